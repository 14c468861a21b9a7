//! Producer rings (Command Ring and transfer rings).
//!
//! Software owns the enqueue side. A ring of `capacity` usable TRBs occupies `capacity + 1` slots:
//! the final slot permanently holds a Link TRB back to the base with Toggle Cycle set, rewritten
//! on each lap with the cycle state of that lap.
//!
//! A slot may only be reused once the controller has retired it, which software learns from the
//! completion event that names the slot (or a later one). Until then it counts as outstanding and
//! [`ProducerRing::enqueue`] refuses to overwrite it.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use thiserror::Error;

use crate::doorbell::Doorbell;
use crate::hal::{DmaMemory, RegisterIo};
use crate::regs::Registers;
use crate::trb::{Trb, TRB_LEN};

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum RingError {
    #[error("ring is full")]
    Full,
    #[error("TRB {0:#x} is not outstanding on this ring")]
    NotOutstanding(u64),
}

#[derive(Debug)]
pub struct ProducerRing {
    base: u64,
    capacity: usize,
    enqueue_index: usize,
    cycle: bool,
    /// Device addresses of the unretired TRBs, oldest first.
    outstanding: VecDeque<u64>,
    doorbell_index: u8,
    doorbell: Doorbell,
}

impl ProducerRing {
    /// Bytes of DMA memory needed for a ring with `capacity` usable TRBs.
    pub const fn size_bytes(capacity: usize) -> usize {
        (capacity + 1) * TRB_LEN
    }

    /// Initializes a ring over `size_bytes(capacity)` bytes at `base` (16-byte aligned).
    ///
    /// `doorbell_index`/`doorbell` select the doorbell written by [`ProducerRing::notify`].
    pub fn new<M: DmaMemory + ?Sized>(
        mem: &mut M,
        base: u64,
        capacity: usize,
        doorbell_index: u8,
        doorbell: Doorbell,
    ) -> Self {
        debug_assert_eq!(base & 0xf, 0);
        mem.fill_zero(base, Self::size_bytes(capacity));
        Self {
            base,
            capacity,
            enqueue_index: 0,
            cycle: true,
            outstanding: VecDeque::with_capacity(capacity),
            doorbell_index,
            doorbell,
        }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn cycle_state(&self) -> bool {
        self.cycle
    }

    pub fn enqueue_index(&self) -> usize {
        self.enqueue_index
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    pub fn is_outstanding(&self, paddr: u64) -> bool {
        self.outstanding.contains(&paddr)
    }

    /// Device address of the slot the next TRB will be written to.
    pub fn enqueue_pointer(&self) -> u64 {
        self.slot_addr(self.enqueue_index)
    }

    /// Enqueue pointer with the cycle state in bit 0, as CRCR and Set TR Dequeue Pointer expect.
    pub fn dequeue_pointer_with_cycle(&self) -> u64 {
        self.enqueue_pointer() | u64::from(self.cycle)
    }

    fn slot_addr(&self, index: usize) -> u64 {
        self.base + (index * TRB_LEN) as u64
    }

    fn advance<M: DmaMemory + ?Sized>(&mut self, mem: &mut M, chain: bool) {
        self.enqueue_index += 1;
        if self.enqueue_index == self.capacity {
            let mut link = Trb::link(self.base, chain);
            link.set_cycle(self.cycle);
            link.write_to(mem, self.slot_addr(self.capacity));
            self.cycle = !self.cycle;
            self.enqueue_index = 0;
        }
    }

    /// Writes one TRB with the current cycle state and returns its device address.
    pub fn enqueue<M: DmaMemory + ?Sized>(
        &mut self,
        mem: &mut M,
        trb: Trb,
    ) -> Result<u64, RingError> {
        if self.outstanding.len() >= self.capacity {
            return Err(RingError::Full);
        }
        let paddr = self.enqueue_pointer();
        let mut trb = trb;
        trb.set_cycle(self.cycle);
        trb.write_to(mem, paddr);
        self.outstanding.push_back(paddr);
        self.advance(mem, false);
        Ok(paddr)
    }

    /// Enqueues a whole TD, or nothing at all.
    ///
    /// The first TRB is written with the inverted cycle bit and handed over last, so the
    /// controller never starts on a partially written TD. A Link crossed inside a chained TD
    /// carries the Chain flag.
    pub fn enqueue_td<M: DmaMemory + ?Sized>(
        &mut self,
        mem: &mut M,
        trbs: &[Trb],
    ) -> Result<Vec<u64>, RingError> {
        if self.outstanding.len() + trbs.len() > self.capacity {
            return Err(RingError::Full);
        }
        let Some(first) = trbs.first() else {
            return Ok(Vec::new());
        };

        let first_cycle = self.cycle;
        let mut addrs = Vec::with_capacity(trbs.len());
        for (i, trb) in trbs.iter().enumerate() {
            let paddr = self.enqueue_pointer();
            let mut trb = *trb;
            trb.set_cycle(if i == 0 { !self.cycle } else { self.cycle });
            trb.write_to(mem, paddr);
            self.outstanding.push_back(paddr);
            addrs.push(paddr);
            let last = i + 1 == trbs.len();
            self.advance(mem, !last && trb.chain());
        }

        let mut head = *first;
        head.set_cycle(first_cycle);
        Trb::write_control(mem, addrs[0], head.control);
        Ok(addrs)
    }

    /// Retires every outstanding TRB up to and including the one at `paddr`.
    pub fn retire_through(&mut self, paddr: u64) -> Result<usize, RingError> {
        let pos = self
            .outstanding
            .iter()
            .position(|&a| a == paddr)
            .ok_or(RingError::NotOutstanding(paddr))?;
        self.outstanding.drain(..=pos);
        Ok(pos + 1)
    }

    /// Retires everything; used once the controller's dequeue pointer has been moved to the
    /// enqueue pointer.
    pub fn retire_all(&mut self) {
        self.outstanding.clear();
    }

    /// Replaces an outstanding TRB in place, preserving the cycle bit it was written with.
    pub fn rewrite<M: DmaMemory + ?Sized>(
        &mut self,
        mem: &mut M,
        paddr: u64,
        trb: Trb,
    ) -> Result<(), RingError> {
        if !self.is_outstanding(paddr) {
            return Err(RingError::NotOutstanding(paddr));
        }
        let current = Trb::read_from(mem, paddr);
        let mut trb = trb;
        trb.set_cycle(current.cycle());
        trb.write_to(mem, paddr);
        Ok(())
    }

    /// Rings this ring's doorbell.
    pub fn notify<R: RegisterIo>(&self, regs: &mut Registers<R>) {
        regs.write_doorbell(self.doorbell_index, self.doorbell.encode());
    }
}
