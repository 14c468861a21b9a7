//! xHCI Event Ring consumer.
//!
//! The controller produces Event TRBs into a single segment described by a one-entry Event Ring
//! Segment Table (ERST); software consumes them while their cycle bit matches the consumer cycle
//! state and reports progress by writing ERDP.

use crate::hal::{DmaMemory, RegisterIo};
use crate::regs::{runtime, Registers};
use crate::trb::{CompletionCode, Trb, TrbType, TRB_LEN};

/// One Event Ring Segment Table entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ErstEntry {
    pub base: u64,
    pub size_trbs: u16,
}

impl ErstEntry {
    pub const LEN: usize = 16;

    pub fn read<M: DmaMemory + ?Sized>(mem: &M, paddr: u64) -> Self {
        let base = mem.read_u64(paddr);
        let size = mem.read_u32(paddr + 8) & 0xffff;
        Self {
            base: base & !0x3f,
            size_trbs: size as u16,
        }
    }

    pub fn write<M: DmaMemory + ?Sized>(&self, mem: &mut M, paddr: u64) {
        mem.write_u64(paddr, self.base);
        mem.write_u32(paddr + 8, u32::from(self.size_trbs));
        mem.write_u32(paddr + 12, 0);
    }
}

/// Receiver of the consumer's dequeue pointer (ERDP).
pub trait DequeueSink {
    fn write_dequeue(&mut self, erdp: u64);
}

impl<R: RegisterIo> DequeueSink for Registers<R> {
    fn write_dequeue(&mut self, erdp: u64) {
        self.write_erdp(erdp);
    }
}

#[derive(Debug)]
pub struct EventRing {
    base: u64,
    erst_base: u64,
    capacity: usize,
    dequeue_index: usize,
    cycle: bool,
}

impl EventRing {
    pub const fn size_bytes(capacity: usize) -> usize {
        capacity * TRB_LEN
    }

    /// Initializes the segment at `ring_base` and writes the single ERST entry at `erst_base`.
    pub fn new<M: DmaMemory + ?Sized>(
        mem: &mut M,
        ring_base: u64,
        erst_base: u64,
        capacity: usize,
    ) -> Self {
        mem.fill_zero(ring_base, Self::size_bytes(capacity));
        ErstEntry {
            base: ring_base,
            size_trbs: capacity as u16,
        }
        .write(mem, erst_base);
        Self {
            base: ring_base,
            erst_base,
            capacity,
            dequeue_index: 0,
            cycle: true,
        }
    }

    /// Programs interrupter 0. ERSTBA is written last since it latches the segment table.
    pub fn program<R: RegisterIo>(&self, regs: &mut Registers<R>) {
        regs.write_erstsz(1);
        regs.write_erdp(self.dequeue_pointer());
        regs.write_erstba(self.erst_base);
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn erst_base(&self) -> u64 {
        self.erst_base
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn cycle_state(&self) -> bool {
        self.cycle
    }

    pub fn dequeue_index(&self) -> usize {
        self.dequeue_index
    }

    pub fn dequeue_pointer(&self) -> u64 {
        self.base + (self.dequeue_index * TRB_LEN) as u64
    }

    /// Returns the events the controller has produced since the last drain.
    ///
    /// The iterator stops at the first TRB still owned by the controller and never yields more
    /// than one lap of the ring. Dropping it after at least one event was consumed writes the new
    /// dequeue pointer to `sink` with Event Handler Busy set.
    pub fn poll<'a, M, S>(&'a mut self, mem: &'a M, sink: &'a mut S) -> Drain<'a, M, S>
    where
        M: DmaMemory + ?Sized,
        S: DequeueSink + ?Sized,
    {
        Drain {
            ring: self,
            mem,
            sink,
            consumed: 0,
        }
    }
}

pub struct Drain<'a, M: ?Sized, S: DequeueSink + ?Sized> {
    ring: &'a mut EventRing,
    mem: &'a M,
    sink: &'a mut S,
    consumed: usize,
}

impl<M: DmaMemory + ?Sized, S: DequeueSink + ?Sized> Iterator for Drain<'_, M, S> {
    type Item = Trb;

    fn next(&mut self) -> Option<Trb> {
        if self.consumed == self.ring.capacity {
            return None;
        }
        let trb = Trb::read_from(self.mem, self.ring.dequeue_pointer());
        if trb.cycle() != self.ring.cycle {
            return None;
        }
        self.ring.dequeue_index += 1;
        if self.ring.dequeue_index == self.ring.capacity {
            self.ring.dequeue_index = 0;
            self.ring.cycle = !self.ring.cycle;
        }
        self.consumed += 1;
        Some(trb)
    }
}

impl<M: ?Sized, S: DequeueSink + ?Sized> Drop for Drain<'_, M, S> {
    fn drop(&mut self) {
        if self.consumed > 0 {
            self.sink
                .write_dequeue(self.ring.dequeue_pointer() | runtime::ERDP_EHB);
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommandCompletionEvent {
    /// Device address of the command TRB this event completes.
    pub command_trb: u64,
    pub code: CompletionCode,
    pub slot_id: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransferEvent {
    /// Device address of the transfer TRB that generated the event.
    pub trb_pointer: u64,
    pub code: CompletionCode,
    /// Bytes *not* transferred by the TRB.
    pub residual: u32,
    pub slot_id: u8,
    pub endpoint_id: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    CommandCompletion(CommandCompletionEvent),
    Transfer(TransferEvent),
    PortStatusChange { port_id: u8 },
    HostController { code: CompletionCode },
    Other(Trb),
}

impl Event {
    pub fn classify(trb: Trb) -> Self {
        match trb.trb_type() {
            TrbType::CommandCompletionEvent => Self::CommandCompletion(CommandCompletionEvent {
                command_trb: trb.pointer(),
                code: trb.completion_code(),
                slot_id: trb.slot_id(),
            }),
            TrbType::TransferEvent => Self::Transfer(TransferEvent {
                trb_pointer: trb.pointer(),
                code: trb.completion_code(),
                residual: trb.transfer_len(),
                slot_id: trb.slot_id(),
                endpoint_id: trb.endpoint_id(),
            }),
            TrbType::PortStatusChangeEvent => Self::PortStatusChange {
                port_id: trb.port_id(),
            },
            TrbType::HostControllerEvent => Self::HostController {
                code: trb.completion_code(),
            },
            _ => Self::Other(trb),
        }
    }
}
