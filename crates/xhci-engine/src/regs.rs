//! xHCI register offsets, bit definitions and typed accessors.
//!
//! The capability block is parsed once at bring-up ([`RegisterLayout::parse`]); every other block
//! is located relative to it. Accesses are 32-bit; 64-bit registers are written low dword first.

use core::sync::atomic::{fence, Ordering};

use bitflags::bitflags;

use crate::hal::RegisterIo;

/// Capability registers (base of MMIO region).
pub mod cap {
    /// CAPLENGTH (u8): Capability register length (offset to operational registers).
    pub const CAPLENGTH: usize = 0x00;
    /// HCIVERSION (u16): Interface version number.
    pub const HCIVERSION: usize = 0x02;
    /// HCSPARAMS1 (u32): MaxSlots (7:0), MaxIntrs (18:8), MaxPorts (31:24).
    pub const HCSPARAMS1: usize = 0x04;
    /// HCSPARAMS2 (u32): Max Scratchpad Buffers Hi (25:21) and Lo (31:27).
    pub const HCSPARAMS2: usize = 0x08;
    /// HCCPARAMS1 (u32).
    pub const HCCPARAMS1: usize = 0x10;
    /// DBOFF (u32): Doorbell array offset.
    pub const DBOFF: usize = 0x14;
    /// RTSOFF (u32): Runtime registers offset.
    pub const RTSOFF: usize = 0x18;

    /// HCCPARAMS1.AC64: 64-bit addressing capability.
    pub const HCCPARAMS1_AC64: u32 = 1 << 0;
    /// HCCPARAMS1.CSZ: contexts are 64 bytes instead of 32.
    pub const HCCPARAMS1_CSZ: u32 = 1 << 2;
}

/// Operational registers (base at `CAPLENGTH`).
pub mod op {
    pub const USBCMD: usize = 0x00;
    pub const USBSTS: usize = 0x04;
    pub const PAGESIZE: usize = 0x08;
    pub const CRCR: usize = 0x18;
    pub const DCBAAP: usize = 0x30;
    pub const CONFIG: usize = 0x38;

    /// CRCR.RCS: Ring Cycle State.
    pub const CRCR_RCS: u64 = 1 << 0;
    /// CRCR.CS: Command Stop.
    pub const CRCR_CS: u64 = 1 << 1;
    /// CRCR.CA: Command Abort.
    pub const CRCR_CA: u64 = 1 << 2;
    /// CRCR.CRR: Command Ring Running (read-only).
    pub const CRCR_CRR: u32 = 1 << 3;

    /// CONFIG.MaxSlotsEn occupies bits 7:0.
    pub const CONFIG_MAX_SLOTS_EN_MASK: u32 = 0xff;
}

/// Runtime registers (base at `RTSOFF`).
pub mod runtime {
    /// Interrupter register block stride in bytes; interrupter 0 follows MFINDEX and padding.
    pub const INTERRUPTER_STRIDE: usize = 0x20;
    pub const INTERRUPTER_0: usize = INTERRUPTER_STRIDE;

    // Offsets within an interrupter block.
    pub const IMAN: usize = 0x00;
    pub const ERSTSZ: usize = 0x08;
    pub const ERSTBA: usize = 0x10;
    pub const ERDP: usize = 0x18;

    /// IMAN.IP: Interrupt Pending (RW1C).
    pub const IMAN_IP: u32 = 1 << 0;
    /// IMAN.IE: Interrupt Enable.
    pub const IMAN_IE: u32 = 1 << 1;
    /// ERDP.EHB: Event Handler Busy (RW1C).
    pub const ERDP_EHB: u64 = 1 << 3;
}

/// Doorbell register array (base at `DBOFF`).
pub mod doorbell {
    /// Doorbell register stride in bytes.
    pub const DOORBELL_STRIDE: usize = 0x04;
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct UsbCmd: u32 {
        const RUN_STOP = 1 << 0;
        const HCRST = 1 << 1;
        const INTE = 1 << 2;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct UsbSts: u32 {
        /// HCHalted.
        const HCH = 1 << 0;
        /// Host System Error.
        const HSE = 1 << 2;
        /// Event Interrupt (RW1C).
        const EINT = 1 << 3;
        /// Port Change Detect (RW1C).
        const PCD = 1 << 4;
        /// Controller Not Ready.
        const CNR = 1 << 11;
        /// Host Controller Error.
        const HCE = 1 << 12;
    }
}

/// Location of each register block, and the capability values the engine depends on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegisterLayout {
    pub op_base: usize,
    pub runtime_base: usize,
    pub doorbell_base: usize,
    pub hci_version: u16,
    pub max_slots: u8,
    pub max_interrupters: u16,
    pub max_ports: u8,
    pub max_scratchpad_buffers: u16,
    /// Size of one device/input context entry: 32 or 64 bytes.
    pub context_size: usize,
    pub ac64: bool,
}

impl RegisterLayout {
    pub fn parse<R: RegisterIo + ?Sized>(io: &R) -> Self {
        let caplength = io.read_u8(cap::CAPLENGTH);
        let hci_version = (io.read_u32(cap::CAPLENGTH) >> 16) as u16;
        let hcsparams1 = io.read_u32(cap::HCSPARAMS1);
        let hcsparams2 = io.read_u32(cap::HCSPARAMS2);
        let hccparams1 = io.read_u32(cap::HCCPARAMS1);
        let dboff = io.read_u32(cap::DBOFF) & !0x3;
        let rtsoff = io.read_u32(cap::RTSOFF) & !0x1f;

        let scratch_hi = (hcsparams2 >> 21) & 0x1f;
        let scratch_lo = (hcsparams2 >> 27) & 0x1f;

        Self {
            op_base: usize::from(caplength),
            runtime_base: rtsoff as usize,
            doorbell_base: dboff as usize,
            hci_version,
            max_slots: hcsparams1 as u8,
            max_interrupters: ((hcsparams1 >> 8) & 0x7ff) as u16,
            max_ports: (hcsparams1 >> 24) as u8,
            max_scratchpad_buffers: ((scratch_hi << 5) | scratch_lo) as u16,
            context_size: if hccparams1 & cap::HCCPARAMS1_CSZ != 0 {
                64
            } else {
                32
            },
            ac64: hccparams1 & cap::HCCPARAMS1_AC64 != 0,
        }
    }

    fn interrupter0(&self, reg: usize) -> usize {
        self.runtime_base + runtime::INTERRUPTER_0 + reg
    }

    /// One past the last register byte the engine accesses: the operational block through CONFIG,
    /// interrupter 0 and a doorbell for the host controller and every slot.
    pub fn extent(&self) -> usize {
        let op_end = self.op_base + op::CONFIG + 4;
        let runtime_end = self.interrupter0(runtime::ERDP) + 8;
        let doorbell_end =
            self.doorbell_base + (usize::from(self.max_slots) + 1) * doorbell::DOORBELL_STRIDE;
        op_end.max(runtime_end).max(doorbell_end)
    }
}

/// Typed access to a controller's register window.
pub struct Registers<R> {
    io: R,
    layout: RegisterLayout,
}

impl<R: RegisterIo> Registers<R> {
    pub fn new(io: R) -> Self {
        let layout = RegisterLayout::parse(&io);
        Self { io, layout }
    }

    pub fn layout(&self) -> &RegisterLayout {
        &self.layout
    }

    pub fn into_inner(self) -> R {
        self.io
    }

    fn read_op(&self, reg: usize) -> u32 {
        self.io.read_u32(self.layout.op_base + reg)
    }

    fn write32(&mut self, offset: usize, value: u32) {
        self.io.write_u32(offset, value);
        fence(Ordering::SeqCst);
    }

    fn write64(&mut self, offset: usize, value: u64) {
        self.io.write_u64(offset, value);
        fence(Ordering::SeqCst);
    }

    pub fn usbcmd(&self) -> UsbCmd {
        UsbCmd::from_bits_retain(self.read_op(op::USBCMD))
    }

    pub fn write_usbcmd(&mut self, cmd: UsbCmd) {
        self.write32(self.layout.op_base + op::USBCMD, cmd.bits());
    }

    pub fn usbsts(&self) -> UsbSts {
        UsbSts::from_bits_retain(self.read_op(op::USBSTS))
    }

    /// Clears write-1-to-clear USBSTS bits.
    pub fn clear_usbsts(&mut self, bits: UsbSts) {
        self.write32(self.layout.op_base + op::USBSTS, bits.bits());
    }

    /// PAGESIZE in bytes (bit n set means 2^(n+12) is supported; the lowest set bit wins).
    pub fn page_size(&self) -> usize {
        let raw = self.read_op(op::PAGESIZE) & 0xffff;
        if raw == 0 {
            return 0;
        }
        1usize << (raw.trailing_zeros() + 12)
    }

    pub fn write_crcr(&mut self, value: u64) {
        self.write64(self.layout.op_base + op::CRCR, value);
    }

    /// Low CRCR dword; only CRR reads back meaningfully.
    pub fn crcr_lo(&self) -> u32 {
        self.read_op(op::CRCR)
    }

    pub fn command_ring_running(&self) -> bool {
        self.crcr_lo() & op::CRCR_CRR != 0
    }

    pub fn write_dcbaap(&mut self, paddr: u64) {
        self.write64(self.layout.op_base + op::DCBAAP, paddr);
    }

    pub fn config(&self) -> u32 {
        self.read_op(op::CONFIG)
    }

    pub fn write_max_slots_enabled(&mut self, slots: u8) {
        let value = (self.config() & !op::CONFIG_MAX_SLOTS_EN_MASK) | u32::from(slots);
        self.write32(self.layout.op_base + op::CONFIG, value);
    }

    pub fn iman(&self) -> u32 {
        self.io.read_u32(self.layout.interrupter0(runtime::IMAN))
    }

    pub fn write_iman(&mut self, value: u32) {
        let offset = self.layout.interrupter0(runtime::IMAN);
        self.write32(offset, value);
    }

    pub fn write_erstsz(&mut self, entries: u16) {
        let offset = self.layout.interrupter0(runtime::ERSTSZ);
        self.write32(offset, u32::from(entries));
    }

    pub fn write_erstba(&mut self, paddr: u64) {
        let offset = self.layout.interrupter0(runtime::ERSTBA);
        self.write64(offset, paddr);
    }

    pub fn write_erdp(&mut self, value: u64) {
        let offset = self.layout.interrupter0(runtime::ERDP);
        self.write64(offset, value);
    }

    pub fn erdp(&self) -> u64 {
        self.io.read_u64(self.layout.interrupter0(runtime::ERDP))
    }

    pub fn write_doorbell(&mut self, index: u8, value: u32) {
        let offset = self.layout.doorbell_base + usize::from(index) * doorbell::DOORBELL_STRIDE;
        self.write32(offset, value);
    }
}
