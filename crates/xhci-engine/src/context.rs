//! Device contexts, the Device Context Base Address Array (DCBAA) and scratchpad buffers.
//!
//! Contexts are 32 or 64 bytes depending on `HCCPARAMS1.CSZ`. Only the first 8 dwords of either
//! size carry fields; the rest is reserved, so both sizes share the same wrappers and only the
//! stride between entries differs.

use alloc::vec::Vec;

use crate::error::{Result, XhciError};
use crate::hal::{pages_for, DmaMemory, DmaRegion, RegionAllocator, PAGE_SIZE};

/// Number of 32-bit dwords that carry fields in a context entry.
pub const CONTEXT_DWORDS: usize = 8;
/// Maximum number of contexts in a Device Context (Slot + 31 Endpoints).
pub const DEVICE_CONTEXT_ENTRY_COUNT: usize = 32;
/// Maximum number of contexts in an Input Context (Input Control + Device Context).
pub const INPUT_CONTEXT_ENTRY_COUNT: usize = 33;

fn read_context_dwords<M: DmaMemory + ?Sized>(mem: &M, paddr: u64) -> [u32; CONTEXT_DWORDS] {
    let mut raw = [0u8; CONTEXT_DWORDS * 4];
    mem.read_physical(paddr, &mut raw);
    let mut out = [0u32; CONTEXT_DWORDS];
    for (i, dword) in out.iter_mut().enumerate() {
        let off = i * 4;
        *dword = u32::from_le_bytes([raw[off], raw[off + 1], raw[off + 2], raw[off + 3]]);
    }
    out
}

fn write_context_dwords<M: DmaMemory + ?Sized>(
    mem: &mut M,
    paddr: u64,
    dwords: &[u32; CONTEXT_DWORDS],
) {
    let mut raw = [0u8; CONTEXT_DWORDS * 4];
    for (i, dword) in dwords.iter().enumerate() {
        let off = i * 4;
        raw[off..off + 4].copy_from_slice(&dword.to_le_bytes());
    }
    mem.write_physical(paddr, &raw);
}

/// USB speed as encoded in PORTSC.PortSpeed and the Slot Context speed field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortSpeed {
    Full,
    Low,
    High,
    Super,
    SuperPlus,
}

impl PortSpeed {
    pub const fn raw(self) -> u8 {
        match self {
            Self::Full => 1,
            Self::Low => 2,
            Self::High => 3,
            Self::Super => 4,
            Self::SuperPlus => 5,
        }
    }

    /// Initial endpoint 0 max packet size before the device descriptor has been read.
    pub const fn default_control_max_packet(self) -> u16 {
        match self {
            Self::Low | Self::Full => 8,
            Self::High => 64,
            Self::Super | Self::SuperPlus => 512,
        }
    }
}

/// Input Control Context.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InputControlContext {
    dwords: [u32; CONTEXT_DWORDS],
}

impl InputControlContext {
    pub fn read_from<M: DmaMemory + ?Sized>(mem: &M, paddr: u64) -> Self {
        Self {
            dwords: read_context_dwords(mem, paddr),
        }
    }

    pub fn write_to<M: DmaMemory + ?Sized>(&self, mem: &mut M, paddr: u64) {
        write_context_dwords(mem, paddr, &self.dwords);
    }

    /// Drop Context Flags field (DW0).
    pub fn drop_flags(&self) -> u32 {
        self.dwords[0]
    }

    /// Add Context Flags field (DW1).
    pub fn add_flags(&self) -> u32 {
        self.dwords[1]
    }

    pub fn set_add_flags(&mut self, value: u32) {
        self.dwords[1] = value;
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SlotContext {
    dwords: [u32; CONTEXT_DWORDS],
}

impl SlotContext {
    pub fn read_from<M: DmaMemory + ?Sized>(mem: &M, paddr: u64) -> Self {
        Self {
            dwords: read_context_dwords(mem, paddr),
        }
    }

    pub fn write_to<M: DmaMemory + ?Sized>(&self, mem: &mut M, paddr: u64) {
        write_context_dwords(mem, paddr, &self.dwords);
    }

    /// Route String field (DW0 bits 0..=19).
    pub fn route_string(&self) -> u32 {
        self.dwords[0] & 0x000f_ffff
    }

    /// Speed field (DW0 bits 20..=23).
    pub fn speed(&self) -> u8 {
        ((self.dwords[0] >> 20) & 0x0f) as u8
    }

    pub fn set_speed(&mut self, speed: u8) {
        let speed = u32::from(speed) & 0x0f;
        self.dwords[0] = (self.dwords[0] & !(0x0f << 20)) | (speed << 20);
    }

    /// Context Entries field (DW0 bits 27..=31).
    pub fn context_entries(&self) -> u8 {
        ((self.dwords[0] >> 27) & 0x1f) as u8
    }

    pub fn set_context_entries(&mut self, entries: u8) {
        let entries = u32::from(entries) & 0x1f;
        self.dwords[0] = (self.dwords[0] & !(0x1f << 27)) | (entries << 27);
    }

    /// Root Hub Port Number field (DW1 bits 16..=23).
    pub fn root_hub_port_number(&self) -> u8 {
        ((self.dwords[1] >> 16) & 0xff) as u8
    }

    pub fn set_root_hub_port_number(&mut self, port: u8) {
        self.dwords[1] = (self.dwords[1] & !(0xff << 16)) | (u32::from(port) << 16);
    }
}

/// Endpoint type (xHCI Endpoint Context EP Type field).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndpointType {
    Control = 4,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EndpointContext {
    dwords: [u32; CONTEXT_DWORDS],
}

impl EndpointContext {
    pub fn read_from<M: DmaMemory + ?Sized>(mem: &M, paddr: u64) -> Self {
        Self {
            dwords: read_context_dwords(mem, paddr),
        }
    }

    pub fn write_to<M: DmaMemory + ?Sized>(&self, mem: &mut M, paddr: u64) {
        write_context_dwords(mem, paddr, &self.dwords);
    }

    /// Endpoint State field (DW0 bits 0..=2).
    pub fn endpoint_state(&self) -> u8 {
        (self.dwords[0] & 0x7) as u8
    }

    /// Error Count field (DW1 bits 1..=2).
    pub fn error_count(&self) -> u8 {
        ((self.dwords[1] >> 1) & 0x3) as u8
    }

    pub fn set_error_count(&mut self, cerr: u8) {
        self.dwords[1] = (self.dwords[1] & !(0x3 << 1)) | ((u32::from(cerr) & 0x3) << 1);
    }

    /// Endpoint Type field (DW1 bits 3..=5).
    pub fn endpoint_type_raw(&self) -> u8 {
        ((self.dwords[1] >> 3) & 0x07) as u8
    }

    pub fn set_endpoint_type(&mut self, ty: EndpointType) {
        self.dwords[1] = (self.dwords[1] & !(0x7 << 3)) | ((ty as u32) << 3);
    }

    /// Max Packet Size field (DW1 bits 16..=31).
    pub fn max_packet_size(&self) -> u16 {
        ((self.dwords[1] >> 16) & 0xffff) as u16
    }

    pub fn set_max_packet_size(&mut self, max_packet_size: u16) {
        self.dwords[1] =
            (self.dwords[1] & !(0xffff << 16)) | (u32::from(max_packet_size) << 16);
    }

    /// TR Dequeue Pointer field (DW2-DW3), including the DCS bit.
    pub fn tr_dequeue_pointer_raw(&self) -> u64 {
        (u64::from(self.dwords[3]) << 32) | u64::from(self.dwords[2])
    }

    /// Sets the TR Dequeue Pointer; bit 0 of `raw` is the Dequeue Cycle State.
    pub fn set_tr_dequeue_pointer(&mut self, raw: u64) {
        self.dwords[2] = raw as u32;
        self.dwords[3] = (raw >> 32) as u32;
    }

    /// Average TRB Length field (DW4 bits 0..=15).
    pub fn average_trb_length(&self) -> u16 {
        (self.dwords[4] & 0xffff) as u16
    }

    pub fn set_average_trb_length(&mut self, len: u16) {
        self.dwords[4] = (self.dwords[4] & !0xffff) | u32::from(len);
    }
}

/// Writes the Input Context consumed by an Address Device command for a device on root port
/// `root_port`, with endpoint 0 dequeuing from `ep0_dequeue` (cycle state in bit 0).
pub fn write_address_device_input<M: DmaMemory + ?Sized>(
    mem: &mut M,
    input: u64,
    context_size: usize,
    root_port: u8,
    speed: PortSpeed,
    ep0_dequeue: u64,
) {
    mem.fill_zero(input, INPUT_CONTEXT_ENTRY_COUNT * context_size);

    let mut icc = InputControlContext::default();
    // A0 (slot) and A1 (endpoint 0).
    icc.set_add_flags(0b11);
    icc.write_to(mem, input);

    let mut slot = SlotContext::default();
    slot.set_context_entries(1);
    slot.set_speed(speed.raw());
    slot.set_root_hub_port_number(root_port);
    slot.write_to(mem, input + context_size as u64);

    let mut ep0 = EndpointContext::default();
    ep0.set_endpoint_type(EndpointType::Control);
    ep0.set_error_count(3);
    ep0.set_max_packet_size(speed.default_control_max_packet());
    ep0.set_tr_dequeue_pointer(ep0_dequeue);
    ep0.set_average_trb_length(8);
    ep0.write_to(mem, input + 2 * context_size as u64);
}

/// Device Context Base Address Array: entry `n` points at slot `n`'s output device context and
/// entry 0 at the scratchpad buffer array.
#[derive(Debug)]
pub struct DeviceContextArray {
    region: DmaRegion,
    max_slots: u8,
}

impl DeviceContextArray {
    /// Bytes needed for an array covering slots `1..=max_slots` plus the scratchpad entry.
    pub const fn size_bytes(max_slots: u8) -> usize {
        (max_slots as usize + 1) * 8
    }

    /// Takes ownership of `region` (at least `size_bytes(max_slots)` bytes) and clears it.
    pub fn new<M: DmaMemory + ?Sized>(mem: &mut M, region: DmaRegion, max_slots: u8) -> Self {
        mem.fill_zero(region.paddr, Self::size_bytes(max_slots));
        Self { region, max_slots }
    }

    pub fn paddr(&self) -> u64 {
        self.region.paddr
    }

    pub fn max_slots(&self) -> u8 {
        self.max_slots
    }

    fn entry_addr(&self, index: u8) -> Option<u64> {
        (index <= self.max_slots).then(|| self.region.paddr + u64::from(index) * 8)
    }

    pub fn get<M: DmaMemory + ?Sized>(&self, mem: &M, index: u8) -> Option<u64> {
        Some(mem.read_u64(self.entry_addr(index)?))
    }

    /// Sets entry `index`; returns `false` when the index is outside the array.
    pub fn set<M: DmaMemory + ?Sized>(&self, mem: &mut M, index: u8, paddr: u64) -> bool {
        match self.entry_addr(index) {
            Some(entry) => {
                mem.write_u64(entry, paddr);
                true
            }
            None => false,
        }
    }

    pub fn free<A: RegionAllocator + ?Sized>(self, alloc: &mut A) {
        self.region.free(alloc);
    }
}

/// Scratchpad buffers requested by the controller through HCSPARAMS2.
#[derive(Debug)]
pub struct Scratchpad {
    array: DmaRegion,
    buffers: Vec<DmaRegion>,
}

impl Scratchpad {
    /// Allocates `count` page-sized buffers and the array that points at them.
    ///
    /// Returns `Ok(None)` when the controller needs no scratchpad. On allocation failure every
    /// region allocated so far is released.
    pub fn allocate<P>(platform: &mut P, count: u16) -> Result<Option<Self>>
    where
        P: DmaMemory + RegionAllocator + ?Sized,
    {
        if count == 0 {
            return Ok(None);
        }
        let out_of_memory = XhciError::OutOfMemory { what: "scratchpad" };
        let array = DmaRegion::allocate(platform, pages_for(usize::from(count) * 8))
            .ok_or_else(|| out_of_memory.clone())?;
        let mut buffers = Vec::with_capacity(usize::from(count));
        for i in 0..count {
            let Some(buf) = DmaRegion::allocate(platform, pages_for(PAGE_SIZE)) else {
                for buf in buffers {
                    DmaRegion::free(buf, platform);
                }
                array.free(platform);
                return Err(out_of_memory);
            };
            platform.fill_zero(buf.paddr, buf.size_bytes());
            platform.write_u64(array.paddr + u64::from(i) * 8, buf.paddr);
            buffers.push(buf);
        }
        Ok(Some(Self { array, buffers }))
    }

    pub fn array_paddr(&self) -> u64 {
        self.array.paddr
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn free<A: RegionAllocator + ?Sized>(self, alloc: &mut A) {
        for buf in self.buffers {
            buf.free(alloc);
        }
        self.array.free(alloc);
    }
}
