#![allow(dead_code)]

//! A small behavioural model of an xHCI controller.
//!
//! The model executes the Command Ring and endpoint 0 transfer rings synchronously when a doorbell
//! is written and posts events to the Event Ring programmed through ERSTBA. Knobs on [`SimState`]
//! inject the misbehaviour the engine has to survive: a reset that never completes, commands that
//! hang, stalled or hung transfers and unsolicited events.

use std::cell::{RefCell, RefMut};
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Duration;

use xhci_engine::context::{EndpointContext, InputControlContext, SlotContext};
use xhci_engine::{
    Clock, CompletionCode, ConfigSpace, DmaMemory, MmioMapper, PciAddress, PollBudget,
    RegionAllocator, RegisterIo, Trb, TrbType, XhciConfig, XhciController,
};

pub const MEM_BASE: u64 = 0x10_0000;
const MEM_SIZE: usize = 4 << 20;
const PAGE_SIZE: usize = 4096;

pub const MMIO_PHYS: u64 = 0x1_fe40_0000;
pub const MAX_SLOTS: u8 = 8;
pub const MAX_PORTS: u8 = 4;
pub const SCRATCHPAD_BUFFERS: u32 = 2;

const CAPLENGTH: usize = 0x20;
const RTSOFF: usize = 0x600;
const DBOFF: usize = 0x800;

pub const USBCMD: usize = CAPLENGTH;
pub const USBSTS: usize = CAPLENGTH + 0x04;
const PAGESIZE: usize = CAPLENGTH + 0x08;
pub const CRCR_LO: usize = CAPLENGTH + 0x18;
const CRCR_HI: usize = CAPLENGTH + 0x1c;
const DCBAAP_LO: usize = CAPLENGTH + 0x30;
const DCBAAP_HI: usize = CAPLENGTH + 0x34;
pub const CONFIG: usize = CAPLENGTH + 0x38;

pub const IMAN: usize = RTSOFF + 0x20;
const IMOD: usize = RTSOFF + 0x24;
pub const ERSTSZ: usize = RTSOFF + 0x28;
pub const ERSTBA_LO: usize = RTSOFF + 0x30;
const ERSTBA_HI: usize = RTSOFF + 0x34;
pub const ERDP_LO: usize = RTSOFF + 0x38;
const ERDP_HI: usize = RTSOFF + 0x3c;

pub const USBCMD_RS: u32 = 1 << 0;
pub const USBCMD_HCRST: u32 = 1 << 1;
pub const USBCMD_INTE: u32 = 1 << 2;
pub const USBSTS_HCH: u32 = 1 << 0;
const USBSTS_EINT: u32 = 1 << 3;
const USBSTS_PCD: u32 = 1 << 4;
pub const USBSTS_HCE: u32 = 1 << 12;
const CRCR_CA: u32 = 1 << 2;
const CRCR_CRR: u32 = 1 << 3;
const IMAN_IP: u32 = 1 << 0;
const IMAN_IE: u32 = 1 << 1;

/// Pointer carried by unsolicited completion events; never a ring slot.
pub const STRAY_TRB: u64 = 0xdead_b000;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

pub type Controller = XhciController<SimRegs, SimPlatform>;

/// Configuration with budgets small enough for failure paths to finish quickly.
pub fn test_config() -> XhciConfig {
    XhciConfig::default()
        .with_reset_budget(PollBudget::polls(64))
        .with_start_budget(PollBudget::polls(64))
        .with_stop_budget(PollBudget::polls(64))
        .with_command_timeout(Duration::from_millis(20))
        .with_transfer_timeout(Duration::from_millis(20))
}

pub fn start(sim: &Sim, mapper: &mut SimMapper, config: XhciConfig) -> Controller {
    init_tracing();
    XhciController::initialize(mapper, MMIO_PHYS, sim.platform(), config).unwrap()
}

pub fn command_completion(trb: u64, code: CompletionCode, slot_id: u8) -> Trb {
    Trb::new(
        trb,
        u32::from(code.raw()) << 24,
        (u32::from(TrbType::CommandCompletionEvent.raw()) << 10) | (u32::from(slot_id) << 24),
    )
}

pub fn transfer_event(trb: u64, code: CompletionCode, residual: u32, slot_id: u8) -> Trb {
    Trb::new(
        trb,
        (u32::from(code.raw()) << 24) | (residual & 0x00ff_ffff),
        (u32::from(TrbType::TransferEvent.raw()) << 10) | (1 << 16) | (u32::from(slot_id) << 24),
    )
}

pub fn port_status_change(port_id: u8) -> Trb {
    Trb::new(
        u64::from(port_id) << 24,
        u32::from(CompletionCode::Success.raw()) << 24,
        u32::from(TrbType::PortStatusChangeEvent.raw()) << 10,
    )
}

pub struct Memory {
    bytes: Vec<u8>,
}

impl Memory {
    fn range(&self, paddr: u64, len: usize) -> std::ops::Range<usize> {
        let start = paddr
            .checked_sub(MEM_BASE)
            .unwrap_or_else(|| panic!("DMA below simulated memory: {paddr:#x}"))
            as usize;
        assert!(
            start + len <= self.bytes.len(),
            "DMA outside simulated memory: {paddr:#x}+{len}"
        );
        start..start + len
    }
}

impl DmaMemory for Memory {
    fn read_physical(&self, paddr: u64, buf: &mut [u8]) {
        buf.copy_from_slice(&self.bytes[self.range(paddr, buf.len())]);
    }

    fn write_physical(&mut self, paddr: u64, buf: &[u8]) {
        let range = self.range(paddr, buf.len());
        self.bytes[range].copy_from_slice(buf);
    }
}

/// What happens to a hung command when software aborts the Command Ring.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AbortBehaviour {
    /// The command completes with CommandAborted and the ring moves past it.
    #[default]
    Aborted,
    /// The command finishes normally while the ring stops.
    Completes,
    /// The command is left unexecuted; the ring stops on it.
    Untouched,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TransferFault {
    #[default]
    None,
    /// The device stalls the first Data (or Status) stage.
    Stall,
    /// The endpoint never processes its ring.
    Hang,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndpointState {
    Running,
    Halted,
    Stopped,
}

#[derive(Clone, Copy, Debug)]
struct Ep0 {
    dequeue: u64,
    cycle: bool,
    state: EndpointState,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Addressed {
    pub root_port: u8,
    pub speed: u8,
    pub max_packet_size: u16,
}

#[derive(Debug, Default)]
struct SimSlot {
    addressed: Option<Addressed>,
    ep0: Option<Ep0>,
}

/// One control TD as the device saw it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ControlRecord {
    pub slot_id: u8,
    pub setup: u64,
    pub stages: Vec<TrbType>,
    pub status_in: bool,
    pub out_data: Vec<u8>,
}

pub struct SimState {
    pub mem: Memory,

    next_page: u64,
    live: BTreeMap<u64, usize>,
    pub allocations: usize,
    /// Index (0-based) of the allocation that fails.
    pub fail_allocation_at: Option<usize>,

    pub now: Duration,
    pub tick: Duration,
    pub relaxes: u64,

    usbcmd: u32,
    usbsts: u32,
    config: u32,
    dcbaap_lo: u32,
    dcbaap: u64,
    crcr_latch: Option<u32>,
    iman: u32,
    imod: u32,
    erstsz: u32,
    erstba_lo: u32,
    erdp_lo: u32,
    erdp: u64,
    pub usbcmd_reads: u32,
    pub register_writes: Vec<(usize, u32)>,
    pub doorbells: Vec<(u8, u32)>,

    cr_dequeue: u64,
    cr_cycle: bool,
    crr: bool,
    in_flight: Option<u64>,

    er_base: u64,
    er_size: usize,
    er_enqueue: usize,
    er_cycle: bool,
    pub dropped_events: usize,

    slots: BTreeMap<u8, SimSlot>,

    /// Doorbell array offset reported in DBOFF.
    pub dboff: usize,
    /// USBCMD reads for which HCRST stays visible; `u32::MAX` never clears.
    pub hcrst_delay: u32,
    hcrst_remaining: u32,
    pub refuse_start: bool,
    /// Clearing Run/Stop leaves HCHalted clear; only HCRST stops the controller.
    pub refuse_halt: bool,
    pub hang_commands: usize,
    /// The next command of this type completes with this code and has no effect.
    pub fail_command: Option<(TrbType, CompletionCode)>,
    pub abort_behaviour: AbortBehaviour,
    pub no_slots: bool,
    pub transfer_fault: TransferFault,
    /// Bytes returned by the device for IN data stages.
    pub device_data: Vec<u8>,
    /// Completion events for unknown TRBs posted after the next executed commands.
    pub stray_completions: usize,

    pub commands: Vec<TrbType>,
    pub controls: Vec<ControlRecord>,
    pub resets: u32,
}

impl SimState {
    fn new() -> Self {
        Self {
            mem: Memory {
                bytes: vec![0; MEM_SIZE],
            },
            next_page: 0,
            live: BTreeMap::new(),
            allocations: 0,
            fail_allocation_at: None,
            now: Duration::ZERO,
            tick: Duration::from_millis(1),
            relaxes: 0,
            usbcmd: 0,
            usbsts: USBSTS_HCH,
            config: 0,
            dcbaap_lo: 0,
            dcbaap: 0,
            crcr_latch: None,
            iman: 0,
            imod: 0,
            erstsz: 0,
            erstba_lo: 0,
            erdp_lo: 0,
            erdp: 0,
            usbcmd_reads: 0,
            register_writes: Vec::new(),
            doorbells: Vec::new(),
            cr_dequeue: 0,
            cr_cycle: true,
            crr: false,
            in_flight: None,
            er_base: 0,
            er_size: 0,
            er_enqueue: 0,
            er_cycle: true,
            dropped_events: 0,
            slots: BTreeMap::new(),
            dboff: DBOFF,
            hcrst_delay: 2,
            hcrst_remaining: 0,
            refuse_start: false,
            refuse_halt: false,
            hang_commands: 0,
            fail_command: None,
            abort_behaviour: AbortBehaviour::default(),
            no_slots: false,
            transfer_fault: TransferFault::default(),
            device_data: Vec::new(),
            stray_completions: 0,
            commands: Vec::new(),
            controls: Vec::new(),
            resets: 0,
        }
    }

    pub fn live_pages(&self) -> usize {
        self.live.values().sum()
    }

    pub fn live_regions(&self) -> usize {
        self.live.len()
    }

    pub fn dcbaap(&self) -> u64 {
        self.dcbaap
    }

    pub fn max_slots_enabled(&self) -> u8 {
        self.config as u8
    }

    pub fn usbcmd(&self) -> u32 {
        self.usbcmd
    }

    pub fn usbsts(&self) -> u32 {
        self.usbsts
    }

    pub fn iman(&self) -> u32 {
        self.iman
    }

    pub fn erdp(&self) -> u64 {
        self.erdp
    }

    pub fn set_host_controller_error(&mut self) {
        self.usbsts |= USBSTS_HCE;
    }

    pub fn halt(&mut self) {
        self.usbsts |= USBSTS_HCH;
    }

    pub fn addressed(&self, slot_id: u8) -> Option<Addressed> {
        self.slots.get(&slot_id).and_then(|s| s.addressed)
    }

    pub fn slot_enabled(&self, slot_id: u8) -> bool {
        self.slots.contains_key(&slot_id)
    }

    pub fn endpoint_state(&self, slot_id: u8) -> Option<EndpointState> {
        self.slots
            .get(&slot_id)
            .and_then(|s| s.ep0)
            .map(|ep| ep.state)
    }

    pub fn endpoint_dequeue(&self, slot_id: u8) -> Option<u64> {
        self.slots
            .get(&slot_id)
            .and_then(|s| s.ep0)
            .map(|ep| ep.dequeue | u64::from(ep.cycle))
    }

    // ---- Event Ring producer ----

    fn event_ring_full(&self) -> bool {
        let dequeue = (self.erdp.saturating_sub(self.er_base) / 16) as usize;
        (self.er_enqueue + 1) % self.er_size == dequeue
    }

    pub fn post_event(&mut self, trb: Trb) {
        if self.er_size == 0 || self.event_ring_full() {
            self.dropped_events += 1;
            return;
        }
        let mut trb = trb;
        trb.set_cycle(self.er_cycle);
        let paddr = self.er_base + (self.er_enqueue * 16) as u64;
        trb.write_to(&mut self.mem, paddr);
        self.er_enqueue += 1;
        if self.er_enqueue == self.er_size {
            self.er_enqueue = 0;
            self.er_cycle = !self.er_cycle;
        }
        self.usbsts |= USBSTS_EINT;
        self.iman |= IMAN_IP;
    }

    fn load_erst(&mut self, erstba: u64) {
        let base = self.mem.read_u64(erstba) & !0x3f;
        let size = self.mem.read_u32(erstba + 8) & 0xffff;
        self.er_base = base;
        self.er_size = size as usize;
        self.er_enqueue = 0;
        self.er_cycle = true;
    }

    // ---- Registers ----

    fn read_register(&mut self, offset: usize) -> u32 {
        match offset {
            0x00 => CAPLENGTH as u32 | (0x0110 << 16),
            0x04 => u32::from(MAX_SLOTS) | (1 << 8) | (u32::from(MAX_PORTS) << 24),
            0x08 => SCRATCHPAD_BUFFERS << 27,
            0x10 => 0,
            0x14 => self.dboff as u32,
            0x18 => RTSOFF as u32,
            USBCMD => {
                self.usbcmd_reads += 1;
                if self.usbcmd & USBCMD_HCRST != 0 {
                    if self.hcrst_remaining == 0 {
                        self.complete_reset();
                    } else if self.hcrst_remaining != u32::MAX {
                        self.hcrst_remaining -= 1;
                    }
                }
                self.usbcmd
            }
            USBSTS => self.usbsts,
            PAGESIZE => 1,
            CRCR_LO => {
                if self.crr {
                    CRCR_CRR
                } else {
                    0
                }
            }
            DCBAAP_LO => self.dcbaap as u32,
            DCBAAP_HI => (self.dcbaap >> 32) as u32,
            CONFIG => self.config,
            IMAN => self.iman,
            IMOD => self.imod,
            ERSTSZ => self.erstsz,
            ERDP_LO => self.erdp as u32,
            ERDP_HI => (self.erdp >> 32) as u32,
            _ => 0,
        }
    }

    fn write_register(&mut self, offset: usize, value: u32) {
        self.register_writes.push((offset, value));
        match offset {
            USBCMD => self.write_usbcmd(value),
            USBSTS => self.usbsts &= !(value & (USBSTS_EINT | USBSTS_PCD)),
            CRCR_LO => {
                if self.crr {
                    if value & CRCR_CA != 0 {
                        self.abort_command_ring();
                    }
                } else if value & CRCR_CA == 0 {
                    self.crcr_latch = Some(value);
                }
            }
            CRCR_HI => {
                if let Some(lo) = self.crcr_latch.take() {
                    let crcr = u64::from(lo) | (u64::from(value) << 32);
                    self.cr_dequeue = crcr & !0x3f;
                    self.cr_cycle = crcr & 1 != 0;
                }
            }
            DCBAAP_LO => self.dcbaap_lo = value,
            DCBAAP_HI => self.dcbaap = u64::from(self.dcbaap_lo) | (u64::from(value) << 32),
            CONFIG => self.config = value,
            IMAN => {
                self.iman = (self.iman & !IMAN_IE) | (value & IMAN_IE);
                if value & IMAN_IP != 0 {
                    self.iman &= !IMAN_IP;
                }
            }
            IMOD => self.imod = value,
            ERSTSZ => self.erstsz = value & 0xffff,
            ERSTBA_LO => self.erstba_lo = value,
            ERSTBA_HI => {
                let erstba = u64::from(self.erstba_lo) | (u64::from(value) << 32);
                self.load_erst(erstba);
            }
            ERDP_LO => self.erdp_lo = value,
            ERDP_HI => {
                self.erdp = (u64::from(self.erdp_lo) | (u64::from(value) << 32)) & !0xf;
            }
            o if (self.dboff..self.dboff + 4 * 256).contains(&o) => {
                let index = ((o - self.dboff) / 4) as u8;
                self.doorbells.push((index, value));
                if self.usbsts & USBSTS_HCH != 0 {
                    return;
                }
                if index == 0 {
                    self.process_command_ring();
                } else if value & 0xff == 1 {
                    self.process_ep0(index);
                }
            }
            _ => {}
        }
    }

    fn write_usbcmd(&mut self, value: u32) {
        if value & USBCMD_HCRST != 0 {
            self.usbcmd = USBCMD_HCRST;
            self.resets += 1;
            self.hcrst_remaining = self.hcrst_delay;
            return;
        }
        self.usbcmd = value;
        if value & USBCMD_RS != 0 {
            if !self.refuse_start {
                self.usbsts &= !USBSTS_HCH;
            }
        } else if !self.refuse_halt {
            self.usbsts |= USBSTS_HCH;
            self.crr = false;
        }
    }

    fn complete_reset(&mut self) {
        self.usbcmd = 0;
        self.usbsts = USBSTS_HCH;
        self.config = 0;
        self.dcbaap = 0;
        self.crcr_latch = None;
        self.crr = false;
        self.cr_dequeue = 0;
        self.cr_cycle = true;
        self.in_flight = None;
        self.iman = 0;
        self.imod = 0;
        self.erstsz = 0;
        self.erdp = 0;
        self.er_base = 0;
        self.er_size = 0;
        self.slots.clear();
    }

    // ---- Command Ring ----

    fn process_command_ring(&mut self) {
        if self.in_flight.is_some() {
            return;
        }
        self.crr = true;
        loop {
            let trb = Trb::read_from(&self.mem, self.cr_dequeue);
            if trb.cycle() != self.cr_cycle {
                return;
            }
            if trb.trb_type() == TrbType::Link {
                if trb.link_toggle_cycle() {
                    self.cr_cycle = !self.cr_cycle;
                }
                self.cr_dequeue = trb.pointer();
                continue;
            }
            if self.hang_commands > 0 {
                self.hang_commands -= 1;
                self.in_flight = Some(self.cr_dequeue);
                return;
            }
            let paddr = self.cr_dequeue;
            self.cr_dequeue += 16;
            self.execute_command(paddr, trb);
        }
    }

    fn abort_command_ring(&mut self) {
        if let Some(paddr) = self.in_flight.take() {
            match self.abort_behaviour {
                AbortBehaviour::Aborted => {
                    self.cr_dequeue = paddr + 16;
                    self.post_event(command_completion(paddr, CompletionCode::CommandAborted, 0));
                }
                AbortBehaviour::Completes => {
                    let trb = Trb::read_from(&self.mem, paddr);
                    self.cr_dequeue = paddr + 16;
                    self.execute_command(paddr, trb);
                }
                AbortBehaviour::Untouched => {}
            }
        }
        self.crr = false;
        let stopped_on = self.cr_dequeue;
        self.post_event(command_completion(
            stopped_on,
            CompletionCode::CommandRingStopped,
            0,
        ));
    }

    fn execute_command(&mut self, paddr: u64, trb: Trb) {
        let ty = trb.trb_type();
        self.commands.push(ty);
        let slot_id = trb.slot_id();
        if let Some((failing, code)) = self.fail_command {
            if failing == ty {
                self.fail_command = None;
                self.post_event(command_completion(paddr, code, slot_id));
                return;
            }
        }
        let (code, slot_id) = match ty {
            TrbType::EnableSlotCommand => self.enable_slot(),
            TrbType::DisableSlotCommand => {
                let code = if self.slots.remove(&slot_id).is_some() {
                    CompletionCode::Success
                } else {
                    CompletionCode::SlotNotEnabledError
                };
                (code, slot_id)
            }
            TrbType::AddressDeviceCommand => (self.address_device(slot_id, trb.pointer()), slot_id),
            TrbType::ResetEndpointCommand => (self.reset_endpoint(slot_id), slot_id),
            TrbType::StopEndpointCommand => (self.stop_endpoint(slot_id), slot_id),
            TrbType::SetTrDequeuePointerCommand => {
                (self.set_tr_dequeue(slot_id, trb.parameter), slot_id)
            }
            TrbType::NoOpCommand => (CompletionCode::Success, 0),
            _ => (CompletionCode::TrbError, 0),
        };
        self.post_event(command_completion(paddr, code, slot_id));
        if self.stray_completions > 0 {
            self.stray_completions -= 1;
            self.post_event(command_completion(STRAY_TRB, CompletionCode::Success, 0));
        }
    }

    fn enable_slot(&mut self) -> (CompletionCode, u8) {
        if self.no_slots {
            return (CompletionCode::NoSlotsAvailableError, 0);
        }
        let max = self.config as u8;
        match (1..=max).find(|id| !self.slots.contains_key(id)) {
            Some(id) => {
                self.slots.insert(id, SimSlot::default());
                (CompletionCode::Success, id)
            }
            None => (CompletionCode::NoSlotsAvailableError, 0),
        }
    }

    fn address_device(&mut self, slot_id: u8, input: u64) -> CompletionCode {
        if !self.slots.contains_key(&slot_id) {
            return CompletionCode::SlotNotEnabledError;
        }
        let ctx = 32u64;
        let icc = InputControlContext::read_from(&self.mem, input);
        if icc.add_flags() & 0b11 != 0b11 {
            return CompletionCode::ParameterError;
        }
        let slot_ctx = SlotContext::read_from(&self.mem, input + ctx);
        let ep0_ctx = EndpointContext::read_from(&self.mem, input + 2 * ctx);
        let dequeue = ep0_ctx.tr_dequeue_pointer_raw();

        let output = self.mem.read_u64(self.dcbaap + u64::from(slot_id) * 8);
        if output != 0 {
            slot_ctx.write_to(&mut self.mem, output);
            // Slot state Addressed (2), USB address = slot id.
            self.mem
                .write_u32(output + 12, u32::from(slot_id) | (2 << 27));
            ep0_ctx.write_to(&mut self.mem, output + ctx);
        }

        if let Some(slot) = self.slots.get_mut(&slot_id) {
            slot.addressed = Some(Addressed {
                root_port: slot_ctx.root_hub_port_number(),
                speed: slot_ctx.speed(),
                max_packet_size: ep0_ctx.max_packet_size(),
            });
            slot.ep0 = Some(Ep0 {
                dequeue: dequeue & !0xf,
                cycle: dequeue & 1 != 0,
                state: EndpointState::Running,
            });
        }
        CompletionCode::Success
    }

    fn ep0_mut(&mut self, slot_id: u8) -> Result<&mut Ep0, CompletionCode> {
        let slot = self
            .slots
            .get_mut(&slot_id)
            .ok_or(CompletionCode::SlotNotEnabledError)?;
        slot.ep0
            .as_mut()
            .ok_or(CompletionCode::EndpointNotEnabledError)
    }

    fn reset_endpoint(&mut self, slot_id: u8) -> CompletionCode {
        match self.ep0_mut(slot_id) {
            Ok(ep) if ep.state == EndpointState::Halted => {
                ep.state = EndpointState::Stopped;
                CompletionCode::Success
            }
            Ok(_) => CompletionCode::ContextStateError,
            Err(code) => code,
        }
    }

    fn stop_endpoint(&mut self, slot_id: u8) -> CompletionCode {
        let ep = match self.ep0_mut(slot_id) {
            Ok(ep) if ep.state == EndpointState::Running => {
                ep.state = EndpointState::Stopped;
                *ep
            }
            Ok(_) => return CompletionCode::ContextStateError,
            Err(code) => return code,
        };
        // A TD still sitting on the ring is reported as stopped.
        let pending = Trb::read_from(&self.mem, ep.dequeue);
        if pending.cycle() == ep.cycle && pending.trb_type() != TrbType::Link {
            self.post_event(transfer_event(
                ep.dequeue,
                CompletionCode::Stopped,
                0,
                slot_id,
            ));
        }
        CompletionCode::Success
    }

    fn set_tr_dequeue(&mut self, slot_id: u8, dequeue: u64) -> CompletionCode {
        match self.ep0_mut(slot_id) {
            Ok(ep) if ep.state == EndpointState::Stopped => {
                ep.dequeue = dequeue & !0xf;
                ep.cycle = dequeue & 1 != 0;
                CompletionCode::Success
            }
            Ok(_) => CompletionCode::ContextStateError,
            Err(code) => code,
        }
    }

    // ---- Endpoint 0 ----

    fn process_ep0(&mut self, slot_id: u8) {
        if self.transfer_fault == TransferFault::Hang {
            return;
        }
        let Ok(ep) = self.ep0_mut(slot_id) else {
            return;
        };
        if ep.state == EndpointState::Halted {
            return;
        }
        ep.state = EndpointState::Running;
        let mut ep = *ep;
        let mut record = ControlRecord {
            slot_id,
            ..Default::default()
        };

        loop {
            let trb = Trb::read_from(&self.mem, ep.dequeue);
            if trb.cycle() != ep.cycle {
                break;
            }
            let paddr = ep.dequeue;
            match trb.trb_type() {
                TrbType::Link => {
                    if trb.link_toggle_cycle() {
                        ep.cycle = !ep.cycle;
                    }
                    ep.dequeue = trb.pointer();
                    continue;
                }
                TrbType::SetupStage => {
                    record.setup = trb.parameter;
                    record.stages.push(TrbType::SetupStage);
                }
                ty @ (TrbType::DataStage | TrbType::StatusStage) => {
                    record.stages.push(ty);
                    if self.transfer_fault == TransferFault::Stall {
                        self.transfer_fault = TransferFault::None;
                        ep.state = EndpointState::Halted;
                        let residual = if ty == TrbType::DataStage {
                            trb.status & 0x1_ffff
                        } else {
                            0
                        };
                        self.post_event(transfer_event(
                            paddr,
                            CompletionCode::StallError,
                            residual,
                            slot_id,
                        ));
                        self.controls.push(record);
                        break;
                    }
                    if ty == TrbType::DataStage {
                        self.run_data_stage(slot_id, paddr, trb, &mut record);
                    } else {
                        record.status_in = trb.dir_in();
                        self.post_event(transfer_event(
                            paddr,
                            CompletionCode::Success,
                            0,
                            slot_id,
                        ));
                        self.controls.push(core::mem::take(&mut record));
                        record.slot_id = slot_id;
                    }
                }
                _ => {
                    self.post_event(transfer_event(paddr, CompletionCode::TrbError, 0, slot_id));
                }
            }
            ep.dequeue += 16;
        }

        if let Ok(slot_ep) = self.ep0_mut(slot_id) {
            *slot_ep = ep;
        }
    }

    fn run_data_stage(&mut self, slot_id: u8, paddr: u64, trb: Trb, record: &mut ControlRecord) {
        let len = (trb.status & 0x1_ffff) as usize;
        let buffer = trb.parameter;
        if trb.dir_in() {
            let n = len.min(self.device_data.len());
            let data = self.device_data[..n].to_vec();
            self.mem.write_physical(buffer, &data);
            let residual = (len - n) as u32;
            if residual > 0 && trb.control & (1 << 2) != 0 {
                self.post_event(transfer_event(
                    paddr,
                    CompletionCode::ShortPacket,
                    residual,
                    slot_id,
                ));
            }
        } else {
            let mut data = vec![0u8; len];
            self.mem.read_physical(buffer, &mut data);
            record.out_data = data;
        }
    }

    // ---- Allocator ----

    fn allocate_pages(&mut self, count: usize) -> Option<u64> {
        let index = self.allocations;
        self.allocations += 1;
        if self.fail_allocation_at == Some(index) {
            return None;
        }
        let paddr = MEM_BASE + self.next_page * PAGE_SIZE as u64;
        let bytes = count * PAGE_SIZE;
        if (paddr - MEM_BASE) as usize + bytes > MEM_SIZE {
            return None;
        }
        self.next_page += count as u64;
        self.mem.fill_zero(paddr, bytes);
        self.live.insert(paddr, count);
        Some(paddr)
    }

    fn free_pages(&mut self, paddr: u64, count: usize) {
        let prev = self.live.remove(&paddr);
        assert_eq!(prev, Some(count), "free of unknown region {paddr:#x}");
    }
}

/// Shared handle to the simulated machine.
#[derive(Clone)]
pub struct Sim(Rc<RefCell<SimState>>);

impl Default for Sim {
    fn default() -> Self {
        Self::new()
    }
}

impl Sim {
    pub fn new() -> Self {
        Self(Rc::new(RefCell::new(SimState::new())))
    }

    pub fn state(&self) -> RefMut<'_, SimState> {
        self.0.borrow_mut()
    }

    pub fn platform(&self) -> SimPlatform {
        SimPlatform(self.0.clone())
    }

    pub fn mapper(&self) -> SimMapper {
        SimMapper {
            sim: self.0.clone(),
            fail: false,
            maps: Vec::new(),
            unmaps: 0,
        }
    }

    pub fn regs(&self) -> SimRegs {
        SimRegs(self.0.clone())
    }
}

pub struct SimRegs(Rc<RefCell<SimState>>);

impl RegisterIo for SimRegs {
    fn read_u32(&self, offset: usize) -> u32 {
        self.0.borrow_mut().read_register(offset)
    }

    fn write_u32(&mut self, offset: usize, value: u32) {
        self.0.borrow_mut().write_register(offset, value);
    }
}

pub struct SimPlatform(Rc<RefCell<SimState>>);

impl DmaMemory for SimPlatform {
    fn read_physical(&self, paddr: u64, buf: &mut [u8]) {
        self.0.borrow().mem.read_physical(paddr, buf);
    }

    fn write_physical(&mut self, paddr: u64, buf: &[u8]) {
        self.0.borrow_mut().mem.write_physical(paddr, buf);
    }
}

impl RegionAllocator for SimPlatform {
    fn allocate_pages(&mut self, count: usize) -> Option<u64> {
        self.0.borrow_mut().allocate_pages(count)
    }

    fn free_pages(&mut self, paddr: u64, count: usize) {
        self.0.borrow_mut().free_pages(paddr, count);
    }
}

impl Clock for SimPlatform {
    fn now(&self) -> Duration {
        self.0.borrow().now
    }

    fn relax(&mut self) {
        let mut state = self.0.borrow_mut();
        state.relaxes += 1;
        let tick = state.tick;
        state.now += tick;
    }
}

pub struct SimMapper {
    sim: Rc<RefCell<SimState>>,
    pub fail: bool,
    pub maps: Vec<(u64, usize)>,
    pub unmaps: usize,
}

impl MmioMapper for SimMapper {
    type Window = SimRegs;

    fn map(&mut self, phys: u64, len: usize) -> Option<SimRegs> {
        if self.fail {
            return None;
        }
        self.maps.push((phys, len));
        Some(SimRegs(self.sim.clone()))
    }

    fn unmap(&mut self, _window: SimRegs) {
        self.unmaps += 1;
    }
}

/// PCI configuration space with explicitly placed functions; everything else reads as absent.
#[derive(Default)]
pub struct SimPci {
    regs: BTreeMap<(PciAddress, u8), u32>,
}

impl SimPci {
    pub fn add_function(&mut self, addr: PciAddress, class_reg: u32, header: u32) {
        self.regs.insert((addr, 0x00), 0x0015_1b36);
        self.regs.insert((addr, 0x04), 0x0010_0000);
        self.regs.insert((addr, 0x08), class_reg);
        self.regs.insert((addr, 0x0c), header);
    }

    /// Places an xHCI controller with a 64-bit memory BAR at `bar`.
    pub fn add_xhci(&mut self, addr: PciAddress, bar: u64) {
        self.add_function(addr, 0x0c03_3001, 0);
        self.regs.insert((addr, 0x10), (bar as u32 & !0xf) | 0x4);
        self.regs.insert((addr, 0x14), (bar >> 32) as u32);
    }

    pub fn command(&self, addr: PciAddress) -> u32 {
        self.regs.get(&(addr, 0x04)).copied().unwrap_or(0)
    }
}

impl ConfigSpace for SimPci {
    fn read_config_dword(&mut self, addr: PciAddress, offset: u8) -> u32 {
        self.regs
            .get(&(addr, offset))
            .copied()
            .unwrap_or(0xffff_ffff)
    }

    fn write_config_dword(&mut self, addr: PciAddress, offset: u8, value: u32) {
        self.regs.insert((addr, offset), value);
    }
}
