//! Transaction orchestration on top of the rings.
//!
//! [`XhciController`] owns everything a running controller needs: the register window, the
//! Command and Event Rings, the DCBAA and scratchpad, one endpoint 0 transfer ring per enabled
//! slot, a bounce buffer for control data and the table of outstanding requests.
//!
//! Every transaction follows the same shape: enqueue TRBs, register them in [`PendingRequests`],
//! ring the doorbell, then drain the Event Ring until the request resolves or its deadline passes.
//! Timed-out work is always reconciled with the hardware before the error is returned, so ring
//! slots are never leaked or silently reused.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec::Vec;
use core::time::Duration;

use tracing::{debug, error, info, warn};

use crate::config::XhciConfig;
use crate::context::{
    write_address_device_input, DeviceContextArray, PortSpeed, Scratchpad,
    DEVICE_CONTEXT_ENTRY_COUNT, INPUT_CONTEXT_ENTRY_COUNT,
};
use crate::doorbell::{Doorbell, CONTROL_ENDPOINT, HOST_CONTROLLER};
use crate::error::{Result, XhciError};
use crate::event_ring::{CommandCompletionEvent, Event, EventRing, TransferEvent};
use crate::hal::{pages_for, DmaRegion, MmioMapper, Platform, RegisterIo};
use crate::lifecycle::{poll_until, ControllerState, Lifecycle};
use crate::pending::{Completion, Finished, PendingRequests, RequestId, RequestKind, Resolution};
use crate::regs::{op, runtime, RegisterLayout, Registers};
use crate::ring::ProducerRing;
use crate::transfer::{control_td, data_stage_limit, DataStage, SetupPacket, TransferOutcome};
use crate::trb::{CompletionCode, Trb, TRB_LEN};

/// Device slot identifier assigned by the controller (1..=MaxSlots).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotId(u8);

impl SlotId {
    pub const fn new(raw: u8) -> Option<Self> {
        if raw == 0 {
            None
        } else {
            Some(Self(raw))
        }
    }

    pub const fn get(self) -> u8 {
        self.0
    }
}

/// Counters describing the engine's traffic since initialization.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub commands_issued: u64,
    pub commands_completed: u64,
    pub command_timeouts: u64,
    pub transfers_issued: u64,
    pub transfers_completed: u64,
    pub transfer_timeouts: u64,
    pub endpoint_recoveries: u64,
    pub events_processed: u64,
    /// Completion events that matched no outstanding request.
    pub correlation_misses: u64,
    pub port_status_changes: u64,
    pub host_controller_events: u64,
}

/// Per-slot structures allocated at Enable Slot.
#[derive(Debug)]
struct DeviceSlot {
    output: DmaRegion,
    input: DmaRegion,
    ring_region: DmaRegion,
    ep0: ProducerRing,
    /// Set when reconciling endpoint 0 failed; retried before the next transfer.
    recovery: Option<Recovery>,
}

impl DeviceSlot {
    fn free<P: Platform + ?Sized>(self, platform: &mut P) {
        self.output.free(platform);
        self.input.free(platform);
        self.ring_region.free(platform);
    }
}

/// Why an endpoint needs its transfer ring reconciled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Recovery {
    /// The endpoint halted on an error; Reset Endpoint first.
    Halted,
    /// The TD never completed; Stop Endpoint first.
    TimedOut,
}

/// Everything allocated at bring-up, before the controller is assembled.
struct Allocation {
    dcbaa: DeviceContextArray,
    scratchpad: Option<Scratchpad>,
    command_ring: ProducerRing,
    command_ring_region: DmaRegion,
    event_ring: EventRing,
    event_ring_region: DmaRegion,
    erst_region: DmaRegion,
    transfer_buffer: DmaRegion,
}

fn allocate_region<P: Platform + ?Sized>(
    platform: &mut P,
    allocated: &mut Vec<DmaRegion>,
    bytes: usize,
    what: &'static str,
) -> Result<DmaRegion> {
    let region = DmaRegion::allocate(platform, pages_for(bytes))
        .ok_or(XhciError::OutOfMemory { what })?;
    allocated.push(region);
    Ok(region)
}

fn allocate_slot_regions<P: Platform + ?Sized>(
    platform: &mut P,
    allocated: &mut Vec<DmaRegion>,
    context_size: usize,
    ring_capacity: usize,
) -> Result<(DmaRegion, DmaRegion, DmaRegion)> {
    let output = allocate_region(
        platform,
        allocated,
        DEVICE_CONTEXT_ENTRY_COUNT * context_size,
        "output device context",
    )?;
    let input = allocate_region(
        platform,
        allocated,
        INPUT_CONTEXT_ENTRY_COUNT * context_size,
        "input context",
    )?;
    let ring = allocate_region(
        platform,
        allocated,
        ProducerRing::size_bytes(ring_capacity),
        "transfer ring",
    )?;
    Ok((output, input, ring))
}

pub struct XhciController<R: RegisterIo, P: Platform> {
    regs: Registers<R>,
    platform: P,
    config: XhciConfig,
    lifecycle: Lifecycle,
    dcbaa: DeviceContextArray,
    scratchpad: Option<Scratchpad>,
    command_ring: ProducerRing,
    command_ring_region: DmaRegion,
    event_ring: EventRing,
    event_ring_region: DmaRegion,
    erst_region: DmaRegion,
    transfer_buffer: DmaRegion,
    slots: BTreeMap<u8, DeviceSlot>,
    pending: PendingRequests,
    port_changes: VecDeque<u8>,
    stats: EngineStats,
}

impl<R: RegisterIo, P: Platform> XhciController<R, P> {
    /// Maps the controller at `mmio_phys`, resets it, allocates and programs the rings and starts
    /// it.
    ///
    /// On failure every DMA region allocated so far is freed and the window is unmapped.
    pub fn initialize<M>(
        mapper: &mut M,
        mmio_phys: u64,
        mut platform: P,
        config: XhciConfig,
    ) -> Result<Self>
    where
        M: MmioMapper<Window = R>,
    {
        config.validate()?;
        let window = mapper
            .map(mmio_phys, config.mmio_window_len)
            .ok_or(XhciError::MappingFailure {
                phys: mmio_phys,
                len: config.mmio_window_len,
            })?;
        let mut regs = Registers::new(window);
        let layout = *regs.layout();
        let end = layout.extent();
        if end > config.mmio_window_len {
            warn!(
                end,
                len = config.mmio_window_len,
                "register blocks extend past the mapped window"
            );
            mapper.unmap(regs.into_inner());
            return Err(XhciError::RegistersOutsideWindow {
                end,
                len: config.mmio_window_len,
            });
        }
        debug!(
            hci_version = layout.hci_version,
            max_slots = layout.max_slots,
            max_ports = layout.max_ports,
            scratchpad_buffers = layout.max_scratchpad_buffers,
            context_size = layout.context_size,
            "xhci capabilities"
        );

        let mut lifecycle = Lifecycle::new();
        if let Err(err) = lifecycle.reset(&mut regs, &mut platform, config.reset_budget) {
            mapper.unmap(regs.into_inner());
            return Err(err);
        }

        let mut allocated = Vec::new();
        let parts = match Self::allocate(&mut platform, &layout, &config, &mut allocated) {
            Ok(parts) => parts,
            Err(err) => {
                warn!(%err, "xhci bring-up allocation failed");
                for region in allocated {
                    region.free(&mut platform);
                }
                mapper.unmap(regs.into_inner());
                return Err(err);
            }
        };

        let mut controller = Self {
            regs,
            platform,
            config,
            lifecycle,
            dcbaa: parts.dcbaa,
            scratchpad: parts.scratchpad,
            command_ring: parts.command_ring,
            command_ring_region: parts.command_ring_region,
            event_ring: parts.event_ring,
            event_ring_region: parts.event_ring_region,
            erst_region: parts.erst_region,
            transfer_buffer: parts.transfer_buffer,
            slots: BTreeMap::new(),
            pending: PendingRequests::new(),
            port_changes: VecDeque::new(),
            stats: EngineStats::default(),
        };

        if let Err(err) = controller.program_and_start() {
            controller.quiesce();
            controller.release(mapper);
            return Err(err);
        }
        Ok(controller)
    }

    fn allocate(
        platform: &mut P,
        layout: &RegisterLayout,
        config: &XhciConfig,
        allocated: &mut Vec<DmaRegion>,
    ) -> Result<Allocation> {
        let max_slots = config
            .max_slots
            .map_or(layout.max_slots, |cap| cap.min(layout.max_slots));

        let dcbaa_region = allocate_region(
            platform,
            allocated,
            DeviceContextArray::size_bytes(max_slots),
            "device context array",
        )?;
        let dcbaa = DeviceContextArray::new(platform, dcbaa_region, max_slots);

        let command_ring_region = allocate_region(
            platform,
            allocated,
            ProducerRing::size_bytes(config.command_ring_capacity),
            "command ring",
        )?;
        let command_ring = ProducerRing::new(
            platform,
            command_ring_region.paddr,
            config.command_ring_capacity,
            HOST_CONTROLLER,
            Doorbell::COMMAND,
        );

        let event_ring_region = allocate_region(
            platform,
            allocated,
            EventRing::size_bytes(config.event_ring_capacity),
            "event ring",
        )?;
        let erst_region = allocate_region(platform, allocated, TRB_LEN, "event ring segment table")?;
        let event_ring = EventRing::new(
            platform,
            event_ring_region.paddr,
            erst_region.paddr,
            config.event_ring_capacity,
        );

        let transfer_buffer = DmaRegion::allocate(platform, config.transfer_buffer_pages)
            .ok_or(XhciError::OutOfMemory {
                what: "transfer buffer",
            })?;
        allocated.push(transfer_buffer);

        let scratchpad = Scratchpad::allocate(platform, layout.max_scratchpad_buffers)?;
        if let Some(pad) = &scratchpad {
            dcbaa.set(platform, 0, pad.array_paddr());
        }

        Ok(Allocation {
            dcbaa,
            scratchpad,
            command_ring,
            command_ring_region,
            event_ring,
            event_ring_region,
            erst_region,
            transfer_buffer,
        })
    }

    fn program_and_start(&mut self) -> Result<()> {
        self.regs.write_max_slots_enabled(self.dcbaa.max_slots());
        self.regs.write_dcbaap(self.dcbaa.paddr());
        self.regs
            .write_crcr(self.command_ring.dequeue_pointer_with_cycle() | op::CRCR_RCS);
        self.event_ring.program(&mut self.regs);
        // Polling only: USBCMD.INTE stays clear, but some controllers only post events for an
        // enabled interrupter.
        self.regs.write_iman(runtime::IMAN_IE | runtime::IMAN_IP);

        self.lifecycle
            .start(&mut self.regs, &mut self.platform, self.config.start_budget)?;
        info!(
            max_slots = self.dcbaa.max_slots(),
            command_ring = self.command_ring.base(),
            event_ring = self.event_ring.base(),
            "xhci rings programmed"
        );
        Ok(())
    }

    /// Clears Run/Stop and waits for HCHalted whatever state the engine thinks the controller is
    /// in. A controller that does not halt is reset instead.
    ///
    /// Must run before [`Self::release`]: a running controller keeps fetching from the rings.
    fn quiesce(&mut self) {
        let stopped = self
            .lifecycle
            .stop(&mut self.regs, &mut self.platform, self.config.stop_budget);
        if let Err(err) = stopped {
            warn!(%err, "xhci controller did not halt; resetting it");
            if let Err(err) = self.lifecycle.force_reset(
                &mut self.regs,
                &mut self.platform,
                self.config.reset_budget,
            ) {
                error!(%err, "xhci controller could not be quiesced");
            }
        }
    }

    fn release<M: MmioMapper<Window = R>>(self, mapper: &mut M) -> P {
        let Self {
            regs,
            mut platform,
            dcbaa,
            scratchpad,
            command_ring_region,
            event_ring_region,
            erst_region,
            transfer_buffer,
            slots,
            ..
        } = self;

        for (_, slot) in slots {
            slot.free(&mut platform);
        }
        if let Some(pad) = scratchpad {
            pad.free(&mut platform);
        }
        dcbaa.free(&mut platform);
        command_ring_region.free(&mut platform);
        event_ring_region.free(&mut platform);
        erst_region.free(&mut platform);
        transfer_buffer.free(&mut platform);
        mapper.unmap(regs.into_inner());
        platform
    }

    /// Halts the controller, frees every DMA region and unmaps the register window.
    ///
    /// Returns the platform so the caller can reuse its allocator.
    pub fn shutdown<M: MmioMapper<Window = R>>(mut self, mapper: &mut M) -> P {
        self.quiesce();
        let outstanding = self.pending.len();
        if outstanding != 0 {
            debug!(outstanding, "dropping outstanding requests at shutdown");
        }
        let platform = self.release(mapper);
        info!("xhci controller shut down");
        platform
    }

    pub fn state(&self) -> ControllerState {
        self.lifecycle.state()
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    pub fn layout(&self) -> &RegisterLayout {
        self.regs.layout()
    }

    pub fn max_slots(&self) -> u8 {
        self.dcbaa.max_slots()
    }

    pub fn command_ring(&self) -> &ProducerRing {
        &self.command_ring
    }

    pub fn event_ring(&self) -> &EventRing {
        &self.event_ring
    }

    /// Endpoint 0 transfer ring of an enabled slot.
    pub fn control_ring(&self, slot: SlotId) -> Option<&ProducerRing> {
        self.slots.get(&slot.get()).map(|s| &s.ep0)
    }

    /// Number of requests still waiting for (or reconciling) a completion.
    pub fn outstanding_requests(&self) -> usize {
        self.pending.len()
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// Drains and dispatches pending events without waiting. Returns how many were processed.
    pub fn poll_events(&mut self) -> Result<usize> {
        let processed = self.process_events();
        self.lifecycle.check_health(&self.regs)?;
        Ok(processed)
    }

    /// Root ports that reported a Port Status Change Event since the last call, oldest first.
    pub fn take_port_changes(&mut self) -> Vec<u8> {
        self.port_changes.drain(..).collect()
    }

    // ---- Commands ----

    /// Issues Enable Slot and allocates the new slot's contexts and endpoint 0 ring.
    pub fn enable_slot(&mut self) -> Result<SlotId> {
        let done = self.run_command(Trb::enable_slot())?;
        if done.code != CompletionCode::Success {
            return Err(XhciError::CommandFailed(done.code));
        }
        let raw = done.slot_id;
        let Some(slot) = SlotId::new(raw).filter(|_| raw <= self.dcbaa.max_slots()) else {
            warn!(slot_id = raw, "controller returned an out-of-range slot id");
            return Err(XhciError::InvalidSlot(raw));
        };

        if let Err(err) = self.allocate_slot(raw) {
            warn!(slot_id = raw, %err, "failed to allocate slot structures; disabling slot");
            if let Err(disable_err) = self.run_command(Trb::disable_slot(raw)) {
                warn!(slot_id = raw, %disable_err, "disable after failed allocation also failed");
            }
            return Err(err);
        }
        debug!(slot_id = raw, "slot enabled");
        Ok(slot)
    }

    fn allocate_slot(&mut self, slot_id: u8) -> Result<()> {
        let ctx = self.regs.layout().context_size;
        let capacity = self.config.transfer_ring_capacity;
        let mut allocated = Vec::new();
        let (output, input, ring_region) =
            match allocate_slot_regions(&mut self.platform, &mut allocated, ctx, capacity) {
                Ok(regions) => regions,
                Err(err) => {
                    for region in allocated {
                        region.free(&mut self.platform);
                    }
                    return Err(err);
                }
            };

        self.platform
            .fill_zero(output.paddr, DEVICE_CONTEXT_ENTRY_COUNT * ctx);
        let ep0 = ProducerRing::new(
            &mut self.platform,
            ring_region.paddr,
            capacity,
            slot_id,
            Doorbell::endpoint(CONTROL_ENDPOINT),
        );
        self.dcbaa.set(&mut self.platform, slot_id, output.paddr);
        self.slots.insert(
            slot_id,
            DeviceSlot {
                output,
                input,
                ring_region,
                ep0,
                recovery: None,
            },
        );
        Ok(())
    }

    /// Issues Address Device for a device attached to root port `root_port`.
    pub fn address_device(&mut self, slot: SlotId, root_port: u8, speed: PortSpeed) -> Result<()> {
        let slot_id = slot.get();
        let ctx = self.regs.layout().context_size;
        let state = self
            .slots
            .get(&slot_id)
            .ok_or(XhciError::InvalidSlot(slot_id))?;
        let input = state.input.paddr;
        let dequeue = state.ep0.dequeue_pointer_with_cycle();
        write_address_device_input(&mut self.platform, input, ctx, root_port, speed, dequeue);

        let done = self.run_command(Trb::address_device(slot_id, input, false))?;
        if done.code != CompletionCode::Success {
            return Err(XhciError::CommandFailed(done.code));
        }
        debug!(slot_id, root_port, ?speed, "device addressed");
        Ok(())
    }

    /// Issues Disable Slot and frees the slot's structures.
    pub fn disable_slot(&mut self, slot: SlotId) -> Result<()> {
        let slot_id = slot.get();
        if !self.slots.contains_key(&slot_id) {
            return Err(XhciError::InvalidSlot(slot_id));
        }
        let done = self.run_command(Trb::disable_slot(slot_id))?;
        if done.code != CompletionCode::Success {
            return Err(XhciError::CommandFailed(done.code));
        }

        self.dcbaa.set(&mut self.platform, slot_id, 0);
        self.pending
            .remove_where(|kind| kind.slot_id() == Some(slot_id));
        if let Some(state) = self.slots.remove(&slot_id) {
            state.free(&mut self.platform);
        }
        debug!(slot_id, "slot disabled");
        Ok(())
    }

    /// Enqueues one command, rings the host controller doorbell and waits for its completion.
    fn run_command(&mut self, trb: Trb) -> Result<CommandCompletionEvent> {
        self.lifecycle.ensure_running()?;
        let paddr = self.command_ring.enqueue(&mut self.platform, trb)?;
        let id = self.pending.register(RequestKind::Command, &[paddr]);
        self.stats.commands_issued += 1;
        debug!(trb_type = ?trb.trb_type(), paddr, "command enqueued");
        self.command_ring.notify(&mut self.regs);

        match self.wait_for(id, self.config.command_timeout)? {
            Some(Finished {
                completion: Completion::Command(ev),
                ..
            }) => {
                self.stats.commands_completed += 1;
                Ok(ev)
            }
            Some(_) => Err(XhciError::CommandFailed(CompletionCode::Invalid)),
            None => self.reclaim_command(id, paddr),
        }
    }

    /// Aborts the Command Ring after a command timed out.
    ///
    /// A completion that arrives while the ring stops is still honoured. Otherwise the abandoned
    /// TRB becomes a No-Op so that restarting the ring retires its slot without side effects.
    fn reclaim_command(&mut self, id: RequestId, paddr: u64) -> Result<CommandCompletionEvent> {
        self.stats.command_timeouts += 1;
        warn!(paddr, "command timed out; aborting command ring");

        self.regs.write_crcr(op::CRCR_CA);
        let regs = &self.regs;
        if !poll_until(&mut self.platform, self.config.stop_budget, || {
            !regs.command_ring_running()
        }) {
            warn!("command ring still running after abort");
        }
        self.process_events();

        if self.pending.is_complete(id) {
            if let Some(Finished {
                completion: Completion::Command(ev),
                ..
            }) = self.pending.take(id)
            {
                if ev.code == CompletionCode::CommandAborted {
                    debug!(paddr, "timed-out command aborted");
                    return Err(XhciError::TransactionTimeout);
                }
                debug!(paddr, code = ?ev.code, "late command completion honoured");
                self.stats.commands_completed += 1;
                return Ok(ev);
            }
            return Err(XhciError::TransactionTimeout);
        }

        self.command_ring
            .rewrite(&mut self.platform, paddr, Trb::no_op_command())?;
        self.pending.set_kind(id, RequestKind::Reclaim);
        Err(XhciError::TransactionTimeout)
    }

    // ---- Transfers ----

    /// Runs a control transfer on a slot's default control endpoint.
    ///
    /// Data is staged through the controller's DMA bounce buffer. Non-success completion codes are
    /// reported in the outcome after the endpoint has been recovered; only a missing completion is
    /// an error ([`XhciError::TransactionTimeout`]).
    pub fn control_transfer(
        &mut self,
        slot: SlotId,
        setup: SetupPacket,
        data: DataStage<'_>,
    ) -> Result<TransferOutcome> {
        self.lifecycle.ensure_running()?;
        let slot_id = slot.get();
        if !self.slots.contains_key(&slot_id) {
            return Err(XhciError::InvalidSlot(slot_id));
        }

        let len = data.len();
        let buffer = self.transfer_buffer.paddr;
        let max = self
            .transfer_buffer
            .size_bytes()
            .min(data_stage_limit(buffer));
        if len > max {
            return Err(XhciError::BufferTooLarge { len, max });
        }
        let trbs = control_td(setup, data.direction().map(|dir| (dir, len)), buffer)?;

        let owed = self.slots.get(&slot_id).and_then(|state| state.recovery);
        if let Some(recovery) = owed {
            debug!(slot_id, ?recovery, "retrying endpoint 0 recovery");
            self.recover_endpoint(slot_id, recovery)?;
        }

        if let DataStage::Out(bytes) = &data {
            self.platform.write_physical(buffer, bytes);
        }

        let ring = &mut self
            .slots
            .get_mut(&slot_id)
            .ok_or(XhciError::InvalidSlot(slot_id))?
            .ep0;
        let addrs = ring.enqueue_td(&mut self.platform, &trbs)?;
        let id = self
            .pending
            .register(RequestKind::ControlTransfer { slot_id }, &addrs);
        ring.notify(&mut self.regs);
        self.stats.transfers_issued += 1;
        debug!(
            slot_id,
            request = setup.b_request,
            len,
            stages = trbs.len(),
            "control transfer enqueued"
        );

        let Some(finished) = self.wait_for(id, self.config.transfer_timeout)? else {
            self.stats.transfer_timeouts += 1;
            warn!(slot_id, "control transfer timed out; stopping endpoint");
            if let Err(err) = self.recover_endpoint(slot_id, Recovery::TimedOut) {
                warn!(slot_id, %err, "endpoint recovery after timeout failed");
                if !self.pending.is_complete(id) {
                    // The controller may still execute the TD.
                    self.pending
                        .set_kind(id, RequestKind::AbandonedTransfer { slot_id });
                    return Err(XhciError::TransactionTimeout);
                }
            }
            self.pending.take(id);
            return Err(XhciError::TransactionTimeout);
        };

        let Completion::Transfer(event) = finished.completion else {
            return Err(XhciError::CommandFailed(CompletionCode::Invalid));
        };
        let data_trb = (trbs.len() == 3).then(|| addrs[1]);
        let bytes = transferred_bytes(len, data_trb, &addrs, event, finished.partial);

        if let DataStage::In(buf) = data {
            self.platform.read_physical(buffer, &mut buf[..bytes]);
        }

        if !event.code.is_success() {
            warn!(slot_id, code = ?event.code, "control transfer failed; recovering endpoint");
            self.recover_endpoint(slot_id, Recovery::Halted)?;
        }
        self.stats.transfers_completed += 1;
        Ok(TransferOutcome {
            code: event.code,
            bytes_transferred: bytes,
        })
    }

    /// Moves the endpoint 0 dequeue pointer past everything enqueued so far and retires the ring.
    ///
    /// A failed recovery is remembered on the slot and retried by the next control transfer.
    fn recover_endpoint(&mut self, slot_id: u8, recovery: Recovery) -> Result<()> {
        self.stats.endpoint_recoveries += 1;
        let result = self.reconcile_endpoint(slot_id, recovery);
        if let Some(state) = self.slots.get_mut(&slot_id) {
            state.recovery = result.is_err().then_some(recovery);
        }
        if result.is_ok() {
            let abandoned = RequestKind::AbandonedTransfer { slot_id };
            self.pending.remove_where(|kind| kind == abandoned);
        }
        result
    }

    fn reconcile_endpoint(&mut self, slot_id: u8, recovery: Recovery) -> Result<()> {
        let first = match recovery {
            Recovery::Halted => Trb::reset_endpoint(slot_id, CONTROL_ENDPOINT),
            Recovery::TimedOut => Trb::stop_endpoint(slot_id, CONTROL_ENDPOINT),
        };
        let done = self.run_command(first)?;
        if done.code != CompletionCode::Success {
            return Err(XhciError::CommandFailed(done.code));
        }

        let dequeue = self
            .slots
            .get(&slot_id)
            .ok_or(XhciError::InvalidSlot(slot_id))?
            .ep0
            .dequeue_pointer_with_cycle();
        let done = self.run_command(Trb::set_tr_dequeue_pointer(
            slot_id,
            CONTROL_ENDPOINT,
            dequeue,
        ))?;
        if done.code != CompletionCode::Success {
            return Err(XhciError::CommandFailed(done.code));
        }

        if let Some(state) = self.slots.get_mut(&slot_id) {
            state.ep0.retire_all();
        }
        debug!(slot_id, dequeue, "endpoint 0 recovered");
        Ok(())
    }

    // ---- Event processing ----

    /// Drains the Event Ring until `id` resolves, the deadline passes or the iteration backstop is
    /// reached. `Ok(None)` means timeout; the request is still registered.
    fn wait_for(&mut self, id: RequestId, timeout: Duration) -> Result<Option<Finished>> {
        let start = self.platform.now();
        for _ in 0..self.config.transaction_poll_limit {
            self.process_events();
            if self.pending.is_complete(id) {
                return Ok(self.pending.take(id));
            }
            self.lifecycle.check_health(&self.regs)?;
            if self.platform.now().saturating_sub(start) >= timeout {
                break;
            }
            self.platform.relax();
        }
        Ok(None)
    }

    fn process_events(&mut self) -> usize {
        let events: Vec<Trb> = self
            .event_ring
            .poll(&self.platform, &mut self.regs)
            .collect();
        let processed = events.len();
        for trb in events {
            self.dispatch(trb);
        }
        processed
    }

    fn dispatch(&mut self, trb: Trb) {
        self.stats.events_processed += 1;
        match Event::classify(trb) {
            Event::CommandCompletion(ev) => self.on_command_completion(ev),
            Event::Transfer(ev) => self.on_transfer_event(ev),
            Event::PortStatusChange { port_id } => {
                debug!(port_id, "port status change");
                self.stats.port_status_changes += 1;
                self.port_changes.push_back(port_id);
            }
            Event::HostController { code } => {
                error!(?code, "host controller event");
                self.stats.host_controller_events += 1;
            }
            Event::Other(trb) => {
                debug!(trb_type = ?trb.trb_type(), "ignoring event");
            }
        }
    }

    fn on_command_completion(&mut self, ev: CommandCompletionEvent) {
        if ev.code == CompletionCode::CommandRingStopped {
            // Posted after an abort; names the TRB the ring stopped on, not a completed command.
            debug!(trb = ev.command_trb, "command ring stopped");
            return;
        }

        match self.pending.resolve(ev.command_trb, Completion::Command(ev)) {
            Resolution::Completed { id, kind } => {
                if let Err(err) = self.command_ring.retire_through(ev.command_trb) {
                    warn!(%err, "completed command was not outstanding");
                }
                if kind == RequestKind::Reclaim {
                    self.pending.take(id);
                    debug!(trb = ev.command_trb, "reclaimed timed-out command slot");
                }
            }
            Resolution::Partial { .. } => {}
            Resolution::Miss => self.correlation_miss(ev.command_trb, "command completion"),
        }
    }

    fn on_transfer_event(&mut self, ev: TransferEvent) {
        match self.pending.resolve(ev.trb_pointer, Completion::Transfer(ev)) {
            Resolution::Completed { id, kind } => {
                self.retire_transfer(ev);
                if let RequestKind::AbandonedTransfer { slot_id } = kind {
                    self.pending.take(id);
                    debug!(slot_id, trb = ev.trb_pointer, "abandoned transfer reported late");
                }
            }
            Resolution::Partial { .. } => self.retire_transfer(ev),
            Resolution::Miss => self.correlation_miss(ev.trb_pointer, "transfer"),
        }
    }

    fn retire_transfer(&mut self, ev: TransferEvent) {
        if let Some(state) = self.slots.get_mut(&ev.slot_id) {
            if let Err(err) = state.ep0.retire_through(ev.trb_pointer) {
                warn!(%err, slot_id = ev.slot_id, "transfer TRB was not outstanding");
            }
        }
    }

    fn correlation_miss(&mut self, trb: u64, kind: &'static str) {
        self.stats.correlation_misses += 1;
        warn!(trb, kind, "completion event matches no outstanding request");
    }
}

/// Bytes moved by the Data stage of a control transfer.
fn transferred_bytes(
    len: usize,
    data_trb: Option<u64>,
    addrs: &[u64],
    event: TransferEvent,
    partial: Option<TransferEvent>,
) -> usize {
    let Some(data_trb) = data_trb else {
        return 0;
    };
    let residual = |ev: TransferEvent| len.saturating_sub(ev.residual as usize);
    match partial {
        Some(p) if p.trb_pointer == data_trb => residual(p),
        _ if event.trb_pointer == data_trb => residual(event),
        _ if addrs.last() == Some(&event.trb_pointer) => len,
        // Failed in the Setup stage.
        _ => 0,
    }
}
