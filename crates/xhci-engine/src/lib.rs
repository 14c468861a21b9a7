//! xHCI host controller command/event ring engine.
//!
//! This crate drives a physical xHCI controller from a kernel: it brings the controller out of
//! reset, programs the Command Ring, the (single segment) Event Ring and the device context array,
//! and then runs synchronous, poll-driven transactions on top of them:
//! - Enable Slot / Address Device / Disable Slot commands on the Command Ring
//! - control transfers (Setup/Data/Status) on a slot's endpoint 0 transfer ring
//!
//! Everything the engine needs from the surrounding kernel is expressed as a small set of traits
//! (see [`hal`] and [`pci`]): register window access, device-visible memory access and
//! allocation, a monotonic clock, MMIO mapping and PCI configuration space. The engine itself
//! never dereferences raw pointers; all descriptor addresses are device addresses and all CPU
//! access goes through [`hal::DmaMemory`].
//!
//! ## Ownership protocol
//!
//! The rings are shared with the hardware without any lock. Ownership of each 16-byte descriptor
//! is decided by its cycle bit:
//! - on producer rings (Command Ring, transfer rings) software writes descriptors with the ring's
//!   current cycle state and the controller consumes them while the bits match; a Link descriptor
//!   at the end of the ring toggles the expected state on every lap.
//! - on the Event Ring the roles are reversed: the controller writes, and software consumes while
//!   the descriptor cycle bit matches its own consumer cycle state.
//!
//! Completions are correlated back to the request that produced them by descriptor address (see
//! [`pending`]).
//!
//! ## Concurrency
//!
//! A controller is driven by exactly one thread of control. Every entry point takes `&mut self`,
//! and nothing inside the engine blocks: waits are bounded polls with a wall-clock deadline and a
//! CPU-yield hook between iterations.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod context;
pub mod controller;
pub mod doorbell;
pub mod error;
pub mod event_ring;
pub mod hal;
pub mod lifecycle;
pub mod pci;
pub mod pending;
pub mod regs;
pub mod ring;
pub mod transfer;
pub mod trb;

pub use config::{PollBudget, XhciConfig};
pub use context::PortSpeed;
pub use controller::{EngineStats, SlotId, XhciController};
pub use error::{Result, XhciError};
pub use hal::{Clock, DmaMemory, MmioMapper, Platform, RegionAllocator, RegisterIo};
pub use lifecycle::ControllerState;
pub use pci::{ConfigSpace, PciAddress};
pub use ring::RingError;
pub use transfer::{DataStage, Direction, SetupPacket, TransferOutcome};
pub use trb::{CompletionCode, Trb, TrbType};

use tracing::{debug, info};

/// Finds the first xHCI controller on the PCI bus, maps its registers and initializes it.
///
/// This is the kernel-facing `initialize()` entry point: discovery failures surface as
/// [`XhciError::DeviceNotFound`] / [`XhciError::MappingFailure`], and every failure after the
/// registers are mapped releases all resources before returning.
pub fn bring_up<C, M, P>(
    pci: &mut C,
    mapper: &mut M,
    platform: P,
    config: XhciConfig,
) -> Result<XhciController<M::Window, P>>
where
    C: ConfigSpace + ?Sized,
    M: MmioMapper,
    P: Platform,
{
    let addr = pci::find_controller(pci).ok_or(XhciError::DeviceNotFound)?;
    let mmio_phys = pci::read_bar0(pci, addr).ok_or(XhciError::MappingFailure {
        phys: 0,
        len: config.mmio_window_len,
    })?;
    debug!(%addr, mmio_phys, "xhci controller located");

    pci::enable_mmio_and_bus_master(pci, addr);

    let controller = XhciController::initialize(mapper, mmio_phys, platform, config)?;
    info!(%addr, "xhci controller initialized");
    Ok(controller)
}
