use thiserror::Error;

use crate::lifecycle::ControllerState;
use crate::ring::RingError;
use crate::trb::CompletionCode;

pub type Result<T> = core::result::Result<T, XhciError>;

/// Unified error type for controller bring-up and transactions.
///
/// Expected conditions (no controller present, a full ring, a timed-out transaction) are ordinary
/// variants; nothing in the engine panics on hardware misbehaviour.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum XhciError {
    #[error("no xHCI controller found on the PCI bus")]
    DeviceNotFound,

    #[error("failed to map controller registers at {phys:#x} ({len:#x} bytes)")]
    MappingFailure { phys: u64, len: usize },

    #[error("register block ends at {end:#x}, outside the {len:#x} byte window")]
    RegistersOutsideWindow { end: usize, len: usize },

    #[error("out of DMA memory while allocating {what}")]
    OutOfMemory { what: &'static str },

    #[error("controller reset did not complete within the poll budget")]
    ResetTimeout,

    #[error("controller did not leave the halted state after run was set")]
    StartTimeout,

    #[error("controller did not halt after run was cleared")]
    StopTimeout,

    #[error(transparent)]
    Ring(#[from] RingError),

    #[error("transaction timed out waiting for its completion event")]
    TransactionTimeout,

    #[error("command failed with completion code {0:?}")]
    CommandFailed(CompletionCode),

    #[error("slot {0} is not enabled")]
    InvalidSlot(u8),

    #[error("controller is not running (state {0:?})")]
    NotRunning(ControllerState),

    #[error("host controller error (USBSTS={0:#010x})")]
    HostControllerError(u32),

    #[error("data stage of {len} bytes exceeds the {max} byte transfer buffer")]
    BufferTooLarge { len: usize, max: usize },

    #[error("setup packet direction does not match the data stage")]
    DirectionMismatch,

    #[error("setup packet requests {w_length} bytes but the data stage holds {len}")]
    SetupLengthMismatch { w_length: u16, len: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}
