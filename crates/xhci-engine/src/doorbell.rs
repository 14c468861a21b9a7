//! Doorbell Notifier.
//!
//! The doorbell array is write-only: doorbell 0 belongs to the host controller (Command Ring) and
//! doorbell `n` (1..=MaxSlots) to device slot `n`, where the written target selects the endpoint.

/// Doorbell index of the host controller (Command Ring).
pub const HOST_CONTROLLER: u8 = 0;
/// Device Context Index of the default control endpoint.
pub const CONTROL_ENDPOINT: u8 = 1;

/// Value written into a doorbell register.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Doorbell {
    pub target: u8,
    pub stream_id: u16,
}

impl Doorbell {
    /// Command Ring doorbell (target 0).
    pub const COMMAND: Self = Self::endpoint(0);

    pub const fn endpoint(target: u8) -> Self {
        Self {
            target,
            stream_id: 0,
        }
    }

    pub const fn encode(self) -> u32 {
        self.target as u32 | ((self.stream_id as u32) << 16)
    }
}
