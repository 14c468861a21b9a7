//! Engine configuration.
//!
//! The defaults mirror what bring-up code commonly uses on PC hardware: 256-entry command and
//! event rings, a 64 KiB register window and generous (100k iteration) poll bounds.

use core::time::Duration;

use crate::error::{Result, XhciError};

/// Default number of usable descriptors on the Command Ring.
pub const DEFAULT_COMMAND_RING_CAPACITY: usize = 256;
/// Default number of descriptors in the single Event Ring segment.
pub const DEFAULT_EVENT_RING_CAPACITY: usize = 256;
/// Default number of usable descriptors on each endpoint 0 transfer ring.
pub const DEFAULT_TRANSFER_RING_CAPACITY: usize = 64;
/// Default iteration bound for register polls (reset/start/stop).
pub const DEFAULT_POLL_LIMIT: u32 = 100_000;
/// Default size of the register window mapped from BAR0.
pub const DEFAULT_MMIO_WINDOW_LEN: usize = 0x10000;

/// A control Data stage is one TRB, which carries at most 64 KiB.
pub const MAX_TRANSFER_BUFFER_PAGES: usize = 16;
/// Capability registers through RTSOFF.
const MIN_MMIO_WINDOW_LEN: usize = 0x20;

/// xHCI limits the size of one Event Ring segment to 16..=4096 TRBs.
const EVENT_RING_MIN: usize = 16;
const EVENT_RING_MAX: usize = 4096;

/// Bound on a hardware poll: at most `max_polls` checks, and optionally a wall-clock limit.
///
/// Whichever limit is reached first ends the poll.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollBudget {
    pub max_polls: u32,
    pub timeout: Option<Duration>,
}

impl PollBudget {
    pub const fn polls(max_polls: u32) -> Self {
        Self {
            max_polls,
            timeout: None,
        }
    }

    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl Default for PollBudget {
    fn default() -> Self {
        Self::polls(DEFAULT_POLL_LIMIT)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct XhciConfig {
    pub command_ring_capacity: usize,
    pub event_ring_capacity: usize,
    pub transfer_ring_capacity: usize,

    /// Budget for the HCRST self-clear poll (and the CNR wait that follows it).
    pub reset_budget: PollBudget,
    pub start_budget: PollBudget,
    pub stop_budget: PollBudget,

    /// Deadline for a command to complete.
    pub command_timeout: Duration,
    /// Deadline for a control transfer to complete.
    pub transfer_timeout: Duration,
    /// Iteration backstop for transaction waits, independent of the clock.
    pub transaction_poll_limit: u32,

    pub mmio_window_len: usize,
    /// Caps CONFIG.MaxSlotsEn below what HCSPARAMS1 advertises.
    pub max_slots: Option<u8>,
    /// Size of the DMA bounce buffer that stages control-transfer data.
    pub transfer_buffer_pages: usize,
}

impl Default for XhciConfig {
    fn default() -> Self {
        Self {
            command_ring_capacity: DEFAULT_COMMAND_RING_CAPACITY,
            event_ring_capacity: DEFAULT_EVENT_RING_CAPACITY,
            transfer_ring_capacity: DEFAULT_TRANSFER_RING_CAPACITY,
            reset_budget: PollBudget::default(),
            start_budget: PollBudget::default(),
            stop_budget: PollBudget::default(),
            command_timeout: Duration::from_secs(5),
            transfer_timeout: Duration::from_secs(5),
            transaction_poll_limit: DEFAULT_POLL_LIMIT,
            mmio_window_len: DEFAULT_MMIO_WINDOW_LEN,
            max_slots: None,
            transfer_buffer_pages: 1,
        }
    }
}

impl XhciConfig {
    pub fn with_command_ring_capacity(mut self, capacity: usize) -> Self {
        self.command_ring_capacity = capacity;
        self
    }

    pub fn with_event_ring_capacity(mut self, capacity: usize) -> Self {
        self.event_ring_capacity = capacity;
        self
    }

    pub fn with_transfer_ring_capacity(mut self, capacity: usize) -> Self {
        self.transfer_ring_capacity = capacity;
        self
    }

    pub fn with_reset_budget(mut self, budget: PollBudget) -> Self {
        self.reset_budget = budget;
        self
    }

    pub fn with_start_budget(mut self, budget: PollBudget) -> Self {
        self.start_budget = budget;
        self
    }

    pub fn with_stop_budget(mut self, budget: PollBudget) -> Self {
        self.stop_budget = budget;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_transfer_timeout(mut self, timeout: Duration) -> Self {
        self.transfer_timeout = timeout;
        self
    }

    pub fn with_transfer_buffer_pages(mut self, pages: usize) -> Self {
        self.transfer_buffer_pages = pages;
        self
    }

    pub fn with_mmio_window_len(mut self, len: usize) -> Self {
        self.mmio_window_len = len;
        self
    }

    pub fn with_max_slots(mut self, max_slots: u8) -> Self {
        self.max_slots = Some(max_slots);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.command_ring_capacity == 0 {
            return Err(XhciError::InvalidConfig("command ring capacity must be non-zero"));
        }
        if self.transfer_ring_capacity < 3 {
            return Err(XhciError::InvalidConfig(
                "transfer ring must hold at least one full control TD",
            ));
        }
        if !(EVENT_RING_MIN..=EVENT_RING_MAX).contains(&self.event_ring_capacity) {
            return Err(XhciError::InvalidConfig(
                "event ring segment must hold 16..=4096 descriptors",
            ));
        }
        if self.reset_budget.max_polls == 0
            || self.start_budget.max_polls == 0
            || self.stop_budget.max_polls == 0
            || self.transaction_poll_limit == 0
        {
            return Err(XhciError::InvalidConfig("poll bounds must be non-zero"));
        }
        if !(1..=MAX_TRANSFER_BUFFER_PAGES).contains(&self.transfer_buffer_pages) {
            return Err(XhciError::InvalidConfig(
                "transfer buffer must be 1..=16 pages (one data stage TRB)",
            ));
        }
        if self.mmio_window_len < MIN_MMIO_WINDOW_LEN {
            return Err(XhciError::InvalidConfig(
                "register window must cover the capability registers",
            ));
        }
        if self.max_slots == Some(0) {
            return Err(XhciError::InvalidConfig("max_slots must be non-zero"));
        }
        Ok(())
    }
}
