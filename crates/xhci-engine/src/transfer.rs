//! Control transfer composition (Setup / Data / Status stages).

use alloc::vec::Vec;

use crate::error::{Result, XhciError};
use crate::trb::{CompletionCode, TransferType, Trb};

/// TRB data buffers may not cross this boundary.
const TRB_BUFFER_BOUNDARY: u64 = 0x10000;

/// Largest Data stage a single TRB starting at `buffer` can carry.
pub const fn data_stage_limit(buffer: u64) -> usize {
    (TRB_BUFFER_BOUNDARY - buffer % TRB_BUFFER_BOUNDARY) as usize
}

/// USB control request, as sent in the Setup stage.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SetupPacket {
    pub bm_request_type: u8,
    pub b_request: u8,
    pub w_value: u16,
    pub w_index: u16,
    pub w_length: u16,
}

impl SetupPacket {
    pub fn is_device_to_host(self) -> bool {
        (self.bm_request_type & 0x80) != 0
    }

    pub fn direction(self) -> Direction {
        if self.is_device_to_host() {
            Direction::In
        } else {
            Direction::Out
        }
    }

    /// The 8 setup bytes as the little-endian immediate parameter of a Setup Stage TRB.
    pub fn to_u64(self) -> u64 {
        u64::from(self.bm_request_type)
            | (u64::from(self.b_request) << 8)
            | (u64::from(self.w_value) << 16)
            | (u64::from(self.w_index) << 32)
            | (u64::from(self.w_length) << 48)
    }

    /// GET_DESCRIPTOR(DEVICE) for the first `len` bytes.
    pub fn get_device_descriptor(len: u16) -> Self {
        Self {
            bm_request_type: 0x80,
            b_request: 0x06,
            w_value: 0x0100,
            w_index: 0,
            w_length: len,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Device to host.
    In,
    /// Host to device.
    Out,
}

/// Data stage of a control transfer: the caller's buffer and its direction.
#[derive(Debug)]
pub enum DataStage<'a> {
    None,
    In(&'a mut [u8]),
    Out(&'a [u8]),
}

impl DataStage<'_> {
    pub fn len(&self) -> usize {
        match self {
            Self::None => 0,
            Self::In(buf) => buf.len(),
            Self::Out(buf) => buf.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn direction(&self) -> Option<Direction> {
        match self {
            Self::None => None,
            Self::In(_) => Some(Direction::In),
            Self::Out(_) => Some(Direction::Out),
        }
    }
}

/// Result of a control transfer that reached the controller.
///
/// Endpoint errors such as a stall are reported through `code`, not as an `Err`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransferOutcome {
    pub code: CompletionCode,
    pub bytes_transferred: usize,
}

impl TransferOutcome {
    pub fn is_success(&self) -> bool {
        self.code.is_success()
    }
}

/// Builds the TRBs of a control TD.
///
/// A Data stage is only emitted for a non-empty buffer, which the controller reaches at `buffer`,
/// and its length must be the setup packet's `wLength`. The Status stage runs opposite to the data
/// (IN when there is no data) and interrupts on completion.
pub fn control_td(
    setup: SetupPacket,
    data: Option<(Direction, usize)>,
    buffer: u64,
) -> Result<Vec<Trb>> {
    let data = data.filter(|&(_, len)| len > 0);
    if let Some((dir, _)) = data {
        if dir != setup.direction() {
            return Err(XhciError::DirectionMismatch);
        }
    }
    let len = data.map_or(0, |(_, len)| len);
    if len != usize::from(setup.w_length) {
        return Err(XhciError::SetupLengthMismatch {
            w_length: setup.w_length,
            len,
        });
    }

    let transfer_type = match data {
        None => TransferType::NoData,
        Some((Direction::In, _)) => TransferType::In,
        Some((Direction::Out, _)) => TransferType::Out,
    };

    let mut trbs = Vec::with_capacity(3);
    trbs.push(Trb::setup_stage(setup.to_u64(), transfer_type));
    if let Some((dir, len)) = data {
        trbs.push(Trb::data_stage(buffer, len as u32, dir == Direction::In));
    }
    let status_in = !matches!(data, Some((Direction::In, _)));
    trbs.push(Trb::status_stage(status_in));
    Ok(trbs)
}
