//! Transfer Request Block (TRB) encoding.
//!
//! Every ring in xHCI (command, transfer and event) is an array of 16-byte TRBs:
//!
//! ```text
//! dword 0..1  parameter (u64, little endian)
//! dword 2     status
//! dword 3     control: cycle (bit 0), type-specific flags, TRB type (bits 10..=15),
//!             type-specific byte (bits 16..=23), slot id (bits 24..=31)
//! ```
//!
//! The control dword carries the cycle bit that hands ownership of the TRB across the
//! software/hardware boundary, so [`Trb::write_to`] always stores it last.

use core::sync::atomic::{fence, Ordering};

use bitflags::bitflags;

use crate::hal::DmaMemory;

/// Size of a single TRB in bytes.
pub const TRB_LEN: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrbType {
    Normal,
    SetupStage,
    DataStage,
    StatusStage,
    Isoch,
    Link,
    EventData,
    NoOp,
    EnableSlotCommand,
    DisableSlotCommand,
    AddressDeviceCommand,
    ConfigureEndpointCommand,
    EvaluateContextCommand,
    ResetEndpointCommand,
    StopEndpointCommand,
    SetTrDequeuePointerCommand,
    ResetDeviceCommand,
    NoOpCommand,
    TransferEvent,
    CommandCompletionEvent,
    PortStatusChangeEvent,
    BandwidthRequestEvent,
    DoorbellEvent,
    HostControllerEvent,
    DeviceNotificationEvent,
    MfindexWrapEvent,
    Unknown(u8),
}

impl TrbType {
    pub const fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Normal,
            2 => Self::SetupStage,
            3 => Self::DataStage,
            4 => Self::StatusStage,
            5 => Self::Isoch,
            6 => Self::Link,
            7 => Self::EventData,
            8 => Self::NoOp,
            9 => Self::EnableSlotCommand,
            10 => Self::DisableSlotCommand,
            11 => Self::AddressDeviceCommand,
            12 => Self::ConfigureEndpointCommand,
            13 => Self::EvaluateContextCommand,
            14 => Self::ResetEndpointCommand,
            15 => Self::StopEndpointCommand,
            16 => Self::SetTrDequeuePointerCommand,
            17 => Self::ResetDeviceCommand,
            23 => Self::NoOpCommand,
            32 => Self::TransferEvent,
            33 => Self::CommandCompletionEvent,
            34 => Self::PortStatusChangeEvent,
            35 => Self::BandwidthRequestEvent,
            36 => Self::DoorbellEvent,
            37 => Self::HostControllerEvent,
            38 => Self::DeviceNotificationEvent,
            39 => Self::MfindexWrapEvent,
            other => Self::Unknown(other),
        }
    }

    pub const fn raw(self) -> u8 {
        match self {
            Self::Normal => 1,
            Self::SetupStage => 2,
            Self::DataStage => 3,
            Self::StatusStage => 4,
            Self::Isoch => 5,
            Self::Link => 6,
            Self::EventData => 7,
            Self::NoOp => 8,
            Self::EnableSlotCommand => 9,
            Self::DisableSlotCommand => 10,
            Self::AddressDeviceCommand => 11,
            Self::ConfigureEndpointCommand => 12,
            Self::EvaluateContextCommand => 13,
            Self::ResetEndpointCommand => 14,
            Self::StopEndpointCommand => 15,
            Self::SetTrDequeuePointerCommand => 16,
            Self::ResetDeviceCommand => 17,
            Self::NoOpCommand => 23,
            Self::TransferEvent => 32,
            Self::CommandCompletionEvent => 33,
            Self::PortStatusChangeEvent => 34,
            Self::BandwidthRequestEvent => 35,
            Self::DoorbellEvent => 36,
            Self::HostControllerEvent => 37,
            Self::DeviceNotificationEvent => 38,
            Self::MfindexWrapEvent => 39,
            Self::Unknown(raw) => raw,
        }
    }

    pub const fn is_event(self) -> bool {
        matches!(self.raw(), 32..=39)
    }
}

/// Completion codes reported in the status field of event TRBs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompletionCode {
    Invalid,
    Success,
    DataBufferError,
    BabbleDetectedError,
    UsbTransactionError,
    TrbError,
    StallError,
    ResourceError,
    BandwidthError,
    NoSlotsAvailableError,
    InvalidStreamTypeError,
    SlotNotEnabledError,
    EndpointNotEnabledError,
    ShortPacket,
    RingUnderrun,
    RingOverrun,
    VfEventRingFullError,
    ParameterError,
    BandwidthOverrunError,
    ContextStateError,
    NoPingResponseError,
    EventRingFullError,
    IncompatibleDeviceError,
    MissedServiceError,
    CommandRingStopped,
    CommandAborted,
    Stopped,
    StoppedLengthInvalid,
    Unknown(u8),
}

impl CompletionCode {
    pub const fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Invalid,
            1 => Self::Success,
            2 => Self::DataBufferError,
            3 => Self::BabbleDetectedError,
            4 => Self::UsbTransactionError,
            5 => Self::TrbError,
            6 => Self::StallError,
            7 => Self::ResourceError,
            8 => Self::BandwidthError,
            9 => Self::NoSlotsAvailableError,
            10 => Self::InvalidStreamTypeError,
            11 => Self::SlotNotEnabledError,
            12 => Self::EndpointNotEnabledError,
            13 => Self::ShortPacket,
            14 => Self::RingUnderrun,
            15 => Self::RingOverrun,
            16 => Self::VfEventRingFullError,
            17 => Self::ParameterError,
            18 => Self::BandwidthOverrunError,
            19 => Self::ContextStateError,
            20 => Self::NoPingResponseError,
            21 => Self::EventRingFullError,
            22 => Self::IncompatibleDeviceError,
            23 => Self::MissedServiceError,
            24 => Self::CommandRingStopped,
            25 => Self::CommandAborted,
            26 => Self::Stopped,
            27 => Self::StoppedLengthInvalid,
            other => Self::Unknown(other),
        }
    }

    pub const fn raw(self) -> u8 {
        match self {
            Self::Invalid => 0,
            Self::Success => 1,
            Self::DataBufferError => 2,
            Self::BabbleDetectedError => 3,
            Self::UsbTransactionError => 4,
            Self::TrbError => 5,
            Self::StallError => 6,
            Self::ResourceError => 7,
            Self::BandwidthError => 8,
            Self::NoSlotsAvailableError => 9,
            Self::InvalidStreamTypeError => 10,
            Self::SlotNotEnabledError => 11,
            Self::EndpointNotEnabledError => 12,
            Self::ShortPacket => 13,
            Self::RingUnderrun => 14,
            Self::RingOverrun => 15,
            Self::VfEventRingFullError => 16,
            Self::ParameterError => 17,
            Self::BandwidthOverrunError => 18,
            Self::ContextStateError => 19,
            Self::NoPingResponseError => 20,
            Self::EventRingFullError => 21,
            Self::IncompatibleDeviceError => 22,
            Self::MissedServiceError => 23,
            Self::CommandRingStopped => 24,
            Self::CommandAborted => 25,
            Self::Stopped => 26,
            Self::StoppedLengthInvalid => 27,
            Self::Unknown(raw) => raw,
        }
    }

    /// `Success` and `ShortPacket` both mean the TD was consumed without an endpoint error.
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success | Self::ShortPacket)
    }
}

/// Transfer type (TRT) of a Setup Stage TRB.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferType {
    NoData = 0,
    Out = 2,
    In = 3,
}

bitflags! {
    /// Flag bits of the control dword (bits 0..=9).
    ///
    /// Several bits are type-specific: `TOGGLE_CYCLE` is Evaluate Next TRB on transfer TRBs and
    /// `BSR` only has meaning on Address Device commands.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct TrbFlags: u32 {
        const CYCLE = 1 << 0;
        const TOGGLE_CYCLE = 1 << 1;
        const ISP = 1 << 2;
        const CHAIN = 1 << 4;
        const IOC = 1 << 5;
        const IDT = 1 << 6;
        const BSR = 1 << 9;
    }
}

/// Decoded control dword.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrbControl {
    pub flags: TrbFlags,
    pub trb_type: TrbType,
    /// Bits 16..=23: DIR / TRT / endpoint id, depending on the TRB type.
    pub type_specific: u8,
    pub slot_id: u8,
}

impl TrbControl {
    const FLAGS_MASK: u32 = 0x3ff;
    const TYPE_SHIFT: u32 = 10;
    const TYPE_MASK: u32 = 0x3f;
    const TYPE_SPECIFIC_SHIFT: u32 = 16;
    const SLOT_ID_SHIFT: u32 = 24;

    pub const fn new(trb_type: TrbType) -> Self {
        Self {
            flags: TrbFlags::empty(),
            trb_type,
            type_specific: 0,
            slot_id: 0,
        }
    }

    pub fn decode(raw: u32) -> Self {
        Self {
            flags: TrbFlags::from_bits_retain(raw & Self::FLAGS_MASK),
            trb_type: TrbType::from_raw(((raw >> Self::TYPE_SHIFT) & Self::TYPE_MASK) as u8),
            type_specific: (raw >> Self::TYPE_SPECIFIC_SHIFT) as u8,
            slot_id: (raw >> Self::SLOT_ID_SHIFT) as u8,
        }
    }

    pub fn encode(&self) -> u32 {
        (self.flags.bits() & Self::FLAGS_MASK)
            | ((u32::from(self.trb_type.raw()) & Self::TYPE_MASK) << Self::TYPE_SHIFT)
            | (u32::from(self.type_specific) << Self::TYPE_SPECIFIC_SHIFT)
            | (u32::from(self.slot_id) << Self::SLOT_ID_SHIFT)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Trb {
    pub parameter: u64,
    pub status: u32,
    pub control: u32,
}

impl Trb {
    pub const CONTROL_CYCLE_BIT: u32 = TrbFlags::CYCLE.bits();
    pub const CONTROL_IOC_BIT: u32 = TrbFlags::IOC.bits();
    pub const CONTROL_IDT_BIT: u32 = TrbFlags::IDT.bits();
    /// Data direction of Data/Status Stage TRBs (1 = IN).
    pub const CONTROL_DIR_IN: u32 = 1 << 16;
    pub const CONTROL_TRT_SHIFT: u32 = 16;

    pub const STATUS_COMPLETION_CODE_SHIFT: u32 = 24;
    pub const STATUS_TRANSFER_LEN_MASK: u32 = 0x00ff_ffff;

    /// Port ID field of a Port Status Change Event (parameter bits 24..=31).
    const PARAMETER_PORT_ID_SHIFT: u32 = 24;
    /// DIR is bit 0 of the type-specific byte.
    const DIR_IN: u8 = 1 << 0;
    const ENDPOINT_ID_MASK: u8 = 0x1f;

    pub const fn new(parameter: u64, status: u32, control: u32) -> Self {
        Self {
            parameter,
            status,
            control,
        }
    }

    pub fn with_control(parameter: u64, status: u32, control: TrbControl) -> Self {
        Self::new(parameter, status, control.encode())
    }

    pub fn from_bytes(bytes: [u8; TRB_LEN]) -> Self {
        let mut parameter = [0u8; 8];
        let mut status = [0u8; 4];
        let mut control = [0u8; 4];
        parameter.copy_from_slice(&bytes[0..8]);
        status.copy_from_slice(&bytes[8..12]);
        control.copy_from_slice(&bytes[12..16]);
        Self {
            parameter: u64::from_le_bytes(parameter),
            status: u32::from_le_bytes(status),
            control: u32::from_le_bytes(control),
        }
    }

    pub fn to_bytes(&self) -> [u8; TRB_LEN] {
        let mut out = [0u8; TRB_LEN];
        out[0..8].copy_from_slice(&self.parameter.to_le_bytes());
        out[8..12].copy_from_slice(&self.status.to_le_bytes());
        out[12..16].copy_from_slice(&self.control.to_le_bytes());
        out
    }

    pub fn read_from<M: DmaMemory + ?Sized>(mem: &M, paddr: u64) -> Self {
        let mut bytes = [0u8; TRB_LEN];
        mem.read_physical(paddr, &mut bytes);
        Self::from_bytes(bytes)
    }

    /// Stores the TRB with the control dword (and therefore the cycle bit) written last.
    pub fn write_to<M: DmaMemory + ?Sized>(&self, mem: &mut M, paddr: u64) {
        let bytes = self.to_bytes();
        mem.write_physical(paddr, &bytes[0..12]);
        fence(Ordering::Release);
        mem.write_physical(paddr + 12, &bytes[12..16]);
    }

    /// Rewrites only the control dword of a TRB already in memory.
    pub fn write_control<M: DmaMemory + ?Sized>(mem: &mut M, paddr: u64, control: u32) {
        fence(Ordering::Release);
        mem.write_u32(paddr + 12, control);
    }

    pub fn control_fields(&self) -> TrbControl {
        TrbControl::decode(self.control)
    }

    fn update_control(&mut self, f: impl FnOnce(&mut TrbControl)) {
        let mut fields = self.control_fields();
        f(&mut fields);
        self.control = fields.encode();
    }

    pub fn flags(&self) -> TrbFlags {
        self.control_fields().flags
    }

    pub fn set_flags(&mut self, flags: TrbFlags, on: bool) {
        self.update_control(|c| c.flags.set(flags, on));
    }

    pub fn cycle(&self) -> bool {
        self.flags().contains(TrbFlags::CYCLE)
    }

    pub fn set_cycle(&mut self, on: bool) {
        self.set_flags(TrbFlags::CYCLE, on);
    }

    pub fn trb_type_raw(&self) -> u8 {
        self.control_fields().trb_type.raw()
    }

    pub fn trb_type(&self) -> TrbType {
        self.control_fields().trb_type
    }

    pub fn set_trb_type(&mut self, ty: TrbType) {
        self.update_control(|c| c.trb_type = ty);
    }

    pub fn slot_id(&self) -> u8 {
        self.control_fields().slot_id
    }

    pub fn set_slot_id(&mut self, slot_id: u8) {
        self.update_control(|c| c.slot_id = slot_id);
    }

    pub fn endpoint_id(&self) -> u8 {
        self.control_fields().type_specific & Self::ENDPOINT_ID_MASK
    }

    pub fn set_endpoint_id(&mut self, endpoint_id: u8) {
        self.update_control(|c| {
            c.type_specific =
                (c.type_specific & !Self::ENDPOINT_ID_MASK) | (endpoint_id & Self::ENDPOINT_ID_MASK)
        });
    }

    pub fn dir_in(&self) -> bool {
        self.control_fields().type_specific & Self::DIR_IN != 0
    }

    pub fn chain(&self) -> bool {
        self.flags().contains(TrbFlags::CHAIN)
    }

    pub fn set_chain(&mut self, on: bool) {
        self.set_flags(TrbFlags::CHAIN, on);
    }

    pub fn link_toggle_cycle(&self) -> bool {
        self.flags().contains(TrbFlags::TOGGLE_CYCLE)
    }

    pub fn completion_code_raw(&self) -> u8 {
        (self.status >> Self::STATUS_COMPLETION_CODE_SHIFT) as u8
    }

    pub fn completion_code(&self) -> CompletionCode {
        CompletionCode::from_raw(self.completion_code_raw())
    }

    /// Transfer length (or residual, for Transfer Events) in the low 24 bits of the status field.
    pub fn transfer_len(&self) -> u32 {
        self.status & Self::STATUS_TRANSFER_LEN_MASK
    }

    /// Root port number reported by a Port Status Change Event.
    pub fn port_id(&self) -> u8 {
        (self.parameter >> Self::PARAMETER_PORT_ID_SHIFT) as u8
    }

    /// Descriptor address, with the low 4 reserved bits masked.
    pub fn pointer(&self) -> u64 {
        self.parameter & !0xf
    }

    // ---- Constructors for the descriptors the engine produces ----

    /// Link TRB pointing at `target`, with Toggle Cycle set.
    pub fn link(target: u64, chain: bool) -> Self {
        let mut control = TrbControl::new(TrbType::Link);
        control.flags.insert(TrbFlags::TOGGLE_CYCLE);
        control.flags.set(TrbFlags::CHAIN, chain);
        Self::with_control(target & !0xf, 0, control)
    }

    pub fn command(ty: TrbType) -> Self {
        Self::with_control(0, 0, TrbControl::new(ty))
    }

    fn slot_command(ty: TrbType, slot_id: u8, endpoint_id: u8) -> TrbControl {
        let mut control = TrbControl::new(ty);
        control.slot_id = slot_id;
        control.type_specific = endpoint_id & Self::ENDPOINT_ID_MASK;
        control
    }

    pub fn enable_slot() -> Self {
        Self::command(TrbType::EnableSlotCommand)
    }

    pub fn disable_slot(slot_id: u8) -> Self {
        Self::with_control(0, 0, Self::slot_command(TrbType::DisableSlotCommand, slot_id, 0))
    }

    pub fn address_device(slot_id: u8, input_context: u64, block_set_address: bool) -> Self {
        let mut control = Self::slot_command(TrbType::AddressDeviceCommand, slot_id, 0);
        control.flags.set(TrbFlags::BSR, block_set_address);
        Self::with_control(input_context & !0xf, 0, control)
    }

    pub fn reset_endpoint(slot_id: u8, endpoint_id: u8) -> Self {
        let control = Self::slot_command(TrbType::ResetEndpointCommand, slot_id, endpoint_id);
        Self::with_control(0, 0, control)
    }

    pub fn stop_endpoint(slot_id: u8, endpoint_id: u8) -> Self {
        let control = Self::slot_command(TrbType::StopEndpointCommand, slot_id, endpoint_id);
        Self::with_control(0, 0, control)
    }

    /// Set TR Dequeue Pointer; `dequeue` must already carry the Dequeue Cycle State in bit 0.
    pub fn set_tr_dequeue_pointer(slot_id: u8, endpoint_id: u8, dequeue: u64) -> Self {
        let control =
            Self::slot_command(TrbType::SetTrDequeuePointerCommand, slot_id, endpoint_id);
        Self::with_control(dequeue, 0, control)
    }

    pub fn no_op_command() -> Self {
        Self::command(TrbType::NoOpCommand)
    }

    /// Setup Stage TRB with the 8-byte setup packet carried immediately in the parameter field.
    pub fn setup_stage(setup: u64, transfer_type: TransferType) -> Self {
        let mut control = TrbControl::new(TrbType::SetupStage);
        control.flags.insert(TrbFlags::IDT);
        control.type_specific = transfer_type as u8;
        Self::with_control(setup, 8, control)
    }

    pub fn data_stage(buffer: u64, len: u32, dir_in: bool) -> Self {
        let mut control = TrbControl::new(TrbType::DataStage);
        control.flags.set(TrbFlags::ISP, dir_in);
        if dir_in {
            control.type_specific = Self::DIR_IN;
        }
        Self::with_control(buffer, len & Self::STATUS_TRANSFER_LEN_MASK, control)
    }

    pub fn status_stage(dir_in: bool) -> Self {
        let mut control = TrbControl::new(TrbType::StatusStage);
        control.flags.insert(TrbFlags::IOC);
        if dir_in {
            control.type_specific = Self::DIR_IN;
        }
        Self::with_control(0, 0, control)
    }
}
