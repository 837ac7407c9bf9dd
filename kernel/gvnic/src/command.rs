//! Wire format of admin queue commands.
//!
//! Each command occupies one fixed-size slot in the admin queue ring: a big-endian
//! opcode word, an opcode-specific payload, and a trailing status word that the
//! device overwrites in place once it has executed the command. All multi-byte
//! integers are big-endian on the wire.
//!
//! Payloads that do not fit in a slot (currently only flow-rule configuration) are
//! carried in a separate DMA buffer referenced by an [`ExtendedCommand`] envelope.

use byteorder::BigEndian;
use num_enum::TryFromPrimitive;
use zerocopy::byteorder::{U16, U32, U64};
use zerocopy::{AsBytes, FromBytes, Unaligned};

/// Size in bytes of one command slot in the admin queue ring.
pub const COMMAND_SLOT_SIZE: usize = 64;
/// Size in bytes of the opcode-specific payload area of a slot.
pub const COMMAND_PAYLOAD_SIZE: usize = 56;
/// Byte offset of the status word within a slot.
pub const COMMAND_STATUS_OFFSET: usize = 60;

/// Admin queue command opcodes.
#[derive(Debug, PartialEq, Eq, Copy, Clone, TryFromPrimitive)]
#[repr(u32)]
pub enum CommandOpcode {
    DescribeDevice             = 0x1,
    ConfigureDeviceResources   = 0x2,
    RegisterPageList           = 0x3,
    UnregisterPageList         = 0x4,
    CreateTxQueue              = 0x5,
    CreateRxQueue              = 0x6,
    DestroyTxQueue             = 0x7,
    DestroyRxQueue             = 0x8,
    DeconfigureDeviceResources = 0x9,
    SetDriverParameter         = 0xB,
    ReportStats                = 0xC,
    ReportLinkSpeed            = 0xD,
    GetPtypeMap                = 0xE,
    VerifyDriverCompatibility  = 0xF,
    ConfigureRss               = 0x12,
    /// Envelope for commands whose payload lives in a separate DMA buffer.
    ExtendedCommand            = 0xFF,
    /// Issued through the extended command envelope, never placed in a slot directly.
    ConfigureFlowRule          = 0x101,
}

/// Status codes the device writes into a slot's trailing status word.
#[derive(Debug, PartialEq, Eq, Copy, Clone, TryFromPrimitive)]
#[repr(u32)]
pub enum CommandStatus {
    Unset                   = 0x0,
    Passed                  = 0x1,
    AbortedError            = 0xFFFF_FFF0,
    AlreadyExistsError      = 0xFFFF_FFF1,
    CancelledError          = 0xFFFF_FFF2,
    DatalossError           = 0xFFFF_FFF3,
    DeadlineExceededError   = 0xFFFF_FFF4,
    FailedPreconditionError = 0xFFFF_FFF5,
    InternalError           = 0xFFFF_FFF6,
    InvalidArgumentError    = 0xFFFF_FFF7,
    NotFoundError           = 0xFFFF_FFF8,
    OutOfRangeError         = 0xFFFF_FFF9,
    PermissionDeniedError   = 0xFFFF_FFFA,
    UnauthenticatedError    = 0xFFFF_FFFB,
    ResourceExhaustedError  = 0xFFFF_FFFC,
    UnavailableError        = 0xFFFF_FFFD,
    UnimplementedError      = 0xFFFF_FFFE,
    UnknownError            = 0xFFFF_FFFF,
}

/// Parameter ids for [`CommandOpcode::SetDriverParameter`].
pub const DRIVER_PARAMETER_MTU: u32 = 1;

#[derive(FromBytes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C)]
pub struct DescribeDeviceCommand {
    pub device_descriptor_addr: U64<BigEndian>,
    pub device_descriptor_version: U32<BigEndian>,
    pub available_length: U32<BigEndian>,
}
const_assert_eq!(core::mem::size_of::<DescribeDeviceCommand>(), 16);

#[derive(FromBytes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C)]
pub struct ConfigureDeviceResourcesCommand {
    pub counter_array_addr: U64<BigEndian>,
    pub num_counters: U32<BigEndian>,
    pub irq_db_addr: U64<BigEndian>,
    pub num_irq_dbs: U32<BigEndian>,
    pub irq_db_stride: U32<BigEndian>,
    pub ntfy_blk_msix_base_idx: U32<BigEndian>,
    pub queue_format: u8,
    pub padding: [u8; 3],
}
const_assert_eq!(core::mem::size_of::<ConfigureDeviceResourcesCommand>(), 36);

#[derive(FromBytes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C)]
pub struct RegisterPageListCommand {
    pub page_list_id: U32<BigEndian>,
    pub num_pages: U32<BigEndian>,
    pub page_address_list_addr: U64<BigEndian>,
}
const_assert_eq!(core::mem::size_of::<RegisterPageListCommand>(), 16);

#[derive(FromBytes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C)]
pub struct UnregisterPageListCommand {
    pub page_list_id: U32<BigEndian>,
}
const_assert_eq!(core::mem::size_of::<UnregisterPageListCommand>(), 4);

#[derive(FromBytes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C)]
pub struct CreateTxQueueCommand {
    pub queue_id: U32<BigEndian>,
    pub reserved: U32<BigEndian>,
    pub queue_resources_addr: U64<BigEndian>,
    pub tx_ring_addr: U64<BigEndian>,
    pub queue_page_list_id: U32<BigEndian>,
    pub ntfy_id: U32<BigEndian>,
    pub tx_comp_ring_addr: U64<BigEndian>,
    pub tx_ring_size: U16<BigEndian>,
    pub tx_comp_ring_size: U16<BigEndian>,
    pub padding: [u8; 4],
}
const_assert_eq!(core::mem::size_of::<CreateTxQueueCommand>(), 48);

#[derive(FromBytes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C)]
pub struct CreateRxQueueCommand {
    pub queue_id: U32<BigEndian>,
    pub index: U32<BigEndian>,
    pub reserved: U32<BigEndian>,
    pub ntfy_id: U32<BigEndian>,
    pub queue_resources_addr: U64<BigEndian>,
    pub rx_desc_ring_addr: U64<BigEndian>,
    pub rx_data_ring_addr: U64<BigEndian>,
    pub queue_page_list_id: U32<BigEndian>,
    pub rx_ring_size: U16<BigEndian>,
    pub packet_buffer_size: U16<BigEndian>,
    pub rx_buff_ring_size: U16<BigEndian>,
    pub enable_rsc: u8,
    pub padding1: u8,
    pub header_buffer_size: U16<BigEndian>,
    pub padding2: [u8; 2],
}
const_assert_eq!(core::mem::size_of::<CreateRxQueueCommand>(), COMMAND_PAYLOAD_SIZE);

#[derive(FromBytes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C)]
pub struct DestroyTxQueueCommand {
    pub queue_id: U32<BigEndian>,
}
const_assert_eq!(core::mem::size_of::<DestroyTxQueueCommand>(), 4);

#[derive(FromBytes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C)]
pub struct DestroyRxQueueCommand {
    pub queue_id: U32<BigEndian>,
}
const_assert_eq!(core::mem::size_of::<DestroyRxQueueCommand>(), 4);

#[derive(FromBytes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C)]
pub struct SetDriverParameterCommand {
    pub parameter_type: U32<BigEndian>,
    pub reserved: U32<BigEndian>,
    pub parameter_value: U64<BigEndian>,
}
const_assert_eq!(core::mem::size_of::<SetDriverParameterCommand>(), 16);

#[derive(FromBytes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C)]
pub struct ReportStatsCommand {
    pub stats_report_len: U64<BigEndian>,
    pub stats_report_addr: U64<BigEndian>,
    pub interval: U64<BigEndian>,
}
const_assert_eq!(core::mem::size_of::<ReportStatsCommand>(), 24);

#[derive(FromBytes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C)]
pub struct ReportLinkSpeedCommand {
    pub link_speed_address: U64<BigEndian>,
}
const_assert_eq!(core::mem::size_of::<ReportLinkSpeedCommand>(), 8);

#[derive(FromBytes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C)]
pub struct GetPtypeMapCommand {
    pub ptype_map_len: U64<BigEndian>,
    pub ptype_map_addr: U64<BigEndian>,
}
const_assert_eq!(core::mem::size_of::<GetPtypeMapCommand>(), 16);

#[derive(FromBytes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C)]
pub struct VerifyDriverCompatibilityCommand {
    pub driver_info_len: U64<BigEndian>,
    pub driver_info_addr: U64<BigEndian>,
}
const_assert_eq!(core::mem::size_of::<VerifyDriverCompatibilityCommand>(), 16);

#[derive(FromBytes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C)]
pub struct ConfigureRssCommand {
    pub hash_types: U16<BigEndian>,
    pub hash_algorithm: u8,
    pub reserved: u8,
    pub hash_key_size: U16<BigEndian>,
    pub indirection_table_size: U16<BigEndian>,
    pub hash_key_addr: U64<BigEndian>,
    pub indirection_table_addr: U64<BigEndian>,
}
const_assert_eq!(core::mem::size_of::<ConfigureRssCommand>(), 24);

#[derive(FromBytes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C)]
pub struct ExtendedCommand {
    pub inner_opcode: U32<BigEndian>,
    pub inner_length: U32<BigEndian>,
    pub inner_command_addr: U64<BigEndian>,
}
const_assert_eq!(core::mem::size_of::<ExtendedCommand>(), 16);

bitflags! {
    /// Packet-hash classes covered by RSS, as encoded in
    /// [`ConfigureRssCommand::hash_types`].
    pub struct RssHashTypes: u16 {
        const IPV4  = 1 << 0;
        const TCPV4 = 1 << 1;
        const UDPV4 = 1 << 2;
        const IPV6  = 1 << 3;
        const TCPV6 = 1 << 4;
        const UDPV6 = 1 << 5;
    }
}

/// Operations carried by a [`ConfigureFlowRuleCommand`].
#[derive(Debug, PartialEq, Eq, Copy, Clone, TryFromPrimitive)]
#[repr(u16)]
pub enum FlowRuleOperation {
    Add    = 1,
    Remove = 2,
    Reset  = 3,
}

/// Protocol-field match values (or the mask selecting which of them matter).
///
/// IPv4 addresses occupy the first four bytes of the address fields. The port pair
/// is meaningful for TCP/UDP/SCTP rules and `spi` for AH/ESP rules; the unused
/// fields of a rule are zero.
#[derive(FromBytes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C)]
pub struct FlowSpecWire {
    pub src_ip: [u8; 16],
    pub dst_ip: [u8; 16],
    pub src_port: U16<BigEndian>,
    pub dst_port: U16<BigEndian>,
    pub spi: U32<BigEndian>,
    pub traffic_class: u8,
    pub padding: [u8; 3],
}
const_assert_eq!(core::mem::size_of::<FlowSpecWire>(), 44);

#[derive(FromBytes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C)]
pub struct FlowRuleWire {
    pub flow_type: U16<BigEndian>,
    pub action: U16<BigEndian>,
    pub key: FlowSpecWire,
    pub mask: FlowSpecWire,
}
const_assert_eq!(core::mem::size_of::<FlowRuleWire>(), 92);

/// The flow-rule configuration command. Larger than a slot, so always issued
/// through the [`ExtendedCommand`] envelope.
#[derive(FromBytes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C)]
pub struct ConfigureFlowRuleCommand {
    pub operation: U16<BigEndian>,
    pub location: U16<BigEndian>,
    pub rule: FlowRuleWire,
}
const_assert_eq!(core::mem::size_of::<ConfigureFlowRuleCommand>(), 96);

/// A command ready to be placed into an admin queue slot.
pub enum AdminqCommand {
    DescribeDevice(DescribeDeviceCommand),
    ConfigureDeviceResources(ConfigureDeviceResourcesCommand),
    RegisterPageList(RegisterPageListCommand),
    UnregisterPageList(UnregisterPageListCommand),
    CreateTxQueue(CreateTxQueueCommand),
    CreateRxQueue(CreateRxQueueCommand),
    DestroyTxQueue(DestroyTxQueueCommand),
    DestroyRxQueue(DestroyRxQueueCommand),
    DeconfigureDeviceResources,
    SetDriverParameter(SetDriverParameterCommand),
    ReportStats(ReportStatsCommand),
    ReportLinkSpeed(ReportLinkSpeedCommand),
    GetPtypeMap(GetPtypeMapCommand),
    VerifyDriverCompatibility(VerifyDriverCompatibilityCommand),
    ConfigureRss(ConfigureRssCommand),
    Extended(ExtendedCommand),
}

impl AdminqCommand {
    /// The opcode written into the slot for this command.
    pub fn opcode(&self) -> CommandOpcode {
        match self {
            AdminqCommand::DescribeDevice(_) => CommandOpcode::DescribeDevice,
            AdminqCommand::ConfigureDeviceResources(_) => CommandOpcode::ConfigureDeviceResources,
            AdminqCommand::RegisterPageList(_) => CommandOpcode::RegisterPageList,
            AdminqCommand::UnregisterPageList(_) => CommandOpcode::UnregisterPageList,
            AdminqCommand::CreateTxQueue(_) => CommandOpcode::CreateTxQueue,
            AdminqCommand::CreateRxQueue(_) => CommandOpcode::CreateRxQueue,
            AdminqCommand::DestroyTxQueue(_) => CommandOpcode::DestroyTxQueue,
            AdminqCommand::DestroyRxQueue(_) => CommandOpcode::DestroyRxQueue,
            AdminqCommand::DeconfigureDeviceResources => CommandOpcode::DeconfigureDeviceResources,
            AdminqCommand::SetDriverParameter(_) => CommandOpcode::SetDriverParameter,
            AdminqCommand::ReportStats(_) => CommandOpcode::ReportStats,
            AdminqCommand::ReportLinkSpeed(_) => CommandOpcode::ReportLinkSpeed,
            AdminqCommand::GetPtypeMap(_) => CommandOpcode::GetPtypeMap,
            AdminqCommand::VerifyDriverCompatibility(_) => CommandOpcode::VerifyDriverCompatibility,
            AdminqCommand::ConfigureRss(_) => CommandOpcode::ConfigureRss,
            AdminqCommand::Extended(_) => CommandOpcode::ExtendedCommand,
        }
    }

    /// The opcode-specific payload bytes.
    pub fn payload_bytes(&self) -> &[u8] {
        match self {
            AdminqCommand::DescribeDevice(c) => c.as_bytes(),
            AdminqCommand::ConfigureDeviceResources(c) => c.as_bytes(),
            AdminqCommand::RegisterPageList(c) => c.as_bytes(),
            AdminqCommand::UnregisterPageList(c) => c.as_bytes(),
            AdminqCommand::CreateTxQueue(c) => c.as_bytes(),
            AdminqCommand::CreateRxQueue(c) => c.as_bytes(),
            AdminqCommand::DestroyTxQueue(c) => c.as_bytes(),
            AdminqCommand::DestroyRxQueue(c) => c.as_bytes(),
            AdminqCommand::DeconfigureDeviceResources => &[],
            AdminqCommand::SetDriverParameter(c) => c.as_bytes(),
            AdminqCommand::ReportStats(c) => c.as_bytes(),
            AdminqCommand::ReportLinkSpeed(c) => c.as_bytes(),
            AdminqCommand::GetPtypeMap(c) => c.as_bytes(),
            AdminqCommand::VerifyDriverCompatibility(c) => c.as_bytes(),
            AdminqCommand::ConfigureRss(c) => c.as_bytes(),
            AdminqCommand::Extended(c) => c.as_bytes(),
        }
    }

    /// The opcode used for per-command statistics: extended envelopes are accounted
    /// under their inner opcode.
    pub fn accounting_opcode(&self) -> u32 {
        match self {
            AdminqCommand::Extended(c) => c.inner_opcode.get(),
            other => other.opcode() as u32,
        }
    }

    /// Serializes the command into a ring slot, leaving the status word unset.
    pub fn encode_into(&self, slot: &mut [u8]) {
        debug_assert_eq!(slot.len(), COMMAND_SLOT_SIZE);
        for byte in slot.iter_mut() {
            *byte = 0;
        }
        slot[0..4].copy_from_slice(&(self.opcode() as u32).to_be_bytes());
        let payload = self.payload_bytes();
        slot[4..4 + payload.len()].copy_from_slice(payload);
    }
}
