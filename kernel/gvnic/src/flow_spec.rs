//! Protocol-family-specific flow rule layouts and their translation to and from
//! the generic rule shape the directory and the firmware command use.
//!
//! A packet-classification configuration surface speaks in per-family structures
//! (an IPv4 5-tuple, an IPv6 5-tuple, AH/ESP with a security parameter index);
//! internally every rule is a `(flow_type, key, mask)` triple over one generic
//! field set, with the fields that do not apply to the family left zero.

use num_enum::TryFromPrimitive;

/// Classification protocol families, as encoded on the wire.
#[derive(Debug, PartialEq, Eq, Copy, Clone, TryFromPrimitive)]
#[repr(u16)]
pub enum FlowType {
    TcpV4  = 0,
    UdpV4  = 1,
    SctpV4 = 2,
    AhV4   = 3,
    EspV4  = 4,
    TcpV6  = 5,
    UdpV6  = 6,
    SctpV6 = 7,
    AhV6   = 8,
    EspV6  = 9,
}

impl FlowType {
    pub fn name(&self) -> &'static str {
        match self {
            FlowType::TcpV4 => "TCPv4",
            FlowType::UdpV4 => "UDPv4",
            FlowType::SctpV4 => "SCTPv4",
            FlowType::AhV4 => "AHv4",
            FlowType::EspV4 => "ESPv4",
            FlowType::TcpV6 => "TCPv6",
            FlowType::UdpV6 => "UDPv6",
            FlowType::SctpV6 => "SCTPv6",
            FlowType::AhV6 => "AHv6",
            FlowType::EspV6 => "ESPv6",
        }
    }
}

/// The generic protocol-field set a rule matches on (or the mask selecting which
/// fields matter). IPv4 addresses occupy the first four bytes of the address
/// fields; fields not applicable to a rule's family are zero.
#[derive(Debug, Default, PartialEq, Eq, Copy, Clone)]
pub struct FlowFields {
    pub src_ip: [u8; 16],
    pub dst_ip: [u8; 16],
    pub src_port: u16,
    pub dst_port: u16,
    pub spi: u32,
    /// Type-of-service (v4) or traffic class (v6).
    pub traffic_class: u8,
}

/// An IPv4 5-tuple match as supplied by the configuration surface.
#[derive(Debug, Default, PartialEq, Eq, Copy, Clone)]
pub struct Ipv4FlowSpec {
    pub src_ip: [u8; 4],
    pub dst_ip: [u8; 4],
    pub src_port: u16,
    pub dst_port: u16,
    pub tos: u8,
}

/// An IPv6 5-tuple match as supplied by the configuration surface.
#[derive(Debug, Default, PartialEq, Eq, Copy, Clone)]
pub struct Ipv6FlowSpec {
    pub src_ip: [u8; 16],
    pub dst_ip: [u8; 16],
    pub src_port: u16,
    pub dst_port: u16,
    pub traffic_class: u8,
}

/// An IPsec (AH/ESP over IPv4) match keyed by security parameter index.
#[derive(Debug, Default, PartialEq, Eq, Copy, Clone)]
pub struct Ipv4SecSpec {
    pub src_ip: [u8; 4],
    pub dst_ip: [u8; 4],
    pub spi: u32,
    pub tos: u8,
}

/// An IPsec (AH/ESP over IPv6) match keyed by security parameter index.
#[derive(Debug, Default, PartialEq, Eq, Copy, Clone)]
pub struct Ipv6SecSpec {
    pub src_ip: [u8; 16],
    pub dst_ip: [u8; 16],
    pub spi: u32,
    pub traffic_class: u8,
}

/// A family-specific rule match: the value fields and the mask choosing which of
/// them participate in classification.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum FlowSpec {
    TcpV4 { key: Ipv4FlowSpec, mask: Ipv4FlowSpec },
    UdpV4 { key: Ipv4FlowSpec, mask: Ipv4FlowSpec },
    SctpV4 { key: Ipv4FlowSpec, mask: Ipv4FlowSpec },
    AhV4 { key: Ipv4SecSpec, mask: Ipv4SecSpec },
    EspV4 { key: Ipv4SecSpec, mask: Ipv4SecSpec },
    TcpV6 { key: Ipv6FlowSpec, mask: Ipv6FlowSpec },
    UdpV6 { key: Ipv6FlowSpec, mask: Ipv6FlowSpec },
    SctpV6 { key: Ipv6FlowSpec, mask: Ipv6FlowSpec },
    AhV6 { key: Ipv6SecSpec, mask: Ipv6SecSpec },
    EspV6 { key: Ipv6SecSpec, mask: Ipv6SecSpec },
}

impl FlowSpec {
    pub fn flow_type(&self) -> FlowType {
        match self {
            FlowSpec::TcpV4 { .. } => FlowType::TcpV4,
            FlowSpec::UdpV4 { .. } => FlowType::UdpV4,
            FlowSpec::SctpV4 { .. } => FlowType::SctpV4,
            FlowSpec::AhV4 { .. } => FlowType::AhV4,
            FlowSpec::EspV4 { .. } => FlowType::EspV4,
            FlowSpec::TcpV6 { .. } => FlowType::TcpV6,
            FlowSpec::UdpV6 { .. } => FlowType::UdpV6,
            FlowSpec::SctpV6 { .. } => FlowType::SctpV6,
            FlowSpec::AhV6 { .. } => FlowType::AhV6,
            FlowSpec::EspV6 { .. } => FlowType::EspV6,
        }
    }

    /// Translates the family-specific layout into the generic `(key, mask)` pair.
    pub(crate) fn to_key_mask(&self) -> (FlowFields, FlowFields) {
        match self {
            FlowSpec::TcpV4 { key, mask }
            | FlowSpec::UdpV4 { key, mask }
            | FlowSpec::SctpV4 { key, mask } => {
                (fields_from_ipv4(key), fields_from_ipv4(mask))
            }
            FlowSpec::AhV4 { key, mask } | FlowSpec::EspV4 { key, mask } => {
                (fields_from_ipv4_sec(key), fields_from_ipv4_sec(mask))
            }
            FlowSpec::TcpV6 { key, mask }
            | FlowSpec::UdpV6 { key, mask }
            | FlowSpec::SctpV6 { key, mask } => {
                (fields_from_ipv6(key), fields_from_ipv6(mask))
            }
            FlowSpec::AhV6 { key, mask } | FlowSpec::EspV6 { key, mask } => {
                (fields_from_ipv6_sec(key), fields_from_ipv6_sec(mask))
            }
        }
    }

    /// Reconstructs the family-specific layout from a generic triple.
    pub(crate) fn from_key_mask(
        flow_type: FlowType,
        key: &FlowFields,
        mask: &FlowFields,
    ) -> FlowSpec {
        match flow_type {
            FlowType::TcpV4 => FlowSpec::TcpV4 { key: ipv4_from_fields(key), mask: ipv4_from_fields(mask) },
            FlowType::UdpV4 => FlowSpec::UdpV4 { key: ipv4_from_fields(key), mask: ipv4_from_fields(mask) },
            FlowType::SctpV4 => FlowSpec::SctpV4 { key: ipv4_from_fields(key), mask: ipv4_from_fields(mask) },
            FlowType::AhV4 => FlowSpec::AhV4 { key: ipv4_sec_from_fields(key), mask: ipv4_sec_from_fields(mask) },
            FlowType::EspV4 => FlowSpec::EspV4 { key: ipv4_sec_from_fields(key), mask: ipv4_sec_from_fields(mask) },
            FlowType::TcpV6 => FlowSpec::TcpV6 { key: ipv6_from_fields(key), mask: ipv6_from_fields(mask) },
            FlowType::UdpV6 => FlowSpec::UdpV6 { key: ipv6_from_fields(key), mask: ipv6_from_fields(mask) },
            FlowType::SctpV6 => FlowSpec::SctpV6 { key: ipv6_from_fields(key), mask: ipv6_from_fields(mask) },
            FlowType::AhV6 => FlowSpec::AhV6 { key: ipv6_sec_from_fields(key), mask: ipv6_sec_from_fields(mask) },
            FlowType::EspV6 => FlowSpec::EspV6 { key: ipv6_sec_from_fields(key), mask: ipv6_sec_from_fields(mask) },
        }
    }
}

fn fields_from_ipv4(spec: &Ipv4FlowSpec) -> FlowFields {
    let mut fields = FlowFields::default();
    fields.src_ip[..4].copy_from_slice(&spec.src_ip);
    fields.dst_ip[..4].copy_from_slice(&spec.dst_ip);
    fields.src_port = spec.src_port;
    fields.dst_port = spec.dst_port;
    fields.traffic_class = spec.tos;
    fields
}

fn fields_from_ipv4_sec(spec: &Ipv4SecSpec) -> FlowFields {
    let mut fields = FlowFields::default();
    fields.src_ip[..4].copy_from_slice(&spec.src_ip);
    fields.dst_ip[..4].copy_from_slice(&spec.dst_ip);
    fields.spi = spec.spi;
    fields.traffic_class = spec.tos;
    fields
}

fn fields_from_ipv6(spec: &Ipv6FlowSpec) -> FlowFields {
    FlowFields {
        src_ip: spec.src_ip,
        dst_ip: spec.dst_ip,
        src_port: spec.src_port,
        dst_port: spec.dst_port,
        spi: 0,
        traffic_class: spec.traffic_class,
    }
}

fn fields_from_ipv6_sec(spec: &Ipv6SecSpec) -> FlowFields {
    FlowFields {
        src_ip: spec.src_ip,
        dst_ip: spec.dst_ip,
        src_port: 0,
        dst_port: 0,
        spi: spec.spi,
        traffic_class: spec.traffic_class,
    }
}

fn ipv4_from_fields(fields: &FlowFields) -> Ipv4FlowSpec {
    let mut spec = Ipv4FlowSpec::default();
    spec.src_ip.copy_from_slice(&fields.src_ip[..4]);
    spec.dst_ip.copy_from_slice(&fields.dst_ip[..4]);
    spec.src_port = fields.src_port;
    spec.dst_port = fields.dst_port;
    spec.tos = fields.traffic_class;
    spec
}

fn ipv4_sec_from_fields(fields: &FlowFields) -> Ipv4SecSpec {
    let mut spec = Ipv4SecSpec::default();
    spec.src_ip.copy_from_slice(&fields.src_ip[..4]);
    spec.dst_ip.copy_from_slice(&fields.dst_ip[..4]);
    spec.spi = fields.spi;
    spec.tos = fields.traffic_class;
    spec
}

fn ipv6_from_fields(fields: &FlowFields) -> Ipv6FlowSpec {
    Ipv6FlowSpec {
        src_ip: fields.src_ip,
        dst_ip: fields.dst_ip,
        src_port: fields.src_port,
        dst_port: fields.dst_port,
        traffic_class: fields.traffic_class,
    }
}

fn ipv6_sec_from_fields(fields: &FlowFields) -> Ipv6SecSpec {
    Ipv6SecSpec {
        src_ip: fields.src_ip,
        dst_ip: fields.dst_ip,
        spi: fields.spi,
        traffic_class: fields.traffic_class,
    }
}
