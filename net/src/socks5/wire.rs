//! SOCKS5 (RFC 1928) client messages for the CONNECT command.
//!
//! ```txt
//! greeting:          +-----+----------+----------+
//!                    | VER | NMETHODS | METHODS  |
//!                    +-----+----------+----------+
//! method selection:  +-----+--------+
//!                    | VER | METHOD |
//!                    +-----+--------+
//! request:           +-----+-----+-------+------+----------+----------+
//!                    | VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
//!                    +-----+-----+-------+------+----------+----------+
//! reply:             +-----+-----+-------+------+----------+----------+
//!                    | VER | REP |  RSV  | ATYP | BND.ADDR | BND.PORT |
//!                    +-----+-----+-------+------+----------+----------+
//! ```

use crate::Error;
use bytes::{BufMut, Bytes, BytesMut};
use libight_buffer::ByteBuffer;
use std::{
    fmt,
    net::{Ipv4Addr, Ipv6Addr},
};

pub const VERSION: u8 = 0x05;
pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_NO_ACCEPTABLE: u8 = 0xFF;
pub const CMD_CONNECT: u8 = 0x01;
pub const RESERVED: u8 = 0x00;
pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;
pub const REP_SUCCEEDED: u8 = 0x00;

/// Client greeting offering a single method: no authentication.
pub const GREETING: [u8; 3] = [VERSION, 0x01, METHOD_NO_AUTH];

/// Length of the method selection message.
pub const METHOD_SELECTION_LEN: usize = 2;

/// Length of the fixed part of the reply (VER, REP, RSV, ATYP).
pub const REPLY_HEADER_LEN: usize = 4;

/// Longest domain name that fits the one-byte length prefix.
pub const MAX_DOMAIN_LEN: usize = 255;

/// Handshake bytes that do not follow the protocol.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    #[error("unexpected version: {0:#04x}")]
    Version(u8),
    #[error("no acceptable authentication method")]
    NoAcceptableMethod,
    #[error("unexpected method: {0:#04x}")]
    Method(u8),
    #[error("unexpected reserved byte: {0:#04x}")]
    Reserved(u8),
    #[error("unknown address type: {0:#04x}")]
    AddressType(u8),
    #[error("unexpected {0} bytes before connect reply")]
    UnexpectedBytes(usize),
    #[error("data before connect")]
    DataBeforeConnect,
    #[error("invalid domain length: {0}")]
    DomainLength(usize),
}

/// Reply code reported by the proxy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reply {
    Succeeded,
    GeneralFailure,
    NotAllowed,
    NetworkUnreachable,
    HostUnreachable,
    ConnectionRefused,
    TtlExpired,
    CommandNotSupported,
    AddressTypeNotSupported,
    Unknown(u8),
}

impl From<u8> for Reply {
    fn from(code: u8) -> Self {
        match code {
            REP_SUCCEEDED => Self::Succeeded,
            0x01 => Self::GeneralFailure,
            0x02 => Self::NotAllowed,
            0x03 => Self::NetworkUnreachable,
            0x04 => Self::HostUnreachable,
            0x05 => Self::ConnectionRefused,
            0x06 => Self::TtlExpired,
            0x07 => Self::CommandNotSupported,
            0x08 => Self::AddressTypeNotSupported,
            code => Self::Unknown(code),
        }
    }
}

impl Reply {
    /// Wire value of the reply.
    pub const fn code(&self) -> u8 {
        match self {
            Self::Succeeded => REP_SUCCEEDED,
            Self::GeneralFailure => 0x01,
            Self::NotAllowed => 0x02,
            Self::NetworkUnreachable => 0x03,
            Self::HostUnreachable => 0x04,
            Self::ConnectionRefused => 0x05,
            Self::TtlExpired => 0x06,
            Self::CommandNotSupported => 0x07,
            Self::AddressTypeNotSupported => 0x08,
            Self::Unknown(code) => *code,
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::GeneralFailure => write!(f, "general SOCKS server failure"),
            Self::NotAllowed => write!(f, "connection not allowed by ruleset"),
            Self::NetworkUnreachable => write!(f, "network unreachable"),
            Self::HostUnreachable => write!(f, "host unreachable"),
            Self::ConnectionRefused => write!(f, "connection refused"),
            Self::TtlExpired => write!(f, "TTL expired"),
            Self::CommandNotSupported => write!(f, "command not supported"),
            Self::AddressTypeNotSupported => write!(f, "address type not supported"),
            Self::Unknown(code) => write!(f, "unknown reply {code:#04x}"),
        }
    }
}

/// Destination (or bound) address of a request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Address {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Domain(String),
}

impl Address {
    /// Classify `host` as an IP literal or a domain name.
    ///
    /// Returns `None` if `host` is empty or longer than [MAX_DOMAIN_LEN].
    pub fn parse(host: &str) -> Option<Self> {
        if let Ok(ip) = host.parse::<Ipv4Addr>() {
            return Some(Self::Ipv4(ip));
        }
        let literal = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = literal.parse::<Ipv6Addr>() {
            return Some(Self::Ipv6(ip));
        }
        if host.is_empty() || host.len() > MAX_DOMAIN_LEN {
            return None;
        }
        Some(Self::Domain(host.to_owned()))
    }

    /// Address type tag.
    pub const fn address_type(&self) -> u8 {
        match self {
            Self::Ipv4(_) => ATYP_IPV4,
            Self::Ipv6(_) => ATYP_IPV6,
            Self::Domain(_) => ATYP_DOMAIN,
        }
    }

    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.address_type());
        match self {
            Self::Ipv4(ip) => buf.put_slice(&ip.octets()),
            Self::Ipv6(ip) => buf.put_slice(&ip.octets()),
            Self::Domain(domain) => {
                buf.put_u8(domain.len() as u8);
                buf.put_slice(domain.as_bytes());
            }
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ipv4(ip) => write!(f, "{ip}"),
            Self::Ipv6(ip) => write!(f, "[{ip}]"),
            Self::Domain(domain) => write!(f, "{domain}"),
        }
    }
}

/// Encode a CONNECT request for `address:port`.
///
/// Fails if a domain is empty or longer than [MAX_DOMAIN_LEN].
pub fn connect_request(address: &Address, port: u16) -> Result<Bytes, ProtocolViolation> {
    if let Address::Domain(domain) = address {
        if domain.is_empty() || domain.len() > MAX_DOMAIN_LEN {
            return Err(ProtocolViolation::DomainLength(domain.len()));
        }
    }
    let mut buf = BytesMut::with_capacity(REPLY_HEADER_LEN + 1 + MAX_DOMAIN_LEN + 2);
    buf.put_u8(VERSION);
    buf.put_u8(CMD_CONNECT);
    buf.put_u8(RESERVED);
    address.encode(&mut buf);
    buf.put_u16(port);
    Ok(buf.freeze())
}

/// Verify the proxy selected "no authentication".
pub fn check_method_selection(selection: &[u8]) -> Result<(), ProtocolViolation> {
    match selection {
        [VERSION, METHOD_NO_AUTH] => Ok(()),
        [VERSION, METHOD_NO_ACCEPTABLE] => Err(ProtocolViolation::NoAcceptableMethod),
        [VERSION, method] => Err(ProtocolViolation::Method(*method)),
        [version, _] => Err(ProtocolViolation::Version(*version)),
        other => Err(ProtocolViolation::UnexpectedBytes(other.len())),
    }
}

/// Verify the fixed part of the reply and return its address type.
///
/// A well-formed reply with a failure code yields [Error::ProxyConnect].
pub fn check_reply_header(header: &[u8]) -> Result<u8, Error> {
    let [version, reply, reserved, address_type] = header else {
        return Err(ProtocolViolation::UnexpectedBytes(header.len()).into());
    };
    if *version != VERSION {
        return Err(ProtocolViolation::Version(*version).into());
    }
    if *reply != REP_SUCCEEDED {
        return Err(Error::ProxyConnect(Reply::from(*reply)));
    }
    if *reserved != RESERVED {
        return Err(ProtocolViolation::Reserved(*reserved).into());
    }
    match *address_type {
        ATYP_IPV4 | ATYP_IPV6 | ATYP_DOMAIN => Ok(*address_type),
        other => Err(ProtocolViolation::AddressType(other).into()),
    }
}

/// Length of the bound address and port that follow a reply header, or `None`
/// if `pending` does not yet hold enough bytes to tell.
pub fn bound_len(
    address_type: u8,
    pending: &ByteBuffer,
) -> Result<Option<usize>, ProtocolViolation> {
    match address_type {
        ATYP_IPV4 => Ok(Some(4 + 2)),
        ATYP_IPV6 => Ok(Some(16 + 2)),
        ATYP_DOMAIN => Ok(pending.peek(1).first().map(|len| 1 + *len as usize + 2)),
        other => Err(ProtocolViolation::AddressType(other)),
    }
}

/// Decode a bound address and port previously sized by [bound_len].
pub fn decode_bound(address_type: u8, bound: &[u8]) -> Option<(Address, u16)> {
    let (address, port) = bound.split_at(bound.len().checked_sub(2)?);
    let port = u16::from_be_bytes([port[0], port[1]]);
    let address = match address_type {
        ATYP_IPV4 => Address::Ipv4(Ipv4Addr::from(<[u8; 4]>::try_from(address).ok()?)),
        ATYP_IPV6 => Address::Ipv6(Ipv6Addr::from(<[u8; 16]>::try_from(address).ok()?)),
        ATYP_DOMAIN => {
            let (_, domain) = address.split_first()?;
            Address::Domain(String::from_utf8_lossy(domain).into_owned())
        }
        _ => return None,
    };
    Some((address, port))
}
