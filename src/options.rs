//! DHCP options (RFC 2132) understood by the server.
//!
//! Each option on the wire is a code byte, a length byte, and that many bytes
//! of data. Options the server has no use for are kept as
//! [`DhcpOption::Unknown`]; the same variant carries a network's numbered
//! custom options out to clients.
//!
//! # References
//!
//! - RFC 2132: DHCP Options and BOOTP Vendor Extensions
//! - RFC 3397: Domain Search Option (119)

use std::net::Ipv4Addr;

use crate::error::{Error, Result};
use crate::model::NetworkOption;

/// Option data is limited by its one-byte length field.
const MAX_OPTION_LEN: usize = 255;

/// Router (3) and DNS server (6) lists fit 63 addresses in 255 bytes.
const MAX_ADDRESSES_PER_OPTION: usize = MAX_OPTION_LEN / 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OptionCode {
    Pad = 0,
    SubnetMask = 1,
    Router = 3,
    DnsServer = 6,
    Hostname = 12,
    RequestedIpAddress = 50,
    LeaseTime = 51,
    MessageType = 53,
    ServerIdentifier = 54,
    ParameterRequestList = 55,
    ClientIdentifier = 61,
    DomainSearch = 119,
    End = 255,
}

impl TryFrom<u8> for OptionCode {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Pad),
            1 => Ok(Self::SubnetMask),
            3 => Ok(Self::Router),
            6 => Ok(Self::DnsServer),
            12 => Ok(Self::Hostname),
            50 => Ok(Self::RequestedIpAddress),
            51 => Ok(Self::LeaseTime),
            53 => Ok(Self::MessageType),
            54 => Ok(Self::ServerIdentifier),
            55 => Ok(Self::ParameterRequestList),
            61 => Ok(Self::ClientIdentifier),
            119 => Ok(Self::DomainSearch),
            255 => Ok(Self::End),
            other => Err(other),
        }
    }
}

/// DHCP message types (Option 53).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Discover = 1,
    Offer = 2,
    Request = 3,
    Decline = 4,
    Ack = 5,
    Nak = 6,
    Release = 7,
    Inform = 8,
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Discover),
            2 => Ok(Self::Offer),
            3 => Ok(Self::Request),
            4 => Ok(Self::Decline),
            5 => Ok(Self::Ack),
            6 => Ok(Self::Nak),
            7 => Ok(Self::Release),
            8 => Ok(Self::Inform),
            other => Err(other),
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Discover => "DISCOVER",
            Self::Offer => "OFFER",
            Self::Request => "REQUEST",
            Self::Decline => "DECLINE",
            Self::Ack => "ACK",
            Self::Nak => "NAK",
            Self::Release => "RELEASE",
            Self::Inform => "INFORM",
        };
        f.write_str(name)
    }
}

/// A parsed DHCP option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhcpOption {
    SubnetMask(Ipv4Addr),
    /// First address is the default gateway.
    Router(Vec<Ipv4Addr>),
    DnsServer(Vec<Ipv4Addr>),
    Hostname(String),
    RequestedIpAddress(Ipv4Addr),
    /// Lease time in seconds.
    LeaseTime(u32),
    MessageType(MessageType),
    ServerIdentifier(Ipv4Addr),
    ParameterRequestList(Vec<u8>),
    ClientIdentifier(Vec<u8>),
    /// Search domains, dotted form.
    DomainSearch(Vec<String>),
    Unknown(u8, Vec<u8>),
}

fn ipv4(data: &[u8], what: &str) -> Result<Ipv4Addr> {
    let octets: [u8; 4] = data
        .try_into()
        .map_err(|_| Error::InvalidPacket(format!("Invalid {} length", what)))?;
    Ok(Ipv4Addr::from(octets))
}

fn ipv4_list(data: &[u8], what: &str) -> Result<Vec<Ipv4Addr>> {
    if data.is_empty() || !data.len().is_multiple_of(4) {
        return Err(Error::InvalidPacket(format!("Invalid {} option length", what)));
    }
    Ok(data
        .chunks_exact(4)
        .map(|chunk| Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]))
        .collect())
}

fn tlv(code: u8, data: &[u8]) -> Vec<u8> {
    let len = data.len().min(MAX_OPTION_LEN);
    let mut result = Vec::with_capacity(len + 2);
    result.push(code);
    result.push(len as u8);
    result.extend_from_slice(&data[..len]);
    result
}

/// Encodes domain names as length-prefixed labels, each name terminated by a
/// zero byte. No compression pointers are emitted.
pub fn encode_domain_search(names: &[String]) -> Vec<u8> {
    let mut payload = Vec::new();
    for name in names {
        for label in name.trim_end_matches('.').split('.').filter(|l| !l.is_empty()) {
            let bytes = &label.as_bytes()[..label.len().min(63)];
            payload.push(bytes.len() as u8);
            payload.extend_from_slice(bytes);
        }
        payload.push(0);
    }
    payload
}

/// Inverse of [`encode_domain_search`].
pub fn decode_domain_search(data: &[u8]) -> Result<Vec<String>> {
    let mut names = Vec::new();
    let mut labels: Vec<String> = Vec::new();
    let mut index = 0;
    while index < data.len() {
        let len = data[index] as usize;
        index += 1;
        if len == 0 {
            names.push(labels.join("."));
            labels.clear();
            continue;
        }
        if len > 63 {
            return Err(Error::InvalidPacket(
                "Compressed or oversized domain search label".to_string(),
            ));
        }
        let label = data
            .get(index..index + len)
            .ok_or_else(|| Error::InvalidPacket("Domain search label truncated".to_string()))?;
        labels.push(String::from_utf8_lossy(label).to_string());
        index += len;
    }
    if !labels.is_empty() {
        return Err(Error::InvalidPacket(
            "Domain search name not terminated".to_string(),
        ));
    }
    Ok(names)
}

impl DhcpOption {
    pub fn option_code(&self) -> u8 {
        match self {
            Self::SubnetMask(_) => OptionCode::SubnetMask as u8,
            Self::Router(_) => OptionCode::Router as u8,
            Self::DnsServer(_) => OptionCode::DnsServer as u8,
            Self::Hostname(_) => OptionCode::Hostname as u8,
            Self::RequestedIpAddress(_) => OptionCode::RequestedIpAddress as u8,
            Self::LeaseTime(_) => OptionCode::LeaseTime as u8,
            Self::MessageType(_) => OptionCode::MessageType as u8,
            Self::ServerIdentifier(_) => OptionCode::ServerIdentifier as u8,
            Self::ParameterRequestList(_) => OptionCode::ParameterRequestList as u8,
            Self::ClientIdentifier(_) => OptionCode::ClientIdentifier as u8,
            Self::DomainSearch(_) => OptionCode::DomainSearch as u8,
            Self::Unknown(code, _) => *code,
        }
    }

    /// A network's custom option, sent as its raw value bytes.
    pub fn custom(option: &NetworkOption) -> Self {
        Self::Unknown(option.number, option.value.as_bytes().to_vec())
    }

    /// Parses an option from its code and data (without the length byte).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPacket`] when the data length does not fit
    /// the option, or for Pad/End, which carry no data.
    pub fn parse(code: u8, data: &[u8]) -> Result<Self> {
        match OptionCode::try_from(code) {
            Ok(OptionCode::SubnetMask) => Ok(Self::SubnetMask(ipv4(data, "subnet mask")?)),
            Ok(OptionCode::Router) => Ok(Self::Router(ipv4_list(data, "router")?)),
            Ok(OptionCode::DnsServer) => Ok(Self::DnsServer(ipv4_list(data, "DNS server")?)),
            Ok(OptionCode::Hostname) => {
                Ok(Self::Hostname(String::from_utf8_lossy(data).to_string()))
            }
            Ok(OptionCode::RequestedIpAddress) => Ok(Self::RequestedIpAddress(ipv4(
                data,
                "requested IP address",
            )?)),
            Ok(OptionCode::LeaseTime) => {
                let bytes: [u8; 4] = data
                    .try_into()
                    .map_err(|_| Error::InvalidPacket("Invalid lease time length".to_string()))?;
                Ok(Self::LeaseTime(u32::from_be_bytes(bytes)))
            }
            Ok(OptionCode::MessageType) => {
                let [value] = data else {
                    return Err(Error::InvalidPacket(
                        "Invalid message type length".to_string(),
                    ));
                };
                let message_type = MessageType::try_from(*value).map_err(|value| {
                    Error::InvalidPacket(format!("Unknown message type: {}", value))
                })?;
                Ok(Self::MessageType(message_type))
            }
            Ok(OptionCode::ServerIdentifier) => {
                Ok(Self::ServerIdentifier(ipv4(data, "server identifier")?))
            }
            Ok(OptionCode::ParameterRequestList) => Ok(Self::ParameterRequestList(data.to_vec())),
            Ok(OptionCode::ClientIdentifier) => Ok(Self::ClientIdentifier(data.to_vec())),
            Ok(OptionCode::DomainSearch) => Ok(Self::DomainSearch(decode_domain_search(data)?)),
            Ok(OptionCode::Pad) | Ok(OptionCode::End) => Err(Error::InvalidPacket(
                "Pad/End should not be parsed as options".to_string(),
            )),
            Err(unknown_code) => Ok(Self::Unknown(unknown_code, data.to_vec())),
        }
    }

    /// Encodes the option as code, length, and data. Oversized data is
    /// truncated to what the length byte can describe.
    pub fn encode(&self) -> Vec<u8> {
        let code = self.option_code();
        match self {
            Self::SubnetMask(addr)
            | Self::RequestedIpAddress(addr)
            | Self::ServerIdentifier(addr) => tlv(code, &addr.octets()),
            Self::Router(addrs) | Self::DnsServer(addrs) => {
                let data: Vec<u8> = addrs
                    .iter()
                    .take(MAX_ADDRESSES_PER_OPTION)
                    .flat_map(|addr| addr.octets())
                    .collect();
                tlv(code, &data)
            }
            Self::Hostname(name) => tlv(code, name.as_bytes()),
            Self::LeaseTime(time) => tlv(code, &time.to_be_bytes()),
            Self::MessageType(message_type) => tlv(code, &[*message_type as u8]),
            Self::ParameterRequestList(data)
            | Self::ClientIdentifier(data)
            | Self::Unknown(_, data) => tlv(code, data),
            Self::DomainSearch(names) => tlv(code, &encode_domain_search(names)),
        }
    }
}
