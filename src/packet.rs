//! DHCP message parsing and encoding (RFC 2131).
//!
//! A message is a fixed 236-byte BOOTP header, the magic cookie
//! `99.130.83.99`, and a list of TLV options. The `sname` and `file` header
//! areas are skipped on input and zeroed on output; option overloading into
//! them is not supported.
//!
//! ```text
//! offset  size  field
//!      0     1  op
//!      1     1  htype
//!      2     1  hlen
//!      3     1  hops
//!      4     4  xid
//!      8     2  secs
//!     10     2  flags
//!     12     4  ciaddr
//!     16     4  yiaddr
//!     20     4  siaddr
//!     24     4  giaddr
//!     28    16  chaddr
//!     44    64  sname
//!    108   128  file
//!    236     4  magic cookie
//!    240     -  options
//! ```

use std::net::Ipv4Addr;

use crate::error::{Error, Result};
use crate::options::{DhcpOption, MessageType, OptionCode};

const DHCP_MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];

const CHADDR_OFFSET: usize = 28;
const CHADDR_SIZE: usize = 16;
const SNAME_SIZE: usize = 64;
const FILE_SIZE: usize = 128;
const MAGIC_COOKIE_OFFSET: usize = CHADDR_OFFSET + CHADDR_SIZE + SNAME_SIZE + FILE_SIZE;
const OPTIONS_OFFSET: usize = MAGIC_COOKIE_OFFSET + DHCP_MAGIC_COOKIE.len();

/// Replies are padded to the BOOTP minimum so relay agents accept them.
const DHCP_MIN_PACKET_SIZE: usize = 300;

/// Minimum datagram every host must accept (RFC 791).
const DHCP_ENCODE_CAPACITY: usize = 576;

/// Relay loop protection (RFC 2131 §4.1).
const MAX_HOPS: u8 = 16;

const BROADCAST_FLAG: u16 = 0x8000;

pub const BOOTREQUEST: u8 = 1;
pub const BOOTREPLY: u8 = 2;
pub const HTYPE_ETHERNET: u8 = 1;
pub const HLEN_ETHERNET: u8 = 6;

/// A DHCP message, request or reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpPacket {
    /// [`BOOTREQUEST`] or [`BOOTREPLY`].
    pub op: u8,
    pub htype: u8,
    pub hlen: u8,
    pub hops: u8,
    /// Transaction ID chosen by the client and echoed in replies.
    pub xid: u32,
    pub secs: u16,
    /// Bit 15 asks the server to broadcast its reply.
    pub flags: u16,
    /// Client address, set by clients that already hold one.
    pub ciaddr: Ipv4Addr,
    /// Address being assigned to the client.
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    /// Relay agent address.
    pub giaddr: Ipv4Addr,
    pub chaddr: [u8; 16],
    pub options: Vec<DhcpOption>,
}

fn address_at(data: &[u8], offset: usize) -> Ipv4Addr {
    Ipv4Addr::new(
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    )
}

impl DhcpPacket {
    /// A client message from an Ethernet host, as sent by a DHCP client.
    pub fn new_request(message_type: MessageType, mac: [u8; 6], xid: u32) -> Self {
        let mut chaddr = [0u8; 16];
        chaddr[..6].copy_from_slice(&mac);
        Self {
            op: BOOTREQUEST,
            htype: HTYPE_ETHERNET,
            hlen: HLEN_ETHERNET,
            hops: 0,
            xid,
            secs: 0,
            flags: 0,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr,
            options: vec![DhcpOption::MessageType(message_type)],
        }
    }

    /// Parses a message received from the network.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPacket`] if the message is shorter than the
    /// header and cookie, the cookie is wrong, the hop count exceeds 16, an
    /// Ethernet `hlen` is not 6, or an option is malformed.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < OPTIONS_OFFSET {
            return Err(Error::InvalidPacket(format!(
                "Packet too short: {} bytes (minimum {})",
                data.len(),
                OPTIONS_OFFSET
            )));
        }
        if data[MAGIC_COOKIE_OFFSET..OPTIONS_OFFSET] != DHCP_MAGIC_COOKIE {
            return Err(Error::InvalidPacket("Invalid magic cookie".to_string()));
        }

        let (op, htype, hlen, hops) = (data[0], data[1], data[2], data[3]);
        if hops > MAX_HOPS {
            return Err(Error::InvalidPacket(format!(
                "Hop count {} exceeds maximum {}",
                hops, MAX_HOPS
            )));
        }
        if htype == HTYPE_ETHERNET && hlen != HLEN_ETHERNET {
            return Err(Error::InvalidPacket(format!(
                "Invalid hlen {} for Ethernet (expected {})",
                hlen, HLEN_ETHERNET
            )));
        }

        let mut chaddr = [0u8; 16];
        chaddr.copy_from_slice(&data[CHADDR_OFFSET..CHADDR_OFFSET + CHADDR_SIZE]);

        Ok(Self {
            op,
            htype,
            hlen,
            hops,
            xid: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            secs: u16::from_be_bytes([data[8], data[9]]),
            flags: u16::from_be_bytes([data[10], data[11]]),
            ciaddr: address_at(data, 12),
            yiaddr: address_at(data, 16),
            siaddr: address_at(data, 20),
            giaddr: address_at(data, 24),
            chaddr,
            options: Self::parse_options(&data[OPTIONS_OFFSET..])?,
        })
    }

    fn parse_options(data: &[u8]) -> Result<Vec<DhcpOption>> {
        let mut options = Vec::new();
        let mut index = 0;

        while index < data.len() {
            let code = data[index];
            if code == OptionCode::Pad as u8 {
                index += 1;
                continue;
            }
            if code == OptionCode::End as u8 {
                break;
            }

            let Some(&length) = data.get(index + 1) else {
                return Err(Error::InvalidPacket("Option length missing".to_string()));
            };
            let start = index + 2;
            let end = start + length as usize;
            if end > data.len() {
                return Err(Error::InvalidPacket("Option data truncated".to_string()));
            }

            options.push(DhcpOption::parse(code, &data[start..end])?);
            index = end;
        }

        Ok(options)
    }

    /// Encodes the message, padded to at least 300 bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(DHCP_ENCODE_CAPACITY);

        packet.extend_from_slice(&[self.op, self.htype, self.hlen, self.hops]);
        packet.extend_from_slice(&self.xid.to_be_bytes());
        packet.extend_from_slice(&self.secs.to_be_bytes());
        packet.extend_from_slice(&self.flags.to_be_bytes());
        for address in [self.ciaddr, self.yiaddr, self.siaddr, self.giaddr] {
            packet.extend_from_slice(&address.octets());
        }
        packet.extend_from_slice(&self.chaddr);
        packet.resize(MAGIC_COOKIE_OFFSET, 0);
        packet.extend_from_slice(&DHCP_MAGIC_COOKIE);

        for option in &self.options {
            packet.extend_from_slice(&option.encode());
        }
        packet.push(OptionCode::End as u8);

        if packet.len() < DHCP_MIN_PACKET_SIZE {
            packet.resize(DHCP_MIN_PACKET_SIZE, 0);
        }
        packet
    }

    /// First Option 53 in the message. `None` means a plain BOOTP message.
    pub fn message_type(&self) -> Option<MessageType> {
        self.options.iter().find_map(|opt| match opt {
            DhcpOption::MessageType(t) => Some(*t),
            _ => None,
        })
    }

    /// Option 50.
    pub fn requested_ip(&self) -> Option<Ipv4Addr> {
        self.options.iter().find_map(|opt| match opt {
            DhcpOption::RequestedIpAddress(ip) => Some(*ip),
            _ => None,
        })
    }

    /// Option 54, naming the server whose offer a REQUEST accepts.
    pub fn server_identifier(&self) -> Option<Ipv4Addr> {
        self.options.iter().find_map(|opt| match opt {
            DhcpOption::ServerIdentifier(ip) => Some(*ip),
            _ => None,
        })
    }

    pub fn hostname(&self) -> Option<&str> {
        self.options.iter().find_map(|opt| match opt {
            DhcpOption::Hostname(name) => Some(name.as_str()),
            _ => None,
        })
    }

    /// The address the client claims: Option 50 when present, else `ciaddr`.
    pub fn asserted_address(&self) -> Ipv4Addr {
        self.requested_ip().unwrap_or(self.ciaddr)
    }

    /// Client hardware address bytes, limited by `hlen`.
    pub fn chaddr_bytes(&self) -> &[u8] {
        let len = (self.hlen as usize).min(self.chaddr.len());
        &self.chaddr[..len]
    }

    /// Hardware address as lowercase colon-separated hex.
    pub fn format_mac(&self) -> String {
        crate::range::format_mac_bytes(self.chaddr_bytes())
    }

    pub fn is_broadcast(&self) -> bool {
        (self.flags & BROADCAST_FLAG) != 0
    }

    /// Builds a reply to `request`. The message type goes first, followed
    /// by `options`. Transaction ID, flags, relay address, and hardware
    /// address are copied from the request.
    pub fn create_reply(
        request: &DhcpPacket,
        message_type: MessageType,
        your_ip: Ipv4Addr,
        server_ip: Ipv4Addr,
        options: Vec<DhcpOption>,
    ) -> Self {
        let mut all_options = Vec::with_capacity(options.len() + 1);
        all_options.push(DhcpOption::MessageType(message_type));
        all_options.extend(options);

        Self {
            op: BOOTREPLY,
            htype: request.htype,
            hlen: request.hlen,
            hops: 0,
            xid: request.xid,
            secs: 0,
            flags: request.flags,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: your_ip,
            siaddr: server_ip,
            giaddr: request.giaddr,
            chaddr: request.chaddr,
            options: all_options,
        }
    }
}
