use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{error, info, warn};

use crate::config::DhcpdConfig;
use crate::error::{Error, Result};
use crate::ipam::Ipam;
use crate::model::Network;
use crate::options::{DhcpOption, MessageType};
use crate::packet::{BOOTREQUEST, DhcpPacket};

const DHCP_SERVER_PORT: u16 = 67;
const DHCP_CLIENT_PORT: u16 = 68;
const RECV_BUFFER_SIZE: usize = 1500;

/// Answers DHCP messages from the IPAM state. Holds no socket, so every
/// exchange can be driven directly.
#[derive(Debug, Clone)]
pub struct DhcpHandler {
    ipam: Ipam,
    /// Server identifier for networks that do not name their own.
    fallback_server: Ipv4Addr,
}

impl DhcpHandler {
    pub fn new(ipam: Ipam, fallback_server: Ipv4Addr) -> Self {
        Self {
            ipam,
            fallback_server,
        }
    }

    /// Computes the reply to a client message. `Ok(None)` means the
    /// exchange is dropped and the client's own retry timer takes over.
    pub async fn handle(&self, packet: &DhcpPacket) -> Result<Option<DhcpPacket>> {
        if packet.op != BOOTREQUEST {
            return Err(Error::InvalidPacket("Expected BOOTREQUEST".to_string()));
        }

        let mac = packet.format_mac();
        let Some(message_type) = packet.message_type() else {
            warn!(mac = %mac, "ignoring BOOTP message");
            return Ok(None);
        };
        info!(mac = %mac, "{}", message_type);

        match message_type {
            MessageType::Discover => self.handle_discover(packet, &mac).await,
            MessageType::Request => self.handle_request(packet, &mac).await,
            MessageType::Release => {
                info!(mac = %mac, addr = %packet.ciaddr, "client released its lease");
                Ok(None)
            }
            MessageType::Decline => {
                warn!(
                    mac = %mac,
                    addr = %packet.asserted_address(),
                    "client declined its address"
                );
                Ok(None)
            }
            _ => {
                warn!(mac = %mac, "ignoring {} message", message_type);
                Ok(None)
            }
        }
    }

    async fn handle_discover(&self, packet: &DhcpPacket, mac: &str) -> Result<Option<DhcpPacket>> {
        let Some(network) = self.ipam.find_mac_network(mac).await? else {
            warn!(mac = %mac, "no network for client");
            return Ok(None);
        };

        let offered_ip = match self.ipam.find_mac_ipv4(mac).await? {
            Some(ip) => ip,
            None => match self.ipam.new_lease4(mac, &network.name).await {
                Ok(ip) => ip,
                Err(
                    error @ (Error::PoolExhausted(_) | Error::NoPool(_) | Error::TxnFailed(_)),
                ) => {
                    warn!(mac = %mac, network = %network.name, error = %error, "no address to offer");
                    return Ok(None);
                }
                Err(error) => return Err(error),
            },
        };

        let server_ip = self.server_identifier(&network);
        let offer = DhcpPacket::create_reply(
            packet,
            MessageType::Offer,
            offered_ip,
            server_ip,
            self.offer_options(&network, server_ip),
        );

        info!(
            mac = %mac,
            hostname = packet.hostname().unwrap_or_default(),
            addr = %offered_ip,
            "OFFER"
        );
        Ok(Some(offer))
    }

    async fn handle_request(&self, packet: &DhcpPacket, mac: &str) -> Result<Option<DhcpPacket>> {
        let Some(network) = self.ipam.find_mac_network(mac).await? else {
            warn!(mac = %mac, "no network for client");
            return Ok(None);
        };

        let server_ip = self.server_identifier(&network);
        if let Some(server_id) = packet.server_identifier()
            && server_id != server_ip
        {
            info!(mac = %mac, server = %server_id, "REQUEST is for a different server");
            return Ok(None);
        }

        let Some(leased_ip) = self.ipam.find_mac_ipv4(mac).await? else {
            return Ok(Some(self.nak(packet, server_ip, mac, "no lease held")));
        };

        let asserted = packet.asserted_address();
        if !asserted.is_unspecified() && asserted != leased_ip {
            return Ok(Some(self.nak(
                packet,
                server_ip,
                mac,
                "requested address does not match lease",
            )));
        }

        self.ipam.renew_lease(mac).await?;

        let ack = DhcpPacket::create_reply(
            packet,
            MessageType::Ack,
            leased_ip,
            server_ip,
            self.offer_options(&network, server_ip),
        );

        info!(mac = %mac, addr = %leased_ip, "ACK");
        Ok(Some(ack))
    }

    fn server_identifier(&self, network: &Network) -> Ipv4Addr {
        network.dhcp4_server.unwrap_or(self.fallback_server)
    }

    fn offer_options(&self, network: &Network, server_ip: Ipv4Addr) -> Vec<DhcpOption> {
        let lease_seconds = u32::try_from(self.ipam.lease_duration().num_seconds()).unwrap_or(u32::MAX);

        let mut options = vec![
            DhcpOption::ServerIdentifier(server_ip),
            DhcpOption::LeaseTime(lease_seconds),
        ];
        if let Some(subnet) = network.subnet4 {
            options.push(DhcpOption::SubnetMask(subnet.netmask()));
        }
        if !network.gateways.is_empty() {
            options.push(DhcpOption::Router(network.gateways.clone()));
        }
        if !network.nameservers.is_empty() {
            options.push(DhcpOption::DnsServer(network.nameservers.clone()));
        }
        if !network.domain.is_empty() {
            options.push(DhcpOption::DomainSearch(vec![network.domain.clone()]));
        }
        options.extend(network.options.iter().map(DhcpOption::custom));
        options
    }

    fn nak(&self, packet: &DhcpPacket, server_ip: Ipv4Addr, mac: &str, reason: &str) -> DhcpPacket {
        warn!(mac = %mac, reason, "NAK");
        DhcpPacket::create_reply(
            packet,
            MessageType::Nak,
            Ipv4Addr::UNSPECIFIED,
            server_ip,
            vec![DhcpOption::ServerIdentifier(server_ip)],
        )
    }
}

/// Where a reply to `request` is sent: the relay agent if one forwarded the
/// request, broadcast for NAKs and clients without an address, otherwise
/// unicast to the client.
pub fn reply_destination(reply: &DhcpPacket, request: &DhcpPacket) -> SocketAddr {
    let is_nak = reply.message_type() == Some(MessageType::Nak);

    if !request.giaddr.is_unspecified() {
        SocketAddr::new(IpAddr::V4(request.giaddr), DHCP_SERVER_PORT)
    } else if is_nak || request.is_broadcast() || request.ciaddr.is_unspecified() {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), DHCP_CLIENT_PORT)
    } else {
        SocketAddr::new(IpAddr::V4(request.ciaddr), DHCP_CLIENT_PORT)
    }
}

pub struct DhcpServer {
    handler: DhcpHandler,
    socket: Arc<UdpSocket>,
}

impl DhcpServer {
    pub fn new(ipam: Ipam, config: &DhcpdConfig) -> Result<Self> {
        let socket = Arc::new(Self::create_socket(config)?);

        info!(
            listen = %config.listen,
            port = config.port,
            "DHCP server starting"
        );

        Ok(Self {
            handler: DhcpHandler::new(ipam, config.listen),
            socket,
        })
    }

    fn create_socket(config: &DhcpdConfig) -> Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|error| Error::Socket(format!("Failed to create socket: {}", error)))?;

        socket
            .set_reuse_address(true)
            .map_err(|error| Error::Socket(format!("Failed to set SO_REUSEADDR: {}", error)))?;

        socket
            .set_broadcast(true)
            .map_err(|error| Error::Socket(format!("Failed to set SO_BROADCAST: {}", error)))?;

        socket
            .set_nonblocking(true)
            .map_err(|error| Error::Socket(format!("Failed to set non-blocking: {}", error)))?;

        if let Some(interface) = &config.interface {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            socket.bind_device(Some(interface.as_bytes())).map_err(|error| {
                Error::Socket(format!("Failed to bind to interface {}: {}", interface, error))
            })?;

            #[cfg(not(any(target_os = "linux", target_os = "android")))]
            warn!(
                interface = %interface,
                "binding to an interface is only supported on Linux and will be ignored"
            );
        }

        // Broadcast requests arrive addressed to 255.255.255.255, so the
        // socket listens on every address regardless of `listen`.
        let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.port);
        socket.bind(&bind_addr.into()).map_err(|error| {
            Error::Socket(format!("Failed to bind to {}: {}", bind_addr, error))
        })?;

        let std_socket: std::net::UdpSocket = socket.into();
        UdpSocket::from_std(std_socket).map_err(|error| {
            Error::Socket(format!("Failed to convert to tokio socket: {}", error))
        })
    }

    /// Receives datagrams until the task is cancelled. Each datagram is
    /// handled on its own task.
    pub async fn run(&self) -> Result<()> {
        let mut buffer = [0u8; RECV_BUFFER_SIZE];

        info!("DHCP server ready and listening");

        loop {
            match self.socket.recv_from(&mut buffer).await {
                Ok((size, source)) => {
                    let data = buffer[..size].to_vec();
                    let handler = self.handler.clone();
                    let socket = Arc::clone(&self.socket);

                    tokio::spawn(async move {
                        if let Err(error) = serve_datagram(&handler, &socket, &data).await {
                            warn!(source = %source, error = %error, "error handling packet");
                        }
                    });
                }
                Err(error) => {
                    error!(error = %error, "error receiving packet");
                }
            }
        }
    }
}

async fn serve_datagram(handler: &DhcpHandler, socket: &UdpSocket, data: &[u8]) -> Result<()> {
    let request = DhcpPacket::parse(data)?;
    if let Some(reply) = handler.handle(&request).await? {
        let destination = reply_destination(&reply, &request);
        socket.send_to(&reply.encode(), destination).await?;
    }
    Ok(())
}
