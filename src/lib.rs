//! # ipamd
//!
//! IP address management: MAC, IPv4, and host-name bindings for a set of
//! networks, kept in a shared versioned key-value store and served to
//! clients over DHCP (RFC 2131).
//!
//! ## Features
//!
//! - Networks with an optional dynamic IPv4 pool and MAC range
//! - Members with static or dynamic leases, looked up by MAC, IPv4, name, or network
//! - First-fit pool allocation that stays compact across many instances
//! - Optimistic concurrency: every multi-key write is one guarded transaction
//! - Periodic expiration sweep that returns slots to the pool
//! - DHCP DISCOVER/REQUEST/RELEASE/DECLINE handling
//! - In-memory or etcd backend
//!
//! ## Quick Start
//!
//! ```no_run
//! use ipamd::{Config, DhcpServer, Ipam, LeaseManager, Store};
//!
//! #[tokio::main]
//! async fn main() -> ipamd::Result<()> {
//!     let config = Config::load_or_create("ipamd.json")?;
//!     let ipam = Ipam::new(Store::connect(&config.store).await?, &config);
//!
//!     let sweeper = LeaseManager::new(ipam.clone(), config.sweep_interval()).spawn();
//!     let server = DhcpServer::new(ipam, &config.dhcpd)?;
//!     let result = server.run().await;
//!     sweeper.shutdown().await;
//!     result
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`Store`] - versioned objects over a transactional [`store::Backend`]
//! - [`Ipam`] - network, member, and lease operations
//! - [`CountSet`] - first-fit slot allocator behind every pool
//! - [`LeaseManager`] - background expiration sweep
//! - [`DhcpServer`] / [`DhcpHandler`] - the DHCP socket and state machine
//! - [`IpamService`] - request-facing adapter with transport status codes

pub mod config;
pub mod countset;
pub mod error;
pub mod index;
pub mod ipam;
pub mod lease;
pub mod lease_manager;
pub mod members;
pub mod model;
pub mod options;
pub mod packet;
pub mod range;
pub mod server;
pub mod service;
pub mod spec;
pub mod store;

pub use config::Config;
pub use countset::CountSet;
pub use error::{Error, Result};
pub use ipam::Ipam;
pub use lease_manager::{LeaseManager, LeaseManagerHandle};
pub use model::{Addrs, Lease, Member, MemberList, MemberUpdate, Network, Pool, UpdateList};
pub use options::{DhcpOption, MessageType};
pub use packet::DhcpPacket;
pub use range::{AddressRange, MacRange};
pub use server::{DhcpHandler, DhcpServer};
pub use service::{Code, IpamService, Status};
pub use store::Store;
