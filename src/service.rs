//! Request-facing adapter over [`Ipam`].
//!
//! Every operation returns [`Status`] on failure. Callers see a code and a
//! message, never the crate's [`Error`].

use chrono::Utc;
use serde::Serialize;
use tracing::debug;

use crate::error::Error;
use crate::ipam::Ipam;
use crate::model::{Addrs, Member, MemberList, Network, UpdateList};
use crate::spec::{SpecObject, apply_spec};

/// Transport-level outcome classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Code {
    NotFound,
    /// A concurrent writer won; re-read and retry.
    Aborted,
    InvalidArgument,
    ResourceExhausted,
    FailedPrecondition,
    Unavailable,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("{code:?}: {message}")]
pub struct Status {
    pub code: Code,
    pub message: String,
}

impl Status {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(Code::InvalidArgument, message)
    }
}

impl From<Error> for Status {
    fn from(error: Error) -> Self {
        let code = match &error {
            Error::NotFound(_) => Code::NotFound,
            Error::TxnFailed(_) => Code::Aborted,
            Error::Validation(_) | Error::InvalidPacket(_) | Error::InvalidConfig(_) => {
                Code::InvalidArgument
            }
            Error::PoolExhausted(_) => Code::ResourceExhausted,
            Error::NoPool(_) => Code::FailedPrecondition,
            Error::Backend(_) | Error::Io(_) | Error::Socket(_) => Code::Unavailable,
            Error::Json(_) | Error::Yaml(_) => Code::Internal,
        };
        Self::new(code, error.to_string())
    }
}

pub type ServiceResult<T> = std::result::Result<T, Status>;

#[derive(Debug, Clone)]
pub struct IpamService {
    ipam: Ipam,
}

impl IpamService {
    pub fn new(ipam: Ipam) -> Self {
        Self { ipam }
    }

    pub async fn get_network(&self, name: &str) -> ServiceResult<Network> {
        Ok(self.ipam.get_network(name).await?)
    }

    pub async fn get_networks(&self) -> ServiceResult<Vec<Network>> {
        Ok(self.ipam.get_networks().await?)
    }

    pub async fn add_network(&self, network: Network) -> ServiceResult<()> {
        debug!(network = %network.name, "AddNetwork");
        Ok(self.ipam.add_network(network).await?)
    }

    pub async fn delete_network(&self, name: &str) -> ServiceResult<()> {
        debug!(network = name, "DeleteNetwork");
        Ok(self.ipam.delete_network(name).await?)
    }

    pub async fn get_members(&self, network: &str) -> ServiceResult<Vec<Member>> {
        Ok(self.ipam.get_members(network).await?)
    }

    pub async fn add_members(&self, members: MemberList) -> ServiceResult<()> {
        if members.net.is_empty() {
            return Err(Status::invalid_argument("member list names no network"));
        }
        Ok(self.ipam.add_members(&members.net, members.list).await?)
    }

    pub async fn update_members(&self, updates: UpdateList) -> ServiceResult<()> {
        if updates.net.is_empty() {
            return Err(Status::invalid_argument("update list names no network"));
        }
        Ok(self.ipam.update_members(&updates.net, updates.list).await?)
    }

    pub async fn delete_members(&self, macs: &[String]) -> ServiceResult<()> {
        Ok(self.ipam.delete_members(macs).await?)
    }

    /// Adds every network in `objects`, then every member list.
    pub async fn apply_spec(&self, objects: Vec<SpecObject>) -> ServiceResult<()> {
        debug!(documents = objects.len(), "ApplySpec");
        Ok(apply_spec(&self.ipam, objects).await?)
    }

    /// Recycles leases that have expired by now. Returns how many.
    pub async fn sweep(&self) -> ServiceResult<usize> {
        Ok(self.ipam.recycle_expired_leases(Utc::now()).await?)
    }

    /// A name that resolves to nothing is reported as `NotFound`.
    pub async fn resolve(&self, name: &str) -> ServiceResult<Addrs> {
        self.ipam
            .resolve_name(name)
            .await?
            .ok_or_else(|| Status::new(Code::NotFound, format!("name '{}' not found", name)))
    }
}
