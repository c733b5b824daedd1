//! The address-management engine and its network operations.
//!
//! [`Ipam`] is a cheap handle over a [`Store`] plus the lease parameters from
//! [`Config`]. It holds no state of its own: every operation reads what it
//! needs from the store and writes back in one transaction, so any number of
//! handles, in one process or many, can work against the same store.
//!
//! Member and lease operations live in [`crate::members`] and
//! [`crate::lease`].

use chrono::TimeDelta;
use tracing::info;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::index::{member_index_objects, NetworkObj, PoolObj, NETWORK_PREFIX};
use crate::model::{Network, Pool};
use crate::store::{Object, Store};

#[derive(Debug, Clone)]
pub struct Ipam {
    pub(crate) store: Store,
    pub(crate) lease_duration: TimeDelta,
    pub(crate) allocation_retries: u32,
}

impl Ipam {
    pub fn new(store: Store, config: &Config) -> Self {
        Self {
            store,
            lease_duration: TimeDelta::seconds(i64::from(config.lease_duration_seconds)),
            allocation_retries: config.allocation_retries,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn lease_duration(&self) -> TimeDelta {
        self.lease_duration
    }

    /// Creates a network and, when it has a range, its empty pool.
    ///
    /// Both records are created in one transaction that requires neither key
    /// to exist, so adding a name that is already in use fails with
    /// `TxnFailed` and leaves the existing network and pool untouched.
    pub async fn add_network(&self, network: Network) -> Result<()> {
        network.validate()?;

        let name = network.name.clone();
        let pool = network
            .range4
            .as_ref()
            .map(|range| PoolObj::new(Pool::for_range(&name, range)));
        let has_pool = pool.is_some();
        let net = NetworkObj::new(network);

        let mut objects: Vec<&dyn Object> = Vec::with_capacity(2);
        objects.push(&net);
        if let Some(pool) = &pool {
            objects.push(pool);
        }
        match self.store.write_objects(&objects).await {
            Err(Error::TxnFailed(_)) => {
                return Err(Error::TxnFailed(format!("network '{}' already exists", name)));
            }
            result => result?,
        }

        info!(network = %name, pool = has_pool, "network added");
        Ok(())
    }

    /// Fails with `NotFound` when no such network exists.
    pub async fn get_network(&self, name: &str) -> Result<Network> {
        let mut object = NetworkObj::named(name);
        self.store.fetch(&mut object).await?;
        Ok(object.network)
    }

    pub async fn get_networks(&self) -> Result<Vec<Network>> {
        let mut networks = Vec::new();
        for kv in self.store.get_prefix(NETWORK_PREFIX).await? {
            networks.push(serde_json::from_slice(&kv.value)?);
        }
        Ok(networks)
    }

    /// Deletes a network, its pool, and every key of every member on it in
    /// one transaction.
    pub async fn delete_network(&self, name: &str) -> Result<()> {
        self.get_network(name).await?;
        let members = self.get_members(name).await?;

        let mut objects: Vec<Box<dyn Object>> = Vec::new();
        for member in &members {
            objects.extend(member_index_objects(member));
        }
        objects.push(Box::new(PoolObj::for_network(name)));
        objects.push(Box::new(NetworkObj::named(name)));

        let targets: Vec<&dyn Object> = objects.iter().map(|object| object.as_ref()).collect();
        self.store.delete_objects(&targets).await?;

        info!(network = %name, members = members.len(), "network deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::model::{Lease, Member};
    use crate::range::AddressRange;

    fn ipam() -> Ipam {
        Ipam::new(Store::memory(), &Config::default())
    }

    fn pooled(name: &str) -> Network {
        Network {
            range4: Some(AddressRange::new(
                Ipv4Addr::new(10, 0, 0, 10),
                Ipv4Addr::new(10, 0, 0, 19),
            )),
            ..Network::new(name)
        }
    }

    #[tokio::test]
    async fn test_add_network_creates_pool() {
        let ipam = ipam();
        ipam.add_network(pooled("mini")).await.unwrap();

        let network = ipam.get_network("mini").await.unwrap();
        assert_eq!(network, pooled("mini"));

        let mut pool = PoolObj::for_network("mini");
        ipam.store().fetch(&mut pool).await.unwrap();
        assert_eq!(pool.pool.slots.size, 10);
        assert!(pool.pool.slots.is_empty());
    }

    #[tokio::test]
    async fn test_readding_network_keeps_existing_pool() {
        let ipam = ipam();
        ipam.add_network(pooled("mini")).await.unwrap();
        let first = ipam.new_lease4("00:00:00:00:00:01", "mini").await.unwrap();

        let result = ipam
            .add_network(Network {
                domain: "changed".to_string(),
                ..pooled("mini")
            })
            .await;
        assert!(matches!(result, Err(Error::TxnFailed(message)) if message.contains("mini")));
        assert!(ipam.get_network("mini").await.unwrap().domain.is_empty());

        let mut pool = PoolObj::for_network("mini");
        ipam.store().fetch(&mut pool).await.unwrap();
        assert_eq!(pool.pool.slots.values, vec![0]);

        let second = ipam.new_lease4("00:00:00:00:00:02", "mini").await.unwrap();
        assert_ne!(first, second);
        assert_eq!(second, Ipv4Addr::new(10, 0, 0, 11));
    }

    #[tokio::test]
    async fn test_static_network_has_no_pool() {
        let ipam = ipam();
        ipam.add_network(Network::new("static")).await.unwrap();

        let mut pool = PoolObj::for_network("static");
        let result = ipam.store().fetch(&mut pool).await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_add_network_rejects_backwards_range() {
        let ipam = ipam();
        let network = Network {
            range4: Some(AddressRange::new(
                Ipv4Addr::new(10, 0, 0, 20),
                Ipv4Addr::new(10, 0, 0, 1),
            )),
            ..Network::new("bad")
        };
        assert!(matches!(
            ipam.add_network(network).await,
            Err(Error::Validation(_))
        ));
        assert!(ipam.get_network("bad").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_get_networks_lists_all() {
        let ipam = ipam();
        ipam.add_network(pooled("alpha")).await.unwrap();
        ipam.add_network(Network::new("bravo")).await.unwrap();

        let names: Vec<String> = ipam
            .get_networks()
            .await
            .unwrap()
            .into_iter()
            .map(|network| network.name)
            .collect();
        assert_eq!(names, vec!["alpha", "bravo"]);
    }

    #[tokio::test]
    async fn test_delete_network_leaves_no_orphans() {
        let ipam = ipam();
        ipam.add_network(Network {
            domain: "lab".to_string(),
            ..Network::new("static")
        })
        .await
        .unwrap();
        ipam.add_members(
            "static",
            vec![Member {
                name: "alpha".to_string(),
                ip4: Some(Lease::fixed(Ipv4Addr::new(172, 16, 0, 2))),
                ..Member::new("00:00:00:00:00:01")
            }],
        )
        .await
        .unwrap();
        ipam.add_network(pooled("other")).await.unwrap();

        ipam.delete_network("static").await.unwrap();

        let remaining: Vec<String> = ipam
            .store()
            .get_prefix("/")
            .await
            .unwrap()
            .into_iter()
            .map(|kv| kv.key)
            .collect();
        assert_eq!(remaining, vec!["/net/other", "/pool/other"]);
    }

    #[tokio::test]
    async fn test_delete_missing_network() {
        let ipam = ipam();
        assert!(ipam.delete_network("ghost").await.unwrap_err().is_not_found());
    }
}
