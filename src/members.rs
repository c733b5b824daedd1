//! Member operations.
//!
//! A member occupies up to four keys: its record under the MAC and the IPv4,
//! name, and network views that point back at it. Every mutation here builds
//! the matching puts and deletes for all of them and applies them in one
//! transaction, so readers never see a view without its record.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::index::{
    member_index_objects, network_members_prefix, Ip4Index, MacIndex, NameIndex, IP4_PREFIX,
    MEMBER_PREFIX,
};
use crate::ipam::Ipam;
use crate::model::{Addrs, Member, MemberUpdate, Network};
use crate::range::normalize_mac;
use crate::store::{KeyValue, Object, ObjectTx};

/// Static IPv4 addresses and pools are mutually exclusive per network.
pub(crate) fn ensure_static_allowed(network: &Network) -> Result<()> {
    if network.has_pool() {
        return Err(Error::Validation(format!(
            "cannot assign static IPv4 to a member of pooled network '{}'",
            network.name
        )));
    }
    Ok(())
}

/// Rejects a batch in which two members claim the same MAC, IPv4 address,
/// or name. Each would otherwise be a repeated key in one transaction.
fn ensure_distinct_keys(tx: &ObjectTx) -> Result<()> {
    let mut seen = BTreeSet::new();
    for key in tx.put.iter().filter_map(|object| object.key()) {
        if !seen.insert(key.clone()) {
            return Err(Error::Validation(format!(
                "member batch claims {} more than once",
                key
            )));
        }
    }
    Ok(())
}

impl Ipam {
    /// Resolves index values (MACs) to their member records in one read.
    async fn members_for(&self, index_entries: Vec<KeyValue>) -> Result<Vec<Member>> {
        let keys = index_entries
            .into_iter()
            .map(|kv| format!("{}{}", MEMBER_PREFIX, String::from_utf8_lossy(&kv.value).trim()))
            .collect();

        let mut members = Vec::new();
        for kv in self.store.get_values(keys).await? {
            members.push(serde_json::from_slice(&kv.value)?);
        }
        Ok(members)
    }

    pub async fn get_members(&self, network: &str) -> Result<Vec<Member>> {
        let entries = self
            .store
            .get_prefix(&network_members_prefix(network))
            .await?;
        self.members_for(entries).await
    }

    /// Every member currently holding an IPv4 address.
    pub async fn fetch_ip4_index_members(&self) -> Result<Vec<Member>> {
        let entries = self.store.get_prefix(IP4_PREFIX).await?;
        self.members_for(entries).await
    }

    /// Reads the records of `macs` in one transaction, failing with
    /// `NotFound` if any is missing.
    pub async fn fetch_members(&self, macs: &[String]) -> Result<Vec<MacIndex>> {
        let mut indices = Vec::with_capacity(macs.len());
        for mac in macs {
            indices.push(MacIndex::for_mac(&normalize_mac(mac)?));
        }

        let mut targets: Vec<&mut dyn Object> = indices
            .iter_mut()
            .map(|index| index as &mut dyn Object)
            .collect();
        self.store.read_objects(&mut targets).await?;

        if let Some(missing) = indices.iter().find(|index| index.version == 0) {
            return Err(Error::NotFound(format!("member {}", missing.member.mac)));
        }
        Ok(indices)
    }

    /// Adds members to a network.
    ///
    /// Names are qualified with the network's domain. All keys are created
    /// in one transaction that fails if any of them already exists.
    pub async fn add_members(&self, network: &str, list: Vec<Member>) -> Result<()> {
        let network = self.get_network(network).await?;

        let mut tx = ObjectTx::default();
        for mut member in list {
            member.mac = normalize_mac(&member.mac)?;
            member.net = network.name.clone();
            if member.ip4.is_some() {
                ensure_static_allowed(&network)?;
            }
            if !member.name.is_empty() {
                member.name = network.qualify(&member.name);
            }
            tx.put.extend(member_index_objects(&member));
        }
        ensure_distinct_keys(&tx)?;

        let count = tx.put.len();
        match self.store.commit_object_tx(&tx).await {
            Err(Error::TxnFailed(_)) => Err(Error::TxnFailed(
                "some or all members already exist".to_string(),
            )),
            Err(error) => Err(error),
            Ok(()) => {
                info!(network = %network.name, keys = count, "members added");
                Ok(())
            }
        }
    }

    /// Applies name and static IPv4 changes.
    ///
    /// All targets are read first; the writes are guarded by the versions
    /// read, so the whole batch fails if any member changed in between.
    pub async fn update_members(&self, network: &str, updates: Vec<MemberUpdate>) -> Result<()> {
        let network = self.get_network(network).await?;
        let macs: Vec<String> = updates.iter().map(|update| update.mac.clone()).collect();
        let current = self.fetch_members(&macs).await?;

        let mut tx = ObjectTx::default();
        for (mut index, update) in current.into_iter().zip(updates) {
            let before = index.member.clone();
            if before.net != network.name {
                return Err(Error::Validation(format!(
                    "member {} belongs to network '{}', not '{}'",
                    before.mac, before.net, network.name
                )));
            }

            if let Some(name) = update.name {
                let name = if name.is_empty() {
                    name
                } else {
                    network.qualify(&name)
                };
                if name != before.name {
                    tx.delete.push(Box::new(NameIndex::new(before.clone())));
                    index.member.name = name;
                    tx.put.push(Box::new(NameIndex::new(index.member.clone())));
                }
            }

            if let Some(lease) = update.ip4 {
                ensure_static_allowed(&network)?;
                let changed = before
                    .ip4
                    .as_ref()
                    .is_none_or(|old| old.address != lease.address);
                index.member.ip4 = Some(lease);
                if changed {
                    tx.delete.push(Box::new(Ip4Index::new(before.clone())));
                    tx.put.push(Box::new(Ip4Index::new(index.member.clone())));
                }
            }

            debug!(mac = %index.member.mac, "member update staged");
            tx.put.push(Box::new(index));
        }
        ensure_distinct_keys(&tx)?;

        self.store.commit_object_tx(&tx).await?;
        info!(network = %network.name, members = macs.len(), "members updated");
        Ok(())
    }

    /// Deletes members and every key they occupy in one transaction.
    ///
    /// Pool slots held by dynamic leases are released afterwards.
    pub async fn delete_members(&self, macs: &[String]) -> Result<()> {
        let mut macs = macs
            .iter()
            .map(|mac| normalize_mac(mac))
            .collect::<Result<Vec<_>>>()?;
        macs.sort();
        macs.dedup();
        let current = self.fetch_members(&macs).await?;

        let mut objects: Vec<Box<dyn Object>> = Vec::new();
        let mut released: BTreeMap<String, Vec<Ipv4Addr>> = BTreeMap::new();
        for index in &current {
            objects.extend(member_index_objects(&index.member));
            if let Some(lease) = index.member.ip4.as_ref().filter(|lease| lease.is_dynamic()) {
                released
                    .entry(index.member.net.clone())
                    .or_default()
                    .push(lease.address);
            }
        }

        let targets: Vec<&dyn Object> = objects.iter().map(|object| object.as_ref()).collect();
        self.store.delete_objects(&targets).await?;
        info!(members = current.len(), "members deleted");

        for (network, addresses) in released {
            if let Err(error) = self.release_slots(&network, &addresses).await {
                warn!(network = %network, error = %error, "failed to release pool slots");
            }
        }
        Ok(())
    }

    /// Finds the network a MAC belongs to.
    ///
    /// Registered members resolve through their record. Unknown MACs are
    /// matched against every network's MAC range.
    pub async fn find_mac_network(&self, mac: &str) -> Result<Option<Network>> {
        let mut index = MacIndex::for_mac(&normalize_mac(mac)?);
        self.store.read(&mut index).await?;
        if index.version > 0 && !index.member.net.is_empty() {
            return Ok(Some(self.get_network(&index.member.net).await?));
        }

        for network in self.get_networks().await? {
            let Some(range) = &network.mac_range else {
                continue;
            };
            match range.contains(&index.member.mac) {
                Ok(true) => return Ok(Some(network)),
                Ok(false) => {}
                Err(error) => {
                    warn!(network = %network.name, error = %error, "network has an invalid MAC range");
                }
            }
        }
        Ok(None)
    }

    pub async fn find_mac_ipv4(&self, mac: &str) -> Result<Option<Ipv4Addr>> {
        let mut index = MacIndex::for_mac(&normalize_mac(mac)?);
        self.store.read(&mut index).await?;
        Ok(index.member.ip4.map(|lease| lease.address))
    }

    /// Looks up the addresses of a fully qualified host name.
    pub async fn resolve_name(&self, name: &str) -> Result<Option<Addrs>> {
        let mut by_name = NameIndex::for_name(name);
        self.store.read(&mut by_name).await?;
        if by_name.version == 0 {
            debug!(name, "name not found");
            return Ok(None);
        }

        let mut index = MacIndex::for_mac(&by_name.member.mac);
        self.store.read(&mut index).await?;
        if index.version == 0 {
            warn!(name, mac = %index.member.mac, "name index points at a missing member");
            return Ok(None);
        }

        let addrs = Addrs {
            ip4: index.member.ip4.map(|lease| lease.address),
            ip6: index.member.ip6.map(|lease| lease.address),
        };
        debug!(name, ip4 = ?addrs.ip4, "resolved");
        Ok(Some(addrs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::model::Lease;
    use crate::range::{AddressRange, MacRange};
    use crate::store::Store;

    const MAC: &str = "00:00:11:11:00:01";

    fn ipam() -> Ipam {
        Ipam::new(Store::memory(), &Config::default())
    }

    fn static_network() -> Network {
        Network {
            domain: "mini.net".to_string(),
            ..Network::new("mini")
        }
    }

    fn pooled_network() -> Network {
        Network {
            range4: Some(AddressRange::new(
                Ipv4Addr::new(10, 1, 0, 10),
                Ipv4Addr::new(10, 1, 0, 20),
            )),
            mac_range: Some(MacRange::new("00:00:22:22:00:00", "00:00:22:22:00:ff")),
            ..Network::new("pool")
        }
    }

    fn whiskey() -> Member {
        Member {
            name: "whiskey".to_string(),
            ip4: Some(Lease::fixed(Ipv4Addr::new(10, 0, 0, 7))),
            ..Member::new("00:00:11:11:00:01")
        }
    }

    async fn keys(ipam: &Ipam) -> Vec<String> {
        ipam.store()
            .get_prefix("/member/")
            .await
            .unwrap()
            .into_iter()
            .map(|kv| kv.key)
            .collect()
    }

    #[tokio::test]
    async fn test_add_members_indices_agree() {
        let ipam = ipam();
        ipam.add_network(static_network()).await.unwrap();
        ipam.add_members("mini", vec![whiskey()]).await.unwrap();

        let mut by_ip = Ip4Index::new(Member {
            ip4: Some(Lease::fixed(Ipv4Addr::new(10, 0, 0, 7))),
            ..Member::default()
        });
        ipam.store().fetch(&mut by_ip).await.unwrap();
        assert_eq!(by_ip.member.mac, MAC);

        let mut by_name = NameIndex::for_name("whiskey.mini.net");
        ipam.store().fetch(&mut by_name).await.unwrap();
        assert_eq!(by_name.member.mac, MAC);

        let members = ipam.get_members("mini").await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].net, "mini");
        assert_eq!(members[0].name, "whiskey.mini.net");
    }

    #[tokio::test]
    async fn test_add_members_normalizes_mac() {
        let ipam = ipam();
        ipam.add_network(static_network()).await.unwrap();
        ipam.add_members("mini", vec![Member::new("00:00:11:11:00:AB")])
            .await
            .unwrap();
        assert_eq!(
            keys(&ipam).await,
            vec!["/member/00:00:11:11:00:ab", "/member/net/mini/00:00:11:11:00:ab"]
        );
    }

    #[tokio::test]
    async fn test_add_existing_member_fails_whole_batch() {
        let ipam = ipam();
        ipam.add_network(static_network()).await.unwrap();
        ipam.add_members("mini", vec![whiskey()]).await.unwrap();

        let result = ipam
            .add_members(
                "mini",
                vec![Member::new("00:00:11:11:00:02"), Member::new(MAC)],
            )
            .await;
        assert!(matches!(result, Err(Error::TxnFailed(message)) if message.contains("already exist")));
        assert!(ipam.find_mac_ipv4("00:00:11:11:00:02").await.unwrap().is_none());
        assert_eq!(ipam.get_members("mini").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_batch_sharing_an_address_is_rejected() {
        let ipam = ipam();
        ipam.add_network(static_network()).await.unwrap();
        let shared = Ipv4Addr::new(172, 16, 0, 1);

        let result = ipam
            .add_members(
                "mini",
                vec![
                    Member {
                        ip4: Some(Lease::fixed(shared)),
                        ..Member::new("00:00:00:00:00:01")
                    },
                    Member {
                        ip4: Some(Lease::fixed(shared)),
                        ..Member::new("00:00:00:00:00:02")
                    },
                ],
            )
            .await;
        assert!(matches!(result, Err(Error::Validation(message)) if message.contains("172.16.0.1")));
        assert!(keys(&ipam).await.is_empty());
    }

    #[tokio::test]
    async fn test_batch_sharing_a_name_is_rejected() {
        let ipam = ipam();
        ipam.add_network(static_network()).await.unwrap();

        let result = ipam
            .add_members(
                "mini",
                vec![
                    Member::with_name("00:00:00:00:00:01", "twin"),
                    Member::with_name("00:00:00:00:00:02", "twin"),
                ],
            )
            .await;
        assert!(matches!(result, Err(Error::Validation(_))));
        assert!(ipam.resolve_name("twin.mini.net").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_batch_repeating_a_mac_is_rejected() {
        let ipam = ipam();
        ipam.add_network(static_network()).await.unwrap();

        let result = ipam
            .add_members(
                "mini",
                vec![Member::new("00:00:11:11:00:AB"), Member::new("00:00:11:11:00:ab")],
            )
            .await;
        assert!(matches!(result, Err(Error::Validation(_))));
        assert!(keys(&ipam).await.is_empty());

        ipam.add_members("mini", vec![whiskey()]).await.unwrap();
        let result = ipam
            .update_members(
                "mini",
                vec![
                    MemberUpdate {
                        mac: MAC.to_string(),
                        name: Some("one".to_string()),
                        ip4: None,
                    },
                    MemberUpdate {
                        mac: MAC.to_string(),
                        name: Some("two".to_string()),
                        ip4: None,
                    },
                ],
            )
            .await;
        assert!(matches!(result, Err(Error::Validation(_))));
        assert!(ipam.resolve_name("whiskey.mini.net").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_members_tolerates_repeated_mac() {
        let ipam = ipam();
        ipam.add_network(static_network()).await.unwrap();
        ipam.add_members("mini", vec![whiskey()]).await.unwrap();

        ipam.delete_members(&[MAC.to_string(), "00:00:11:11:00:01".to_uppercase()])
            .await
            .unwrap();
        assert!(keys(&ipam).await.is_empty());
    }

    #[tokio::test]
    async fn test_static_ip_rejected_on_pooled_network() {
        let ipam = ipam();
        ipam.add_network(pooled_network()).await.unwrap();
        let result = ipam.add_members("pool", vec![whiskey()]).await;
        assert!(matches!(result, Err(Error::Validation(_))));

        ipam.add_members("pool", vec![Member::new(MAC)]).await.unwrap();
        let result = ipam
            .update_members(
                "pool",
                vec![MemberUpdate {
                    mac: MAC.to_string(),
                    name: None,
                    ip4: Some(Lease::fixed(Ipv4Addr::new(10, 1, 0, 12))),
                }],
            )
            .await;
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_add_members_invalid_mac() {
        let ipam = ipam();
        ipam.add_network(static_network()).await.unwrap();
        let result = ipam.add_members("mini", vec![Member::new("nope")]).await;
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_delete_members_removes_every_key() {
        let ipam = ipam();
        ipam.add_network(static_network()).await.unwrap();
        ipam.add_members("mini", vec![whiskey()]).await.unwrap();

        ipam.delete_members(&[MAC.to_string()]).await.unwrap();
        assert!(keys(&ipam).await.is_empty());
        assert!(ipam.resolve_name("whiskey.mini.net").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_unknown_member() {
        let ipam = ipam();
        let result = ipam.delete_members(&["00:00:00:00:00:99".to_string()]).await;
        assert!(result.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_update_name_moves_name_index() {
        let ipam = ipam();
        ipam.add_network(static_network()).await.unwrap();
        ipam.add_members("mini", vec![whiskey()]).await.unwrap();

        ipam.update_members(
            "mini",
            vec![MemberUpdate {
                mac: MAC.to_string(),
                name: Some("tango".to_string()),
                ip4: None,
            }],
        )
        .await
        .unwrap();

        assert!(ipam.resolve_name("whiskey.mini.net").await.unwrap().is_none());
        let addrs = ipam.resolve_name("tango.mini.net").await.unwrap().unwrap();
        assert_eq!(addrs.ip4, Some(Ipv4Addr::new(10, 0, 0, 7)));
    }

    #[tokio::test]
    async fn test_update_first_name_and_address() {
        let ipam = ipam();
        ipam.add_network(static_network()).await.unwrap();
        ipam.add_members("mini", vec![Member::new(MAC)]).await.unwrap();

        ipam.update_members(
            "mini",
            vec![MemberUpdate {
                mac: MAC.to_string(),
                name: Some("golf".to_string()),
                ip4: Some(Lease::fixed(Ipv4Addr::new(10, 0, 0, 9))),
            }],
        )
        .await
        .unwrap();

        assert_eq!(
            keys(&ipam).await,
            vec![
                "/member/00:00:11:11:00:01",
                "/member/ip4/10.0.0.9",
                "/member/name/golf.mini.net",
                "/member/net/mini/00:00:11:11:00:01",
            ]
        );
    }

    #[tokio::test]
    async fn test_update_static_address_replaces_ip4_index() {
        let ipam = ipam();
        ipam.add_network(static_network()).await.unwrap();
        ipam.add_members("mini", vec![whiskey()]).await.unwrap();

        ipam.update_members(
            "mini",
            vec![MemberUpdate {
                mac: MAC.to_string(),
                name: None,
                ip4: Some(Lease::fixed(Ipv4Addr::new(10, 0, 0, 8))),
            }],
        )
        .await
        .unwrap();

        let all = keys(&ipam).await;
        assert!(all.contains(&"/member/ip4/10.0.0.8".to_string()));
        assert!(!all.contains(&"/member/ip4/10.0.0.7".to_string()));
        assert_eq!(
            ipam.find_mac_ipv4(MAC).await.unwrap(),
            Some(Ipv4Addr::new(10, 0, 0, 8))
        );
    }

    #[tokio::test]
    async fn test_update_name_taken_by_other_member_fails() {
        let ipam = ipam();
        ipam.add_network(static_network()).await.unwrap();
        ipam.add_members(
            "mini",
            vec![whiskey(), Member::with_name("00:00:11:11:00:02", "xray")],
        )
        .await
        .unwrap();

        let result = ipam
            .update_members(
                "mini",
                vec![MemberUpdate {
                    mac: "00:00:11:11:00:02".to_string(),
                    name: Some("whiskey".to_string()),
                    ip4: None,
                }],
            )
            .await;
        assert!(matches!(result, Err(Error::TxnFailed(_))));
        assert!(ipam.resolve_name("xray.mini.net").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_find_mac_network_by_member_and_range() {
        let ipam = ipam();
        ipam.add_network(static_network()).await.unwrap();
        ipam.add_network(pooled_network()).await.unwrap();
        ipam.add_members("mini", vec![whiskey()]).await.unwrap();

        let found = ipam.find_mac_network(MAC).await.unwrap().unwrap();
        assert_eq!(found.name, "mini");

        let found = ipam
            .find_mac_network("00:00:22:22:00:ff")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.name, "pool");

        assert!(ipam
            .find_mac_network("00:00:33:33:00:01")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_resolve_name_without_address() {
        let ipam = ipam();
        ipam.add_network(static_network()).await.unwrap();
        ipam.add_members("mini", vec![Member::with_name(MAC, "bare")])
            .await
            .unwrap();

        let addrs = ipam.resolve_name("bare.mini.net").await.unwrap().unwrap();
        assert_eq!(addrs, Addrs::default());
    }
}
