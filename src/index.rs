//! Store-resident views of networks, members, and pools.
//!
//! The authoritative member record lives under its MAC. The IPv4, name, and
//! network views are secondary keys whose value is the owning MAC in plain
//! text; the mutation layer keeps them consistent by writing and deleting
//! matching sets of these objects in one transaction.

use std::net::Ipv4Addr;

use serde_json::{from_slice, to_vec};

use crate::error::Result;
use crate::model::{Lease, Member, Network, Pool};
use crate::store::Object;

pub const NETWORK_PREFIX: &str = "/net/";
pub const MEMBER_PREFIX: &str = "/member/";
pub const IP4_PREFIX: &str = "/member/ip4/";
pub const NAME_PREFIX: &str = "/member/name/";
pub const NET_PREFIX: &str = "/member/net/";
pub const POOL_PREFIX: &str = "/pool/";

/// Prefix under which every member key of `network` lives.
pub fn network_members_prefix(network: &str) -> String {
    format!("{}{}/", NET_PREFIX, network)
}

fn mac_from_bytes(data: &[u8]) -> String {
    String::from_utf8_lossy(data).trim().to_string()
}

/// A network record under `/net/<name>`.
#[derive(Debug, Clone, Default)]
pub struct NetworkObj {
    pub network: Network,
    pub version: i64,
}

impl NetworkObj {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            version: 0,
        }
    }

    pub fn named(name: &str) -> Self {
        Self::new(Network::new(name))
    }
}

impl Object for NetworkObj {
    fn key(&self) -> Option<String> {
        if self.network.name.is_empty() {
            return None;
        }
        Some(format!("{}{}", NETWORK_PREFIX, self.network.name))
    }

    fn version(&self) -> i64 {
        self.version
    }

    fn set_version(&mut self, version: i64) {
        self.version = version;
    }

    fn encode(&self) -> Result<Vec<u8>> {
        Ok(to_vec(&self.network)?)
    }

    fn decode(&mut self, data: &[u8]) -> Result<()> {
        self.network = from_slice(data)?;
        Ok(())
    }
}

/// The full member record under `/member/<mac>`.
#[derive(Debug, Clone, Default)]
pub struct MacIndex {
    pub member: Member,
    pub version: i64,
}

impl MacIndex {
    pub fn new(member: Member) -> Self {
        Self { member, version: 0 }
    }

    pub fn for_mac(mac: &str) -> Self {
        Self::new(Member::new(mac))
    }
}

impl Object for MacIndex {
    fn key(&self) -> Option<String> {
        if self.member.mac.is_empty() {
            return None;
        }
        Some(format!("{}{}", MEMBER_PREFIX, self.member.mac))
    }

    fn version(&self) -> i64 {
        self.version
    }

    fn set_version(&mut self, version: i64) {
        self.version = version;
    }

    fn encode(&self) -> Result<Vec<u8>> {
        Ok(to_vec(&self.member)?)
    }

    fn decode(&mut self, data: &[u8]) -> Result<()> {
        self.member = from_slice(data)?;
        Ok(())
    }
}

/// `/member/ip4/<addr>` → MAC. Keyless while the member holds no IPv4.
#[derive(Debug, Clone, Default)]
pub struct Ip4Index {
    pub member: Member,
    pub version: i64,
}

impl Ip4Index {
    pub fn new(member: Member) -> Self {
        Self { member, version: 0 }
    }

    /// An entry to read the holder of `address` into.
    pub fn for_address(address: Ipv4Addr) -> Self {
        Self::new(Member {
            ip4: Some(Lease::fixed(address)),
            ..Member::default()
        })
    }
}

impl Object for Ip4Index {
    fn key(&self) -> Option<String> {
        let lease = self.member.ip4.as_ref()?;
        Some(format!("{}{}", IP4_PREFIX, lease.address))
    }

    fn version(&self) -> i64 {
        self.version
    }

    fn set_version(&mut self, version: i64) {
        self.version = version;
    }

    fn encode(&self) -> Result<Vec<u8>> {
        Ok(self.member.mac.as_bytes().to_vec())
    }

    fn decode(&mut self, data: &[u8]) -> Result<()> {
        self.member.mac = mac_from_bytes(data);
        Ok(())
    }
}

/// `/member/name/<name>` → MAC. Keyless for unnamed members.
#[derive(Debug, Clone, Default)]
pub struct NameIndex {
    pub member: Member,
    pub version: i64,
}

impl NameIndex {
    pub fn new(member: Member) -> Self {
        Self { member, version: 0 }
    }

    pub fn for_name(name: &str) -> Self {
        Self::new(Member {
            name: name.to_string(),
            ..Default::default()
        })
    }
}

impl Object for NameIndex {
    fn key(&self) -> Option<String> {
        if self.member.name.is_empty() {
            return None;
        }
        Some(format!("{}{}", NAME_PREFIX, self.member.name))
    }

    fn version(&self) -> i64 {
        self.version
    }

    fn set_version(&mut self, version: i64) {
        self.version = version;
    }

    fn encode(&self) -> Result<Vec<u8>> {
        Ok(self.member.mac.as_bytes().to_vec())
    }

    fn decode(&mut self, data: &[u8]) -> Result<()> {
        self.member.mac = mac_from_bytes(data);
        Ok(())
    }
}

/// `/member/net/<net>/<mac>` → MAC, the membership marker.
#[derive(Debug, Clone, Default)]
pub struct NetIndex {
    pub member: Member,
    pub version: i64,
}

impl NetIndex {
    pub fn new(member: Member) -> Self {
        Self { member, version: 0 }
    }
}

impl Object for NetIndex {
    fn key(&self) -> Option<String> {
        if self.member.net.is_empty() || self.member.mac.is_empty() {
            return None;
        }
        Some(format!(
            "{}{}",
            network_members_prefix(&self.member.net),
            self.member.mac
        ))
    }

    fn version(&self) -> i64 {
        self.version
    }

    fn set_version(&mut self, version: i64) {
        self.version = version;
    }

    fn encode(&self) -> Result<Vec<u8>> {
        Ok(self.member.mac.as_bytes().to_vec())
    }

    fn decode(&mut self, data: &[u8]) -> Result<()> {
        self.member.mac = mac_from_bytes(data);
        Ok(())
    }
}

/// A network's allocation state under `/pool/<net>`.
#[derive(Debug, Clone, Default)]
pub struct PoolObj {
    pub pool: Pool,
    pub version: i64,
}

impl PoolObj {
    pub fn new(pool: Pool) -> Self {
        Self { pool, version: 0 }
    }

    pub fn for_network(net: &str) -> Self {
        Self::new(Pool::new(net))
    }
}

impl Object for PoolObj {
    fn key(&self) -> Option<String> {
        if self.pool.net.is_empty() {
            return None;
        }
        Some(format!("{}{}", POOL_PREFIX, self.pool.net))
    }

    fn version(&self) -> i64 {
        self.version
    }

    fn set_version(&mut self, version: i64) {
        self.version = version;
    }

    fn encode(&self) -> Result<Vec<u8>> {
        Ok(to_vec(&self.pool)?)
    }

    fn decode(&mut self, data: &[u8]) -> Result<()> {
        self.pool = from_slice(data)?;
        Ok(())
    }
}

/// Every key a member occupies. Views the member does not populate come back
/// keyless and are skipped by the store.
pub fn member_index_objects(member: &Member) -> Vec<Box<dyn Object>> {
    vec![
        Box::new(MacIndex::new(member.clone())),
        Box::new(Ip4Index::new(member.clone())),
        Box::new(NameIndex::new(member.clone())),
        Box::new(NetIndex::new(member.clone())),
    ]
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::model::Lease;

    fn keys(objects: &[Box<dyn Object>]) -> Vec<String> {
        objects.iter().filter_map(|object| object.key()).collect()
    }

    #[test]
    fn test_full_member_occupies_four_keys() {
        let member = Member {
            mac: "00:00:11:11:00:01".to_string(),
            name: "whiskey.mini.net".to_string(),
            ip4: Some(Lease::fixed(Ipv4Addr::new(10, 0, 0, 7))),
            ip6: None,
            net: "mini".to_string(),
        };
        assert_eq!(
            keys(&member_index_objects(&member)),
            vec![
                "/member/00:00:11:11:00:01",
                "/member/ip4/10.0.0.7",
                "/member/name/whiskey.mini.net",
                "/member/net/mini/00:00:11:11:00:01",
            ]
        );
    }

    #[test]
    fn test_bare_member_skips_unset_views() {
        let member = Member::new("00:00:11:11:00:02");
        assert_eq!(
            keys(&member_index_objects(&member)),
            vec!["/member/00:00:11:11:00:02"]
        );
    }

    #[test]
    fn test_secondary_views_store_plain_mac() {
        let member = Member {
            name: "bravo".to_string(),
            ..Member::new("00:00:11:11:00:03")
        };
        let index = NameIndex::new(member);
        assert_eq!(index.encode().unwrap(), b"00:00:11:11:00:03".to_vec());

        let mut decoded = NameIndex::for_name("bravo");
        decoded.decode(b"00:00:11:11:00:03").unwrap();
        assert_eq!(decoded.member.mac, "00:00:11:11:00:03");
    }

    #[test]
    fn test_member_prefix_has_trailing_separator() {
        assert_eq!(network_members_prefix("mini"), "/member/net/mini/");
        assert!(!"/member/net/mini2/aa".starts_with(&network_members_prefix("mini")));
    }
}
