//! Domain entities stored in the key-value backend.

use std::net::{Ipv4Addr, Ipv6Addr};

use chrono::{DateTime, TimeDelta, Utc};
use ipnet::{Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};

use crate::countset::CountSet;
use crate::error::Result;
use crate::range::{AddressRange, MacRange};

/// A numbered DHCP option handed to every client on a network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkOption {
    pub number: u8,
    pub value: String,
}

/// A managed network.
///
/// A network with a [`range4`](Self::range4) hands out dynamic leases from a
/// pool; a network without one only serves statically addressed members.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet4: Option<Ipv4Net>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet6: Option<Ipv6Net>,
    #[serde(default, rename = "dhcp4server", skip_serializing_if = "Option::is_none")]
    pub dhcp4_server: Option<Ipv4Addr>,
    #[serde(default, rename = "dhcp6server", skip_serializing_if = "Option::is_none")]
    pub dhcp6_server: Option<Ipv6Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range4: Option<AddressRange>,
    #[serde(default, rename = "macrange", skip_serializing_if = "Option::is_none")]
    pub mac_range: Option<MacRange>,
    #[serde(default)]
    pub gateways: Vec<Ipv4Addr>,
    #[serde(default)]
    pub nameservers: Vec<Ipv4Addr>,
    #[serde(default)]
    pub options: Vec<NetworkOption>,
    #[serde(default)]
    pub domain: String,
}

impl Network {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn has_pool(&self) -> bool {
        self.range4.is_some()
    }

    /// Appends the network's domain to a bare host name.
    pub fn qualify(&self, name: &str) -> String {
        if self.domain.is_empty() {
            name.to_string()
        } else {
            format!("{}.{}", name, self.domain)
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.name.contains('/') {
            return Err(crate::error::Error::Validation(format!(
                "invalid network name '{}'",
                self.name
            )));
        }
        if let Some(range) = &self.range4 {
            range.validate()?;
        }
        if let Some(range) = &self.mac_range {
            range.validate()?;
        }
        Ok(())
    }
}

/// An address assignment. Dynamic leases carry an expiration; static ones do not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease<A> {
    pub address: A,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<DateTime<Utc>>,
}

impl<A> Lease<A> {
    pub fn fixed(address: A) -> Self {
        Self {
            address,
            expires: None,
        }
    }

    pub fn dynamic(address: A, duration: TimeDelta) -> Self {
        Self {
            address,
            expires: Some(Utc::now() + duration),
        }
    }

    pub fn is_dynamic(&self) -> bool {
        self.expires.is_some()
    }

    /// True only for dynamic leases whose expiration lies strictly before `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_some_and(|expires| expires < now)
    }

    pub fn renew(&mut self, duration: TimeDelta) {
        self.expires = Some(Utc::now() + duration);
    }
}

/// A host on a network, identified by its MAC address.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub mac: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip4: Option<Lease<Ipv4Addr>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip6: Option<Lease<Ipv6Addr>>,
    #[serde(default)]
    pub net: String,
}

impl Member {
    pub fn new(mac: impl Into<String>) -> Self {
        Self {
            mac: mac.into(),
            ..Default::default()
        }
    }

    pub fn with_name(mac: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            mac: mac.into(),
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Allocation state of one network's dynamic range.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool {
    pub net: String,
    #[serde(flatten)]
    pub slots: CountSet,
}

impl Pool {
    pub fn new(net: impl Into<String>) -> Self {
        Self {
            net: net.into(),
            slots: CountSet::default(),
        }
    }

    pub fn for_range(net: impl Into<String>, range: &AddressRange) -> Self {
        Self {
            net: net.into(),
            slots: CountSet::new(range.size()),
        }
    }
}

/// Members to add to one network.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberList {
    pub net: String,
    #[serde(default)]
    pub list: Vec<Member>,
}

/// Requested changes to one member. Absent fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberUpdate {
    pub mac: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub ip4: Option<Lease<Ipv4Addr>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateList {
    pub net: String,
    #[serde(default)]
    pub list: Vec<MemberUpdate>,
}

/// Result of resolving a host name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Addrs {
    pub ip4: Option<Ipv4Addr>,
    pub ip6: Option<Ipv6Addr>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_expiry() {
        let now = Utc::now();
        let expired = Lease {
            address: Ipv4Addr::new(10, 0, 0, 1),
            expires: Some(now - TimeDelta::seconds(5)),
        };
        assert!(expired.is_expired_at(now));

        let fresh = Lease::dynamic(Ipv4Addr::new(10, 0, 0, 2), TimeDelta::hours(1));
        assert!(!fresh.is_expired_at(now));

        let fixed = Lease::fixed(Ipv4Addr::new(10, 0, 0, 3));
        assert!(!fixed.is_expired_at(now + TimeDelta::days(365)));
    }

    #[test]
    fn test_qualify_name() {
        let mut network = Network::new("mini");
        assert_eq!(network.qualify("whiskey"), "whiskey");
        network.domain = "mini.net".to_string();
        assert_eq!(network.qualify("whiskey"), "whiskey.mini.net");
    }

    #[test]
    fn test_network_validation() {
        assert!(Network::new("").validate().is_err());
        assert!(Network::new("a/b").validate().is_err());

        let network = Network {
            range4: Some(AddressRange::new(
                Ipv4Addr::new(10, 0, 0, 9),
                Ipv4Addr::new(10, 0, 0, 1),
            )),
            ..Network::new("backwards")
        };
        assert!(network.validate().is_err());

        let network = Network {
            mac_range: Some(MacRange::new("bogus", "00:00:00:00:00:01")),
            ..Network::new("badmac")
        };
        assert!(network.validate().is_err());
    }

    #[test]
    fn test_network_json_field_names() {
        let network = Network {
            subnet4: Some("10.0.0.0/24".parse().unwrap()),
            dhcp4_server: Some(Ipv4Addr::new(10, 0, 0, 1)),
            mac_range: Some(MacRange::new("00:00:00:00:00:00", "00:00:00:00:00:ff")),
            ..Network::new("mini")
        };
        let json = serde_json::to_value(&network).unwrap();
        assert_eq!(json["subnet4"], "10.0.0.0/24");
        assert_eq!(json["dhcp4server"], "10.0.0.1");
        assert_eq!(json["macrange"]["end"], "00:00:00:00:00:ff");
    }

    #[test]
    fn test_pool_flattens_countset() {
        let range = AddressRange::new(Ipv4Addr::new(10, 0, 0, 0), Ipv4Addr::new(10, 0, 0, 3));
        let pool = Pool::for_range("mini", &range);
        let json = serde_json::to_value(&pool).unwrap();
        assert_eq!(json, serde_json::json!({ "net": "mini", "size": 4, "values": [] }));

        let decoded: Pool = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, pool);
    }
}
