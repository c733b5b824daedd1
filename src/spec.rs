//! Declarative network definitions.
//!
//! A spec file is a stream of YAML documents, each tagged with a `kind`:
//!
//! ```yaml
//! kind: Network
//! name: lab
//! subnet4: 10.0.0.0/24
//! range4: { begin: 10.0.0.10, end: 10.0.0.20 }
//! ---
//! kind: MemberList
//! net: lab
//! list:
//!   - mac: "00:00:11:11:00:01"
//!     name: box
//! ```

use std::path::Path;

use serde::Deserialize;
use tracing::info;

use crate::error::Result;
use crate::ipam::Ipam;
use crate::model::{MemberList, Network};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind")]
pub enum SpecObject {
    Network(Network),
    MemberList(MemberList),
}

pub fn parse_spec(text: &str) -> Result<Vec<SpecObject>> {
    let mut objects = Vec::new();
    for document in serde_yaml::Deserializer::from_str(text) {
        objects.push(SpecObject::deserialize(document)?);
    }
    Ok(objects)
}

pub fn read_spec<P: AsRef<Path>>(path: P) -> Result<Vec<SpecObject>> {
    let text = std::fs::read_to_string(path)?;
    parse_spec(&text)
}

/// Adds every network, then every member list, so member lists may
/// reference networks defined later in the same file.
pub async fn apply_spec(ipam: &Ipam, objects: Vec<SpecObject>) -> Result<()> {
    let (networks, member_lists): (Vec<_>, Vec<_>) = objects
        .into_iter()
        .partition(|object| matches!(object, SpecObject::Network(_)));

    for object in networks.into_iter().chain(member_lists) {
        match object {
            SpecObject::Network(network) => {
                info!(network = %network.name, "applying network");
                ipam.add_network(network).await?;
            }
            SpecObject::MemberList(members) => {
                info!(network = %members.net, count = members.list.len(), "applying members");
                ipam.add_members(&members.net, members.list).await?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::config::Config;
    use crate::store::Store;

    const SPEC: &str = r#"
kind: MemberList
net: lab
list:
  - mac: "00:00:11:11:00:01"
    name: box
---
kind: Network
name: lab
subnet4: 10.0.0.0/24
range4:
  begin: 10.0.0.10
  end: 10.0.0.20
gateways: [10.0.0.1]
domain: lab.example
"#;

    struct TestGuard(String);

    impl Drop for TestGuard {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.0);
        }
    }

    #[test]
    fn test_parse_tagged_documents() {
        let objects = parse_spec(SPEC).unwrap();
        assert_eq!(objects.len(), 2);

        let SpecObject::MemberList(members) = &objects[0] else {
            panic!("expected a member list first");
        };
        assert_eq!(members.net, "lab");
        assert_eq!(members.list[0].name, "box");

        let SpecObject::Network(network) = &objects[1] else {
            panic!("expected a network second");
        };
        assert_eq!(network.gateways, vec![Ipv4Addr::new(10, 0, 0, 1)]);
        assert_eq!(network.range4.unwrap().size(), 11);
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        assert!(parse_spec("kind: Router\nname: r1\n").is_err());
    }

    #[tokio::test]
    async fn test_apply_adds_networks_before_members() {
        let path = "test_spec_apply.yaml".to_string();
        let _guard = TestGuard(path.clone());
        std::fs::write(&path, SPEC).unwrap();

        let ipam = Ipam::new(Store::memory(), &Config::default());
        apply_spec(&ipam, read_spec(&path).unwrap()).await.unwrap();

        assert_eq!(ipam.get_network("lab").await.unwrap().domain, "lab.example");
        let members = ipam.get_members("lab").await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].name, "box.lab.example");
        assert!(ipam.resolve_name("box.lab.example").await.unwrap().is_some());
    }
}
