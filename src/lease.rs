//! Dynamic IPv4 lease allocation, renewal, and reclamation.
//!
//! Pool state lives in the store next to the network it belongs to. An
//! allocation reads the network, its pool, and the target member in one
//! transaction, takes the lowest free offset from the pool's [`CountSet`],
//! and writes pool, member, and IPv4 index back under version checks. A
//! concurrent writer that touched any of them makes the write fail as
//! `TxnFailed`; the allocation is then retried from a fresh read a bounded
//! number of times.
//!
//! Reclamation is the lease sweep's job ([`Ipam::recycle_expired_leases`]).
//! It clears expired members unconditionally, then returns their offsets to
//! the pool with a separate guarded write. If that second write keeps losing,
//! the slot stays marked allocated: a leak, never a double allocation.
//!
//! [`CountSet`]: crate::countset::CountSet

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::index::{Ip4Index, MacIndex, NetIndex, NetworkObj, PoolObj};
use crate::ipam::Ipam;
use crate::model::{Lease, Member};
use crate::range::normalize_mac;
use crate::store::{Object, ObjectTx};

impl Ipam {
    /// Allocates a dynamic IPv4 lease for `mac` from `network`'s pool.
    ///
    /// A MAC that already holds an address gets that address back without
    /// touching the pool. A MAC with no record yet is enrolled on `network`.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the network or its pool does not exist
    /// - `NoPool` if the network has no dynamic range
    /// - `PoolExhausted` if every offset is allocated
    /// - `TxnFailed` if every attempt lost a race with another writer
    pub async fn new_lease4(&self, mac: &str, network: &str) -> Result<Ipv4Addr> {
        let mac = normalize_mac(mac)?;
        let mut attempt = 0;
        loop {
            match self.try_new_lease4(&mac, network).await {
                Err(error) if error.is_txn_failed() && attempt < self.allocation_retries => {
                    attempt += 1;
                    debug!(mac = %mac, network, attempt, "allocation conflict, retrying");
                }
                result => return result,
            }
        }
    }

    async fn try_new_lease4(&self, mac: &str, network: &str) -> Result<Ipv4Addr> {
        let mut net = NetworkObj::named(network);
        let mut pool = PoolObj::for_network(network);
        let mut member = MacIndex::for_mac(mac);
        {
            let mut targets: [&mut dyn Object; 3] = [&mut net, &mut pool, &mut member];
            self.store.read_objects(&mut targets).await?;
        }

        if net.version == 0 {
            return Err(Error::NotFound(format!("network {}", network)));
        }
        let Some(range) = net.network.range4 else {
            return Err(Error::NoPool(network.to_string()));
        };
        if pool.version == 0 {
            return Err(Error::NotFound(format!("pool for network {}", network)));
        }
        if let Some(lease) = &member.member.ip4 {
            return Ok(lease.address);
        }

        // A slot can be marked free while its address is still indexed, e.g.
        // after a stale release. Such slots stay allocated and are skipped.
        let (offset, address) = loop {
            let offset = pool
                .pool
                .slots
                .add()
                .map_err(|_| Error::PoolExhausted(network.to_string()))?;
            let address = range.select(offset);

            let mut holder = Ip4Index::for_address(address);
            self.store.read(&mut holder).await?;
            if holder.version == 0 {
                break (offset, address);
            }
            warn!(
                network,
                addr = %address,
                holder = %holder.member.mac,
                "free pool slot is in use, skipping"
            );
        };

        let enrolling = member.version == 0;
        if enrolling {
            member.member.net = network.to_string();
        }
        member.member.ip4 = Some(Lease::dynamic(address, self.lease_duration));

        let by_address = Ip4Index::new(member.member.clone());
        let by_network = NetIndex::new(member.member.clone());
        let mut objects: Vec<&dyn Object> = Vec::with_capacity(4);
        objects.push(&pool);
        objects.push(&member);
        objects.push(&by_address);
        if enrolling {
            objects.push(&by_network);
        }
        self.store.write_objects(&objects).await?;

        info!(mac, network, addr = %address, offset, "lease allocated");
        Ok(address)
    }

    /// Pushes the expiration of `mac`'s dynamic lease forward by the lease
    /// duration. Members without a dynamic lease are left alone.
    pub async fn renew_lease(&self, mac: &str) -> Result<()> {
        let mut member = MacIndex::for_mac(&normalize_mac(mac)?);
        self.store.fetch(&mut member).await?;

        let Some(lease) = member.member.ip4.as_mut().filter(|lease| lease.is_dynamic()) else {
            debug!(mac, "nothing to renew");
            return Ok(());
        };
        lease.renew(self.lease_duration);
        let address = lease.address;

        self.store.write(&member).await?;
        debug!(mac, addr = %address, "lease renewed");
        Ok(())
    }

    /// Returns `addresses` to `network`'s pool.
    ///
    /// Addresses outside the range are ignored, as is a network that no
    /// longer exists or has no pool.
    pub async fn release_slots(&self, network: &str, addresses: &[Ipv4Addr]) -> Result<()> {
        let mut attempt = 0;
        loop {
            match self.try_release_slots(network, addresses).await {
                Err(error) if error.is_txn_failed() && attempt < self.allocation_retries => {
                    attempt += 1;
                    debug!(network, attempt, "pool release conflict, retrying");
                }
                result => return result,
            }
        }
    }

    /// Only addresses with no IPv4 index entry are freed, and the pool write
    /// requires those entries to still be absent. A caller working from a
    /// stale member list cannot free a slot someone else now holds.
    async fn try_release_slots(&self, network: &str, addresses: &[Ipv4Addr]) -> Result<()> {
        let mut addresses = addresses.to_vec();
        addresses.sort();
        addresses.dedup();

        let mut net = NetworkObj::named(network);
        let mut pool = PoolObj::for_network(network);
        let mut holders: Vec<Ip4Index> = addresses
            .iter()
            .map(|address| Ip4Index::for_address(*address))
            .collect();
        {
            let mut targets: Vec<&mut dyn Object> = Vec::with_capacity(holders.len() + 2);
            targets.push(&mut net);
            targets.push(&mut pool);
            targets.extend(holders.iter_mut().map(|holder| holder as &mut dyn Object));
            self.store.read_objects(&mut targets).await?;
        }
        let Some(range) = net.network.range4.filter(|_| net.version > 0 && pool.version > 0)
        else {
            return Ok(());
        };

        let before = pool.pool.slots.len();
        let mut guards: Vec<&dyn Object> = Vec::new();
        for (address, holder) in addresses.iter().zip(&holders) {
            if holder.version > 0 {
                debug!(network, addr = %address, holder = %holder.member.mac, "address reassigned, not released");
                continue;
            }
            if let Some(offset) = range.offset_of(*address)
                && pool.pool.slots.contains(offset)
            {
                pool.pool.slots.remove(offset);
                guards.push(holder);
            }
        }
        if pool.pool.slots.len() == before {
            return Ok(());
        }

        self.store.write_objects_guarded(&[&pool], &guards).await?;
        debug!(network, released = before - pool.pool.slots.len(), "pool slots released");
        Ok(())
    }

    /// Clears every dynamic lease that expired before `now` and frees its
    /// pool slot. Returns the number of leases recycled.
    pub async fn recycle_expired_leases(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut expired: Vec<Member> = self
            .fetch_ip4_index_members()
            .await?
            .into_iter()
            .filter(|member| member.ip4.as_ref().is_some_and(|lease| lease.is_expired_at(now)))
            .collect();
        expired.sort_by(|a, b| a.mac.cmp(&b.mac));
        expired.dedup_by(|a, b| a.mac == b.mac);
        if expired.is_empty() {
            return Ok(0);
        }

        let mut tx = ObjectTx::default();
        let mut released: BTreeMap<String, Vec<Ipv4Addr>> = BTreeMap::new();
        for member in &expired {
            tx.delete.push(Box::new(Ip4Index::new(member.clone())));

            let mut cleared = member.clone();
            if let Some(lease) = cleared.ip4.take() {
                released
                    .entry(member.net.clone())
                    .or_default()
                    .push(lease.address);
            }
            tx.put.push(Box::new(MacIndex::new(cleared)));
        }
        self.store.run_object_tx(&tx).await?;

        for member in &expired {
            if let Some(lease) = &member.ip4 {
                info!(mac = %member.mac, network = %member.net, addr = %lease.address, "lease expired");
            }
        }

        for (network, addresses) in released {
            if let Err(error) = self.release_slots(&network, &addresses).await {
                warn!(network = %network, error = %error, "failed to release pool slots");
            }
        }
        Ok(expired.len())
    }
}
