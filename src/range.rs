//! Address and hardware-address ranges.
//!
//! [`AddressRange`] maps pool offsets to IPv4 addresses. Both ends are
//! inclusive: a range from `10.0.0.10` to `10.0.0.19` has ten slots, offset
//! `0` is `begin` and offset `size() - 1` is `end`. Callers must keep offsets
//! below [`AddressRange::size`]; [`AddressRange::select`] does no bounds check.

use std::net::Ipv4Addr;
use std::str::FromStr;

use macaddr::MacAddr6;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Inclusive IPv4 range a network's pool draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRange {
    pub begin: Ipv4Addr,
    pub end: Ipv4Addr,
}

impl AddressRange {
    pub fn new(begin: Ipv4Addr, end: Ipv4Addr) -> Self {
        Self { begin, end }
    }

    /// Number of addresses in the range, saturating at `u32::MAX`.
    pub fn size(&self) -> u32 {
        let begin = u32::from(self.begin);
        let end = u32::from(self.end);
        end.wrapping_sub(begin).saturating_add(1)
    }

    /// Returns `begin + offset`.
    pub fn select(&self, offset: u32) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.begin).wrapping_add(offset))
    }

    /// Inverse of [`select`](Self::select) for addresses inside the range.
    pub fn offset_of(&self, address: Ipv4Addr) -> Option<u32> {
        let here = u32::from(address);
        if here < u32::from(self.begin) || here > u32::from(self.end) {
            return None;
        }
        Some(here - u32::from(self.begin))
    }

    pub fn validate(&self) -> Result<()> {
        if u32::from(self.begin) > u32::from(self.end) {
            return Err(Error::Validation(format!(
                "range begin {} is after end {}",
                self.begin, self.end
            )));
        }
        Ok(())
    }
}

/// Inclusive MAC range used to place unknown hosts onto a network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacRange {
    pub begin: String,
    pub end: String,
}

impl MacRange {
    pub fn new(begin: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            begin: begin.into(),
            end: end.into(),
        }
    }

    fn bounds(&self) -> Result<(u64, u64)> {
        Ok((mac_to_u64(&self.begin)?, mac_to_u64(&self.end)?))
    }

    pub fn validate(&self) -> Result<()> {
        let (begin, end) = self.bounds()?;
        if begin > end {
            return Err(Error::Validation(format!(
                "mac range begin {} is after end {}",
                self.begin, self.end
            )));
        }
        Ok(())
    }

    /// Tests whether `mac` lies inside the range, comparing the six address
    /// bytes as a big-endian 48-bit integer.
    pub fn contains(&self, mac: &str) -> Result<bool> {
        let (begin, end) = self.bounds()?;
        let here = mac_to_u64(mac)?;
        Ok(begin <= here && here <= end)
    }
}

pub fn parse_mac(mac: &str) -> Result<MacAddr6> {
    MacAddr6::from_str(mac.trim()).map_err(|_| Error::Validation(format!("invalid MAC: {}", mac)))
}

/// Canonical lowercase colon-separated form, the identity used for store keys.
pub fn normalize_mac(mac: &str) -> Result<String> {
    let parsed = parse_mac(mac)?;
    Ok(format_mac_bytes(parsed.as_bytes()))
}

pub fn format_mac_bytes(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|byte| format!("{:02x}", byte))
        .collect::<Vec<_>>()
        .join(":")
}

pub fn mac_to_u64(mac: &str) -> Result<u64> {
    let parsed = parse_mac(mac)?;
    let mut buffer = [0u8; 8];
    buffer[2..].copy_from_slice(parsed.as_bytes());
    Ok(u64::from_be_bytes(buffer))
}
