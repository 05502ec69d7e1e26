//! Per-subnet lease pool: configuration model, validation, and the
//! cursor allocator with expiry-based reclamation.

use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

use crate::ipv4::Ipv4;
use crate::options::ExtraOption;

/// Default lease time: 4 hours.
pub const DEFAULT_LEASE_TIME: Duration = Duration::from_secs(14_400);

/// Subnet record as carried by the config store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubnetConfig {
    /// CIDR, e.g. "10.1.1.0/24". Also the registry key.
    pub subnet: String,
    pub range_from: Ipv4,
    pub range_to: Ipv4,
    pub gateway: Ipv4,
    #[serde(default)]
    pub dns: Vec<Ipv4>,
    #[serde(default)]
    pub options: Vec<ExtraOption>,
    /// Seconds; 0 or absent means the 4-hour default.
    #[serde(default)]
    pub lease_time: u64,
}

/// A committed or offered address binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    pub mac: String,
    pub ip: Ipv4,
    pub net_mask: Ipv4,
    pub gateway: Ipv4,
    #[serde(default)]
    pub dns: Vec<Ipv4>,
    #[serde(default)]
    pub options: Vec<ExtraOption>,
    /// Seconds.
    pub lease_time: u64,
    /// CIDR of the owning subnet.
    pub subnet: String,
    pub last_update: DateTime<Utc>,
}

#[derive(thiserror::Error, Debug)]
pub enum SubnetError {
    #[error("invalid subnet {0:?}: {1}")]
    InvalidCidr(String, ipnet::AddrParseError),
    #[error("range start {from} > range end {to}")]
    RangeInverted { from: Ipv4, to: Ipv4 },
    #[error("{what} {ip} not inside {net}")]
    OutsideSubnet {
        what: &'static str,
        ip: Ipv4,
        net: Ipv4Net,
    },
}

/// Runtime subnet: immutable configuration plus the guarded pool state.
pub struct Subnet {
    cidr: String,
    net: Ipv4Net,
    range_from: Ipv4,
    range_to: Ipv4,
    gateway: Ipv4,
    net_mask: Ipv4,
    dns: Vec<Ipv4>,
    options: Vec<ExtraOption>,
    lease_time: Duration,
    state: Mutex<PoolState>,
}

/// Lease table and allocation cursor. Leases are keyed by IP; the MAC
/// index points into the primary map so both lookup paths observe the
/// same record.
#[derive(Default)]
struct PoolState {
    cursor: Option<Ipv4>,
    leases: HashMap<Ipv4, Lease>,
    by_mac: HashMap<String, Ipv4>,
}

impl Subnet {
    /// Validate a config record into a servable subnet with an empty
    /// lease table.
    pub fn new(cfg: SubnetConfig) -> Result<Self, SubnetError> {
        let net: Ipv4Net = cfg
            .subnet
            .parse()
            .map_err(|e| SubnetError::InvalidCidr(cfg.subnet.clone(), e))?;

        if cfg.range_from > cfg.range_to {
            return Err(SubnetError::RangeInverted {
                from: cfg.range_from,
                to: cfg.range_to,
            });
        }
        for (what, ip) in [
            ("range start", cfg.range_from),
            ("range end", cfg.range_to),
            ("gateway", cfg.gateway),
        ] {
            if !net.contains(&std::net::Ipv4Addr::from(ip)) {
                return Err(SubnetError::OutsideSubnet { what, ip, net });
            }
        }

        let lease_time = if cfg.lease_time == 0 {
            DEFAULT_LEASE_TIME
        } else {
            Duration::from_secs(cfg.lease_time)
        };

        Ok(Self {
            cidr: cfg.subnet,
            net_mask: Ipv4::from(net.netmask()),
            net,
            range_from: cfg.range_from,
            range_to: cfg.range_to,
            gateway: cfg.gateway,
            dns: cfg.dns,
            options: cfg.options,
            lease_time,
            state: Mutex::new(PoolState::default()),
        })
    }

    /// Override the lease time after construction.
    pub fn with_lease_time(mut self, lease_time: Duration) -> Self {
        self.lease_time = lease_time;
        self
    }

    pub fn cidr(&self) -> &str {
        &self.cidr
    }

    pub fn gateway(&self) -> Ipv4 {
        self.gateway
    }

    /// CIDR membership.
    pub fn contains(&self, ip: Ipv4) -> bool {
        self.net.contains(&std::net::Ipv4Addr::from(ip))
    }

    /// Resolve a stable lease for a client hardware address.
    ///
    /// A MAC already in the table gets its record back unchanged. A new
    /// MAC gets the first free slot found by a cursor scan of the range;
    /// when no slot is free, the longest-expired lease is rekeyed to the
    /// caller. None means the pool is exhausted with nothing reclaimable.
    pub fn lease_for_mac(&self, mac: &str) -> Option<Lease> {
        let mac = mac.to_lowercase();
        let mut state = self.state.lock().unwrap();

        if let Some(ip) = state.by_mac.get(&mac) {
            if let Some(lease) = state.leases.get(ip) {
                return Some(lease.clone());
            }
        }

        let mut cursor = match state.cursor {
            None => self.range_from,
            Some(mut at) => {
                at.inc();
                if at > self.range_to {
                    self.range_from
                } else {
                    at
                }
            }
        };

        let now = Utc::now();
        let expired_before =
            now - chrono::Duration::from_std(self.lease_time).unwrap_or(chrono::Duration::zero());

        let start = cursor;
        let mut oldest_expired: Option<Ipv4> = None;

        loop {
            match state.leases.get(&cursor) {
                None => {
                    let lease = Lease {
                        mac: mac.clone(),
                        ip: cursor,
                        net_mask: self.net_mask,
                        gateway: self.gateway,
                        dns: self.dns.clone(),
                        options: self.options.clone(),
                        lease_time: self.lease_time.as_secs(),
                        subnet: self.cidr.clone(),
                        last_update: now,
                    };
                    state.leases.insert(cursor, lease.clone());
                    state.by_mac.insert(mac, cursor);
                    state.cursor = Some(cursor);
                    return Some(lease);
                }
                Some(existing) => {
                    if existing.last_update < expired_before {
                        let older_than_tracked = match oldest_expired {
                            None => true,
                            Some(prev) => {
                                existing.last_update < state.leases[&prev].last_update
                            }
                        };
                        if older_than_tracked {
                            oldest_expired = Some(cursor);
                        }
                    }
                }
            }

            cursor.inc();
            if cursor > self.range_to {
                cursor = self.range_from;
            }
            if cursor == start {
                state.cursor = Some(cursor);
                return oldest_expired.and_then(|ip| Self::reclaim(&mut state, ip, mac, now));
            }
        }
    }

    /// Hand an expired slot to a new owner: rewrite the record's MAC and
    /// timestamp, and drop the displaced MAC's index entry so a later
    /// request from it allocates fresh.
    fn reclaim(state: &mut PoolState, ip: Ipv4, mac: String, now: DateTime<Utc>) -> Option<Lease> {
        let lease = state.leases.get_mut(&ip)?;
        debug!("reclaiming {} from {} for {}", ip, lease.mac, mac);
        let old_mac = std::mem::replace(&mut lease.mac, mac.clone());
        lease.last_update = now;
        let snapshot = lease.clone();

        if state.by_mac.get(&old_mac) == Some(&ip) {
            state.by_mac.remove(&old_mac);
        }
        state.by_mac.insert(mac, ip);
        Some(snapshot)
    }

    /// Write a lease through into the table under both keys (used when
    /// replaying store-persisted leases and on ACK commit).
    pub fn commit(&self, lease: Lease) {
        let mut state = self.state.lock().unwrap();

        if let Some(previous) = state.leases.get(&lease.ip) {
            if previous.mac != lease.mac {
                let stale = previous.mac.clone();
                if state.by_mac.get(&stale) == Some(&lease.ip) {
                    state.by_mac.remove(&stale);
                }
            }
        }
        state.by_mac.insert(lease.mac.clone(), lease.ip);
        state.leases.insert(lease.ip, lease);
    }

    /// Number of occupied slots (both offered and committed).
    pub fn leases_in_use(&self) -> usize {
        self.state.lock().unwrap().leases.len()
    }
}
