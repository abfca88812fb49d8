//! Lease pool allocator.
//!
//! A [`Pool`] owns one inclusive address range and the lease records of the
//! addresses in it. Records are created lazily the first time the scan
//! reaches an address and are never removed; whether an address is free is
//! decided purely by comparing the record's `end` with the current time, so
//! reclamation happens as a side effect of later scans.
//!
//! All access to the record map goes through a single mutex per pool. The
//! operations that reserve an address ([`Pool::offer`], [`Pool::bind`]) run
//! the lookup and the mutation under one lock acquisition, so two concurrent
//! transactions can never be handed the same free address.

use std::{
    collections::HashMap,
    net::Ipv4Addr,
    sync::{Mutex, MutexGuard, PoisonError},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use advmac::MacAddr6;

use crate::config::Settings;
use crate::error::{Error, Rejection, Result};

/// How long a declined address is kept out of circulation.
pub const DECLINE_HOLD: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    Free,
    Offered,
    Bound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub ip: Ipv4Addr,
    pub mac: Option<MacAddr6>,
    pub start: SystemTime,
    /// Absolute expiry. A time in the past means the address is free.
    pub end: SystemTime,
    /// Set while the lease only backs an outstanding DHCPOFFER.
    pub offered: bool,
}

impl Lease {
    fn new(ip: Ipv4Addr) -> Self {
        Self {
            ip,
            mac: None,
            start: UNIX_EPOCH,
            end: UNIX_EPOCH,
            offered: false,
        }
    }

    pub fn is_free(&self, now: SystemTime) -> bool {
        self.end <= now
    }

    pub fn state(&self, now: SystemTime) -> LeaseState {
        if self.is_free(now) {
            LeaseState::Free
        } else if self.offered {
            LeaseState::Offered
        } else {
            LeaseState::Bound
        }
    }

    fn held_by(&self, mac: MacAddr6, now: SystemTime) -> bool {
        self.mac == Some(mac) && !self.is_free(now)
    }
}

/// Snapshot of how many addresses of a pool are in use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolUsage {
    pub total: u32,
    pub offered: u32,
    pub bound: u32,
}

#[derive(Debug)]
pub struct Pool {
    start: Ipv4Addr,
    end: Ipv4Addr,
    pub settings: Settings,
    /// Configuration line the pool was declared on.
    pub(crate) line: usize,
    leases: Mutex<HashMap<Ipv4Addr, Lease>>,
}

impl Pool {
    /// `start` must not be greater than `end`; the parser rejects inverted ranges.
    pub fn new(start: Ipv4Addr, end: Ipv4Addr, settings: Settings) -> Self {
        debug_assert!(start <= end);
        Self {
            start,
            end,
            settings,
            line: 0,
            leases: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn declared_at(mut self, line: usize) -> Self {
        self.line = line;
        self
    }

    pub fn start(&self) -> Ipv4Addr {
        self.start
    }

    pub fn end(&self) -> Ipv4Addr {
        self.end
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.start <= ip && ip <= self.end
    }

    pub fn count_of_addresses(&self) -> u32 {
        u32::from(self.end) - u32::from(self.start) + 1
    }

    fn leases(&self) -> MutexGuard<'_, HashMap<Ipv4Addr, Lease>> {
        // A panic while holding the lock leaves the map consistent: every
        // mutation is a plain field assignment.
        self.leases.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// First-fit scan in ascending address order. Materializes missing records
    /// but does not reserve the lease it returns.
    fn first_free<'m>(
        &self,
        leases: &'m mut HashMap<Ipv4Addr, Lease>,
        now: SystemTime,
    ) -> Option<&'m mut Lease> {
        let ip = (u32::from(self.start)..=u32::from(self.end))
            .map(Ipv4Addr::from)
            .find(|ip| leases.entry(*ip).or_insert_with(|| Lease::new(*ip)).is_free(now))?;
        leases.get_mut(&ip)
    }

    /// Return the lowest free address without reserving it. Calling this again
    /// before the returned lease is changed yields the same lease.
    pub fn free_lease(&self, now: SystemTime) -> Result<Lease> {
        let mut leases = self.leases();
        self.first_free(&mut leases, now)
            .map(|lease| lease.clone())
            .ok_or(Error::PoolExhausted)
    }

    pub fn lease_by_address(&self, ip: Ipv4Addr) -> Option<Lease> {
        self.leases().get(&ip).cloned()
    }

    /// The unexpired lease currently held by `mac`, offered or bound.
    pub fn lease_for_client(&self, mac: MacAddr6, now: SystemTime) -> Option<Lease> {
        self.leases()
            .values()
            .find(|lease| lease.held_by(mac, now))
            .cloned()
    }

    /// Reserve an address for a DHCPOFFER.
    ///
    /// A client that already holds an unexpired lease here gets the same lease
    /// back: an outstanding offer has its hold window restarted, a bound lease
    /// is returned untouched. Otherwise the first free address is held for
    /// `hold`.
    pub fn offer(&self, mac: MacAddr6, now: SystemTime, hold: Duration) -> Result<Lease> {
        let mut leases = self.leases();

        if let Some(lease) = leases.values_mut().find(|lease| lease.held_by(mac, now)) {
            if lease.offered {
                lease.end = now + hold;
            }
            return Ok(lease.clone());
        }

        let lease = self
            .first_free(&mut leases, now)
            .ok_or(Error::PoolExhausted)?;
        lease.mac = Some(mac);
        lease.start = now;
        lease.end = now + hold;
        lease.offered = true;
        Ok(lease.clone())
    }

    /// Confirm `ip` for `mac` for the full lease `duration`.
    pub fn bind(
        &self,
        ip: Ipv4Addr,
        mac: MacAddr6,
        now: SystemTime,
        duration: Duration,
    ) -> std::result::Result<Lease, Rejection> {
        let mut leases = self.leases();
        let lease = leases.get_mut(&ip).ok_or(Rejection::UnknownAddress)?;
        if lease.mac != Some(mac) {
            return Err(Rejection::HardwareMismatch);
        }
        if lease.offered || lease.is_free(now) {
            lease.start = now;
        }
        lease.end = now + duration;
        lease.offered = false;
        Ok(lease.clone())
    }

    /// DHCPRELEASE: free the lease if `mac` holds it.
    pub fn release(&self, ip: Ipv4Addr, mac: MacAddr6, now: SystemTime) -> bool {
        match self.leases().get_mut(&ip) {
            Some(lease) if lease.held_by(mac, now) => {
                lease.end = now;
                lease.offered = false;
                true
            }
            _ => false,
        }
    }

    /// Free every unexpired lease `mac` holds here except `keep`. Returns how
    /// many were freed.
    pub fn release_others(&self, mac: MacAddr6, keep: Ipv4Addr, now: SystemTime) -> usize {
        let mut released = 0;
        for lease in self.leases().values_mut() {
            if lease.ip != keep && lease.held_by(mac, now) {
                lease.end = now;
                lease.offered = false;
                released += 1;
            }
        }
        released
    }

    /// DHCPDECLINE: the client found the address in use on the wire. Park it
    /// without an owner so the scan skips it for [`DECLINE_HOLD`].
    pub fn decline(&self, ip: Ipv4Addr, mac: MacAddr6, now: SystemTime) -> bool {
        match self.leases().get_mut(&ip) {
            Some(lease) if lease.mac == Some(mac) => {
                lease.mac = None;
                lease.start = now;
                lease.end = now + DECLINE_HOLD;
                lease.offered = false;
                true
            }
            _ => false,
        }
    }

    pub fn usage(&self, now: SystemTime) -> PoolUsage {
        let leases = self.leases();
        let mut usage = PoolUsage {
            total: self.count_of_addresses(),
            ..Default::default()
        };
        for lease in leases.values() {
            match lease.state(now) {
                LeaseState::Free => {}
                LeaseState::Offered => usage.offered += 1,
                LeaseState::Bound => usage.bound += 1,
            }
        }
        usage
    }

    pub fn active_leases(&self, now: SystemTime) -> Vec<Lease> {
        self.leases()
            .values()
            .filter(|lease| !lease.is_free(now))
            .cloned()
            .collect()
    }

    /// Take over a lease from a previous configuration tree. Ignored when the
    /// address is outside the range or this pool already tracks it as in use.
    pub fn adopt(&self, lease: Lease, now: SystemTime) -> bool {
        if !self.contains(lease.ip) {
            return false;
        }
        let mut leases = self.leases();
        match leases.get(&lease.ip) {
            Some(existing) if !existing.is_free(now) => false,
            _ => {
                leases.insert(lease.ip, lease);
                true
            }
        }
    }
}
