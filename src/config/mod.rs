//! Hierarchical server configuration.
//!
//! The tree is Global -> Network -> RegistrationClass -> Subnet -> Pool. Every
//! level carries a [`Settings`] map; a lookup walks a [`Scope`] from the most
//! specific level to the least specific one and returns the first value found.
//! The tree is immutable once built. Reloads build a new tree and swap it in
//! with `ArcSwap`.

mod parser;

use std::{
    collections::BTreeMap,
    fmt,
    net::Ipv4Addr,
    path::Path,
    time::{Duration, SystemTime},
};

use compact_str::CompactString;
use ipnet::Ipv4Net;
use tracing::info;

use crate::error::Result;
use crate::pool::Pool;

pub use parser::ParseError;

/// Offer hold bounds when no `offer-hold-time` is configured.
const MIN_OFFER_HOLD: u32 = 1;
const MAX_OFFER_HOLD: u32 = 300;

/// Shortest lease that still leaves room for a one second offer hold.
pub const MIN_LEASE_TIME: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Classification {
    Registered,
    Unregistered,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Registered => "registered",
            Classification::Unregistered => "unregistered",
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SettingKey {
    Router,
    DomainNameServer,
    DomainName,
    DefaultLeaseTime,
    MaxLeaseTime,
    OfferHoldTime,
}

impl SettingKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettingKey::Router => "router",
            SettingKey::DomainNameServer => "domain-name-server",
            SettingKey::DomainName => "domain-name",
            SettingKey::DefaultLeaseTime => "default-lease-time",
            SettingKey::MaxLeaseTime => "max-lease-time",
            SettingKey::OfferHoldTime => "offer-hold-time",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingValue {
    Addresses(Vec<Ipv4Addr>),
    Text(CompactString),
    Seconds(u32),
}

/// Values set at one level of the tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    values: BTreeMap<SettingKey, SettingValue>,
}

impl Settings {
    pub fn get(&self, key: SettingKey) -> Option<&SettingValue> {
        self.values.get(&key)
    }

    pub fn set(&mut self, key: SettingKey, value: SettingValue) -> Option<SettingValue> {
        self.values.insert(key, value)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Ordered chain of settings, most specific first.
#[derive(Debug, Clone, Default)]
pub struct Scope<'a> {
    chain: Vec<&'a Settings>,
}

impl<'a> Scope<'a> {
    pub fn new(chain: Vec<&'a Settings>) -> Self {
        Self { chain }
    }

    /// First value defined for `key`, walking from most to least specific.
    pub fn resolve(&self, key: SettingKey) -> Option<&'a SettingValue> {
        self.chain.iter().copied().find_map(|settings| settings.get(key))
    }

    fn addresses(&self, key: SettingKey) -> Option<&'a [Ipv4Addr]> {
        match self.resolve(key)? {
            SettingValue::Addresses(addrs) => Some(addrs.as_slice()),
            _ => None,
        }
    }

    fn seconds(&self, key: SettingKey) -> Option<u32> {
        match self.resolve(key)? {
            SettingValue::Seconds(secs) => Some(*secs),
            _ => None,
        }
    }

    pub fn routers(&self) -> Option<&'a [Ipv4Addr]> {
        self.addresses(SettingKey::Router)
    }

    pub fn dns_servers(&self) -> Option<&'a [Ipv4Addr]> {
        self.addresses(SettingKey::DomainNameServer)
    }

    pub fn domain_name(&self) -> Option<&'a str> {
        match self.resolve(SettingKey::DomainName)? {
            SettingValue::Text(name) => Some(name.as_str()),
            _ => None,
        }
    }

    /// Lease duration in seconds. `default-lease-time` wins over
    /// `max-lease-time`; a client request is honoured up to the maximum and
    /// raised to [`MIN_LEASE_TIME`].
    pub fn lease_time(&self, requested: Option<u32>) -> Option<u32> {
        let max = self.seconds(SettingKey::MaxLeaseTime);
        let default = self.seconds(SettingKey::DefaultLeaseTime).or(max)?;
        let default = max.map_or(default, |max| default.min(max));
        Some(match (requested, max) {
            (Some(requested), Some(max)) => requested.max(MIN_LEASE_TIME).min(max),
            _ => default,
        })
    }

    /// How long an offered address stays reserved before the client confirms it.
    pub fn offer_hold(&self, lease_time: u32) -> Duration {
        let secs = self.seconds(SettingKey::OfferHoldTime).unwrap_or_else(|| {
            let max = self.seconds(SettingKey::MaxLeaseTime).unwrap_or(lease_time);
            (max / 12).clamp(MIN_OFFER_HOLD, MAX_OFFER_HOLD)
        });
        Duration::from_secs(u64::from(secs.min(lease_time.saturating_sub(1)).max(1)))
    }
}

#[derive(Debug)]
pub struct GlobalConfig {
    pub server_id: Ipv4Addr,
    pub settings: Settings,
    pub registered: Settings,
    pub unregistered: Settings,
}

impl GlobalConfig {
    pub fn class(&self, classification: Classification) -> &Settings {
        match classification {
            Classification::Registered => &self.registered,
            Classification::Unregistered => &self.unregistered,
        }
    }
}

#[derive(Debug)]
pub struct Subnet {
    pub net: Ipv4Net,
    pub settings: Settings,
    pub pools: Vec<Pool>,
}

impl Subnet {
    pub fn netmask(&self) -> Ipv4Addr {
        self.net.netmask()
    }
}

#[derive(Debug, Default)]
pub struct RegistrationClass {
    pub settings: Settings,
    pub subnets: Vec<Subnet>,
}

impl RegistrationClass {
    /// Every pool of the class in declaration order, with its subnet.
    pub fn pools(&self) -> impl Iterator<Item = (&Subnet, &Pool)> {
        self.subnets
            .iter()
            .flat_map(|subnet| subnet.pools.iter().map(move |pool| (subnet, pool)))
    }
}

/// A pool located inside a network, with the class and subnet that own it.
#[derive(Debug, Clone, Copy)]
pub struct PoolRef<'a> {
    pub classification: Classification,
    pub subnet: &'a Subnet,
    pub pool: &'a Pool,
}

#[derive(Debug)]
pub struct Network {
    pub name: CompactString,
    pub registered: RegistrationClass,
    pub unregistered: RegistrationClass,
}

impl Network {
    pub fn class(&self, classification: Classification) -> &RegistrationClass {
        match classification {
            Classification::Registered => &self.registered,
            Classification::Unregistered => &self.unregistered,
        }
    }

    pub fn pools(&self) -> impl Iterator<Item = PoolRef<'_>> {
        [Classification::Registered, Classification::Unregistered]
            .into_iter()
            .flat_map(move |classification| {
                self.class(classification)
                    .pools()
                    .map(move |(subnet, pool)| PoolRef {
                        classification,
                        subnet,
                        pool,
                    })
            })
    }

    pub fn subnets(&self) -> impl Iterator<Item = &Subnet> {
        self.registered
            .subnets
            .iter()
            .chain(self.unregistered.subnets.iter())
    }

    /// The pool whose range contains `ip`, in either class.
    pub fn pool_for_address(&self, ip: Ipv4Addr) -> Option<PoolRef<'_>> {
        self.pools().find(|pool_ref| pool_ref.pool.contains(ip))
    }
}

#[derive(Debug)]
pub struct Config {
    pub global: GlobalConfig,
    pub networks: Vec<Network>,
}

impl Config {
    /// Parse the nested-block configuration text. The first error aborts the
    /// parse and no partial tree is returned.
    pub fn parse(text: &str) -> std::result::Result<Config, ParseError> {
        parser::Parser::new(text).parse()
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Config> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config = Config::parse(&text)?;
        info!(
            path = %path.as_ref().display(),
            networks = config.networks.len(),
            "loaded configuration"
        );
        Ok(config)
    }

    pub fn network(&self, name: &str) -> Option<&Network> {
        self.networks.iter().find(|network| network.name == name)
    }

    /// Find the network owning a subnet that contains `addr`. `addr` is the
    /// relay agent address, or the receiving interface address for clients on
    /// a directly attached link.
    pub fn select_network_by_subnet(&self, addr: Ipv4Addr) -> Option<&Network> {
        self.networks
            .iter()
            .find(|network| network.subnets().any(|subnet| subnet.net.contains(&addr)))
    }

    /// Scope for a pool: Pool -> Subnet -> RegistrationClass -> global class -> Global.
    pub fn scope<'a>(
        &'a self,
        network: &'a Network,
        classification: Classification,
        subnet: &'a Subnet,
        pool: &'a Pool,
    ) -> Scope<'a> {
        Scope::new(vec![
            &pool.settings,
            &subnet.settings,
            &network.class(classification).settings,
            self.global.class(classification),
            &self.global.settings,
        ])
    }

    pub fn pool_scope<'a>(&'a self, network: &'a Network, pool_ref: PoolRef<'a>) -> Scope<'a> {
        self.scope(network, pool_ref.classification, pool_ref.subnet, pool_ref.pool)
    }

    /// Scope without any network below the global level.
    pub fn global_scope(&self, classification: Classification) -> Scope<'_> {
        Scope::new(vec![self.global.class(classification), &self.global.settings])
    }

    /// Move every unexpired lease of `previous` into the pool of this tree
    /// whose range contains its address. Returns how many were carried over.
    pub fn inherit_leases(&self, previous: &Config, now: SystemTime) -> usize {
        let mut carried = 0;
        for lease in previous
            .networks
            .iter()
            .flat_map(Network::pools)
            .flat_map(|pool_ref| pool_ref.pool.active_leases(now))
        {
            let target = self
                .networks
                .iter()
                .flat_map(Network::pools)
                .find(|pool_ref| pool_ref.pool.contains(lease.ip));
            if let Some(pool_ref) = target {
                if pool_ref.pool.adopt(lease, now) {
                    carried += 1;
                }
            }
        }
        carried
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::SettingKey::Router;

    pub(crate) const TEST_CONFIG: &str = r#"
global
    option domain-name example.com

    server-identifier 10.0.0.1

    registered
        default-lease-time 86400
        max-lease-time 86400
        option domain-name-server 10.1.0.1, 10.1.0.2
    end

    unregistered
        default-lease-time 360
        max-lease-time 360
        option domain-name-server 10.0.0.1
    end
end

network Network1
    unregistered
        subnet 10.0.1.0/24
            range 10.0.1.10 10.0.1.200
            option router 10.0.1.1
        end
    end
    registered
        subnet 10.0.2.0/24
            range 10.0.2.10 10.0.2.200
            option router 10.0.2.1
        end
    end
end

network Network2
    unregistered
        subnet 10.0.4.0/22
            range 10.0.4.1 10.0.7.254
            option router 10.0.4.1
        end
    end
    registered
        subnet 10.0.3.0/24
            pool
                range 10.0.3.10 10.0.3.100
                option router 10.0.3.254
                default-lease-time 3600
            end
            range 10.0.3.101 10.0.3.200
            option router 10.0.3.1
        end
    end
end
"#;

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test]
    fn subnet_router_is_resolved() {
        let config = Config::parse(TEST_CONFIG).unwrap();
        let network = config.network("Network1").unwrap();
        let class = network.class(Classification::Registered);
        let (subnet, pool) = class.pools().next().unwrap();

        let scope = config.scope(network, Classification::Registered, subnet, pool);
        assert_eq!(
            scope.resolve(Router),
            Some(&SettingValue::Addresses(vec![ip("10.0.2.1")]))
        );
        assert_eq!(scope.routers(), Some(&[ip("10.0.2.1")][..]));
    }

    #[test]
    fn pool_override_shadows_subnet() {
        let config = Config::parse(TEST_CONFIG).unwrap();
        let network = config.network("Network2").unwrap();
        let mut pools = network.class(Classification::Registered).pools();

        let (subnet, overridden) = pools.next().unwrap();
        let scope = config.scope(network, Classification::Registered, subnet, overridden);
        assert_eq!(scope.routers(), Some(&[ip("10.0.3.254")][..]));
        assert_eq!(scope.lease_time(None), Some(3600));

        let (subnet, plain) = pools.next().unwrap();
        let scope = config.scope(network, Classification::Registered, subnet, plain);
        assert_eq!(scope.routers(), Some(&[ip("10.0.3.1")][..]));
        assert_eq!(scope.lease_time(None), Some(86400));
    }

    #[test]
    fn class_and_global_values_fall_through() {
        let config = Config::parse(TEST_CONFIG).unwrap();
        let network = config.network("Network1").unwrap();
        let (subnet, pool) = network
            .class(Classification::Unregistered)
            .pools()
            .next()
            .unwrap();
        let scope = config.scope(network, Classification::Unregistered, subnet, pool);

        assert_eq!(scope.dns_servers(), Some(&[ip("10.0.0.1")][..]));
        assert_eq!(scope.domain_name(), Some("example.com"));
        assert_eq!(scope.lease_time(None), Some(360));
        assert_eq!(scope.resolve(SettingKey::OfferHoldTime), None);
    }

    #[test]
    fn lease_time_honours_client_request_up_to_max() {
        let mut class = Settings::default();
        class.set(SettingKey::DefaultLeaseTime, SettingValue::Seconds(600));
        class.set(SettingKey::MaxLeaseTime, SettingValue::Seconds(3600));
        let scope = Scope::new(vec![&class]);

        assert_eq!(scope.lease_time(None), Some(600));
        assert_eq!(scope.lease_time(Some(1200)), Some(1200));
        assert_eq!(scope.lease_time(Some(100_000)), Some(3600));
        assert_eq!(Scope::default().lease_time(None), None);
        assert_eq!(scope.lease_time(Some(0)), Some(MIN_LEASE_TIME));
    }

    #[test]
    fn one_second_lease_request_keeps_hold_below_lease() {
        let mut class = Settings::default();
        class.set(SettingKey::MaxLeaseTime, SettingValue::Seconds(3600));
        let scope = Scope::new(vec![&class]);

        let lease_time = scope.lease_time(Some(1)).unwrap();
        assert_eq!(lease_time, 2);
        assert!(scope.offer_hold(lease_time) < Duration::from_secs(u64::from(lease_time)));
    }

    #[test]
    fn offer_hold_is_shorter_than_the_lease() {
        let mut settings = Settings::default();
        settings.set(SettingKey::MaxLeaseTime, SettingValue::Seconds(360));
        let scope = Scope::new(vec![&settings]);
        assert_eq!(scope.offer_hold(360), Duration::from_secs(30));

        settings.set(SettingKey::MaxLeaseTime, SettingValue::Seconds(86400));
        let scope = Scope::new(vec![&settings]);
        assert_eq!(scope.offer_hold(86400), Duration::from_secs(300));

        settings.set(SettingKey::OfferHoldTime, SettingValue::Seconds(45));
        let scope = Scope::new(vec![&settings]);
        assert_eq!(scope.offer_hold(86400), Duration::from_secs(45));
        assert_eq!(scope.offer_hold(10), Duration::from_secs(9));
    }

    #[test]
    fn select_network_by_subnet() {
        let config = Config::parse(TEST_CONFIG).unwrap();

        let relay = config.select_network_by_subnet(ip("10.0.1.5")).unwrap();
        assert_eq!(relay.name, "Network1");
        let registered_side = config.select_network_by_subnet(ip("10.0.2.1")).unwrap();
        assert_eq!(registered_side.name, "Network1");
        let wide = config.select_network_by_subnet(ip("10.0.6.77")).unwrap();
        assert_eq!(wide.name, "Network2");
        assert!(config.select_network_by_subnet(ip("172.16.0.1")).is_none());
    }

    #[test]
    fn pool_for_address_spans_both_classes() {
        let config = Config::parse(TEST_CONFIG).unwrap();
        let network = config.network("Network1").unwrap();

        let registered = network.pool_for_address(ip("10.0.2.50")).unwrap();
        assert_eq!(registered.classification, Classification::Registered);
        let unregistered = network.pool_for_address(ip("10.0.1.10")).unwrap();
        assert_eq!(unregistered.classification, Classification::Unregistered);
        assert!(network.pool_for_address(ip("10.0.1.5")).is_none());
    }

    #[test]
    fn reload_carries_leases_over() {
        let old = Config::parse(TEST_CONFIG).unwrap();
        let now = SystemTime::now();
        let mac = advmac::MacAddr6::new([0x12, 0x34, 0x56, 0x12, 0x34, 0x56]);
        let (_, pool) = old
            .network("Network1")
            .unwrap()
            .class(Classification::Registered)
            .pools()
            .next()
            .unwrap();
        let lease = pool.offer(mac, now, Duration::from_secs(30)).unwrap();

        let new = Config::parse(TEST_CONFIG).unwrap();
        assert_eq!(new.inherit_leases(&old, now), 1);
        let moved = new
            .network("Network1")
            .unwrap()
            .pool_for_address(lease.ip)
            .unwrap();
        assert_eq!(moved.pool.lease_for_client(mac, now), Some(lease));
    }
}
