use std::{net::Ipv4Addr, str::Lines};

use compact_str::CompactString;
use ipnet::Ipv4Net;

use super::{
    Classification, Config, GlobalConfig, Network, RegistrationClass, SettingKey, SettingValue,
    Settings, Subnet, MIN_LEASE_TIME,
};
use crate::pool::Pool;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("line {line}: {message}")]
pub struct ParseError {
    pub line: usize,
    pub message: String,
}

impl ParseError {
    fn new(line: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

type Result<T> = std::result::Result<T, ParseError>;

const KEYWORDS: &[&str] = &[
    "global",
    "network",
    "registered",
    "unregistered",
    "subnet",
    "pool",
    "range",
    "option",
    "server-identifier",
    "default-lease-time",
    "max-lease-time",
    "offer-hold-time",
    "end",
];

#[derive(Debug, Clone, Copy)]
enum Block {
    Global,
    GlobalClass(Classification),
    Network,
    NetworkClass(Classification),
    Subnet,
    Pool,
}

impl Block {
    fn name(&self) -> &'static str {
        match self {
            Block::Global => "global",
            Block::GlobalClass(c) | Block::NetworkClass(c) => c.as_str(),
            Block::Network => "network",
            Block::Subnet => "subnet",
            Block::Pool => "pool",
        }
    }
}

struct Statement<'a> {
    line: usize,
    keyword: &'a str,
    args: Vec<&'a str>,
}

impl<'a> Statement<'a> {
    fn args<const N: usize>(&self) -> Result<[&'a str; N]> {
        self.args.as_slice().try_into().map_err(|_| {
            ParseError::new(
                self.line,
                format!(
                    "'{}' expects {} argument(s), got {}",
                    self.keyword,
                    N,
                    self.args.len()
                ),
            )
        })
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError::new(self.line, message)
    }

    /// Error for a keyword that cannot appear where it was found.
    fn misplaced(&self, block: Option<Block>) -> ParseError {
        if !KEYWORDS.contains(&self.keyword) {
            return self.error(format!("unknown keyword '{}'", self.keyword));
        }
        match block {
            None if self.keyword == "end" => self.error("unexpected 'end'"),
            None => self.error(format!("'{}' is not permitted at top level", self.keyword)),
            Some(block) => self.error(format!(
                "'{}' is not permitted inside '{}'",
                self.keyword,
                block.name()
            )),
        }
    }
}

fn class_of(keyword: &str) -> Classification {
    if keyword == "registered" {
        Classification::Registered
    } else {
        Classification::Unregistered
    }
}

fn address(stmt: &Statement<'_>, value: &str) -> Result<Ipv4Addr> {
    value
        .parse()
        .map_err(|_| stmt.error(format!("malformed address '{value}'")))
}

fn seconds(stmt: &Statement<'_>) -> Result<SettingValue> {
    let [value] = stmt.args::<1>()?;
    match value.parse::<u32>() {
        Ok(secs) if secs > 0 => Ok(SettingValue::Seconds(secs)),
        _ => Err(stmt.error(format!("'{}' must be a positive number of seconds", stmt.keyword))),
    }
}

fn option(stmt: &Statement<'_>) -> Result<(SettingKey, SettingValue)> {
    let Some((key, values)) = stmt.args.split_first().filter(|(_, v)| !v.is_empty()) else {
        return Err(stmt.error("'option' expects a key and a value"));
    };
    let addresses = || -> Result<SettingValue> {
        let addrs = values
            .iter()
            .flat_map(|v| v.split(','))
            .filter(|v| !v.is_empty())
            .map(|v| address(stmt, v))
            .collect::<Result<Vec<_>>>()?;
        if addrs.is_empty() {
            return Err(stmt.error(format!("option '{key}' expects at least one address")));
        }
        Ok(SettingValue::Addresses(addrs))
    };
    match *key {
        "router" => Ok((SettingKey::Router, addresses()?)),
        "domain-name-server" => Ok((SettingKey::DomainNameServer, addresses()?)),
        "domain-name" => match values {
            [name] => Ok((SettingKey::DomainName, SettingValue::Text(CompactString::from(*name)))),
            _ => Err(stmt.error("option 'domain-name' expects a single name")),
        },
        other => Err(stmt.error(format!("unknown option '{other}'"))),
    }
}

/// Apply a scoped setting, or reject the statement as misplaced in `block`.
fn setting(stmt: &Statement<'_>, block: Block, settings: &mut Settings) -> Result<()> {
    let (key, value) = match stmt.keyword {
        "option" => option(stmt)?,
        "default-lease-time" => (SettingKey::DefaultLeaseTime, seconds(stmt)?),
        "max-lease-time" => (SettingKey::MaxLeaseTime, seconds(stmt)?),
        "offer-hold-time" => (SettingKey::OfferHoldTime, seconds(stmt)?),
        _ => return Err(stmt.misplaced(Some(block))),
    };
    settings.set(key, value);
    Ok(())
}

fn range(stmt: &Statement<'_>, net: &Ipv4Net) -> Result<(Ipv4Addr, Ipv4Addr)> {
    let [start, end] = stmt.args::<2>()?;
    let (start, end) = (address(stmt, start)?, address(stmt, end)?);
    if start > end {
        return Err(stmt.error(format!("range start {start} is greater than end {end}")));
    }
    if !net.contains(&start) || !net.contains(&end) {
        return Err(stmt.error(format!("range {start} - {end} is outside subnet {net}")));
    }
    Ok((start, end))
}

/// Line oriented reader over the nested `keyword ... end` grammar.
pub(crate) struct Parser<'a> {
    lines: Lines<'a>,
    line: usize,
}

impl<'a> Parser<'a> {
    pub(crate) fn new(text: &'a str) -> Self {
        Self {
            lines: text.lines(),
            line: 0,
        }
    }

    /// Next non-blank line, with `#` comments stripped.
    fn next_statement(&mut self) -> Option<Statement<'a>> {
        for raw in self.lines.by_ref() {
            self.line += 1;
            let content = raw.split('#').next().unwrap_or_default();
            let mut tokens = content.split_whitespace();
            if let Some(keyword) = tokens.next() {
                return Some(Statement {
                    line: self.line,
                    keyword,
                    args: tokens.collect(),
                });
            }
        }
        None
    }

    fn next_in(&mut self, block: Block, opened: usize) -> Result<Statement<'a>> {
        self.next_statement().ok_or_else(|| {
            ParseError::new(
                self.line,
                format!(
                    "'{}' block opened on line {opened} is missing 'end'",
                    block.name()
                ),
            )
        })
    }

    pub(crate) fn parse(mut self) -> Result<Config> {
        let mut global = None;
        let mut networks: Vec<Network> = Vec::new();

        while let Some(stmt) = self.next_statement() {
            match stmt.keyword {
                "global" => {
                    stmt.args::<0>()?;
                    if global.is_some() {
                        return Err(stmt.error("duplicate 'global' block"));
                    }
                    global = Some(self.parse_global(stmt.line)?);
                }
                "network" => {
                    let [name] = stmt.args::<1>()?;
                    if networks.iter().any(|network| network.name == name) {
                        return Err(stmt.error(format!("duplicate network name '{name}'")));
                    }
                    networks.push(self.parse_network(name, stmt.line)?);
                }
                _ => return Err(stmt.misplaced(None)),
            }
        }

        let global = global.ok_or_else(|| ParseError::new(self.line, "missing 'global' block"))?;
        let config = Config { global, networks };
        validate(&config)?;
        Ok(config)
    }

    fn parse_global(&mut self, opened: usize) -> Result<GlobalConfig> {
        let mut server_id = None;
        let mut settings = Settings::default();
        let mut registered = None;
        let mut unregistered = None;

        loop {
            let stmt = self.next_in(Block::Global, opened)?;
            match stmt.keyword {
                "end" => {
                    stmt.args::<0>()?;
                    break;
                }
                "server-identifier" => {
                    let [addr] = stmt.args::<1>()?;
                    server_id = Some(address(&stmt, addr)?);
                }
                "registered" | "unregistered" => {
                    stmt.args::<0>()?;
                    let classification = class_of(stmt.keyword);
                    let slot = match classification {
                        Classification::Registered => &mut registered,
                        Classification::Unregistered => &mut unregistered,
                    };
                    if slot.is_some() {
                        return Err(stmt.error(format!("duplicate '{}' block", stmt.keyword)));
                    }
                    *slot = Some(self.parse_global_class(classification, stmt.line)?);
                }
                _ => setting(&stmt, Block::Global, &mut settings)?,
            }
        }

        let server_id = server_id.ok_or_else(|| {
            ParseError::new(opened, "'global' block requires a server-identifier")
        })?;
        Ok(GlobalConfig {
            server_id,
            settings,
            registered: registered.unwrap_or_default(),
            unregistered: unregistered.unwrap_or_default(),
        })
    }

    fn parse_global_class(&mut self, classification: Classification, opened: usize) -> Result<Settings> {
        let block = Block::GlobalClass(classification);
        let mut settings = Settings::default();
        loop {
            let stmt = self.next_in(block, opened)?;
            match stmt.keyword {
                "end" => {
                    stmt.args::<0>()?;
                    return Ok(settings);
                }
                _ => setting(&stmt, block, &mut settings)?,
            }
        }
    }

    fn parse_network(&mut self, name: &str, opened: usize) -> Result<Network> {
        let mut registered = None;
        let mut unregistered = None;

        loop {
            let stmt = self.next_in(Block::Network, opened)?;
            match stmt.keyword {
                "end" => {
                    stmt.args::<0>()?;
                    break;
                }
                "registered" | "unregistered" => {
                    stmt.args::<0>()?;
                    let classification = class_of(stmt.keyword);
                    let slot = match classification {
                        Classification::Registered => &mut registered,
                        Classification::Unregistered => &mut unregistered,
                    };
                    if slot.is_some() {
                        return Err(stmt.error(format!(
                            "duplicate '{}' block in network '{name}'",
                            stmt.keyword
                        )));
                    }
                    *slot = Some(self.parse_network_class(classification, stmt.line)?);
                }
                _ => return Err(stmt.misplaced(Some(Block::Network))),
            }
        }

        Ok(Network {
            name: CompactString::from(name),
            registered: registered.unwrap_or_default(),
            unregistered: unregistered.unwrap_or_default(),
        })
    }

    fn parse_network_class(
        &mut self,
        classification: Classification,
        opened: usize,
    ) -> Result<RegistrationClass> {
        let block = Block::NetworkClass(classification);
        let mut class = RegistrationClass::default();
        loop {
            let stmt = self.next_in(block, opened)?;
            match stmt.keyword {
                "end" => {
                    stmt.args::<0>()?;
                    return Ok(class);
                }
                "subnet" => {
                    let [cidr] = stmt.args::<1>()?;
                    let net: Ipv4Net = cidr
                        .parse()
                        .map_err(|_| stmt.error(format!("malformed CIDR '{cidr}'")))?;
                    class.subnets.push(self.parse_subnet(net, stmt.line)?);
                }
                _ => setting(&stmt, block, &mut class.settings)?,
            }
        }
    }

    fn parse_subnet(&mut self, net: Ipv4Net, opened: usize) -> Result<Subnet> {
        let mut subnet = Subnet {
            net,
            settings: Settings::default(),
            pools: Vec::new(),
        };
        loop {
            let stmt = self.next_in(Block::Subnet, opened)?;
            match stmt.keyword {
                "end" => {
                    stmt.args::<0>()?;
                    return Ok(subnet);
                }
                "range" => {
                    let (start, end) = range(&stmt, &net)?;
                    subnet
                        .pools
                        .push(Pool::new(start, end, Settings::default()).declared_at(stmt.line));
                }
                "pool" => {
                    stmt.args::<0>()?;
                    subnet.pools.push(self.parse_pool(&net, stmt.line)?);
                }
                _ => setting(&stmt, Block::Subnet, &mut subnet.settings)?,
            }
        }
    }

    fn parse_pool(&mut self, net: &Ipv4Net, opened: usize) -> Result<Pool> {
        let mut bounds = None;
        let mut settings = Settings::default();
        loop {
            let stmt = self.next_in(Block::Pool, opened)?;
            match stmt.keyword {
                "end" => {
                    stmt.args::<0>()?;
                    break;
                }
                "range" => {
                    if bounds.is_some() {
                        return Err(stmt.error("'pool' block takes a single 'range'"));
                    }
                    bounds = Some(range(&stmt, net)?);
                }
                _ => setting(&stmt, Block::Pool, &mut settings)?,
            }
        }
        let (start, end) =
            bounds.ok_or_else(|| ParseError::new(opened, "'pool' block requires a 'range'"))?;
        Ok(Pool::new(start, end, settings).declared_at(opened))
    }
}

/// Mandatory values must resolve for every pool, and no address may belong
/// to more than one pool.
fn validate(config: &Config) -> Result<()> {
    let pools: Vec<&Pool> = config
        .networks
        .iter()
        .flat_map(|network| network.pools())
        .map(|pool_ref| pool_ref.pool)
        .collect();
    for (i, pool) in pools.iter().enumerate() {
        for other in &pools[..i] {
            if pool.start() <= other.end() && other.start() <= pool.end() {
                let (earlier, later) = if other.line <= pool.line {
                    (other, pool)
                } else {
                    (pool, other)
                };
                return Err(ParseError::new(
                    later.line,
                    format!(
                        "range {} - {} overlaps the pool declared on line {}",
                        later.start(),
                        later.end(),
                        earlier.line
                    ),
                ));
            }
        }
    }

    for network in &config.networks {
        for pool_ref in network.pools() {
            let pool = pool_ref.pool;
            let scope = config.pool_scope(network, pool_ref);
            let Some(lease_time) = scope.lease_time(None) else {
                return Err(ParseError::new(
                    pool.line,
                    format!(
                        "no lease time resolvable for pool {} - {} in network '{}'",
                        pool.start(),
                        pool.end(),
                        network.name
                    ),
                ));
            };
            if lease_time < MIN_LEASE_TIME {
                return Err(ParseError::new(
                    pool.line,
                    format!("lease time {lease_time} is below the minimum of {MIN_LEASE_TIME}"),
                ));
            }
            if let Some(SettingValue::Seconds(hold)) = scope.resolve(SettingKey::OfferHoldTime) {
                if *hold >= lease_time {
                    return Err(ParseError::new(
                        pool.line,
                        format!("offer-hold-time {hold} must be shorter than the lease time {lease_time}"),
                    ));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::TEST_CONFIG;

    fn parse_err(text: &str) -> ParseError {
        Config::parse(text).expect_err("configuration should be rejected")
    }

    const GLOBAL: &str = "global\n  server-identifier 10.0.0.1\n  default-lease-time 600\nend\n";

    #[test]
    fn parses_full_configuration() {
        let config = Config::parse(TEST_CONFIG).unwrap();
        assert_eq!(config.global.server_id, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(config.networks.len(), 2);

        let network2 = config.network("Network2").unwrap();
        let unregistered: Vec<_> = network2.unregistered.pools().collect();
        assert_eq!(unregistered.len(), 1);
        assert_eq!(unregistered[0].1.count_of_addresses(), 1022);
        assert_eq!(network2.registered.subnets[0].pools.len(), 2);
        assert_eq!(
            network2.registered.subnets[0].netmask(),
            Ipv4Addr::new(255, 255, 255, 0)
        );
    }

    #[test]
    fn tolerates_comments_and_whitespace() {
        let text = "\n\n   # leading comment\nglobal   \n\tserver-identifier 10.0.0.1 # inline\n\n   default-lease-time 600\nend\n\nnetwork lab\n  registered\n    subnet 10.9.0.0/24\n\t\trange 10.9.0.10 10.9.0.20\n    end\n  end\nend   \n";
        let config = Config::parse(text).unwrap();
        assert_eq!(config.network("lab").unwrap().registered.pools().count(), 1);
    }

    #[test]
    fn missing_end_is_rejected() {
        let text = format!("{GLOBAL}network n\n  registered\n    subnet 10.0.1.0/24\n      range 10.0.1.10 10.0.1.20\n    end\n  end\n");
        let err = parse_err(&text);
        assert_eq!(err.line, 10);
        assert!(err.message.contains("missing 'end'"), "{err}");
    }

    #[test]
    fn unknown_keyword_is_rejected() {
        let err = parse_err("global\n  server-identifier 10.0.0.1\n  frobnicate yes\nend\n");
        assert_eq!(err, ParseError::new(3, "unknown keyword 'frobnicate'"));
    }

    #[test]
    fn unknown_option_is_rejected() {
        let err = parse_err("global\n  server-identifier 10.0.0.1\n  option ntp-server 10.0.0.5\nend\n");
        assert_eq!(err.line, 3);
        assert!(err.message.contains("unknown option 'ntp-server'"));
    }

    #[test]
    fn inverted_range_is_rejected() {
        let text = format!("{GLOBAL}network n\n  unregistered\n    subnet 10.0.1.0/24\n      range 10.0.1.200 10.0.1.10\n    end\n  end\nend\n");
        let err = parse_err(&text);
        assert_eq!(err.line, 8);
        assert!(err.message.contains("greater than end"));
    }

    #[test]
    fn range_outside_subnet_is_rejected() {
        let text = format!("{GLOBAL}network n\n  unregistered\n    subnet 10.0.1.0/24\n      range 10.0.1.10 10.0.2.10\n    end\n  end\nend\n");
        assert!(parse_err(&text).message.contains("outside subnet"));
    }

    #[test]
    fn malformed_addresses_are_rejected() {
        let err = parse_err("global\n  server-identifier 10.0.0.300\nend\n");
        assert_eq!(err, ParseError::new(2, "malformed address '10.0.0.300'"));

        let text = format!("{GLOBAL}network n\n  registered\n    subnet 10.0.1.0/33\n    end\n  end\nend\n");
        assert_eq!(parse_err(&text), ParseError::new(7, "malformed CIDR '10.0.1.0/33'"));
    }

    #[test]
    fn duplicate_network_is_rejected() {
        let text = format!("{GLOBAL}network n\nend\nnetwork n\nend\n");
        assert_eq!(
            parse_err(&text),
            ParseError::new(7, "duplicate network name 'n'")
        );
    }

    #[test]
    fn blocks_nested_in_the_wrong_place_are_rejected() {
        let err = parse_err("global\n  server-identifier 10.0.0.1\n  registered\n    subnet 10.0.1.0/24\n    end\n  end\nend\n");
        assert_eq!(err.line, 4);
        assert_eq!(err.message, "'subnet' is not permitted inside 'registered'");

        let text = format!("{GLOBAL}network n\n  subnet 10.0.1.0/24\n  end\nend\n");
        let err = parse_err(&text);
        assert_eq!(err.message, "'subnet' is not permitted inside 'network'");

        let text = format!("{GLOBAL}network n\n  registered\n    range 10.0.1.1 10.0.1.2\n  end\nend\n");
        assert_eq!(
            parse_err(&text).message,
            "'range' is not permitted inside 'registered'"
        );

        assert_eq!(
            parse_err(&format!("{GLOBAL}registered\nend\n")).message,
            "'registered' is not permitted at top level"
        );
        assert_eq!(parse_err(&format!("{GLOBAL}end\n")).message, "unexpected 'end'");
    }

    #[test]
    fn pool_blocks_need_exactly_one_range() {
        let text = format!("{GLOBAL}network n\n  registered\n    subnet 10.0.1.0/24\n      pool\n        option router 10.0.1.1\n      end\n    end\n  end\nend\n");
        let err = parse_err(&text);
        assert_eq!(err, ParseError::new(8, "'pool' block requires a 'range'"));

        let text = format!("{GLOBAL}network n\n  registered\n    subnet 10.0.1.0/24\n      pool\n        range 10.0.1.1 10.0.1.5\n        range 10.0.1.6 10.0.1.9\n      end\n    end\n  end\nend\n");
        assert_eq!(parse_err(&text).line, 10);
    }

    #[test]
    fn mandatory_values_are_required() {
        let err = parse_err("global\n  default-lease-time 600\nend\n");
        assert_eq!(
            err,
            ParseError::new(1, "'global' block requires a server-identifier")
        );

        let err = parse_err("network n\nend\n");
        assert_eq!(err.message, "missing 'global' block");

        let text = "global\n  server-identifier 10.0.0.1\nend\nnetwork n\n  registered\n    subnet 10.0.1.0/24\n      range 10.0.1.10 10.0.1.20\n    end\n  end\nend\n";
        let err = parse_err(text);
        assert_eq!(err.line, 7);
        assert!(err.message.starts_with("no lease time resolvable"));
    }

    #[test]
    fn offer_hold_must_be_shorter_than_lease() {
        let text = "global\n  server-identifier 10.0.0.1\n  default-lease-time 60\n  offer-hold-time 60\nend\nnetwork n\n  registered\n    subnet 10.0.1.0/24\n      range 10.0.1.10 10.0.1.20\n    end\n  end\nend\n";
        assert_eq!(parse_err(text).line, 9);
    }

    #[test]
    fn one_second_lease_is_rejected() {
        let text = "global\n  server-identifier 10.0.0.1\n  max-lease-time 1\nend\nnetwork n\n  registered\n    subnet 10.0.1.0/24\n      range 10.0.1.10 10.0.1.20\n    end\n  end\nend\n";
        let err = parse_err(text);
        assert_eq!(err.line, 8);
        assert_eq!(err.message, "lease time 1 is below the minimum of 2");
    }

    #[test]
    fn overlapping_ranges_across_classes_are_rejected() {
        let text = format!("{GLOBAL}network n\n  registered\n    subnet 10.0.1.0/24\n      range 10.0.1.10 10.0.1.20\n    end\n  end\n  unregistered\n    subnet 10.0.1.0/24\n      range 10.0.1.15 10.0.1.30\n    end\n  end\nend\n");
        assert_eq!(
            parse_err(&text),
            ParseError::new(13, "range 10.0.1.15 - 10.0.1.30 overlaps the pool declared on line 8")
        );
    }

    #[test]
    fn overlapping_ranges_in_one_subnet_are_rejected() {
        let text = format!("{GLOBAL}network n\n  unregistered\n    subnet 10.0.1.0/24\n      range 10.0.1.10 10.0.1.20\n      pool\n        range 10.0.1.20 10.0.1.40\n      end\n    end\n  end\nend\n");
        let err = parse_err(&text);
        assert_eq!(err.line, 9);
        assert!(err.message.contains("overlaps the pool declared on line 8"), "{err}");

        let text = format!("{GLOBAL}network n\n  unregistered\n    subnet 10.0.1.0/24\n      range 10.0.1.10 10.0.1.20\n      range 10.0.1.21 10.0.1.40\n    end\n  end\nend\n");
        assert!(Config::parse(&text).is_ok());
    }

    #[test]
    fn option_value_lists() {
        let text = "global\n  server-identifier 10.0.0.1\n  option domain-name-server 10.1.0.1,10.1.0.2 , 10.1.0.3\nend\n";
        let config = Config::parse(text).unwrap();
        assert_eq!(
            config.global.settings.get(SettingKey::DomainNameServer),
            Some(&SettingValue::Addresses(vec![
                Ipv4Addr::new(10, 1, 0, 1),
                Ipv4Addr::new(10, 1, 0, 2),
                Ipv4Addr::new(10, 1, 0, 3),
            ]))
        );

        let err = parse_err("global\n  server-identifier 10.0.0.1\n  option router\nend\n");
        assert_eq!(err.message, "'option' expects a key and a value");
    }
}
