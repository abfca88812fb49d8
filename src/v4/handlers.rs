use advmac::MacAddr6;
use compact_str::CompactString;
use dhcproto::v4::{self, DhcpOption, Flags, OptionCode};
use std::net::Ipv4Addr;
use std::time::{Duration, SystemTime};
use tracing::{debug, field, info, instrument, warn, Span};

use crate::config::{Classification, Config, Network, PoolRef, Scope, Subnet};
use crate::error::{Error, Rejection, Result};
use crate::pool::Lease;
use crate::registry::{unix_secs, Device, DeviceStore, LeaseRecord};
use crate::v4::{extensions::NacMessageExtV4, rebinding_time, renewal_time};

/// A DHCPv4 response message produced by the server, with the classification
/// and network it was served from when known.
#[derive(Debug)]
pub struct ResponseMessage {
    pub message: v4::Message,
    pub classification: Option<Classification>,
    pub network: Option<CompactString>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NoResponse {
    NoValidMac,
    NoMessageType,
    Discarded,
    NoServerSubnet,
    NoLeaseTime,
    PoolExhausted,
    PersistenceFailed,
    Released,
    Declined,
}

impl NoResponse {
    pub fn as_str(&self) -> &'static str {
        match self {
            NoResponse::NoValidMac => "NoValidMac",
            NoResponse::NoMessageType => "NoMessageType",
            NoResponse::Discarded => "Discarded",
            NoResponse::NoServerSubnet => "NoServerSubnet",
            NoResponse::NoLeaseTime => "NoLeaseTime",
            NoResponse::PoolExhausted => "PoolExhausted",
            NoResponse::PersistenceFailed => "PersistenceFailed",
            NoResponse::Released => "Released",
            NoResponse::Declined => "Declined",
        }
    }
}

/// Result of processing an incoming DHCPv4 message.
///
/// `DhcpV4Response` indicates whether the server should send a DHCPv4
/// message back to the client or intentionally remain silent.
#[derive(Debug)]
pub enum DhcpV4Response {
    Message(ResponseMessage),
    NoResponse(NoResponse),
}

/// 4.3 A DHCP server can receive the following messages from a client:
/// * DHCPDISCOVER
/// * DHCPREQUEST
/// * DHCPDECLINE
/// * DHCPRELEASE
/// * DHCPINFORM
///
/// `local_addr` is the address of the receiving interface. It selects the
/// network for clients on a directly attached link (giaddr of zero) and
/// defaults to the server identifier.
pub fn handle_message(
    config: &Config,
    store: &dyn DeviceStore,
    msg: &v4::Message,
    local_addr: Option<Ipv4Addr>,
    now: SystemTime,
) -> DhcpV4Response {
    // servers should only respond to BootRequest messages
    let message_type = match msg.opcode() {
        v4::Opcode::BootRequest => match msg.message_type() {
            Some(mt) => mt,
            None => return DhcpV4Response::NoResponse(NoResponse::NoMessageType),
        },
        // Servers don't receive BootReply
        v4::Opcode::BootReply => return DhcpV4Response::NoResponse(NoResponse::Discarded),
        v4::Opcode::Unknown(_) => return DhcpV4Response::NoResponse(NoResponse::Discarded),
    };

    let mac_addr = match MacAddr6::try_from(msg.chaddr()).ok() {
        Some(ma) => ma,
        None => return DhcpV4Response::NoResponse(NoResponse::NoValidMac),
    };

    let ctx = Transaction {
        config,
        store,
        msg,
        mac_addr,
        local_addr,
        now,
    };

    match message_type {
        v4::MessageType::Discover => handle_discover(&ctx),
        v4::MessageType::Request => handle_request(&ctx),
        v4::MessageType::Release => handle_release(&ctx),
        v4::MessageType::Decline => handle_decline(&ctx),
        // DHCPINFORM needs no address management and is not served here
        v4::MessageType::Inform => DhcpV4Response::NoResponse(NoResponse::Discarded),
        // Other messages are not valid for a server to receive
        _ => DhcpV4Response::NoResponse(NoResponse::Discarded),
    }
}

/// Per-message inputs shared by the handlers.
struct Transaction<'a> {
    config: &'a Config,
    store: &'a dyn DeviceStore,
    msg: &'a v4::Message,
    mac_addr: MacAddr6,
    local_addr: Option<Ipv4Addr>,
    now: SystemTime,
}

impl<'a> Transaction<'a> {
    /// Current classification according to the registry. Evaluated fresh for
    /// every message; nothing is remembered between DISCOVER and REQUEST.
    fn classify(&self) -> (Classification, Option<Device>) {
        match self.store.device(self.mac_addr) {
            Ok(Some(device)) => (device.classification(self.now), Some(device)),
            Ok(None) => {
                debug!("device not in registry");
                (Classification::Unregistered, None)
            }
            Err(e) => {
                let err = Error::ClassificationLookupFailed(e);
                warn!(%err, "treating client as unregistered");
                (Classification::Unregistered, None)
            }
        }
    }

    /// Relay address when relayed, otherwise the receiving interface address.
    fn selection_address(&self) -> Ipv4Addr {
        match self.msg.giaddr() {
            Ipv4Addr::UNSPECIFIED => self
                .local_addr
                .unwrap_or(self.config.global.server_id),
            giaddr => giaddr,
        }
    }

    fn network(&self) -> Option<&'a Network> {
        let addr = self.selection_address();
        let network = self.config.select_network_by_subnet(addr);
        match network {
            Some(network) => debug!(%addr, network = %network.name, "selected network"),
            None => warn!(%addr, "no configured subnet contains the relay or local address"),
        }
        network
    }

    fn is_relayed(&self) -> bool {
        self.msg.giaddr() != Ipv4Addr::UNSPECIFIED
    }
}

/// Client is discovering available DHCP servers, reply with DHCPOFFER message with
/// available parameters.
///
/// <https://datatracker.ietf.org/doc/html/rfc2131#section-4.3.1>
#[instrument(skip_all, fields(mac = %ctx.mac_addr, xid = %ctx.msg.xid(), class = field::Empty))]
fn handle_discover(ctx: &Transaction<'_>) -> DhcpV4Response {
    info!("DHCPDiscover");

    let (classification, _) = ctx.classify();
    Span::current().record("class", field::display(classification));

    let Some(network) = ctx.network() else {
        return DhcpV4Response::NoResponse(NoResponse::NoServerSubnet);
    };

    let class = network.class(classification);
    // A client already holding an address in this class is steered back to
    // the same pool before the declaration-order scan.
    let held = class
        .pools()
        .filter(|(_, pool)| pool.lease_for_client(ctx.mac_addr, ctx.now).is_some());

    for (subnet, pool) in held.chain(class.pools()) {
        let scope = ctx.config.scope(network, classification, subnet, pool);
        let Some(lease_time) = scope.lease_time(ctx.msg.lease_time()) else {
            continue;
        };
        let hold = scope.offer_hold(lease_time);

        match pool.offer(ctx.mac_addr, ctx.now, hold) {
            Ok(lease) => {
                info!(ip = %lease.ip, network = %network.name, lease_time, hold = hold.as_secs(), "sending DHCPOffer");
                let reply = build_reply(
                    ctx,
                    v4::MessageType::Offer,
                    lease.ip,
                    subnet,
                    &scope,
                    lease_time,
                );
                return DhcpV4Response::Message(ResponseMessage {
                    message: reply,
                    classification: Some(classification),
                    network: Some(network.name.clone()),
                });
            }
            Err(e) => debug!(start = %pool.start(), end = %pool.end(), %e, "pool cannot serve"),
        }
    }

    warn!(network = %network.name, err = %Error::PoolExhausted, "no address to offer");
    DhcpV4Response::NoResponse(NoResponse::PoolExhausted)
}

/// DHCPREQUEST - Client message to servers either (a) requesting offered parameters from one server
/// and implicitly declining offers from all others, (b) confirming correctness of previously allocated
/// address after, e.g., system reboot, or (c) extending the lease on a particular network address
///
/// <https://datatracker.ietf.org/doc/html/rfc2131#section-4.3.2>
#[instrument(skip_all, fields(mac = %ctx.mac_addr, xid = %ctx.msg.xid(), class = field::Empty))]
fn handle_request(ctx: &Transaction<'_>) -> DhcpV4Response {
    // Four variants of DHCPREQUEST
    //  * SELECTING
    //    server id is set from the client and matches
    //    ciaddr must be zero
    //    requested ip address option must be filled with the value received previously in the DHCPOFFER from the server
    //  * INIT/REBOOT
    //    no server id from client
    //    ciaddr must be zero
    //    requested ip address option must be filled
    //  * RENEW - client trying to extend its lease, sent unicast directly to server
    //    server id is not set
    //    ciaddr must be filled in
    //  * REBINDING - when client can not reach server unicast, it broadcasts.
    //    same prereqs as RENEW, but sent via the relay
    info!("DHCPRequest");
    let msg = ctx.msg;

    if let Some(server_id) = msg.server_id() {
        if server_id != &ctx.config.global.server_id {
            info!(%server_id, "server id did not match");
            return nak(ctx, Rejection::WrongServerId, None);
        }
    }

    let requested_ip = match (msg.server_id(), &msg.ciaddr(), msg.requested_ip_addr()) {
        (Some(_), &Ipv4Addr::UNSPECIFIED, Some(requested_ip)) => {
            debug!("variant: selecting");
            *requested_ip
        }
        (None, &Ipv4Addr::UNSPECIFIED, Some(requested_ip)) => {
            debug!("variant: init-reboot");
            *requested_ip
        }
        (None, ciaddr, None) if ciaddr != &Ipv4Addr::UNSPECIFIED => {
            if ctx.is_relayed() {
                debug!("variant: rebinding")
            } else {
                debug!("variant: renew")
            }
            *ciaddr
        }
        (_, ciaddr, requested_ip) => {
            let fallback = requested_ip
                .copied()
                .or_else(|| (ciaddr != &Ipv4Addr::UNSPECIFIED).then_some(*ciaddr));
            match fallback {
                Some(ip) => {
                    debug!(%ip, "unrecognized DHCPREQUEST variant");
                    ip
                }
                None => return nak(ctx, Rejection::NoRequestedAddress, None),
            }
        }
    };

    // The address fixes the network and the pool, which may belong to either
    // class. A unicast RENEW can arrive on any interface, so only a relayed
    // request is held to the network of its relay.
    let owner = ctx.config.networks.iter().find_map(|network| {
        network
            .pool_for_address(requested_ip)
            .map(|target| (network, target))
    });
    if ctx.is_relayed() {
        let Some(relay_network) = ctx.network() else {
            return DhcpV4Response::NoResponse(NoResponse::NoServerSubnet);
        };
        if owner.map_or(true, |(network, _)| network.name != relay_network.name) {
            info!(%requested_ip, network = %relay_network.name, "requested address is not in any pool of the relay's network");
            return nak(ctx, Rejection::UnknownAddress, None);
        }
    }
    let Some((network, target)) = owner else {
        info!(%requested_ip, "requested address is not in any pool");
        return nak(ctx, Rejection::UnknownAddress, None);
    };

    let (classification, device) = ctx.classify();
    Span::current().record("class", field::display(classification));
    if target.classification != classification {
        info!(%requested_ip, pool_class = %target.classification, "classification changed since the address was offered");
        return nak(ctx, Rejection::ClassificationChanged, Some(classification));
    }

    let scope = ctx.config.pool_scope(network, target);
    let Some(lease_time) = scope.lease_time(msg.lease_time()) else {
        warn!(%requested_ip, "no lease time resolvable");
        return DhcpV4Response::NoResponse(NoResponse::NoLeaseTime);
    };

    let lease = match target.pool.bind(
        requested_ip,
        ctx.mac_addr,
        ctx.now,
        Duration::from_secs(u64::from(lease_time)),
    ) {
        Ok(lease) => lease,
        Err(rejection) => {
            info!(%requested_ip, reason = rejection.as_str(), "cannot confirm lease");
            return nak(ctx, rejection, Some(classification));
        }
    };

    // One address per client and class: a new binding supersedes any other
    // lease or offer the client still holds.
    let superseded: usize = network
        .class(classification)
        .pools()
        .map(|(_, pool)| pool.release_others(ctx.mac_addr, lease.ip, ctx.now))
        .sum();
    if superseded > 0 {
        debug!(superseded, "released other leases held by client");
    }

    // The pool lock is already released here.
    if let Err(err) = persist(ctx, network, target, &lease, device) {
        warn!(ip = %lease.ip, %err, "lease bound in memory but not persisted");
        return DhcpV4Response::NoResponse(NoResponse::PersistenceFailed);
    }

    info!(ip = %lease.ip, network = %network.name, lease_time, "sending DHCPAck");
    let reply = build_reply(
        ctx,
        v4::MessageType::Ack,
        lease.ip,
        target.subnet,
        &scope,
        lease_time,
    );
    DhcpV4Response::Message(ResponseMessage {
        message: reply,
        classification: Some(classification),
        network: Some(network.name.clone()),
    })
}

/// DHCPRELEASE - the client gives up its lease. No reply is sent.
#[instrument(skip_all, fields(mac = %ctx.mac_addr, xid = %ctx.msg.xid()))]
fn handle_release(ctx: &Transaction<'_>) -> DhcpV4Response {
    let ip = ctx.msg.ciaddr();
    info!(%ip, "DHCPRelease");
    match owning_pool(ctx.config, ip) {
        Some(pool_ref) if pool_ref.pool.release(ip, ctx.mac_addr, ctx.now) => {
            info!(%ip, "lease released")
        }
        _ => debug!(%ip, "no lease held by client"),
    }
    DhcpV4Response::NoResponse(NoResponse::Released)
}

/// DHCPDECLINE - the client found the address already in use. The address is
/// parked so it is not handed out again right away. No reply is sent.
#[instrument(skip_all, fields(mac = %ctx.mac_addr, xid = %ctx.msg.xid()))]
fn handle_decline(ctx: &Transaction<'_>) -> DhcpV4Response {
    let Some(ip) = ctx.msg.requested_ip_addr().copied() else {
        debug!("DHCPDecline without requested address");
        return DhcpV4Response::NoResponse(NoResponse::Discarded);
    };
    match owning_pool(ctx.config, ip) {
        Some(pool_ref) if pool_ref.pool.decline(ip, ctx.mac_addr, ctx.now) => {
            warn!(%ip, "DHCPDecline, address in use by another host")
        }
        _ => debug!(%ip, "DHCPDecline for address not held by client"),
    }
    DhcpV4Response::NoResponse(NoResponse::Declined)
}

fn owning_pool(config: &Config, ip: Ipv4Addr) -> Option<PoolRef<'_>> {
    config
        .networks
        .iter()
        .find_map(|network| network.pool_for_address(ip))
}

/// Record the confirmed lease, then refresh the device if the registry knows it.
fn persist(
    ctx: &Transaction<'_>,
    network: &Network,
    target: PoolRef<'_>,
    lease: &Lease,
    device: Option<Device>,
) -> Result<()> {
    let record = LeaseRecord {
        ip: lease.ip,
        mac: ctx.mac_addr,
        network: network.name.clone(),
        classification: target.classification,
        start: unix_secs(lease.start),
        end: unix_secs(lease.end),
    };
    ctx.store
        .insert_lease(&record)
        .map_err(Error::PersistenceFailed)?;

    if let Some(mut device) = device {
        device.last_ip = Some(lease.ip);
        device.lease_expires = record.end;
        device.last_seen = unix_secs(ctx.now);
        ctx.store
            .upsert_device(&device)
            .map_err(Error::PersistenceFailed)?;
    }
    Ok(())
}

fn reply_header(ctx: &Transaction<'_>, ciaddr: Ipv4Addr, yiaddr: Ipv4Addr) -> v4::Message {
    let msg = ctx.msg;
    let mut reply = v4::Message::new_with_id(
        msg.xid(),
        ciaddr,
        yiaddr,
        Ipv4Addr::UNSPECIFIED,
        msg.giaddr(),
        msg.chaddr(),
    );
    reply.set_opcode(v4::Opcode::BootReply);
    reply.set_secs(0);
    reply.set_flags(msg.flags());
    reply
}

/// OFFER and ACK share one option set. Router, DNS servers and domain name
/// are optional and honour the client's parameter request list; the rest is
/// always sent.
fn build_reply(
    ctx: &Transaction<'_>,
    message_type: v4::MessageType,
    yiaddr: Ipv4Addr,
    subnet: &Subnet,
    scope: &Scope<'_>,
    lease_time: u32,
) -> v4::Message {
    // RFC 2131 Table 3: ciaddr is echoed in an ACK, zero in an OFFER
    let ciaddr = match message_type {
        v4::MessageType::Ack => ctx.msg.ciaddr(),
        _ => Ipv4Addr::UNSPECIFIED,
    };
    let mut reply = reply_header(ctx, ciaddr, yiaddr);

    let requested = ctx.msg.parameter_request_list();
    let wants = |code: OptionCode| requested.map_or(true, |codes| codes.contains(&code));

    let opts = reply.opts_mut();
    opts.insert(DhcpOption::MessageType(message_type));
    opts.insert(DhcpOption::ServerIdentifier(ctx.config.global.server_id));
    opts.insert(DhcpOption::SubnetMask(subnet.netmask()));
    if let Some(routers) = scope.routers().filter(|_| wants(OptionCode::Router)) {
        opts.insert(DhcpOption::Router(routers.to_vec()));
    }
    if let Some(dns) = scope
        .dns_servers()
        .filter(|_| wants(OptionCode::DomainNameServer))
    {
        opts.insert(DhcpOption::DomainNameServer(dns.to_vec()));
    }
    if let Some(domain) = scope.domain_name().filter(|_| wants(OptionCode::DomainName)) {
        opts.insert(DhcpOption::DomainName(domain.to_string()));
    }
    opts.insert(DhcpOption::AddressLeaseTime(lease_time));
    opts.insert(DhcpOption::Renewal(renewal_time(lease_time)));
    opts.insert(DhcpOption::Rebinding(rebinding_time(lease_time)));
    opts.insert(DhcpOption::End);
    reply
}

fn nak(
    ctx: &Transaction<'_>,
    rejection: Rejection,
    classification: Option<Classification>,
) -> DhcpV4Response {
    let err = Error::RequestValidationFailed(rejection);
    info!(reason = rejection.as_str(), %err, "sending DHCPNAK");

    // RFC 2131 Table 3: yiaddr in DHCPNAK MUST be 0
    let mut reply = reply_header(ctx, Ipv4Addr::UNSPECIFIED, Ipv4Addr::UNSPECIFIED);
    if ctx.is_relayed() {
        // NAK should set broadcast bit when relayed
        let flags = reply.flags();
        reply.set_flags(Flags::set_broadcast(flags));
    }
    let opts = reply.opts_mut();
    opts.insert(DhcpOption::MessageType(v4::MessageType::Nak));
    opts.insert(DhcpOption::ServerIdentifier(ctx.config.global.server_id));
    opts.insert(DhcpOption::End);

    DhcpV4Response::Message(ResponseMessage {
        message: reply,
        classification,
        network: None,
    })
}
