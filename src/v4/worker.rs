use arc_swap::ArcSwap;
use dhcproto::{v4, Decodable, Encodable};
use std::{
    io,
    net::{Ipv4Addr, SocketAddrV4, UdpSocket},
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, SystemTime},
};
use tracing::{debug, error, info, trace, warn};

use crate::config::Config;
use crate::registry::DeviceStore;
use crate::v4::{
    extensions::NacMessageExtV4,
    handlers::{handle_message, DhcpV4Response, NoResponse},
};

pub const SERVER_PORT: u16 = 67;
pub const CLIENT_PORT: u16 = 68;

/// Where a reply goes, per RFC 2131 4.1: back to the relay when relayed, to a
/// configured client at ciaddr, otherwise broadcast on the local link.
pub fn reply_destination(request: &v4::Message, reply: &v4::Message) -> SocketAddrV4 {
    let is_nak = reply.message_type() == Some(&v4::MessageType::Nak);
    if request.giaddr() != Ipv4Addr::UNSPECIFIED {
        SocketAddrV4::new(request.giaddr(), SERVER_PORT)
    } else if request.ciaddr() != Ipv4Addr::UNSPECIFIED && !is_nak {
        SocketAddrV4::new(request.ciaddr(), CLIENT_PORT)
    } else {
        SocketAddrV4::new(Ipv4Addr::BROADCAST, CLIENT_PORT)
    }
}

/// Start `count` workers sharing one socket.
pub fn spawn_workers(
    socket: UdpSocket,
    count: usize,
    config: Arc<ArcSwap<Config>>,
    store: Arc<dyn DeviceStore>,
    local_addr: Option<Ipv4Addr>,
) -> io::Result<Vec<JoinHandle<()>>> {
    socket.set_broadcast(true)?;
    (0..count.max(1))
        .map(|n| {
            let socket = socket.try_clone()?;
            let config = Arc::clone(&config);
            let store = Arc::clone(&store);
            thread::Builder::new()
                .name(format!("v4worker-{n}"))
                .spawn(move || v4_worker(socket, config, store, local_addr))
        })
        .collect()
}

pub fn v4_worker(
    socket: UdpSocket,
    config: Arc<ArcSwap<Config>>,
    store: Arc<dyn DeviceStore>,
    local_addr: Option<Ipv4Addr>,
) {
    let mut read_buf = [0u8; 2048];
    let mut error_count: u32 = 0;
    const MAX_BACKOFF_MS: u64 = 1000;

    loop {
        let (amount, src) = match socket.recv_from(&mut read_buf) {
            Ok((amount, src)) => {
                error_count = 0;
                debug!("Received {amount} bytes from {src:?}");
                trace!("Data: {:x?}", &read_buf[..amount]);
                (amount, src)
            }
            Err(err) => {
                match err.kind() {
                    io::ErrorKind::ConnectionReset => {
                        info!("Sent response to host that responded with ICMP unreachable");
                    }
                    io::ErrorKind::Interrupted => {
                        debug!("recv_from interrupted, retrying");
                    }
                    _ => {
                        error!("Unexpected socket error: {err:?}");
                        // Apply exponential backoff to prevent CPU spin on persistent errors
                        error_count = error_count.saturating_add(1);
                        let backoff_ms = std::cmp::min(
                            10_u64.saturating_mul(2_u64.saturating_pow(error_count)),
                            MAX_BACKOFF_MS,
                        );
                        thread::sleep(Duration::from_millis(backoff_ms));
                    }
                }
                continue;
            }
        };

        let msg = match v4::Message::from_bytes(&read_buf[..amount]) {
            Ok(msg) => msg,
            Err(e) => {
                error!("Unable to parse dhcpv4 message from {src}: {e}");
                continue;
            }
        };

        let config = config.load();
        match handle_message(&config, store.as_ref(), &msg, local_addr, SystemTime::now()) {
            DhcpV4Response::NoResponse(reason @ NoResponse::PersistenceFailed) => {
                warn!(xid = msg.xid(), reason = reason.as_str(), "Not responding");
            }
            DhcpV4Response::NoResponse(reason) => {
                debug!(xid = msg.xid(), reason = reason.as_str(), "Not responding");
            }
            DhcpV4Response::Message(resp) => {
                let write_buf = match resp.message.to_vec() {
                    Ok(buf) => buf,
                    Err(e) => {
                        error!("Failed to encode DHCPv4 response: {e}");
                        continue;
                    }
                };
                let dst = reply_destination(&msg, &resp.message);
                match socket.send_to(&write_buf, dst) {
                    Ok(sent) => debug!(
                        network = resp.network.as_deref(),
                        class = resp.classification.map(|c| c.as_str()),
                        "responded to {dst} with {sent} bytes"
                    ),
                    Err(e) => error!("Problem sending response message to {dst}: {e}"),
                }
            }
        }
    }
}
