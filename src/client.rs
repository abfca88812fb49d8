use advmac::MacAddr6;
use dhcproto::{v4, Decodable, Encodable};

use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::time::Duration;

fn main() {
    let mut pargs = pico_args::Arguments::from_env();
    let server: SocketAddrV4 = pargs
        .opt_value_from_str("--server")
        .expect("parsing --server")
        .unwrap_or(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 67));
    let giaddr: Ipv4Addr = pargs
        .opt_value_from_str("--giaddr")
        .expect("parsing --giaddr")
        .unwrap_or(Ipv4Addr::UNSPECIFIED);
    let mac: MacAddr6 = pargs
        .opt_value_from_fn("--mac", |s| s.parse::<MacAddr6>().map_err(|e| format!("{e:?}")))
        .expect("parsing --mac")
        .unwrap_or(MacAddr6::new([0x12, 0x34, 0x56, 0x12, 0x34, 0x56]));

    let msg = dhcpv4_test_discover(mac, giaddr)
        .to_vec()
        .expect("encoding test msg");

    // The server answers a relay on port 67 and an unrelayed client by broadcast on 68
    let local = if giaddr.is_unspecified() {
        SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 68)
    } else {
        SocketAddrV4::new(giaddr, 67)
    };
    let socket = UdpSocket::bind(local).expect("couldn't bind to address");
    socket.set_broadcast(true).expect("enabling broadcast");
    socket
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("setting read timeout");
    socket.send_to(&msg, server).expect("couldn't send data");

    let mut recv_buf = vec![0u8; 1500];
    let recv_bytes = socket.recv(&mut recv_buf).expect("socket recv");
    println!("received {recv_bytes} bytes in response");

    let msg = v4::Message::from_bytes(&recv_buf[..recv_bytes]).expect("parsing response");
    println!("yiaddr: {}", msg.yiaddr());
    println!("msg: {msg:?}");
}

fn dhcpv4_test_discover(mac: MacAddr6, giaddr: Ipv4Addr) -> v4::Message {
    let mut msg = v4::Message::new(
        Ipv4Addr::UNSPECIFIED,
        Ipv4Addr::UNSPECIFIED,
        Ipv4Addr::UNSPECIFIED,
        giaddr,
        &mac.to_array(),
    );
    msg.set_opcode(v4::Opcode::BootRequest);
    let opts = msg.opts_mut();
    opts.insert(v4::DhcpOption::MessageType(v4::MessageType::Discover));
    opts.insert(v4::DhcpOption::ParameterRequestList(vec![
        v4::OptionCode::SubnetMask,
        v4::OptionCode::Router,
        v4::OptionCode::DomainNameServer,
        v4::OptionCode::DomainName,
    ]));
    msg
}
