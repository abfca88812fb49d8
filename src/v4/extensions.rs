use dhcproto::v4::{self, DhcpOption, OptionCode};
use std::net::Ipv4Addr;

/// Helpers for interacting with dhcproto::v4::Message
pub trait NacMessageExtV4 {
    fn message_type(&self) -> Option<&v4::MessageType>;
    fn server_id(&self) -> Option<&Ipv4Addr>;
    fn requested_ip_addr(&self) -> Option<&Ipv4Addr>;
    /// Lease time asked for by the client (option 51).
    fn lease_time(&self) -> Option<u32>;
    fn parameter_request_list(&self) -> Option<&[OptionCode]>;
}

impl NacMessageExtV4 for v4::Message {
    fn message_type(&self) -> Option<&v4::MessageType> {
        self.opts().iter().find_map(|o| match o.1 {
            DhcpOption::MessageType(mt) => Some(mt),
            _ => None,
        })
    }

    fn server_id(&self) -> Option<&Ipv4Addr> {
        self.opts().iter().find_map(|o| match o.1 {
            DhcpOption::ServerIdentifier(addr) => Some(addr),
            _ => None,
        })
    }

    fn requested_ip_addr(&self) -> Option<&Ipv4Addr> {
        self.opts().iter().find_map(|o| match o.1 {
            DhcpOption::RequestedIpAddress(addr) => Some(addr),
            _ => None,
        })
    }

    fn lease_time(&self) -> Option<u32> {
        self.opts().iter().find_map(|o| match o.1 {
            DhcpOption::AddressLeaseTime(secs) => Some(*secs),
            _ => None,
        })
    }

    fn parameter_request_list(&self) -> Option<&[OptionCode]> {
        self.opts().iter().find_map(|o| match o.1 {
            DhcpOption::ParameterRequestList(codes) => Some(codes.as_slice()),
            _ => None,
        })
    }
}
