use std::net::IpAddr;

use pnet::packet::ethernet::{EtherTypes, EthernetPacket};
use pnet::packet::ip::{IpNextHeaderProtocol, IpNextHeaderProtocols};
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::ipv6::Ipv6Packet;
use pnet::packet::tcp::TcpPacket;
use pnet::packet::udp::UdpPacket;
use pnet::packet::vlan::VlanPacket;

use crate::flow::FlowKey;

const IPV4_MIN_HEADER: usize = 20;
const IPV6_HEADER: usize = 40;

/// What the flow table needs from one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketInfo {
    pub key: FlowKey,
    pub tcp_flags: u8,
}

/// Pull the flow key out of an Ethernet frame.
///
/// Returns `None` for non-IP frames and for anything too short to carry
/// the headers it claims; those are never tracked. Lengths are checked
/// against the captured bytes rather than trusting header fields.
pub fn extract(frame: &[u8]) -> Option<PacketInfo> {
    let ethernet = EthernetPacket::new(frame)?;
    let mut ethertype = ethernet.get_ethertype();
    let mut offset = EthernetPacket::minimum_packet_size();

    // Single 802.1Q tag
    if ethertype == EtherTypes::Vlan {
        let vlan = VlanPacket::new(&frame[offset..])?;
        ethertype = vlan.get_ethertype();
        offset += VlanPacket::minimum_packet_size();
    }

    let l3 = &frame[offset..];
    match ethertype {
        t if t == EtherTypes::Ipv4 => extract_ipv4(l3),
        t if t == EtherTypes::Ipv6 => extract_ipv6(l3),
        _ => None,
    }
}

fn extract_ipv4(l3: &[u8]) -> Option<PacketInfo> {
    let ip = Ipv4Packet::new(l3)?;
    let header_len = ip.get_header_length() as usize * 4;
    if header_len < IPV4_MIN_HEADER || header_len > l3.len() {
        return None;
    }

    let total_len = (ip.get_total_length() as usize).clamp(header_len, l3.len());
    let protocol = ip.get_next_level_protocol();

    // Later fragments carry no transport header
    let l4: &[u8] = if ip.get_fragment_offset() == 0 {
        &l3[header_len..total_len]
    } else {
        &[]
    };

    let (sport, dport, tcp_flags) = transport(protocol, l4);
    Some(PacketInfo {
        key: FlowKey {
            src: IpAddr::V4(ip.get_source()),
            dst: IpAddr::V4(ip.get_destination()),
            sport,
            dport,
            protocol: protocol.0,
        },
        tcp_flags,
    })
}

fn extract_ipv6(l3: &[u8]) -> Option<PacketInfo> {
    let ip = Ipv6Packet::new(l3)?;
    let payload_end = (IPV6_HEADER + ip.get_payload_length() as usize).min(l3.len());
    let protocol = ip.get_next_header();
    let (sport, dport, tcp_flags) = transport(protocol, &l3[IPV6_HEADER..payload_end]);

    Some(PacketInfo {
        key: FlowKey {
            src: IpAddr::V6(ip.get_source()),
            dst: IpAddr::V6(ip.get_destination()),
            sport,
            dport,
            protocol: protocol.0,
        },
        tcp_flags,
    })
}

/// Ports and TCP flags; zeros when the transport header is absent or short.
fn transport(protocol: IpNextHeaderProtocol, l4: &[u8]) -> (u16, u16, u8) {
    if protocol == IpNextHeaderProtocols::Tcp {
        if let Some(tcp) = TcpPacket::new(l4) {
            return (tcp.get_source(), tcp.get_destination(), tcp.get_flags() as u8);
        }
    } else if protocol == IpNextHeaderProtocols::Udp {
        if let Some(udp) = UdpPacket::new(l4) {
            return (udp.get_source(), udp.get_destination(), 0);
        }
    }
    (0, 0, 0)
}
