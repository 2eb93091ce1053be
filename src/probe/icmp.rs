use pnet::packet::MutablePacket;
use pnet::packet::icmp::echo_request::MutableEchoRequestPacket;
use pnet::packet::icmp::{IcmpCode, IcmpPacket, IcmpTypes, checksum};
use pnet::packet::ipv4::Ipv4Packet;

use crate::error::ProbeError;
use crate::state::IcmpResponseType;

/// ICMP header size (fixed)
pub const ICMP_HEADER_SIZE: usize = 8;
/// ICMP type number of an echo request
pub const ECHO_REQUEST_TYPE: u8 = 8;
/// Minimum effective payload size (the marker length)
pub const MIN_PAYLOAD_SIZE: usize = 56;

/// Payload marker carried by ping probes
pub const PING_MARKER: &[u8] = b"HELLO-R-U-THERE-KNOCK-KNOCK-QUACK-QUACK-QUACK-QUACK-BYE!";
/// Payload marker carried by trace probes
pub const TRACE_MARKER: &[u8] = b"HELLO-R-U-THERE-TTLTRACE-TTLTRACE-TTLTRACE-TTLTRACE-BYE!";

const PAD_BYTE: u8 = b'X';

/// Get process identifier for ICMP identification field
pub fn get_identifier() -> u16 {
    (std::process::id() & 0xffff) as u16
}

/// Ping payload: marker padded with filler up to `size` bytes.
///
/// Returns the payload and its effective size (never below the marker length).
pub fn ping_payload(size: usize) -> (Vec<u8>, usize) {
    let size = size.max(MIN_PAYLOAD_SIZE);
    let mut payload = PING_MARKER.to_vec();
    payload.resize(size, PAD_BYTE);
    (payload, size)
}

/// Build an ICMP Echo Request packet around `payload`
pub fn build_echo_request(
    identifier: u16,
    sequence: u16,
    payload: &[u8],
) -> Result<Vec<u8>, ProbeError> {
    let mut buffer = vec![0u8; ICMP_HEADER_SIZE + payload.len()];

    let mut packet = MutableEchoRequestPacket::new(&mut buffer)
        .ok_or_else(|| ProbeError::Marshal("buffer too small for echo request".into()))?;
    packet.set_icmp_type(IcmpTypes::EchoRequest);
    packet.set_icmp_code(IcmpCode::new(0));
    packet.set_identifier(identifier);
    packet.set_sequence_number(sequence);
    packet.payload_mut().copy_from_slice(payload);

    let cksum = IcmpPacket::new(&buffer)
        .map(|p| checksum(&p))
        .ok_or_else(|| ProbeError::Marshal("buffer too small for checksum".into()))?;
    buffer[2..4].copy_from_slice(&cksum.to_be_bytes());

    Ok(buffer)
}

/// Parsed view of a packet read from a raw IPv4 ICMP socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcmpReply {
    pub response: IcmpResponseType,
    /// TTL from the reply's IP header
    pub ip_ttl: u8,
}

/// Parse a raw-socket packet (IPv4 header followed by ICMP message)
pub fn parse_reply(data: &[u8]) -> Result<IcmpReply, ProbeError> {
    let ip_packet =
        Ipv4Packet::new(data).ok_or_else(|| ProbeError::Parse("short IPv4 header".into()))?;
    let ip_header_len = ip_packet.get_header_length() as usize * 4;
    if ip_header_len < 20 || data.len() < ip_header_len + ICMP_HEADER_SIZE {
        return Err(ProbeError::Parse(format!(
            "truncated ICMP message ({} bytes)",
            data.len()
        )));
    }

    let icmp = IcmpPacket::new(&data[ip_header_len..])
        .ok_or_else(|| ProbeError::Parse("short ICMP header".into()))?;

    Ok(IcmpReply {
        response: IcmpResponseType::from_type_code(
            icmp.get_icmp_type().0,
            icmp.get_icmp_code().0,
        ),
        ip_ttl: ip_packet.get_ttl(),
    })
}

/// Does the packet carry `marker` anywhere (echo payload or quoted datagram)?
pub fn contains_marker(data: &[u8], marker: &[u8]) -> bool {
    !marker.is_empty() && data.windows(marker.len()).any(|w| w == marker)
}
