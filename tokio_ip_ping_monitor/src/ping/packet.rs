//! ICMP and ICMPv6 echo codec.
//!
//! Encodes outbound echo requests and decodes everything the listeners may
//! read back: echo replies and the routing errors that quote the original
//! probe (time exceeded, destination unreachable, packet too big).

use super::{DecodeError, Family};
use pnet::packet::icmp::echo_request::MutableEchoRequestPacket;
use pnet::packet::icmp::{IcmpPacket, IcmpTypes};
use pnet::packet::icmpv6::{Icmpv6Packet, Icmpv6Types, MutableIcmpv6Packet};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::ipv6::Ipv6Packet;
use pnet::packet::Packet;
use std::net::IpAddr;

/// Type, code, checksum, identifier and sequence number.
pub const ICMP_HEADER_SIZE: usize = 8;
pub const IPV4_HEADER_SIZE: usize = 20;
pub const IPV6_HEADER_SIZE: usize = 40;

/// Marker carried in every probe.
pub const PROBE_PAYLOAD: &[u8] = b"tokio_ip_ping_monitor: latency probe";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Echo {
    pub identifier: u16,
    pub sequence: u16,
    pub payload: Vec<u8>,
}

/// Identity of the probe quoted inside a routing error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmbeddedProbe {
    pub identifier: u16,
    pub sequence: u16,
    pub destination: IpAddr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    EchoReply(Echo),
    TimeExceeded(EmbeddedProbe),
    DestinationUnreachable(EmbeddedProbe),
    PacketTooBig(EmbeddedProbe),
    Other(u8),
}

impl Reply {
    pub fn identifier(&self) -> Option<u16> {
        match self {
            Self::EchoReply(echo) => Some(echo.identifier),
            Self::TimeExceeded(probe)
            | Self::DestinationUnreachable(probe)
            | Self::PacketTooBig(probe) => Some(probe.identifier),
            Self::Other(_) => None,
        }
    }
}

pub fn encode_echo_request(
    family: Family,
    identifier: u16,
    sequence: u16,
    payload: &[u8],
) -> Vec<u8> {
    let mut vec: Vec<u8> = vec![0; ICMP_HEADER_SIZE + payload.len()];
    match family {
        Family::V4 => {
            // The buffer is always at least the header size.
            if let Some(mut echo_packet) = MutableEchoRequestPacket::new(&mut vec[..]) {
                echo_packet.set_icmp_type(IcmpTypes::EchoRequest);
                echo_packet.set_identifier(identifier);
                echo_packet.set_sequence_number(sequence);
                echo_packet.set_payload(payload);
                let csum = pnet::util::checksum(echo_packet.packet(), 1);
                echo_packet.set_checksum(csum);
            }
        }
        Family::V6 => {
            let mut body = Vec::with_capacity(4 + payload.len());
            body.extend_from_slice(&identifier.to_be_bytes());
            body.extend_from_slice(&sequence.to_be_bytes());
            body.extend_from_slice(payload);
            // The kernel fills in the ICMPv6 checksum, it covers a pseudo header
            // we do not know the source of.
            if let Some(mut echo_packet) = MutableIcmpv6Packet::new(&mut vec[..]) {
                echo_packet.set_icmpv6_type(Icmpv6Types::EchoRequest);
                echo_packet.set_payload(&body);
            }
        }
    }
    vec
}

/// Read the echo header of an echo request or reply.
pub fn decode_echo(data: &[u8]) -> Result<Echo, DecodeError> {
    check_len("echo message", data, ICMP_HEADER_SIZE)?;
    Ok(Echo {
        identifier: u16::from_be_bytes([data[4], data[5]]),
        sequence: u16::from_be_bytes([data[6], data[7]]),
        payload: data[ICMP_HEADER_SIZE..].to_vec(),
    })
}

/// Decode an ICMP message starting at its ICMP header.
pub fn decode_message(family: Family, data: &[u8]) -> Result<Reply, DecodeError> {
    check_len("ICMP header", data, ICMP_HEADER_SIZE)?;
    match family {
        Family::V4 => {
            let packet = IcmpPacket::new(data).ok_or(DecodeError::Truncated {
                what: "ICMP header",
                needed: ICMP_HEADER_SIZE,
                actual: data.len(),
            })?;
            let ty = packet.get_icmp_type();
            if ty == IcmpTypes::EchoReply {
                Ok(Reply::EchoReply(decode_echo(data)?))
            } else if ty == IcmpTypes::TimeExceeded {
                Ok(Reply::TimeExceeded(embedded_ipv4(data)?))
            } else if ty == IcmpTypes::DestinationUnreachable {
                Ok(Reply::DestinationUnreachable(embedded_ipv4(data)?))
            } else {
                Ok(Reply::Other(ty.0))
            }
        }
        Family::V6 => {
            let packet = Icmpv6Packet::new(data).ok_or(DecodeError::Truncated {
                what: "ICMPv6 header",
                needed: ICMP_HEADER_SIZE,
                actual: data.len(),
            })?;
            let ty = packet.get_icmpv6_type();
            if ty == Icmpv6Types::EchoReply {
                Ok(Reply::EchoReply(decode_echo(data)?))
            } else if ty == Icmpv6Types::TimeExceeded {
                Ok(Reply::TimeExceeded(embedded_ipv6(data)?))
            } else if ty == Icmpv6Types::DestinationUnreachable {
                Ok(Reply::DestinationUnreachable(embedded_ipv6(data)?))
            } else if ty == Icmpv6Types::PacketTooBig {
                Ok(Reply::PacketTooBig(embedded_ipv6(data)?))
            } else {
                Ok(Reply::Other(ty.0))
            }
        }
    }
}

/// Skip the IPv4 header raw IPv4 sockets prepend to every datagram.
pub fn strip_ipv4_header(data: &[u8]) -> Result<&[u8], DecodeError> {
    let header_len = ipv4_header_len(data)?;
    Ok(&data[header_len..])
}

fn ipv4_header_len(data: &[u8]) -> Result<usize, DecodeError> {
    let ip = Ipv4Packet::new(data).ok_or(DecodeError::Truncated {
        what: "IPv4 header",
        needed: IPV4_HEADER_SIZE,
        actual: data.len(),
    })?;
    if ip.get_version() != 4 {
        return Err(DecodeError::BadVersion {
            expected: 4,
            actual: ip.get_version(),
        });
    }
    let header_len = ip.get_header_length() as usize * 4;
    if header_len < IPV4_HEADER_SIZE {
        return Err(DecodeError::BadHeaderLength(header_len));
    }
    check_len("IPv4 header", data, header_len)?;
    Ok(header_len)
}

fn embedded_ipv4(data: &[u8]) -> Result<EmbeddedProbe, DecodeError> {
    let quoted = &data[ICMP_HEADER_SIZE..];
    let header_len = ipv4_header_len(quoted)?;
    check_len("embedded ICMP header", quoted, header_len + ICMP_HEADER_SIZE)?;
    // Length checked above.
    let ip = Ipv4Packet::new(quoted).ok_or(DecodeError::BadHeaderLength(header_len))?;
    let protocol = ip.get_next_level_protocol();
    if protocol != IpNextHeaderProtocols::Icmp {
        return Err(DecodeError::UnexpectedProtocol(protocol.0));
    }
    let inner = &quoted[header_len..];
    if inner[0] != IcmpTypes::EchoRequest.0 {
        return Err(DecodeError::NotAnEchoRequest(inner[0]));
    }
    let echo = decode_echo(inner)?;
    Ok(EmbeddedProbe {
        identifier: echo.identifier,
        sequence: echo.sequence,
        destination: IpAddr::V4(ip.get_destination()),
    })
}

fn embedded_ipv6(data: &[u8]) -> Result<EmbeddedProbe, DecodeError> {
    let quoted = &data[ICMP_HEADER_SIZE..];
    check_len(
        "embedded IPv6 datagram",
        quoted,
        IPV6_HEADER_SIZE + ICMP_HEADER_SIZE,
    )?;
    let ip = Ipv6Packet::new(quoted).ok_or(DecodeError::Truncated {
        what: "embedded IPv6 header",
        needed: IPV6_HEADER_SIZE,
        actual: quoted.len(),
    })?;
    if ip.get_version() != 6 {
        return Err(DecodeError::BadVersion {
            expected: 6,
            actual: ip.get_version(),
        });
    }
    let next_header = ip.get_next_header();
    if next_header != IpNextHeaderProtocols::Icmpv6 {
        return Err(DecodeError::UnexpectedProtocol(next_header.0));
    }
    let inner = &quoted[IPV6_HEADER_SIZE..];
    if inner[0] != Icmpv6Types::EchoRequest.0 {
        return Err(DecodeError::NotAnEchoRequest(inner[0]));
    }
    let echo = decode_echo(inner)?;
    Ok(EmbeddedProbe {
        identifier: echo.identifier,
        sequence: echo.sequence,
        destination: IpAddr::V6(ip.get_destination()),
    })
}

fn check_len(what: &'static str, data: &[u8], needed: usize) -> Result<(), DecodeError> {
    if data.len() < needed {
        return Err(DecodeError::Truncated {
            what,
            needed,
            actual: data.len(),
        });
    }
    Ok(())
}

/// Decodes what one connection reads, keeping only this engine's traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decoder {
    pub family: Family,
    pub identifier: u16,
    /// Raw IPv4 sockets deliver the IP header along with the ICMP message.
    pub header_included: bool,
}

impl Decoder {
    pub fn new(family: Family, identifier: u16, header_included: bool) -> Self {
        Self {
            family,
            identifier,
            header_included,
        }
    }

    /// `Ok(None)` for unrelated messages and replies to someone else's probes.
    pub fn decode(&self, data: &[u8]) -> Result<Option<Reply>, DecodeError> {
        let data = if self.header_included {
            strip_ipv4_header(data)?
        } else {
            data
        };
        let reply = decode_message(self.family, data)?;
        match reply.identifier() {
            Some(identifier) if identifier == self.identifier => Ok(Some(reply)),
            _ => Ok(None),
        }
    }
}
