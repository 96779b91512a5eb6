//! DNS Stub Responder
//!
//! Answers DNS queries captured on the virtual interface without
//! resolving anything. The query is echoed back with the response flag
//! bits set so that a client blocked on a reply is released; no answer
//! records are produced.
//!
//! # Classification
//!
//! ```text
//! 0                  20        22        24        28
//! ├── IPv4 header ───┼─ sport ─┼─ dport ─┼─ len/ck ─┤
//!                              └── == 53 → DNS query
//! ```
//!
//! Only fixed offsets are inspected, so IPv4 options or IPv6 headers are
//! not understood. Anything shorter than a bare IPv4+UDP header is never
//! treated as DNS.

/// DNS well-known port
pub const DNS_PORT: u16 = 53;

/// Smallest packet holding a 20-byte IPv4 header and an 8-byte UDP header
pub const MIN_DNS_PACKET_LEN: usize = 28;

/// Offset of the transport destination port (IPv4 without options)
const DEST_PORT_OFFSET: usize = 22;

/// Bytes of the flags field marked on the response
const FLAG_OFFSETS: [usize; 2] = [2, 3];

/// Response ("QR") bit and recursion bit pattern applied to each flag byte
const RESPONSE_FLAGS: u8 = 0x80;

/// Check whether a captured packet is a DNS query
///
/// Tolerates arbitrary input: short or malformed packets return `false`.
pub fn is_dns_query(packet: &[u8]) -> bool {
    if packet.len() < MIN_DNS_PACKET_LEN {
        return false;
    }

    packet
        .get(DEST_PORT_OFFSET..DEST_PORT_OFFSET + 2)
        .map(|port| u16::from_be_bytes([port[0], port[1]]) == DNS_PORT)
        .unwrap_or(false)
}

/// Build a stub reply for a DNS query
///
/// Copies the packet verbatim and sets `0x80` on bytes 2 and 3. The
/// length never changes.
pub fn synthesize_response(packet: &[u8]) -> Vec<u8> {
    let mut response = packet.to_vec();

    if response.len() > FLAG_OFFSETS[1] {
        for offset in FLAG_OFFSETS {
            response[offset] |= RESPONSE_FLAGS;
        }
    }

    response
}
