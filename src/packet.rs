//! Wire-format codec for IPv4, TCP and UDP headers.
//!
//! Every frame read from or written to the device is an IPv4 datagram
//! carrying either a TCP segment or a UDP datagram.  This module is
//! responsible for:
//! - Defining the on-wire binary layout of the three headers.
//! - Decoding raw byte slices into typed headers plus a payload slice,
//!   returning [`PacketError`] for truncated or inconsistent input.
//! - Encoding typed headers back into bytes (exact inverse of decoding).
//! - The Internet checksum (RFC 1071) and the TCP/UDP pseudo-header.
//!
//! No I/O happens here; this is pure data transformation.
//!
//! # Wire formats
//!
//! All multi-byte integers are **big-endian**.
//!
//! ```text
//!  IPv4 (20 bytes, no options)
//!  0               1               2               3
//! +-------+-------+---------------+-------------------------------+
//! |Version|  IHL  |   DSCP/ECN    |          Total Length         |
//! +-------+-------+---------------+-----+-------------------------+
//! |         Identification        |Flags|     Fragment Offset     |
//! +---------------+---------------+-----+-------------------------+
//! |      TTL      |   Protocol    |        Header Checksum        |
//! +---------------+---------------+-------------------------------+
//! |                        Source Address                         |
//! +---------------------------------------------------------------+
//! |                      Destination Address                      |
//! +---------------------------------------------------------------+
//!
//!  TCP (20 bytes, no options)
//! +-------------------------------+-------------------------------+
//! |          Source Port          |       Destination Port        |
//! +-------------------------------+-------------------------------+
//! |                        Sequence Number                        |
//! +---------------------------------------------------------------+
//! |                    Acknowledgment Number                      |
//! +-------+-------+---------------+-------------------------------+
//! | Offset| Rsvd  |     Flags     |            Window             |
//! +-------+-------+---------------+-------------------------------+
//! |           Checksum            |        Urgent Pointer         |
//! +-------------------------------+-------------------------------+
//!
//!  UDP (8 bytes)
//! +-------------------------------+-------------------------------+
//! |          Source Port          |       Destination Port        |
//! +-------------------------------+-------------------------------+
//! |            Length             |           Checksum            |
//! +-------------------------------+-------------------------------+
//! ```

use std::net::{Ipv4Addr, SocketAddrV4};

use thiserror::Error;

/// Bit-flag constants for the TCP `flags` byte.
pub mod flags {
    /// Finish: sender has no more data to send.
    pub const FIN: u8 = 0x01;
    /// Synchronise sequence numbers (handshake initiation).
    pub const SYN: u8 = 0x02;
    /// Reset the connection.
    pub const RST: u8 = 0x04;
    /// Push buffered data to the receiving application.
    pub const PSH: u8 = 0x08;
    /// Acknowledgement field is valid.
    pub const ACK: u8 = 0x10;
    /// Urgent pointer field is valid.
    pub const URG: u8 = 0x20;
}

/// IP protocol numbers carried in the IPv4 `protocol` field.
pub mod protocol {
    pub const TCP: u8 = 6;
    pub const UDP: u8 = 17;
}

/// Byte length of an IPv4 header without options.
pub const IPV4_HEADER_LEN: usize = 20;
/// Byte length of a TCP header without options.
pub const TCP_HEADER_LEN: usize = 20;
/// Byte length of a UDP header.
pub const UDP_HEADER_LEN: usize = 8;

/// "More fragments" bit of the IPv4 flags/fragment-offset field.
pub const IP_FLAG_MORE_FRAGMENTS: u16 = 0x2000;
/// "Don't fragment" bit of the IPv4 flags/fragment-offset field.
pub const IP_FLAG_DONT_FRAGMENT: u16 = 0x4000;
const IP_FRAGMENT_OFFSET_MASK: u16 = 0x1fff;

// Byte offsets within the IPv4 header.
const IP_OFF_VER_IHL: usize = 0;
const IP_OFF_DSCP_ECN: usize = 1;
const IP_OFF_TOTAL_LEN: usize = 2;
const IP_OFF_IDENT: usize = 4;
const IP_OFF_FLAGS_FRAG: usize = 6;
const IP_OFF_TTL: usize = 8;
const IP_OFF_PROTOCOL: usize = 9;
const IP_OFF_CHECKSUM: usize = 10;
const IP_OFF_SRC: usize = 12;
const IP_OFF_DST: usize = 16;

// Byte offsets within the TCP header.
const TCP_OFF_SRC_PORT: usize = 0;
const TCP_OFF_DST_PORT: usize = 2;
const TCP_OFF_SEQ: usize = 4;
const TCP_OFF_ACK: usize = 8;
const TCP_OFF_DATA_OFFSET: usize = 12;
const TCP_OFF_FLAGS: usize = 13;
const TCP_OFF_WINDOW: usize = 14;
const TCP_OFF_CHECKSUM: usize = 16;
const TCP_OFF_URGENT: usize = 18;

// Byte offsets within the UDP header.
const UDP_OFF_SRC_PORT: usize = 0;
const UDP_OFF_DST_PORT: usize = 2;
const UDP_OFF_LENGTH: usize = 4;
const UDP_OFF_CHECKSUM: usize = 6;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can arise when decoding a raw frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    /// Buffer shorter than the fixed header of the format.
    #[error("truncated header: need {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },
    /// Header-length / data-offset field below the five-word minimum.
    #[error("header length field {0} is below the minimum of 5 words")]
    BadHeaderLength(u8),
    /// Declared length disagrees with the bytes actually present.
    #[error("declared length {declared} does not fit the {available} available bytes")]
    LengthMismatch { declared: usize, available: usize },
    /// Checksum did not fold to zero.
    #[error("checksum verification failed")]
    ChecksumMismatch,
}

impl PacketError {
    /// `true` for every structural failure (the MalformedPacket class).
    pub fn is_malformed(&self) -> bool {
        !matches!(self, PacketError::ChecksumMismatch)
    }
}

// ---------------------------------------------------------------------------
// Checksum
// ---------------------------------------------------------------------------

/// Add `data` to a running ones'-complement sum of 16-bit big-endian words.
///
/// An odd trailing byte is padded with a zero byte on the right.
fn checksum_accumulate(mut sum: u64, data: &[u8]) -> u64 {
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum += u64::from(u16::from_be_bytes([word[0], word[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u64::from(*last) << 8;
    }
    sum
}

/// Fold the carries of `sum` back into 16 bits and complement.
fn checksum_finish(mut sum: u64) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Compute the Internet checksum (RFC 1071) over `data`.
///
/// To compute, run it with the checksum field zeroed and store the result.
/// To verify, run it over the bytes as received; a valid buffer yields `0`.
pub fn internet_checksum(data: &[u8]) -> u16 {
    checksum_finish(checksum_accumulate(0, data))
}

/// Internet checksum over the TCP/UDP pseudo-header followed by `segment`.
///
/// The pseudo-header is `src | dst | 0 | protocol | segment length` and is
/// never transmitted.
pub fn pseudo_header_checksum(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, segment: &[u8]) -> u16 {
    let mut pseudo = [0u8; 12];
    pseudo[0..4].copy_from_slice(&src.octets());
    pseudo[4..8].copy_from_slice(&dst.octets());
    pseudo[9] = protocol;
    pseudo[10..12].copy_from_slice(&(segment.len() as u16).to_be_bytes());

    let sum = checksum_accumulate(0, &pseudo);
    checksum_finish(checksum_accumulate(sum, segment))
}

fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([buf[off], buf[off + 1]])
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn read_addr(buf: &[u8], off: usize) -> Ipv4Addr {
    Ipv4Addr::new(buf[off], buf[off + 1], buf[off + 2], buf[off + 3])
}

// ---------------------------------------------------------------------------
// IPv4
// ---------------------------------------------------------------------------

/// IPv4 header fields in host byte order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Header {
    pub version: u8,
    /// Header length in 32-bit words (5 without options).
    pub header_len: u8,
    pub dscp_ecn: u8,
    /// Header plus payload, in bytes.
    pub total_len: u16,
    pub identification: u16,
    /// Flags (top 3 bits) and fragment offset (low 13 bits).
    pub flags_fragment: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: u16,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

impl Ipv4Header {
    /// Header for an unfragmented datagram carrying `payload_len` bytes.
    ///
    /// The checksum is left at zero; see [`Ipv4Header::fill_checksum`].
    pub fn new(
        src: Ipv4Addr,
        dst: Ipv4Addr,
        protocol: u8,
        payload_len: usize,
        identification: u16,
        ttl: u8,
    ) -> Self {
        Self {
            version: 4,
            header_len: 5,
            dscp_ecn: 0,
            total_len: (IPV4_HEADER_LEN + payload_len) as u16,
            identification,
            flags_fragment: IP_FLAG_DONT_FRAGMENT,
            ttl,
            protocol,
            checksum: 0,
            src,
            dst,
        }
    }

    /// Header length in bytes.
    pub fn header_bytes(&self) -> usize {
        usize::from(self.header_len) * 4
    }

    /// `true` when this datagram is one piece of a fragmented whole.
    pub fn is_fragment(&self) -> bool {
        self.flags_fragment & IP_FLAG_MORE_FRAGMENTS != 0
            || self.flags_fragment & IP_FRAGMENT_OFFSET_MASK != 0
    }

    /// Parse an IPv4 header and return it with the payload it declares.
    ///
    /// Options (header length above five words) are skipped.  Bytes beyond
    /// `total_len` (link-layer padding) are ignored.
    pub fn decode(buf: &[u8]) -> Result<(Self, &[u8]), PacketError> {
        if buf.len() < IPV4_HEADER_LEN {
            return Err(PacketError::Truncated {
                needed: IPV4_HEADER_LEN,
                got: buf.len(),
            });
        }

        let header = Self {
            version: buf[IP_OFF_VER_IHL] >> 4,
            header_len: buf[IP_OFF_VER_IHL] & 0x0f,
            dscp_ecn: buf[IP_OFF_DSCP_ECN],
            total_len: read_u16(buf, IP_OFF_TOTAL_LEN),
            identification: read_u16(buf, IP_OFF_IDENT),
            flags_fragment: read_u16(buf, IP_OFF_FLAGS_FRAG),
            ttl: buf[IP_OFF_TTL],
            protocol: buf[IP_OFF_PROTOCOL],
            checksum: read_u16(buf, IP_OFF_CHECKSUM),
            src: read_addr(buf, IP_OFF_SRC),
            dst: read_addr(buf, IP_OFF_DST),
        };

        if header.header_len < 5 {
            return Err(PacketError::BadHeaderLength(header.header_len));
        }
        let hlen = header.header_bytes();
        let total = usize::from(header.total_len);
        if hlen > buf.len() {
            return Err(PacketError::Truncated {
                needed: hlen,
                got: buf.len(),
            });
        }
        if total > buf.len() || total < hlen {
            return Err(PacketError::LengthMismatch {
                declared: total,
                available: buf.len(),
            });
        }

        Ok((header, &buf[hlen..total]))
    }

    /// Serialise the header followed by `payload`.
    ///
    /// Fields are written verbatim (including `total_len` and `checksum`);
    /// an options area implied by `header_len > 5` is zero-filled.
    pub fn encode(&self, payload: &[u8]) -> Vec<u8> {
        let hlen = self.header_bytes().max(IPV4_HEADER_LEN);
        let mut buf = vec![0u8; hlen + payload.len()];

        buf[IP_OFF_VER_IHL] = (self.version << 4) | (self.header_len & 0x0f);
        buf[IP_OFF_DSCP_ECN] = self.dscp_ecn;
        buf[IP_OFF_TOTAL_LEN..IP_OFF_TOTAL_LEN + 2].copy_from_slice(&self.total_len.to_be_bytes());
        buf[IP_OFF_IDENT..IP_OFF_IDENT + 2].copy_from_slice(&self.identification.to_be_bytes());
        buf[IP_OFF_FLAGS_FRAG..IP_OFF_FLAGS_FRAG + 2]
            .copy_from_slice(&self.flags_fragment.to_be_bytes());
        buf[IP_OFF_TTL] = self.ttl;
        buf[IP_OFF_PROTOCOL] = self.protocol;
        buf[IP_OFF_CHECKSUM..IP_OFF_CHECKSUM + 2].copy_from_slice(&self.checksum.to_be_bytes());
        buf[IP_OFF_SRC..IP_OFF_SRC + 4].copy_from_slice(&self.src.octets());
        buf[IP_OFF_DST..IP_OFF_DST + 4].copy_from_slice(&self.dst.octets());

        buf[hlen..].copy_from_slice(payload);
        buf
    }

    /// Recompute and store the header checksum.
    pub fn fill_checksum(&mut self) {
        self.checksum = 0;
        let bytes = self.encode(&[]);
        self.checksum = internet_checksum(&bytes[..self.header_bytes()]);
    }
}

/// `true` when the header bytes of `frame` fold to a zero checksum.
///
/// `frame` must already have passed [`Ipv4Header::decode`].
pub fn verify_ipv4_checksum(frame: &[u8]) -> bool {
    let hlen = usize::from(frame[IP_OFF_VER_IHL] & 0x0f) * 4;
    internet_checksum(&frame[..hlen]) == 0
}

// ---------------------------------------------------------------------------
// TCP
// ---------------------------------------------------------------------------

/// TCP header fields in host byte order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    /// Sequence number of the first payload byte (or of the SYN/FIN).
    pub seq: u32,
    /// Next sequence number expected from the peer (valid with ACK).
    pub ack: u32,
    /// Header length in 32-bit words (5 without options).
    pub data_offset: u8,
    /// Bitmask of [`flags`] constants.
    pub flags: u8,
    /// Advertised receive window in bytes.
    pub window: u16,
    pub checksum: u16,
    pub urgent_ptr: u16,
}

impl TcpHeader {
    /// An option-less header with zero checksum and urgent pointer.
    pub fn new(src_port: u16, dst_port: u16, seq: u32, ack: u32, flags: u8, window: u16) -> Self {
        Self {
            src_port,
            dst_port,
            seq,
            ack,
            data_offset: 5,
            flags,
            window,
            checksum: 0,
            urgent_ptr: 0,
        }
    }

    /// `true` when every bit of `mask` is set.
    pub fn has(&self, mask: u8) -> bool {
        self.flags & mask == mask
    }

    /// Header length in bytes.
    pub fn header_bytes(&self) -> usize {
        usize::from(self.data_offset) * 4
    }

    /// Parse a TCP header and return it with the segment payload.
    ///
    /// Options are skipped, never interpreted.
    pub fn decode(buf: &[u8]) -> Result<(Self, &[u8]), PacketError> {
        if buf.len() < TCP_HEADER_LEN {
            return Err(PacketError::Truncated {
                needed: TCP_HEADER_LEN,
                got: buf.len(),
            });
        }

        let header = Self {
            src_port: read_u16(buf, TCP_OFF_SRC_PORT),
            dst_port: read_u16(buf, TCP_OFF_DST_PORT),
            seq: read_u32(buf, TCP_OFF_SEQ),
            ack: read_u32(buf, TCP_OFF_ACK),
            data_offset: buf[TCP_OFF_DATA_OFFSET] >> 4,
            flags: buf[TCP_OFF_FLAGS],
            window: read_u16(buf, TCP_OFF_WINDOW),
            checksum: read_u16(buf, TCP_OFF_CHECKSUM),
            urgent_ptr: read_u16(buf, TCP_OFF_URGENT),
        };

        if header.data_offset < 5 {
            return Err(PacketError::BadHeaderLength(header.data_offset));
        }
        let hlen = header.header_bytes();
        if hlen > buf.len() {
            return Err(PacketError::LengthMismatch {
                declared: hlen,
                available: buf.len(),
            });
        }

        Ok((header, &buf[hlen..]))
    }

    /// Serialise the header followed by `payload`, fields verbatim.
    pub fn encode(&self, payload: &[u8]) -> Vec<u8> {
        let hlen = self.header_bytes().max(TCP_HEADER_LEN);
        let mut buf = vec![0u8; hlen + payload.len()];

        buf[TCP_OFF_SRC_PORT..TCP_OFF_SRC_PORT + 2].copy_from_slice(&self.src_port.to_be_bytes());
        buf[TCP_OFF_DST_PORT..TCP_OFF_DST_PORT + 2].copy_from_slice(&self.dst_port.to_be_bytes());
        buf[TCP_OFF_SEQ..TCP_OFF_SEQ + 4].copy_from_slice(&self.seq.to_be_bytes());
        buf[TCP_OFF_ACK..TCP_OFF_ACK + 4].copy_from_slice(&self.ack.to_be_bytes());
        buf[TCP_OFF_DATA_OFFSET] = self.data_offset << 4;
        buf[TCP_OFF_FLAGS] = self.flags;
        buf[TCP_OFF_WINDOW..TCP_OFF_WINDOW + 2].copy_from_slice(&self.window.to_be_bytes());
        buf[TCP_OFF_CHECKSUM..TCP_OFF_CHECKSUM + 2].copy_from_slice(&self.checksum.to_be_bytes());
        buf[TCP_OFF_URGENT..TCP_OFF_URGENT + 2].copy_from_slice(&self.urgent_ptr.to_be_bytes());

        buf[hlen..].copy_from_slice(payload);
        buf
    }

    /// Serialise with the checksum computed over the pseudo-header.
    pub fn encode_with_checksum(&self, src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8]) -> Vec<u8> {
        let mut buf = Self {
            checksum: 0,
            ..self.clone()
        }
        .encode(payload);
        let csum = pseudo_header_checksum(src, dst, protocol::TCP, &buf);
        buf[TCP_OFF_CHECKSUM..TCP_OFF_CHECKSUM + 2].copy_from_slice(&csum.to_be_bytes());
        buf
    }
}

/// A TCP header plus its payload, as produced by the connection layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpSegment {
    pub header: TcpHeader,
    pub payload: Vec<u8>,
}

impl TcpSegment {
    /// Sequence space consumed by this segment (SYN and FIN count as one).
    pub fn seq_len(&self) -> u32 {
        let mut len = self.payload.len() as u32;
        if self.header.has(flags::SYN) {
            len += 1;
        }
        if self.header.has(flags::FIN) {
            len += 1;
        }
        len
    }
}

// ---------------------------------------------------------------------------
// UDP
// ---------------------------------------------------------------------------

/// UDP header fields in host byte order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    /// Header plus payload, in bytes.
    pub length: u16,
    /// `0` means the sender did not compute a checksum.
    pub checksum: u16,
}

impl UdpHeader {
    /// Parse a UDP header and return it with the payload it declares.
    pub fn decode(buf: &[u8]) -> Result<(Self, &[u8]), PacketError> {
        if buf.len() < UDP_HEADER_LEN {
            return Err(PacketError::Truncated {
                needed: UDP_HEADER_LEN,
                got: buf.len(),
            });
        }

        let header = Self {
            src_port: read_u16(buf, UDP_OFF_SRC_PORT),
            dst_port: read_u16(buf, UDP_OFF_DST_PORT),
            length: read_u16(buf, UDP_OFF_LENGTH),
            checksum: read_u16(buf, UDP_OFF_CHECKSUM),
        };

        let len = usize::from(header.length);
        if len < UDP_HEADER_LEN || len > buf.len() {
            return Err(PacketError::LengthMismatch {
                declared: len,
                available: buf.len(),
            });
        }

        Ok((header, &buf[UDP_HEADER_LEN..len]))
    }

    /// Serialise the header followed by `payload`, fields verbatim.
    pub fn encode(&self, payload: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; UDP_HEADER_LEN + payload.len()];
        buf[UDP_OFF_SRC_PORT..UDP_OFF_SRC_PORT + 2].copy_from_slice(&self.src_port.to_be_bytes());
        buf[UDP_OFF_DST_PORT..UDP_OFF_DST_PORT + 2].copy_from_slice(&self.dst_port.to_be_bytes());
        buf[UDP_OFF_LENGTH..UDP_OFF_LENGTH + 2].copy_from_slice(&self.length.to_be_bytes());
        buf[UDP_OFF_CHECKSUM..UDP_OFF_CHECKSUM + 2].copy_from_slice(&self.checksum.to_be_bytes());
        buf[UDP_HEADER_LEN..].copy_from_slice(payload);
        buf
    }
}

// ---------------------------------------------------------------------------
// Frame builders
// ---------------------------------------------------------------------------

/// Build a complete IPv4 frame carrying a TCP segment, both checksums set.
pub fn build_tcp_frame(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    segment: &TcpSegment,
    identification: u16,
    ttl: u8,
) -> Vec<u8> {
    let tcp = segment.header.encode_with_checksum(src, dst, &segment.payload);
    let mut ip = Ipv4Header::new(src, dst, protocol::TCP, tcp.len(), identification, ttl);
    ip.fill_checksum();
    ip.encode(&tcp)
}

/// Build a complete IPv4 frame carrying a UDP datagram, both checksums set.
pub fn build_udp_frame(
    src: SocketAddrV4,
    dst: SocketAddrV4,
    payload: &[u8],
    identification: u16,
    ttl: u8,
) -> Vec<u8> {
    let header = UdpHeader {
        src_port: src.port(),
        dst_port: dst.port(),
        length: (UDP_HEADER_LEN + payload.len()) as u16,
        checksum: 0,
    };
    let mut udp = header.encode(payload);
    let mut csum = pseudo_header_checksum(*src.ip(), *dst.ip(), protocol::UDP, &udp);
    // A computed zero is sent as all ones; zero on the wire means "none".
    if csum == 0 {
        csum = 0xffff;
    }
    udp[UDP_OFF_CHECKSUM..UDP_OFF_CHECKSUM + 2].copy_from_slice(&csum.to_be_bytes());

    let mut ip = Ipv4Header::new(*src.ip(), *dst.ip(), protocol::UDP, udp.len(), identification, ttl);
    ip.fill_checksum();
    ip.encode(&udp)
}
