//! VRRP packet format and parsing.
//!
//! RFC 3768 Section 5.1 - VRRP Packet Format
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |Version| Type  | Virtual Rtr ID|   Priority    | Count IP Addrs|
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |   Auth Type   |   Adver Int   |          Checksum             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                         IP Address (1)                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                            .                                  |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                     Authentication Data (1)                   |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                     Authentication Data (2)                   |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use crate::types::{VRRP_PROTOCOL, VRRP_TTL, VRRP_VERSION};
use bytes::{BufMut, Bytes, BytesMut};
use std::net::Ipv4Addr;
use thiserror::Error;

/// VRRP packet type (always 1 = ADVERTISEMENT)
const VRRP_TYPE_ADVERTISEMENT: u8 = 1;

/// Fixed header in front of the address list
pub const VRRP_HEADER_LEN: usize = 8;

/// Trailing authentication data
pub const VRRP_AUTH_DATA_LEN: usize = 8;

/// No authentication
pub const AUTH_TYPE_NONE: u8 = 0;

/// Most addresses the one-byte count field can describe
pub const MAX_VIRTUAL_IPS: usize = u8::MAX as usize;

const IPV4_MIN_HEADER_LEN: usize = 20;

/// Reasons a received frame is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed advertisement ({len} bytes)")]
    MalformedLength { len: usize },

    #[error("unsupported version/type {0:#04x}")]
    UnsupportedVersion(u8),

    #[error("checksum mismatch (computed {computed:#06x}, carried {carried:#06x})")]
    ChecksumMismatch { computed: u16, carried: u16 },

    #[error("no instance for VRID {0}")]
    VridMismatch(u8),

    #[error("TTL {0} is not 255")]
    TtlViolation(u8),
}

/// Counter class a decode failure is accounted under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropClass {
    MalformedLength,
    ChecksumMismatch,
    VridMismatch,
    TtlViolation,
}

impl DecodeError {
    pub fn class(&self) -> DropClass {
        match self {
            DecodeError::MalformedLength { .. } | DecodeError::UnsupportedVersion(_) => {
                DropClass::MalformedLength
            }
            DecodeError::ChecksumMismatch { .. } => DropClass::ChecksumMismatch,
            DecodeError::VridMismatch(_) => DropClass::VridMismatch,
            DecodeError::TtlViolation(_) => DropClass::TtlViolation,
        }
    }
}

/// A VRRP advertisement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// Version (4 bits, always 2) and Type (4 bits, always 1)
    pub version_type: u8,

    /// Virtual Router ID (1-255)
    pub vrid: u8,

    /// Priority (1-255, 0 = master shutting down)
    pub priority: u8,

    /// Authentication type
    pub auth_type: u8,

    /// Advertisement interval in seconds
    pub advert_interval: u8,

    /// Ones' complement checksum over the whole advertisement
    pub checksum: u16,

    /// Virtual IP addresses
    pub virtual_ips: Vec<Ipv4Addr>,

    /// Authentication data (zero when auth type is none)
    pub auth_data: [u8; VRRP_AUTH_DATA_LEN],
}

impl Advertisement {
    /// Create a new advertisement with its checksum filled in.
    ///
    /// Addresses past [`MAX_VIRTUAL_IPS`] are dropped.
    pub fn new(vrid: u8, priority: u8, advert_interval: u8, mut ips: Vec<Ipv4Addr>) -> Self {
        ips.truncate(MAX_VIRTUAL_IPS);
        let mut advert = Self {
            version_type: (VRRP_VERSION << 4) | VRRP_TYPE_ADVERTISEMENT,
            vrid,
            priority,
            auth_type: AUTH_TYPE_NONE,
            advert_interval,
            checksum: 0,
            virtual_ips: ips,
            auth_data: [0; VRRP_AUTH_DATA_LEN],
        };
        advert.checksum = advert.compute_checksum();
        advert
    }

    /// Number of bytes `encode` produces
    pub fn encoded_len(&self) -> usize {
        VRRP_HEADER_LEN + self.wire_ips().len() * 4 + VRRP_AUTH_DATA_LEN
    }

    /// Addresses that fit the count field
    fn wire_ips(&self) -> &[Ipv4Addr] {
        &self.virtual_ips[..self.virtual_ips.len().min(MAX_VIRTUAL_IPS)]
    }

    /// Serialize to wire format, carrying the checksum field as stored
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.write(&mut buf, self.checksum);
        buf.freeze()
    }

    fn write(&self, buf: &mut BytesMut, checksum: u16) {
        buf.put_u8(self.version_type);
        buf.put_u8(self.vrid);
        buf.put_u8(self.priority);
        let ips = self.wire_ips();
        buf.put_u8(ips.len() as u8);
        buf.put_u8(self.auth_type);
        buf.put_u8(self.advert_interval);
        buf.put_u16(checksum);
        for ip in ips {
            buf.put_slice(&ip.octets());
        }
        buf.put_slice(&self.auth_data);
    }

    /// Checksum of this advertisement with the checksum field zeroed
    pub fn compute_checksum(&self) -> u16 {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.write(&mut buf, 0);
        checksum(&buf)
    }

    /// Parse an advertisement (the IPv4 payload).
    ///
    /// Checks length first, then the checksum, then version and type.
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < VRRP_HEADER_LEN {
            return Err(DecodeError::MalformedLength { len: data.len() });
        }

        let count_ip = data[3] as usize;
        if data.len() != VRRP_HEADER_LEN + count_ip * 4 + VRRP_AUTH_DATA_LEN {
            return Err(DecodeError::MalformedLength { len: data.len() });
        }

        let carried = u16::from_be_bytes([data[6], data[7]]);
        if checksum(data) != 0 {
            let mut zeroed = data.to_vec();
            zeroed[6] = 0;
            zeroed[7] = 0;
            return Err(DecodeError::ChecksumMismatch {
                computed: checksum(&zeroed),
                carried,
            });
        }

        let version_type = data[0];
        if version_type >> 4 != VRRP_VERSION || version_type & 0x0F != VRRP_TYPE_ADVERTISEMENT {
            return Err(DecodeError::UnsupportedVersion(version_type));
        }

        let virtual_ips = data[VRRP_HEADER_LEN..VRRP_HEADER_LEN + count_ip * 4]
            .chunks_exact(4)
            .map(|octets| Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]))
            .collect();

        let mut auth_data = [0u8; VRRP_AUTH_DATA_LEN];
        auth_data.copy_from_slice(&data[data.len() - VRRP_AUTH_DATA_LEN..]);

        Ok(Self {
            version_type,
            vrid: data[1],
            priority: data[2],
            auth_type: data[4],
            advert_interval: data[5],
            checksum: carried,
            virtual_ips,
            auth_data,
        })
    }
}

/// An advertisement together with the IPv4 header fields the ingress policy needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressFrame {
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    pub ttl: u8,
    pub advertisement: Advertisement,
}

impl IngressFrame {
    /// Parse a captured IPv4 datagram carrying an advertisement.
    ///
    /// Performs the length and checksum checks; VRID and TTL are checked
    /// separately once the target instance is known.
    pub fn parse(datagram: &[u8]) -> Result<Self, DecodeError> {
        if datagram.len() < IPV4_MIN_HEADER_LEN || datagram[0] >> 4 != 4 {
            return Err(DecodeError::MalformedLength { len: datagram.len() });
        }

        let header_len = usize::from(datagram[0] & 0x0F) * 4;
        let total_len = usize::from(u16::from_be_bytes([datagram[2], datagram[3]]));
        if header_len < IPV4_MIN_HEADER_LEN
            || total_len < header_len
            || total_len > datagram.len()
            || datagram[9] != VRRP_PROTOCOL
        {
            return Err(DecodeError::MalformedLength { len: datagram.len() });
        }

        let advertisement = Advertisement::decode(&datagram[header_len..total_len])?;

        Ok(Self {
            source: Ipv4Addr::new(datagram[12], datagram[13], datagram[14], datagram[15]),
            destination: Ipv4Addr::new(datagram[16], datagram[17], datagram[18], datagram[19]),
            ttl: datagram[8],
            advertisement,
        })
    }

    pub fn vrid(&self) -> u8 {
        self.advertisement.vrid
    }

    /// Reject frames that did not originate on the local link
    pub fn check_ttl(&self) -> Result<(), DecodeError> {
        if self.ttl != VRRP_TTL {
            return Err(DecodeError::TtlViolation(self.ttl));
        }
        Ok(())
    }
}

/// RFC 1071 ones' complement checksum.
///
/// Over data that already carries a correct checksum this yields zero.
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;

    let mut words = data.chunks_exact(2);
    for word in &mut words {
        sum += u32::from(u16::from_be_bytes([word[0], word[1]]));
    }
    if let [last] = words.remainder() {
        sum += u32::from(u16::from_be_bytes([*last, 0]));
    }

    // Fold 32-bit sum to 16 bits
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !sum as u16
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Wrap an advertisement in a minimal IPv4 header
    pub(crate) fn ipv4_datagram(source: Ipv4Addr, ttl: u8, payload: &[u8]) -> Vec<u8> {
        let total_len = (IPV4_MIN_HEADER_LEN + payload.len()) as u16;
        let mut datagram = vec![0x45, 0, 0, 0, 0, 0, 0, 0, ttl, VRRP_PROTOCOL, 0, 0];
        datagram[2..4].copy_from_slice(&total_len.to_be_bytes());
        datagram.extend_from_slice(&source.octets());
        datagram.extend_from_slice(&[224, 0, 0, 18]);
        datagram.extend_from_slice(payload);
        datagram
    }

    fn sample() -> Advertisement {
        Advertisement::new(
            1,
            100,
            1,
            vec!["192.168.1.1".parse().unwrap(), "192.168.1.2".parse().unwrap()],
        )
    }

    #[test]
    fn test_packet_serialize_parse() {
        let packet = sample();
        let bytes = packet.encode();
        assert_eq!(bytes.len(), 8 + 2 * 4 + 8);
        assert_eq!(bytes[0], 0x21);

        let parsed = Advertisement::decode(&bytes).unwrap();
        assert_eq!(parsed, packet);
        assert_eq!(parsed.encode(), bytes);
    }

    #[test]
    fn test_address_count_fits_count_field() {
        let ips: Vec<Ipv4Addr> = (0..300u32).map(|n| Ipv4Addr::from(0x0a00_0000 + n)).collect();
        let packet = Advertisement::new(1, 100, 1, ips);
        assert_eq!(packet.virtual_ips.len(), MAX_VIRTUAL_IPS);

        let bytes = packet.encode();
        assert_eq!(bytes[3], 255);
        assert_eq!(Advertisement::decode(&bytes).unwrap(), packet);

        // A list grown past the limit after construction still encodes consistently
        let mut grown = packet.clone();
        grown.virtual_ips.push("10.9.9.9".parse().unwrap());
        assert_eq!(grown.encode(), bytes);
    }

    #[test]
    fn test_checksum_over_advertisement() {
        let packet = sample();
        assert_ne!(packet.checksum, 0);
        assert_eq!(checksum(&packet.encode()), 0);
    }

    #[test]
    fn test_corrupted_byte_rejected() {
        let bytes = sample().encode();

        for offset in 0..bytes.len() {
            let mut corrupted = bytes.to_vec();
            corrupted[offset] ^= 0x01;
            // Flipping the address count changes the expected length instead
            let err = Advertisement::decode(&corrupted).unwrap_err();
            if offset == 3 {
                assert!(matches!(err, DecodeError::MalformedLength { .. }));
            } else {
                assert!(
                    matches!(err, DecodeError::ChecksumMismatch { .. }),
                    "offset {} gave {:?}",
                    offset,
                    err
                );
            }
        }
    }

    #[test]
    fn test_malformed_length() {
        assert_eq!(
            Advertisement::decode(&[0x21, 1, 100]),
            Err(DecodeError::MalformedLength { len: 3 })
        );

        let mut truncated = sample().encode().to_vec();
        truncated.pop();
        assert!(matches!(
            Advertisement::decode(&truncated),
            Err(DecodeError::MalformedLength { .. })
        ));
    }

    #[test]
    fn test_wrong_version() {
        let mut packet = sample();
        packet.version_type = 0x31;
        packet.checksum = packet.compute_checksum();

        assert_eq!(
            Advertisement::decode(&packet.encode()),
            Err(DecodeError::UnsupportedVersion(0x31))
        );
        assert_eq!(DecodeError::UnsupportedVersion(0x31).class(), DropClass::MalformedLength);
    }

    #[test]
    fn test_ingress_frame() {
        let source: Ipv4Addr = "10.0.0.2".parse().unwrap();
        let datagram = ipv4_datagram(source, 255, &sample().encode());

        let frame = IngressFrame::parse(&datagram).unwrap();
        assert_eq!(frame.source, source);
        assert_eq!(frame.destination, crate::types::VRRP_MULTICAST_ADDR_V4);
        assert_eq!(frame.vrid(), 1);
        assert!(frame.check_ttl().is_ok());
    }

    #[test]
    fn test_ingress_ttl_violation() {
        let datagram = ipv4_datagram("10.0.0.2".parse().unwrap(), 64, &sample().encode());

        let frame = IngressFrame::parse(&datagram).unwrap();
        assert_eq!(frame.check_ttl(), Err(DecodeError::TtlViolation(64)));
    }

    #[test]
    fn test_ingress_truncated_header() {
        assert!(matches!(
            IngressFrame::parse(&[0x45, 0, 0]),
            Err(DecodeError::MalformedLength { .. })
        ));
    }
}
