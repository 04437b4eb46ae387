//! Link handshake record.
//!
//! Sent exactly once by the connecting side, right after the transport
//! handshake, and read by the gateway with a single fixed-length receive.
//!
//! ```text
//! +---------------+--------------------------------+----------+
//! | legacy handle | self-reported IPv4 address     | port     |
//! | i32 LE        | 16 bytes, NUL-padded ASCII     | i32 LE   |
//! +---------------+--------------------------------+----------+
//! ```

use crate::error::ProtocolError;
use bytes::{Buf, BufMut, BytesMut};
use std::net::IpAddr;

/// Width of the address field, including the terminating NUL.
const ADDRESS_FIELD_SIZE: usize = 16;

/// Longest address string that fits the field.
pub const MAX_ADDRESS_LEN: usize = ADDRESS_FIELD_SIZE - 1;

/// Encoded size of a handshake record (4 + 16 + 4 = 24).
pub const HANDSHAKE_RECORD_SIZE: usize = 4 + ADDRESS_FIELD_SIZE + 4;

/// Self-description a link sends after connecting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRecord {
    /// Sender-local socket handle. Carried for layout compatibility only;
    /// receivers ignore it.
    pub legacy_handle: i32,
    /// Address the sender believes it connects from.
    pub address: String,
    /// Port the sender reports for itself.
    pub port: u16,
}

impl HandshakeRecord {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            legacy_handle: 0,
            address: address.into(),
            port,
        }
    }

    /// Parses the self-reported address, if it is a valid IP literal.
    pub fn ip(&self) -> Option<IpAddr> {
        self.address.parse().ok()
    }

    /// Encodes the record into its fixed-size wire form.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let address = self.address.as_bytes();
        if address.len() > MAX_ADDRESS_LEN {
            return Err(ProtocolError::AddressTooLong {
                len: address.len(),
                max: MAX_ADDRESS_LEN,
            });
        }

        let mut buf = BytesMut::with_capacity(HANDSHAKE_RECORD_SIZE);
        buf.put_i32_le(self.legacy_handle);
        buf.put_slice(address);
        buf.put_bytes(0, ADDRESS_FIELD_SIZE - address.len());
        buf.put_i32_le(i32::from(self.port));
        Ok(buf)
    }

    /// Decodes a record from exactly `HANDSHAKE_RECORD_SIZE` bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() != HANDSHAKE_RECORD_SIZE {
            return Err(ProtocolError::ShortRecord {
                expected: HANDSHAKE_RECORD_SIZE,
                actual: bytes.len(),
            });
        }

        let mut buf = bytes;
        let legacy_handle = buf.get_i32_le();

        let field = &buf[..ADDRESS_FIELD_SIZE];
        let end = field
            .iter()
            .position(|&b| b == 0)
            .ok_or(ProtocolError::UnterminatedAddress)?;
        let address = std::str::from_utf8(&field[..end])
            .map_err(|_| ProtocolError::InvalidUtf8)?
            .to_string();
        buf.advance(ADDRESS_FIELD_SIZE);

        let raw_port = buf.get_i32_le();
        let port = u16::try_from(raw_port).map_err(|_| ProtocolError::PortOutOfRange(raw_port))?;

        Ok(Self {
            legacy_handle,
            address,
            port,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let mut record = HandshakeRecord::new("10.0.0.7", 9000);
        record.legacy_handle = 5;
        let bytes = record.encode().unwrap();

        assert_eq!(bytes.len(), HANDSHAKE_RECORD_SIZE);
        assert_eq!(&bytes[0..4], &5i32.to_le_bytes());
        assert_eq!(&bytes[4..12], b"10.0.0.7");
        assert!(bytes[12..20].iter().all(|&b| b == 0));
        assert_eq!(&bytes[20..24], &9000i32.to_le_bytes());
    }

    #[test]
    fn test_decode_ignores_padding_after_nul() {
        let mut bytes = HandshakeRecord::new("127.0.0.1", 80).encode().unwrap();
        // Senders are not required to zero the tail of the field.
        bytes[4 + 10] = b'x';
        let record = HandshakeRecord::decode(&bytes).unwrap();
        assert_eq!(record.address, "127.0.0.1");
        assert_eq!(record.port, 80);
    }

    #[test]
    fn test_decode_short_record() {
        let err = HandshakeRecord::decode(&[0u8; 10]).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::ShortRecord {
                expected: 24,
                actual: 10
            }
        ));
    }

    #[test]
    fn test_decode_unterminated_address() {
        let mut bytes = [0u8; HANDSHAKE_RECORD_SIZE];
        bytes[4..20].copy_from_slice(&[b'1'; 16]);
        assert!(matches!(
            HandshakeRecord::decode(&bytes),
            Err(ProtocolError::UnterminatedAddress)
        ));
    }

    #[test]
    fn test_decode_port_out_of_range() {
        let mut bytes = HandshakeRecord::new("1.2.3.4", 1).encode().unwrap();
        bytes[20..24].copy_from_slice(&70000i32.to_le_bytes());
        assert!(matches!(
            HandshakeRecord::decode(&bytes),
            Err(ProtocolError::PortOutOfRange(70000))
        ));

        bytes[20..24].copy_from_slice(&(-1i32).to_le_bytes());
        assert!(matches!(
            HandshakeRecord::decode(&bytes),
            Err(ProtocolError::PortOutOfRange(-1))
        ));
    }

    #[test]
    fn test_encode_rejects_long_address() {
        let record = HandshakeRecord::new("255.255.255.255x", 1);
        assert!(matches!(
            record.encode(),
            Err(ProtocolError::AddressTooLong { len: 16, max: 15 })
        ));
    }

    #[test]
    fn test_ip_parse() {
        assert!(HandshakeRecord::new("192.168.1.10", 1).ip().is_some());
        assert!(HandshakeRecord::new("not-an-ip", 1).ip().is_none());
    }
}
