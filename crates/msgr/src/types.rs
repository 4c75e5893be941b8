//! Entity naming and addressing

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut};

use crate::error::{MsgrError, Result};

/// Entity type constants
pub const ENTITY_TYPE_MON: u8 = 0x01;
pub const ENTITY_TYPE_MDS: u8 = 0x02;
pub const ENTITY_TYPE_OSD: u8 = 0x04;
pub const ENTITY_TYPE_CLIENT: u8 = 0x08;

/// Identity of a cluster daemon or client, e.g. "osd.3".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityName {
    pub entity_type: u8,
    pub num: i64,
}

impl EntityName {
    pub fn new(entity_type: u8, num: i64) -> Self {
        Self { entity_type, num }
    }

    pub fn osd(num: i64) -> Self {
        Self::new(ENTITY_TYPE_OSD, num)
    }

    pub fn client(num: i64) -> Self {
        Self::new(ENTITY_TYPE_CLIENT, num)
    }
}

impl fmt::Display for EntityName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.entity_type {
            ENTITY_TYPE_MON => "mon",
            ENTITY_TYPE_MDS => "mds",
            ENTITY_TYPE_OSD => "osd",
            ENTITY_TYPE_CLIENT => "client",
            _ => "unknown",
        };
        write!(f, "{}.{}", kind, self.num)
    }
}

/// A peer's transport address: socket address plus an instance nonce that
/// distinguishes successive incarnations of the same daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityAddr {
    pub addr: SocketAddr,
    pub nonce: u32,
}

const ADDR_TAG_V4: u8 = 4;
const ADDR_TAG_V6: u8 = 6;

impl EntityAddr {
    pub fn new(addr: SocketAddr, nonce: u32) -> Self {
        Self { addr, nonce }
    }

    /// Encode as: family tag u8, port u16, address octets, nonce u32.
    /// All integers little-endian.
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        match self.addr.ip() {
            IpAddr::V4(ip) => {
                buf.put_u8(ADDR_TAG_V4);
                buf.put_u16_le(self.addr.port());
                buf.put_slice(&ip.octets());
            }
            IpAddr::V6(ip) => {
                buf.put_u8(ADDR_TAG_V6);
                buf.put_u16_le(self.addr.port());
                buf.put_slice(&ip.octets());
            }
        }
        buf.put_u32_le(self.nonce);
    }

    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        if buf.remaining() < 3 {
            return Err(MsgrError::BadAddress("truncated address".into()));
        }
        let tag = buf.get_u8();
        let port = buf.get_u16_le();
        let ip = match tag {
            ADDR_TAG_V4 => {
                if buf.remaining() < 4 + 4 {
                    return Err(MsgrError::BadAddress("truncated v4 address".into()));
                }
                let mut octets = [0u8; 4];
                buf.copy_to_slice(&mut octets);
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            ADDR_TAG_V6 => {
                if buf.remaining() < 16 + 4 {
                    return Err(MsgrError::BadAddress("truncated v6 address".into()));
                }
                let mut octets = [0u8; 16];
                buf.copy_to_slice(&mut octets);
                IpAddr::V6(Ipv6Addr::from(octets))
            }
            t => return Err(MsgrError::BadAddress(format!("unknown family tag {}", t))),
        };
        let nonce = buf.get_u32_le();
        Ok(Self {
            addr: SocketAddr::new(ip, port),
            nonce,
        })
    }
}

impl fmt::Display for EntityAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.nonce)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn entity_name_display() {
        assert_eq!(EntityName::osd(3).to_string(), "osd.3");
        assert_eq!(EntityName::client(42).to_string(), "client.42");
    }

    #[test]
    fn addr_roundtrip_v4() {
        let addr = EntityAddr::new("10.0.0.7:6800".parse().unwrap(), 99);
        let mut buf = BytesMut::new();
        addr.encode(&mut buf);
        let decoded = EntityAddr::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, addr);
    }

    #[test]
    fn addr_roundtrip_v6() {
        let addr = EntityAddr::new("[::1]:6801".parse().unwrap(), 1);
        let mut buf = BytesMut::new();
        addr.encode(&mut buf);
        let decoded = EntityAddr::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, addr);
    }

    #[test]
    fn addr_decode_rejects_garbage() {
        let mut buf = bytes::Bytes::from_static(&[9, 0, 0, 0, 0]);
        assert!(EntityAddr::decode(&mut buf).is_err());
    }
}
