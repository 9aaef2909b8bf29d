use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

pub const SOCKS_VERSION: u8 = 0x05;

pub const IPV4_ADDRESS: u8 = 0x01;
pub const DOMAIN_NAME: u8 = 0x03;
pub const IPV6_ADDRESS: u8 = 0x04;

/// UDP 包头: RSV(2) + FRAG(1)
pub const UDP_HEADER_LEN: usize = 3;

/// 请求中的 CMD 字段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Bind,
    Associate,
    Other(u8),
}

impl Command {
    pub fn code(self) -> u8 {
        match self {
            Command::Connect => 0x01,
            Command::Bind => 0x02,
            Command::Associate => 0x03,
            Command::Other(code) => code,
        }
    }
}

impl From<u8> for Command {
    fn from(code: u8) -> Self {
        match code {
            0x01 => Command::Connect,
            0x02 => Command::Bind,
            0x03 => Command::Associate,
            other => Command::Other(other),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Connect => f.write_str("CONNECT"),
            Command::Bind => f.write_str("BIND"),
            Command::Associate => f.write_str("UDP ASSOCIATE"),
            Command::Other(code) => write!(f, "CMD({code:#04x})"),
        }
    }
}

/// 应答中的 REP 字段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reply {
    Succeeded = 0x00,
    ServerFailure = 0x01,
    RuleFailure = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TtlExpired = 0x06,
    CommandNotSupported = 0x07,
    AddrTypeNotSupported = 0x08,
}

/// 目标地址，域名或 IP 加端口。
///
/// 域名解析之后 `fqdn` 和 `ip` 会同时存在，拨号时优先用 IP。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddrSpec {
    pub fqdn: Option<String>,
    pub ip: Option<IpAddr>,
    pub port: u16,
}

impl AddrSpec {
    pub fn domain(name: impl Into<String>, port: u16) -> Self {
        Self {
            fqdn: Some(name.into()),
            ip: None,
            port,
        }
    }

    pub fn ip(ip: IpAddr, port: u16) -> Self {
        Self {
            fqdn: None,
            ip: Some(ip),
            port,
        }
    }

    /// 可以直接拿去拨号的 `host:port`
    pub fn address(&self) -> String {
        match (&self.ip, &self.fqdn) {
            (Some(ip), _) => SocketAddr::new(*ip, self.port).to_string(),
            (None, Some(fqdn)) => format!("{}:{}", fqdn, self.port),
            (None, None) => SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), self.port).to_string(),
        }
    }

    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.ip.map(|ip| SocketAddr::new(ip, self.port))
    }

    /// 按 ATYP | ADDR | PORT 写入，域名优先，其次 IPv4，最后 IPv6
    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        match (&self.fqdn, &self.ip) {
            (Some(fqdn), _) => {
                let len = u8::try_from(fqdn.len())
                    .map_err(|_| Error::AddressFormat(format!("域名过长: {}", fqdn.len())))?;
                buf.put_u8(DOMAIN_NAME);
                buf.put_u8(len);
                buf.put_slice(fqdn.as_bytes());
            }
            (None, Some(IpAddr::V4(ip))) => {
                buf.put_u8(IPV4_ADDRESS);
                buf.put_slice(&ip.octets());
            }
            (None, Some(IpAddr::V6(ip))) => match ip.to_ipv4_mapped() {
                Some(v4) => {
                    buf.put_u8(IPV4_ADDRESS);
                    buf.put_slice(&v4.octets());
                }
                None => {
                    buf.put_u8(IPV6_ADDRESS);
                    buf.put_slice(&ip.octets());
                }
            },
            (None, None) => return Err(Error::AddressFormat(format!("{:?}", self))),
        }
        buf.put_u16(self.port);
        Ok(())
    }
}

impl From<SocketAddr> for AddrSpec {
    fn from(addr: SocketAddr) -> Self {
        Self::ip(addr.ip(), addr.port())
    }
}

impl fmt::Display for AddrSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.fqdn, &self.ip) {
            (Some(fqdn), Some(ip)) => write!(f, "{} ({}):{}", fqdn, ip, self.port),
            (Some(fqdn), None) => write!(f, "{}:{}", fqdn, self.port),
            _ => f.write_str(&self.address()),
        }
    }
}

/// 从流中读取 ATYP | DST.ADDR | DST.PORT
pub async fn read_addr_spec<R: AsyncRead + Unpin>(reader: &mut R) -> Result<AddrSpec> {
    let address_type = reader.read_u8().await?;
    let mut spec = AddrSpec::default();

    match address_type {
        IPV4_ADDRESS => {
            let mut addr = [0u8; 4];
            reader.read_exact(&mut addr).await?;
            spec.ip = Some(IpAddr::V4(Ipv4Addr::from(addr)));
        }
        IPV6_ADDRESS => {
            let mut addr = [0u8; 16];
            reader.read_exact(&mut addr).await?;
            spec.ip = Some(IpAddr::V6(Ipv6Addr::from(addr)));
        }
        DOMAIN_NAME => {
            let len = reader.read_u8().await? as usize;
            let mut domain = vec![0u8; len];
            reader.read_exact(&mut domain).await?;
            spec.fqdn = Some(String::from_utf8(domain).map_err(|_| Error::InvalidDomain)?);
        }
        other => return Err(Error::UnrecognizedAddrType(other)),
    }

    spec.port = reader.read_u16().await?;
    Ok(spec)
}

/// 从内存中解析地址，同时返回消耗的字节数
pub fn decode_addr_spec(raw: &[u8]) -> Result<(AddrSpec, usize)> {
    let short = || Error::ShortUdpPacket(raw.len());
    let mut buf = raw;
    if !buf.has_remaining() {
        return Err(short());
    }

    let address_type = buf.get_u8();
    let addr_len = match address_type {
        IPV4_ADDRESS => 4,
        IPV6_ADDRESS => 16,
        DOMAIN_NAME => 1 + *buf.first().ok_or_else(short)? as usize,
        other => return Err(Error::UnrecognizedAddrType(other)),
    };
    if buf.remaining() < addr_len + 2 {
        return Err(short());
    }

    let mut spec = AddrSpec::default();
    match address_type {
        IPV4_ADDRESS => {
            let mut addr = [0u8; 4];
            buf.copy_to_slice(&mut addr);
            spec.ip = Some(IpAddr::V4(Ipv4Addr::from(addr)));
        }
        IPV6_ADDRESS => {
            let mut addr = [0u8; 16];
            buf.copy_to_slice(&mut addr);
            spec.ip = Some(IpAddr::V6(Ipv6Addr::from(addr)));
        }
        _ => {
            let len = buf.get_u8() as usize;
            let domain = std::str::from_utf8(&buf[..len]).map_err(|_| Error::InvalidDomain)?;
            spec.fqdn = Some(domain.to_owned());
            buf.advance(len);
        }
    }
    spec.port = buf.get_u16();

    Ok((spec, raw.len() - buf.remaining()))
}

/// 编码应答，`addr` 为空时填全零的 IPv4 地址
pub fn encode_reply(reply: Reply, addr: Option<&AddrSpec>) -> Result<BytesMut> {
    let mut msg = BytesMut::with_capacity(22);
    msg.put_u8(SOCKS_VERSION);
    msg.put_u8(reply as u8);
    msg.put_u8(0x00);
    match addr {
        Some(addr) => addr.encode(&mut msg)?,
        None => {
            msg.put_u8(IPV4_ADDRESS);
            msg.put_slice(&[0, 0, 0, 0]);
            msg.put_u16(0);
        }
    }
    Ok(msg)
}

pub async fn send_reply<W: AsyncWrite + Unpin>(
    writer: &mut W,
    reply: Reply,
    addr: Option<&AddrSpec>,
) -> Result<()> {
    let msg = encode_reply(reply, addr)?;
    writer.write_all(&msg).await?;
    Ok(())
}

/// 解析 RSV | FRAG | ATYP | DST.ADDR | DST.PORT，返回目标地址和数据前缀的长度
pub fn parse_udp_header(packet: &[u8]) -> Result<(AddrSpec, usize)> {
    if packet.len() <= UDP_HEADER_LEN {
        return Err(Error::ShortUdpPacket(packet.len()));
    }
    if packet[0] != 0x00 || packet[1] != 0x00 {
        return Err(Error::UdpReserved([packet[0], packet[1]]));
    }
    if packet[2] != 0x00 {
        return Err(Error::UdpFragment(packet[2]));
    }

    let (spec, addr_len) = decode_addr_spec(&packet[UDP_HEADER_LEN..])?;
    Ok((spec, UDP_HEADER_LEN + addr_len))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[tokio::test]
    async fn test_reply_address_round_trip() {
        let specs = [
            AddrSpec::ip("10.1.2.3".parse().unwrap(), 8080),
            AddrSpec::ip("2001:db8::1".parse().unwrap(), 443),
            AddrSpec::domain("example.com", 53),
        ];
        for spec in specs {
            let reply = encode_reply(Reply::Succeeded, Some(&spec)).unwrap();
            assert_eq!(&reply[..3], &[SOCKS_VERSION, 0x00, 0x00]);

            let mut cursor = Cursor::new(reply[3..].to_vec());
            assert_eq!(read_addr_spec(&mut cursor).await.unwrap(), spec);

            let (decoded, used) = decode_addr_spec(&reply[3..]).unwrap();
            assert_eq!(decoded, spec);
            assert_eq!(used, reply.len() - 3);
        }
    }

    #[test]
    fn test_nil_reply_is_zero_ipv4() {
        let reply = encode_reply(Reply::HostUnreachable, None).unwrap();
        assert_eq!(&reply[..], &[0x05, 0x04, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_mapped_ipv6_encodes_as_ipv4() {
        let spec = AddrSpec::ip("::ffff:127.0.0.1".parse().unwrap(), 1080);
        let reply = encode_reply(Reply::Succeeded, Some(&spec)).unwrap();
        assert_eq!(&reply[3..], &[0x01, 127, 0, 0, 1, 0x04, 0x38]);
    }

    #[test]
    fn test_empty_addr_cannot_be_encoded() {
        let spec = AddrSpec::default();
        assert!(matches!(
            encode_reply(Reply::Succeeded, Some(&spec)),
            Err(Error::AddressFormat(_))
        ));
    }

    #[tokio::test]
    async fn test_unrecognized_address_type() {
        let mut cursor = Cursor::new(vec![0x02, 1, 2, 3, 4, 0, 80]);
        assert!(matches!(
            read_addr_spec(&mut cursor).await,
            Err(Error::UnrecognizedAddrType(0x02))
        ));
    }

    #[tokio::test]
    async fn test_short_address_is_io_error() {
        let mut cursor = Cursor::new(vec![IPV4_ADDRESS, 127, 0]);
        assert!(matches!(read_addr_spec(&mut cursor).await, Err(Error::Io(_))));
    }

    #[test]
    fn test_command_codes() {
        for code in 0u8..=5 {
            assert_eq!(Command::from(code).code(), code);
        }
        assert_eq!(Command::from(0x03), Command::Associate);
        assert_eq!(Command::Other(0x09).to_string(), "CMD(0x09)");
    }

    #[test]
    fn test_udp_header() {
        let packet = [0, 0, 0, IPV4_ADDRESS, 8, 8, 8, 8, 0, 53, b'q', b'u', b'e', b'r', b'y'];
        let (spec, prefix) = parse_udp_header(&packet).unwrap();
        assert_eq!(spec, AddrSpec::ip("8.8.8.8".parse().unwrap(), 53));
        assert_eq!(prefix, 10);
        assert_eq!(&packet[prefix..], b"query");
    }

    #[test]
    fn test_udp_header_rejections() {
        let fragment = [0, 0, 1, IPV4_ADDRESS, 8, 8, 8, 8, 0, 53];
        assert!(matches!(parse_udp_header(&fragment), Err(Error::UdpFragment(1))));

        let reserved = [0, 1, 0, IPV4_ADDRESS, 8, 8, 8, 8, 0, 53];
        assert!(matches!(parse_udp_header(&reserved), Err(Error::UdpReserved([0, 1]))));

        assert!(matches!(parse_udp_header(&[0, 0, 0]), Err(Error::ShortUdpPacket(3))));

        let truncated_domain = [0, 0, 0, DOMAIN_NAME, 10, b'a', b'b', 0, 80];
        assert!(matches!(
            parse_udp_header(&truncated_domain),
            Err(Error::ShortUdpPacket(_))
        ));
    }

    #[test]
    fn test_addr_spec_display() {
        let mut spec = AddrSpec::domain("example.com", 80);
        assert_eq!(spec.to_string(), "example.com:80");
        assert_eq!(spec.address(), "example.com:80");

        spec.ip = Some("93.184.216.34".parse().unwrap());
        assert_eq!(spec.to_string(), "example.com (93.184.216.34):80");
        assert_eq!(spec.address(), "93.184.216.34:80");

        let v6 = AddrSpec::ip("::1".parse().unwrap(), 22);
        assert_eq!(v6.address(), "[::1]:22");
    }
}
