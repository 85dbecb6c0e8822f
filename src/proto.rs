//! Byte-exact (de)serialization of the SOCKS5 wire messages.
//!
//! Every message owns a pure `decode(&[u8])`/`encode()` pair that is
//! deterministic and round-trip stable; the `read_from` constructors only
//! take care of framing the message off an async stream and then hand the
//! collected bytes to the pure decoder, so there is a single parsing path.

use crate::read_exact;
use crate::util::target_addr::TargetAddr;
use crate::{consts, ReplyError, Result, SocksError};
use anyhow::Context;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};
use tokio::io::{AsyncRead, AsyncReadExt};

/// A version identifier/method selection message:
///
/// ```text
/// +----+----------+----------+
/// |VER | NMETHODS | METHODS  |
/// +----+----------+----------+
/// | 1  |    1     | 1 to 255 |
/// +----+----------+----------+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodSelectionRequest {
    pub version: u8,
    pub methods: Vec<u8>,
}

impl MethodSelectionRequest {
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 2 {
            return Err(SocksError::MalformedMessage("method selection too short"));
        }
        let nmethods = buf[1] as usize;
        if buf.len() < 2 + nmethods {
            return Err(SocksError::MalformedMessage("methods truncated"));
        }
        Ok(MethodSelectionRequest {
            version: buf[0],
            methods: buf[2..2 + nmethods].to_vec(),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![self.version, self.methods.len() as u8];
        buf.extend_from_slice(&self.methods);
        buf
    }

    pub async fn read_from<T: AsyncRead + Unpin>(stream: &mut T) -> Result<Self> {
        let header = read_exact!(stream, [0u8; 2]).context("Can't read methods")?;
        let methods =
            read_exact!(stream, vec![0u8; header[1] as usize]).context("Can't get methods.")?;

        let mut buf = header.to_vec();
        buf.extend_from_slice(&methods);
        Self::decode(&buf)
    }
}

/// The method selection reply: `VER METHOD`, where `METHOD == 0xff`
/// denotes that no acceptable method was offered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodSelectionReply {
    pub version: u8,
    pub method: u8,
}

impl MethodSelectionReply {
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 2 {
            return Err(SocksError::MalformedMessage("method reply too short"));
        }
        Ok(MethodSelectionReply {
            version: buf[0],
            method: buf[1],
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        vec![self.version, self.method]
    }
}

/// RFC 1929 username/password sub-negotiation request:
///
/// ```text
/// +----+------+----------+------+----------+
/// |VER | ULEN |  UNAME   | PLEN |  PASSWD  |
/// +----+------+----------+------+----------+
/// | 1  |  1   | 1 to 255 |  1   | 1 to 255 |
/// +----+------+----------+------+----------+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserPassRequest {
    pub version: u8,
    pub username: String,
    pub password: String,
}

impl UserPassRequest {
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 2 {
            return Err(SocksError::MalformedMessage("auth request too short"));
        }
        let version = buf[0];
        let ulen = buf[1] as usize;
        if buf.len() < 2 + ulen + 1 {
            return Err(SocksError::MalformedMessage("username truncated"));
        }
        let username = buf[2..2 + ulen].to_vec();
        let plen = buf[2 + ulen] as usize;
        if buf.len() < 2 + ulen + 1 + plen {
            return Err(SocksError::MalformedMessage("password truncated"));
        }
        let password = buf[2 + ulen + 1..2 + ulen + 1 + plen].to_vec();

        Ok(UserPassRequest {
            version,
            username: String::from_utf8(username)
                .map_err(|_| SocksError::MalformedMessage("username is not valid utf-8"))?,
            password: String::from_utf8(password)
                .map_err(|_| SocksError::MalformedMessage("password is not valid utf-8"))?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![self.version, self.username.len() as u8];
        buf.extend_from_slice(self.username.as_bytes());
        buf.push(self.password.len() as u8);
        buf.extend_from_slice(self.password.as_bytes());
        buf
    }

    pub async fn read_from<T: AsyncRead + Unpin>(stream: &mut T) -> Result<Self> {
        let [version, ulen] = read_exact!(stream, [0u8; 2]).context("Can't read user len")?;
        let uname = read_exact!(stream, vec![0u8; ulen as usize]).context("Can't get username.")?;
        let [plen] = read_exact!(stream, [0u8; 1]).context("Can't read pass len")?;
        let passwd = read_exact!(stream, vec![0u8; plen as usize]).context("Can't get password.")?;

        let mut buf = vec![version, ulen];
        buf.extend_from_slice(&uname);
        buf.push(plen);
        buf.extend_from_slice(&passwd);
        Self::decode(&buf)
    }
}

/// The sub-negotiation status reply: `VER STATUS`, `0x00` on success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserPassReply {
    pub version: u8,
    pub status: u8,
}

impl UserPassReply {
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 2 {
            return Err(SocksError::MalformedMessage("auth reply too short"));
        }
        Ok(UserPassReply {
            version: buf[0],
            status: buf[1],
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        vec![self.version, self.status]
    }
}

/// SOCKS request:
///
/// ```text
/// +----+-----+-------+------+----------+----------+
/// |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
/// +----+-----+-------+------+----------+----------+
/// | 1  |  1  | X'00' |  1   | Variable |    2     |
/// +----+-----+-------+------+----------+----------+
/// ```
///
/// The command is kept as the raw byte so the state machine can reply
/// `CommandNotSupported` for BIND/UDP ASSOCIATE instead of failing the parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub version: u8,
    pub command: u8,
    pub dest: TargetAddr,
}

impl ConnectRequest {
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 4 {
            return Err(SocksError::MalformedMessage("request header too short"));
        }
        let (dest, consumed) = decode_addr_port(buf[3], &buf[4..])?;
        if 4 + consumed != buf.len() {
            return Err(SocksError::MalformedMessage("trailing bytes after request"));
        }

        Ok(ConnectRequest {
            version: buf[0],
            command: buf[1],
            dest,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = vec![self.version, self.command, 0x00];
        encode_addr_port(&self.dest, &mut buf)?;
        Ok(buf)
    }

    pub async fn read_from<T: AsyncRead + Unpin>(stream: &mut T) -> Result<Self> {
        let header = read_exact!(stream, [0u8; 4]).context("Malformed request")?;
        let mut buf = header.to_vec();
        read_addr_bytes(stream, header[3], &mut buf).await?;
        Self::decode(&buf)
    }
}

/// SOCKS reply:
///
/// ```text
/// +----+-----+-------+------+----------+----------+
/// |VER | REP |  RSV  | ATYP | BND.ADDR | BND.PORT |
/// +----+-----+-------+------+----------+----------+
/// | 1  |  1  | X'00' |  1   | Variable |    2     |
/// +----+-----+-------+------+----------+----------+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectReply {
    pub version: u8,
    pub reply: ReplyError,
    pub bind: TargetAddr,
}

impl ConnectReply {
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 4 {
            return Err(SocksError::MalformedMessage("reply header too short"));
        }
        let reply = ReplyError::from_u8(buf[1])
            .ok_or(SocksError::MalformedMessage("unknown reply code"))?;
        let (bind, consumed) = decode_addr_port(buf[3], &buf[4..])?;
        if 4 + consumed != buf.len() {
            return Err(SocksError::MalformedMessage("trailing bytes after reply"));
        }

        Ok(ConnectReply {
            version: buf[0],
            reply,
            bind,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = vec![self.version, self.reply.as_u8(), 0x00];
        encode_addr_port(&self.bind, &mut buf)?;
        Ok(buf)
    }

    pub async fn read_from<T: AsyncRead + Unpin>(stream: &mut T) -> Result<Self> {
        let header = read_exact!(stream, [0u8; 4]).context("Malformed reply")?;
        let mut buf = header.to_vec();
        read_addr_bytes(stream, header[3], &mut buf).await?;
        Self::decode(&buf)
    }
}

/// Decode `ADDR PORT` according to the ATYP byte, returning the parsed
/// target and the number of bytes consumed from `buf`.
fn decode_addr_port(atyp: u8, buf: &[u8]) -> Result<(TargetAddr, usize)> {
    let (addr, consumed) = match atyp {
        consts::SOCKS5_ADDR_TYPE_IPV4 => {
            if buf.len() < 6 {
                return Err(SocksError::MalformedMessage("ipv4 address truncated"));
            }
            let ip = Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
            let port = u16::from_be_bytes([buf[4], buf[5]]);
            (TargetAddr::Ip(SocketAddrV4::new(ip, port).into()), 6)
        }
        consts::SOCKS5_ADDR_TYPE_IPV6 => {
            if buf.len() < 18 {
                return Err(SocksError::MalformedMessage("ipv6 address truncated"));
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[..16]);
            let port = u16::from_be_bytes([buf[16], buf[17]]);
            (
                TargetAddr::Ip(SocketAddrV6::new(Ipv6Addr::from(octets), port, 0, 0).into()),
                18,
            )
        }
        consts::SOCKS5_ADDR_TYPE_DOMAIN_NAME => {
            if buf.is_empty() {
                return Err(SocksError::MalformedMessage("domain length missing"));
            }
            let len = buf[0] as usize;
            if buf.len() < 1 + len + 2 {
                return Err(SocksError::MalformedMessage("domain truncated"));
            }
            let domain = String::from_utf8(buf[1..1 + len].to_vec())
                .map_err(|_| SocksError::MalformedMessage("domain is not valid utf-8"))?;
            let port = u16::from_be_bytes([buf[1 + len], buf[1 + len + 1]]);
            (TargetAddr::Domain(domain, port), 1 + len + 2)
        }
        _ => return Err(SocksError::MalformedMessage("unknown address type")),
    };

    Ok((addr, consumed))
}

/// Append `ATYP ADDR PORT` for the given target.
fn encode_addr_port(target: &TargetAddr, buf: &mut Vec<u8>) -> Result<()> {
    buf.push(target.addr_type());
    match target {
        TargetAddr::Ip(addr) => {
            match addr.ip() {
                std::net::IpAddr::V4(ip) => buf.extend_from_slice(&ip.octets()),
                std::net::IpAddr::V6(ip) => buf.extend_from_slice(&ip.octets()),
            }
            buf.extend_from_slice(&addr.port().to_be_bytes());
        }
        TargetAddr::Domain(domain, port) => {
            if domain.len() > 255 {
                return Err(SocksError::ExceededMaxDomainLen(domain.len()));
            }
            buf.push(domain.len() as u8);
            buf.extend_from_slice(domain.as_bytes());
            buf.extend_from_slice(&port.to_be_bytes());
        }
    }
    Ok(())
}

/// Read the variable `ADDR PORT` tail off the stream into `buf` so the
/// whole message can be handed to the pure decoder.
async fn read_addr_bytes<T: AsyncRead + Unpin>(
    stream: &mut T,
    atyp: u8,
    buf: &mut Vec<u8>,
) -> Result<()> {
    match atyp {
        consts::SOCKS5_ADDR_TYPE_IPV4 => {
            let bytes = read_exact!(stream, [0u8; 6]).context("Can't read IPv4 address")?;
            buf.extend_from_slice(&bytes);
        }
        consts::SOCKS5_ADDR_TYPE_IPV6 => {
            let bytes = read_exact!(stream, [0u8; 18]).context("Can't read IPv6 address")?;
            buf.extend_from_slice(&bytes);
        }
        consts::SOCKS5_ADDR_TYPE_DOMAIN_NAME => {
            let [len] = read_exact!(stream, [0u8; 1]).context("Can't read domain len")?;
            let rest = read_exact!(stream, vec![0u8; len as usize + 2])
                .context("Can't read domain content")?;
            buf.push(len);
            buf.extend_from_slice(&rest);
        }
        _ => return Err(SocksError::MalformedMessage("unknown address type")),
    }
    Ok(())
}
