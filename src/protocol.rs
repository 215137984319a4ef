//! SOCKS5 wire forms: greeting, method reply, request and reply, plus
//! address marshaling. Both directions are implemented so that client-side
//! tooling and tests can speak the same frames the server reads.
//!
//! Every read is bounded by the protocol itself: the method list caps at 255
//! entries and a request at 262 octets (the longest domain form).

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub mod addr;
pub mod command;
pub mod methods;
pub mod reply;

pub use addr::{Address, AddressType, Host};
pub use command::Command;
pub use methods::AuthMethod;
pub use reply::Reply;

use crate::{Error, Result};

pub const VERSION: u8 = 0x05;
pub const RESERVED: u8 = 0x00;

/// Reads the client greeting: `VER | NMETHODS | METHODS[NMETHODS]`.
///
/// A version other than 5 or an empty method list is `Error::Malformed`.
pub async fn read_greeting<S>(stream: &mut S) -> Result<Vec<AuthMethod>>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;

    if header[0] != VERSION {
        return Err(Error::Malformed("greeting version"));
    }
    if header[1] == 0 {
        return Err(Error::Malformed("greeting method list"));
    }

    let mut methods = vec![0u8; header[1] as usize];
    stream.read_exact(&mut methods).await?;

    Ok(methods.into_iter().map(AuthMethod::from_u8).collect())
}

/// Writes a client greeting for the given method list.
pub async fn write_greeting<S>(stream: &mut S, methods: &[AuthMethod]) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    if methods.is_empty() || methods.len() > 255 {
        return Err(Error::Malformed("greeting method list"));
    }

    stream.write_u8(VERSION).await?;
    stream.write_u8(methods.len() as u8).await?;
    for method in methods {
        stream.write_u8(method.to_u8()).await?;
    }
    Ok(())
}

/// Writes the method reply: `VER | METHOD`.
pub async fn write_method_reply<S>(stream: &mut S, method: AuthMethod) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_u8(VERSION).await?;
    stream.write_u8(method.to_u8()).await?;
    Ok(())
}

/// Reads a method reply.
pub async fn read_method_reply<S>(stream: &mut S) -> Result<AuthMethod>
where
    S: AsyncRead + Unpin,
{
    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;

    if reply[0] != VERSION {
        return Err(Error::Malformed("method reply version"));
    }
    Ok(AuthMethod::from_u8(reply[1]))
}

/// Reads a request: `VER | CMD | RSV | ATYP | DST.ADDR | DST.PORT`.
///
/// The command octet comes back raw so the caller can answer
/// `command not supported` for values it does not relay.
pub async fn read_request<S>(stream: &mut S) -> Result<(u8, Address)>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;

    if header[0] != VERSION {
        return Err(Error::Malformed("request version"));
    }
    if header[2] != RESERVED {
        return Err(Error::Malformed("request reserved octet"));
    }

    let dst = read_address(stream, header[3]).await?;
    Ok((header[1], dst))
}

/// Writes a request for the given command and destination.
pub async fn write_request<S>(stream: &mut S, command: Command, dst: &Address) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_u8(VERSION).await?;
    stream.write_u8(command.to_u8()).await?;
    stream.write_u8(RESERVED).await?;
    write_address(stream, dst).await
}

/// Writes a reply: same shape as a request with the REP code in the CMD
/// slot. This is the commit point of a request's outcome.
pub async fn write_reply<S>(stream: &mut S, reply: Reply, bound: &Address) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_u8(VERSION).await?;
    stream.write_u8(reply.to_u8()).await?;
    stream.write_u8(RESERVED).await?;
    write_address(stream, bound).await
}

/// Reads a reply.
pub async fn read_reply<S>(stream: &mut S) -> Result<(Reply, Address)>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;

    if header[0] != VERSION {
        return Err(Error::Malformed("reply version"));
    }
    let reply = Reply::from_u8(header[1]).ok_or(Error::Malformed("reply code"))?;
    if header[2] != RESERVED {
        return Err(Error::Malformed("reply reserved octet"));
    }

    let bound = read_address(stream, header[3]).await?;
    Ok((reply, bound))
}

async fn read_address<S>(stream: &mut S, atyp: u8) -> Result<Address>
where
    S: AsyncRead + Unpin,
{
    let atyp = AddressType::from_u8(atyp).ok_or(Error::Malformed("address type"))?;

    let host = match atyp {
        AddressType::Ipv4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            Host::Ipv4(octets.into())
        }
        AddressType::DomainName => {
            let len = stream.read_u8().await?;
            if len == 0 {
                return Err(Error::Malformed("domain address"));
            }
            let mut name = vec![0u8; len as usize];
            stream.read_exact(&mut name).await?;
            let name =
                String::from_utf8(name).map_err(|_| Error::Malformed("domain address"))?;
            Host::Domain(name)
        }
        AddressType::Ipv6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            Host::Ipv6(octets.into())
        }
    };

    let port = stream.read_u16().await?;
    Ok(Address { host, port })
}

async fn write_address<S>(stream: &mut S, addr: &Address) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_u8(addr.host.address_type().to_u8()).await?;

    match &addr.host {
        Host::Ipv4(ip) => stream.write_all(&ip.octets()).await?,
        Host::Ipv6(ip) => stream.write_all(&ip.octets()).await?,
        Host::Domain(name) => {
            if name.is_empty() || name.len() > 255 {
                return Err(Error::Malformed("domain address"));
            }
            stream.write_u8(name.len() as u8).await?;
            stream.write_all(name.as_bytes()).await?;
        }
    }

    stream.write_u16(addr.port).await?;
    Ok(())
}
