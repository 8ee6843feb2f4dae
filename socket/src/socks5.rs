use std::io;

use async_trait::async_trait;
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    addr::{Address, DecodeAddressError},
    forward::forward,
    server::{ConnHandler, IoStream, SocketContext},
};

pub const VERSION: u8 = 5;
pub const METHOD_NO_AUTH: u8 = 0x00;
pub const CMD_CONNECT: u8 = 0x01;

const REPLY_SUCCEEDED: u8 = 0x00;
const REPLY_HOST_UNREACHABLE: u8 = 0x03;
const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;

/// How [`Socks5Connect`] reaches its targets. Callers may wrap the
/// default to intercept, log, or reroute outbound connections.
#[async_trait]
pub trait Dial: Send + Sync {
    async fn dial(
        &self,
        cancellation: &CancellationToken,
        addr: &Address,
    ) -> io::Result<TcpStream>;
}

/// Plain TCP dial, aborted if the connection's scope is cancelled while
/// connecting.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectDial;

#[async_trait]
impl Dial for DirectDial {
    async fn dial(
        &self,
        cancellation: &CancellationToken,
        addr: &Address,
    ) -> io::Result<TcpStream> {
        tokio::select! {
            () = cancellation.cancelled() => Err(io::Error::new(
                io::ErrorKind::Interrupted,
                "Connection cancelled",
            )),
            res = TcpStream::connect(addr.to_string()) => res,
        }
    }
}

/// SOCKS5 CONNECT handler: no-auth only, CONNECT only.
///
/// BIND and UDP ASSOCIATE are answered with `0x07` (command not
/// supported) without any action taken.
#[derive(Debug, Clone)]
pub struct Socks5Connect<D = DirectDial> {
    dial: D,
}

impl Default for Socks5Connect<DirectDial> {
    fn default() -> Self {
        Self { dial: DirectDial }
    }
}

impl<D> Socks5Connect<D> {
    pub fn new(dial: D) -> Self {
        Self { dial }
    }
}

#[async_trait]
impl<D> ConnHandler for Socks5Connect<D>
where
    D: Dial,
{
    async fn handle_conn<S>(&self, mut socket: SocketContext<S>)
    where
        S: IoStream,
    {
        let peer_addr = socket.peer_addr();
        match self.establish(&mut socket).await {
            Ok(Some((target, addr))) => {
                info!(?peer_addr, %addr, "Relaying");
                let (stream, _, cancellation) = socket.into_parts();
                forward(stream, target, &cancellation).await;
            }
            Ok(None) => (),
            Err(e) => warn!(?peer_addr, ?e, "SOCKS5 handshake failed"),
        }
    }
}

impl<D> Socks5Connect<D>
where
    D: Dial,
{
    /// Runs the SOCKS5 negotiation on `socket`. `Ok(Some(..))` carries
    /// the dialed target stream and the requested address; `Ok(None)`
    /// means an error reply was already sent and the connection should
    /// just close. Failures before the reply header send nothing.
    async fn establish<S>(
        &self,
        socket: &mut SocketContext<S>,
    ) -> Result<Option<(TcpStream, Address)>, HandshakeError>
    where
        S: IoStream,
    {
        // Method negotiation. The offered methods are discarded unread;
        // no-auth is the only method ever selected.
        let mut buf = [0u8; 2];
        socket.read_exact(&mut buf).await?;
        if buf[0] != VERSION {
            return Err(HandshakeError::UnsupportedVersion(buf[0]));
        }
        let method_count = buf[1];
        let mut methods = vec![0u8; method_count as usize];
        socket.read_exact(&mut methods).await?;
        socket.write_all(&[VERSION, METHOD_NO_AUTH]).await?;

        // Relay request.
        let mut buf = [0u8; 3];
        socket.read_exact(&mut buf).await?;
        if buf[0] != VERSION {
            return Err(HandshakeError::UnsupportedVersion(buf[0]));
        }
        let command = buf[1];
        let reserved = buf[2];
        let addr = Address::decode(socket).await?;

        let (reply, target) = if command != CMD_CONNECT {
            (REPLY_COMMAND_NOT_SUPPORTED, None)
        } else {
            match self.dial.dial(socket.cancellation_token(), &addr).await {
                Ok(stream) => (REPLY_SUCCEEDED, Some(stream)),
                Err(e) => {
                    warn!(?e, %addr, "Failed to dial target");
                    (REPLY_HOST_UNREACHABLE, None)
                }
            }
        };

        // The reserved byte is echoed back as read from the client, and
        // the bound address field carries the requested address rather
        // than the dialed socket's local address. Both quirks are kept
        // for compatibility with the deployed behavior.
        socket.write_all(&[VERSION, reply, reserved]).await?;
        addr.encode(socket).await?;
        socket.flush().await?;

        Ok(target.map(|target| (target, addr)))
    }
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("Unsupported SOCKS version: {0}")]
    UnsupportedVersion(u8),
    #[error("Failed to decode target address: {0}")]
    Address(#[from] DecodeAddressError),
    #[error("{0}")]
    Io(#[from] io::Error),
}
