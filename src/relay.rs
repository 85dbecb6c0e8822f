//! Outbound dialing and the bidirectional byte relay.

use crate::stats::{keys, StatsSink};
use crate::util::stream::tcp_connect_with_timeout;
use crate::util::target_addr::TargetAddr;
use crate::Result;
use std::net::SocketAddr;
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// How the outbound side of a channel reaches the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientProtocol {
    /// Dial the destination parsed from the CONNECT request.
    Direct,
    /// Dial a fixed upstream hop instead of the destination; the hop is
    /// responsible for forwarding onwards. Transparent to the relay loop.
    Upstream(SocketAddr),
}

/// Resolves a destination into a live outbound transport.
///
/// Exactly one connect attempt is made per CONNECT request; there is no
/// speculative pre-connect and no pooling.
#[derive(Debug, Clone)]
pub struct Dialer {
    protocol: ClientProtocol,
    connect_timeout_s: u64,
}

impl Dialer {
    pub fn new(protocol: ClientProtocol, connect_timeout_s: u64) -> Self {
        Dialer {
            protocol,
            connect_timeout_s,
        }
    }

    pub fn direct(connect_timeout_s: u64) -> Self {
        Self::new(ClientProtocol::Direct, connect_timeout_s)
    }

    pub async fn dial(&self, dest: &TargetAddr) -> Result<TcpStream> {
        let addr = match self.protocol {
            ClientProtocol::Direct => dest.resolve_dns().await?,
            ClientProtocol::Upstream(hop) => hop,
        };

        let stream = tcp_connect_with_timeout(addr, self.connect_timeout_s).await?;
        debug!("Connected to remote destination {}", addr);
        Ok(stream)
    }
}

/// Run the bidirectional relay until either side closes.
///
/// Two independent copy loops; the first to hit EOF or an error wins the
/// `select!` and the other future is dropped along with its stream halves,
/// closing both transports together. Half-close is deliberately unsupported.
pub async fn relay<I, O>(inbound: I, outbound: O, stats: &dyn StatsSink) -> Result<()>
where
    I: AsyncRead + AsyncWrite + Unpin,
    O: AsyncRead + AsyncWrite + Unpin,
{
    let (inbound_rx, inbound_tx) = io::split(inbound);
    let (outbound_rx, outbound_tx) = io::split(outbound);

    let upload = pump(inbound_rx, outbound_tx, stats, keys::DATA_SENT);
    let download = pump(outbound_rx, inbound_tx, stats, keys::DATA_RECEIVED);
    tokio::pin!(upload);
    tokio::pin!(download);

    let result = tokio::select! {
        res = &mut upload => res,
        res = &mut download => res,
    };

    match result {
        Ok(bytes) => info!("transfer closed ({} bytes on closing side)", bytes),
        Err(err) => error!("transfer error: {:?}", err),
    }

    Ok(())
}

/// Copy bytes one way, reporting each chunk to the stats sink.
async fn pump<R, W>(mut rx: R, mut tx: W, stats: &dyn StatsSink, key: &str) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut total: u64 = 0;

    loop {
        let n = rx.read(&mut buf).await?;
        if n == 0 {
            return Ok(total);
        }
        tx.write_all(&buf[..n]).await?;
        stats.incr(key, n as u64);
        total += n as u64;
    }
}
