//! Channels bind a listening socket to its protocol implementations.
//!
//! A channel is static configuration fixed at startup: the listen address,
//! the inbound (interface) protocol, the outbound (client) protocol and the
//! per-server settings. Every accepted TCP stream gets its own connection
//! state machine wired to the channel's dialer, so all dials launched from
//! the request phase use the same outbound protocol.

use crate::ready;
use crate::relay::{ClientProtocol, Dialer};
use crate::server::{serve_connection, ServerConfig};
use crate::stats::{keys, NoopStats, StatsSink};
use crate::Result;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as AsyncContext, Poll};
use tokio::net::{TcpListener, TcpStream};
use tokio_stream::{Stream, StreamExt};

/// The inbound-facing connection handler bound to a channel's listener.
///
/// This is a compile-time registry: configuration keys map onto enum
/// variants instead of dynamically loaded class paths, so an unknown
/// protocol is caught at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceProtocol {
    Socks5,
}

impl InterfaceProtocol {
    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "socks5" => Some(InterfaceProtocol::Socks5),
            _ => None,
        }
    }
}

impl ClientProtocol {
    /// Resolve a configuration key (plus the optional fixed downstream
    /// address) into a client protocol.
    pub fn from_key(key: &str, downstream: Option<SocketAddr>) -> Option<Self> {
        match (key, downstream) {
            ("direct", None) => Some(ClientProtocol::Direct),
            ("upstream", Some(addr)) => Some(ClientProtocol::Upstream(addr)),
            _ => None,
        }
    }
}

/// Static binding of a listening socket to its protocol constructors.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub name: String,
    pub listen_addr: SocketAddr,
    pub interface: InterfaceProtocol,
    pub client: ClientProtocol,
}

impl ChannelConfig {
    pub fn new(name: impl Into<String>, listen_addr: SocketAddr) -> Self {
        ChannelConfig {
            name: name.into(),
            listen_addr,
            interface: InterfaceProtocol::Socks5,
            client: ClientProtocol::Direct,
        }
    }

    pub fn with_client(mut self, client: ClientProtocol) -> Self {
        self.client = client;
        self
    }
}

/// One listening socket plus everything a connection task needs.
pub struct Channel {
    name: String,
    listener: TcpListener,
    interface: InterfaceProtocol,
    server: Arc<ServerConfig>,
    dialer: Dialer,
    stats: Arc<dyn StatsSink>,
}

impl Channel {
    pub async fn bind(config: ChannelConfig, server: ServerConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.listen_addr).await?;
        let dialer = Dialer::new(config.client, server.request_timeout());

        Ok(Channel {
            name: config.name,
            listener,
            interface: config.interface,
            server: Arc::new(server),
            dialer,
            stats: Arc::new(NoopStats),
        })
    }

    /// Replace the stats sink; the default discards every counter.
    pub fn with_stats(mut self, stats: Arc<dyn StatsSink>) -> Self {
        self.stats = stats;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Can loop on `incoming().next()` to iterate over incoming connections.
    pub fn incoming(&self) -> Incoming<'_> {
        Incoming(self, None)
    }

    /// Accept connections forever, one task per connection.
    ///
    /// A failing connection only ends its own task; the listener keeps
    /// accepting.
    pub async fn serve(self) -> Result<()> {
        info!(
            "Channel [{}] is open; listening on the interface: [{}]",
            self.name,
            self.local_addr()?,
        );

        let mut incoming = self.incoming();
        while let Some(accepted) = incoming.next().await {
            match accepted {
                Ok(conn) => {
                    self.stats.incr(keys::CONNECTIONS_ACCEPTED, 1);
                    tokio::spawn(async move {
                        let peer = conn.peer_addr();
                        if let Err(err) = conn.run().await {
                            error!("{:#} [{}]", &err, peer);
                        }
                    });
                }
                Err(err) => {
                    error!("accept error = {:?}", err);
                }
            }
        }

        Ok(())
    }
}

/// An accepted connection bound to its channel's configuration.
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    interface: InterfaceProtocol,
    server: Arc<ServerConfig>,
    dialer: Dialer,
    stats: Arc<dyn StatsSink>,
}

impl Connection {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Drive the connection through its interface protocol and, on
    /// success, the relay loop until either side closes.
    pub async fn run(self) -> Result<()> {
        match self.interface {
            InterfaceProtocol::Socks5 => {
                serve_connection(
                    self.stream,
                    self.peer,
                    &self.server,
                    &self.dialer,
                    self.stats.as_ref(),
                )
                .await
            }
        }
    }
}

/// `Incoming` implements [`tokio_stream::Stream`] over accepted connections.
pub struct Incoming<'a>(
    &'a Channel,
    Option<Pin<Box<dyn Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send + Sync + 'a>>>,
);

impl<'a> Stream for Incoming<'a> {
    type Item = Result<Connection>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut AsyncContext<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if self.1.is_none() {
                self.1 = Some(Box::pin(self.0.listener.accept()));
            }

            if let Some(f) = &mut self.1 {
                // early returns if pending
                let (stream, peer) = ready!(f.as_mut().poll(cx))?;
                self.1 = None;

                debug!("incoming connection from peer {}", &peer);

                return Poll::Ready(Some(Ok(Connection {
                    stream,
                    peer,
                    interface: self.0.interface,
                    server: self.0.server.clone(),
                    dialer: self.0.dialer.clone(),
                    stats: self.0.stats.clone(),
                })));
            }
        }
    }
}
