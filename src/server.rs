//! The per-connection SOCKS5 state machine.
//!
//! Each accepted connection advances INIT -> AUTH -> HOST -> DATA (AUTH is
//! skipped when the negotiated method carries no credentials). Transitions
//! are encoded as typestates, so a connection can only move forward and no
//! state can be re-entered; the DATA state hands off to the relay loop and
//! never parses protocol bytes again.

use crate::auth::{CredentialBackend, MethodTable};
use crate::proto::{ConnectReply, ConnectRequest, MethodSelectionRequest, UserPassRequest};
use crate::relay::{relay, Dialer};
use crate::stats::{keys, StatsSink};
use crate::util::target_addr::TargetAddr;
use crate::{consts, ReplyError, Result, SocksError};
use anyhow::Context;
use std::fmt;
use std::marker::PhantomData;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Zero-sized connection states.
pub mod states {
    /// Waiting for the version/method selection message.
    #[derive(Debug)]
    pub struct Init;
    /// Waiting for the credential sub-negotiation.
    #[derive(Debug)]
    pub struct Auth;
    /// Waiting for the CONNECT request.
    #[derive(Debug)]
    pub struct Host;
    /// Negotiation done; bytes are relayed verbatim.
    #[derive(Debug)]
    pub struct Data;
}

/// The observable name of a connection state, for logging and stats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateTag {
    Init,
    Auth,
    Host,
    Data,
}

impl fmt::Display for StateTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateTag::Init => f.write_str("INIT"),
            StateTag::Auth => f.write_str("AUTH"),
            StateTag::Host => f.write_str("HOST"),
            StateTag::Data => f.write_str("DATA"),
        }
    }
}

/// Marker trait binding a typestate to its tag.
pub trait State {
    const TAG: StateTag;
}

impl State for states::Init {
    const TAG: StateTag = StateTag::Init;
}
impl State for states::Auth {
    const TAG: StateTag = StateTag::Auth;
}
impl State for states::Host {
    const TAG: StateTag = StateTag::Host;
}
impl State for states::Data {
    const TAG: StateTag = StateTag::Data;
}

/// One accepted connection, exclusively owned by its handling task.
#[derive(Debug)]
pub struct Socks5Connection<T, S: State> {
    inner: T,
    _state: PhantomData<S>,
}

impl<T, S: State> Socks5Connection<T, S> {
    fn new(inner: T) -> Self {
        Socks5Connection {
            inner,
            _state: PhantomData,
        }
    }

    pub fn state(&self) -> StateTag {
        S::TAG
    }

    /// Consumes the connection, returning the wrapped stream.
    pub fn into_inner(self) -> T {
        self.inner
    }
}

/// Outcome of the INIT negotiation: either straight to the request phase or
/// through a credential round first.
#[derive(Debug)]
pub enum Negotiated<T> {
    Host(Socks5Connection<T, states::Host>),
    Auth(Socks5Connection<T, states::Auth>),
}

impl<T: AsyncRead + AsyncWrite + Unpin> Socks5Connection<T, states::Init> {
    pub fn start(inner: T) -> Self {
        Self::new(inner)
    }

    /// Read the method-selection message and pick an authentication method,
    /// preferring the server's configured order over the client's.
    ///
    /// When no offered method is configured the `[0x05, 0xff]` reply is
    /// written and the caller must drop the connection; this is the one case
    /// where INIT terminates the connection itself rather than advancing.
    pub async fn negotiate_auth(mut self, table: &MethodTable) -> Result<Negotiated<T>> {
        trace!("Socks5Connection: negotiate_auth()");
        let request = MethodSelectionRequest::read_from(&mut self.inner).await?;
        debug!(
            "Handshake headers: [version: {version}, methods: {methods:?}]",
            version = request.version,
            methods = request.methods,
        );

        if request.version != consts::SOCKS5_VERSION {
            return Err(SocksError::UnsupportedSocksVersion(request.version));
        }

        let Some(method) = table.negotiate(&request.methods) else {
            debug!("No auth method supported by both client and server, reply with (0xff)");
            self.inner
                .write_all(&[
                    consts::SOCKS5_VERSION,
                    consts::SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE,
                ])
                .await
                .context("Can't reply with method not acceptable.")?;
            return Err(SocksError::AuthMethodUnacceptable(request.methods));
        };

        debug!("Reply with method {:#04x}", method.method_id());
        self.inner
            .write_all(&[consts::SOCKS5_VERSION, method.method_id()])
            .await
            .context("Can't reply with auth method")?;

        if method.requires_credentials() {
            Ok(Negotiated::Auth(Socks5Connection::new(self.inner)))
        } else {
            Ok(Negotiated::Host(Socks5Connection::new(self.inner)))
        }
    }
}

impl<T: AsyncRead + AsyncWrite + Unpin> Socks5Connection<T, states::Auth> {
    /// Run the RFC 1929 credential round against the backend.
    ///
    /// The failure reply is written here but the transport is never closed by
    /// this method; the caller drops the connection on error.
    pub async fn authenticate(
        mut self,
        backend: &dyn CredentialBackend,
        stats: &dyn StatsSink,
    ) -> Result<Socks5Connection<T, states::Host>> {
        let request = UserPassRequest::read_from(&mut self.inner).await?;
        stats.incr(keys::AUTH_ATTEMPTS, 1);

        if backend
            .authenticate(&request.username, &request.password)
            .await
        {
            // The status reply echoes the sub-negotiation version byte.
            self.inner
                .write_all(&[request.version, consts::SOCKS5_AUTH_SUCCEEDED])
                .await
                .context("Can't reply auth success")?;

            info!("Password authentication accepted.");
            Ok(Socks5Connection::new(self.inner))
        } else {
            self.inner
                .write_all(&[request.version, consts::SOCKS5_AUTH_FAILED])
                .await
                .context("Can't reply auth failure")?;

            stats.incr(keys::AUTH_FAILURES, 1);
            info!("Authentication failed: [{}]", request.username);
            Err(SocksError::AuthenticationFailed(request.username))
        }
    }
}

impl<T: AsyncRead + AsyncWrite + Unpin> Socks5Connection<T, states::Host> {
    /// Read and validate the CONNECT request.
    ///
    /// BIND and UDP ASSOCIATE are rejected with reply `0x07` before the
    /// error is returned; an unsupported version gets no reply at all.
    pub async fn read_request(
        mut self,
    ) -> Result<(Socks5Connection<T, states::Data>, TargetAddr)> {
        let request = ConnectRequest::read_from(&mut self.inner).await?;
        debug!(
            "Request: [version: {version}, command: {command}, dest: {dest}]",
            version = request.version,
            command = request.command,
            dest = request.dest,
        );

        if request.version != consts::SOCKS5_VERSION {
            return Err(SocksError::UnsupportedSocksVersion(request.version));
        }

        if request.command != consts::SOCKS5_CMD_TCP_CONNECT {
            let mut conn = Socks5Connection::<T, states::Data>::new(self.inner);
            conn.reply(ReplyError::CommandNotSupported, unspecified_bind_addr())
                .await?;
            return Err(SocksError::UnsupportedCommand(request.command));
        }

        Ok((Socks5Connection::new(self.inner), request.dest))
    }
}

impl<T: AsyncRead + AsyncWrite + Unpin> Socks5Connection<T, states::Data> {
    /// Write the connect reply. Exactly one reply is ever written per
    /// connect attempt, always before any relayed data.
    async fn reply(&mut self, reply: ReplyError, bind: SocketAddr) -> Result<()> {
        let message = ConnectReply {
            version: consts::SOCKS5_VERSION,
            reply,
            bind: TargetAddr::Ip(bind),
        }
        .encode()?;

        self.inner
            .write_all(&message)
            .await
            .context("Can't write the reply!")?;
        self.inner.flush().await.context("Can't flush the reply!")?;
        Ok(())
    }

    /// Dial the destination, emit the connect reply and pump bytes until
    /// either side closes.
    ///
    /// Classified dial failures are answered with their reply code; anything
    /// else gets a best-effort general failure before the connection is
    /// dropped.
    pub async fn connect_and_relay(
        mut self,
        dest: &TargetAddr,
        dialer: &Dialer,
        nodelay: bool,
        stats: &dyn StatsSink,
    ) -> Result<()> {
        // The dial races against the inbound side: a client hanging up while
        // the connect is still in flight aborts the attempt instead of
        // holding the task until the connect timeout. Bytes a client
        // pipelines ahead of the reply are kept for the relay.
        let dial = dialer.dial(dest);
        tokio::pin!(dial);

        let mut early = Vec::new();
        let mut probe = [0u8; 512];
        let dialed = loop {
            tokio::select! {
                res = &mut dial => break res,
                read = self.inner.read(&mut probe) => match read {
                    Ok(0) => {
                        debug!("Inbound side closed while dialing {}", dest);
                        return Ok(());
                    }
                    Ok(n) => early.extend_from_slice(&probe[..n]),
                    Err(err) => return Err(err.into()),
                },
            }
        };

        let mut outbound = match dialed {
            Ok(outbound) => outbound,
            Err(SocksError::ReplyError(code)) => {
                error!("Dial to {} failed: {}", dest, code);
                self.reply(code, unspecified_bind_addr()).await?;
                return Err(code.into());
            }
            Err(err) => {
                error!("Dial to {} failed: {:#}", dest, err);
                // Best effort; the inbound side may already be gone.
                let _ = self
                    .reply(ReplyError::GeneralFailure, unspecified_bind_addr())
                    .await;
                return Err(err);
            }
        };

        outbound.set_nodelay(nodelay)?;

        // BND.ADDR/BND.PORT report the real local endpoint of the outbound
        // socket; its family picks the ATYP, which matters on dual-stack
        // hosts.
        let bind = outbound.local_addr()?;
        self.reply(ReplyError::Succeeded, bind).await?;

        if !early.is_empty() {
            outbound.write_all(&early).await?;
            stats.incr(keys::DATA_SENT, early.len() as u64);
        }

        relay(self.inner, outbound, stats).await
    }
}

fn unspecified_bind_addr() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
}

/// Static per-server configuration, immutable once the channel starts.
#[derive(Clone)]
pub struct ServerConfig {
    method_table: MethodTable,
    backend: Option<Arc<dyn CredentialBackend>>,
    /// Timeout of the outbound connect, in seconds.
    request_timeout: u64,
    /// Disables Nagle's algorithm for the outbound TCP stream.
    nodelay: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            method_table: MethodTable::no_auth_only(),
            backend: None,
            request_timeout: 10,
            nodelay: false,
        }
    }
}

impl ServerConfig {
    /// How much time it should wait until the outbound connect times out.
    pub fn set_request_timeout(&mut self, n: u64) -> &mut Self {
        self.request_timeout = n;
        self
    }

    pub fn set_nodelay(&mut self, value: bool) -> &mut Self {
        self.nodelay = value;
        self
    }

    /// Replace the ordered authentication method table.
    pub fn with_method_table(mut self, table: MethodTable) -> Self {
        self.method_table = table;
        self
    }

    /// Require username/password authentication against the given backend.
    pub fn with_authentication<B: CredentialBackend + 'static>(mut self, backend: B) -> Self {
        self.method_table = MethodTable::user_password_only();
        self.backend = Some(Arc::new(backend));
        self
    }

    pub fn request_timeout(&self) -> u64 {
        self.request_timeout
    }

    pub fn nodelay(&self) -> bool {
        self.nodelay
    }

    pub fn method_table(&self) -> &MethodTable {
        &self.method_table
    }
}

/// Drive one accepted connection through the whole state machine.
///
/// Every error is handled at this boundary: the caller logs it and drops the
/// streams, other connections and the listener are never affected.
pub async fn serve_connection<T>(
    stream: T,
    peer: SocketAddr,
    config: &ServerConfig,
    dialer: &Dialer,
    stats: &dyn StatsSink,
) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let conn = Socks5Connection::start(stream);
    debug!("[{}] connection opened in state [{}]", peer, conn.state());

    let conn = match conn.negotiate_auth(config.method_table()).await? {
        Negotiated::Host(conn) => conn,
        Negotiated::Auth(conn) => {
            debug!("[{}] state switched to [{}]", peer, conn.state());
            let backend = config.backend.as_deref().ok_or(SocksError::ArgumentInputError(
                "username/password method configured without a credential backend",
            ))?;
            conn.authenticate(backend, stats).await?
        }
    };
    debug!("[{}] state switched to [{}]", peer, conn.state());

    let (conn, dest) = conn.read_request().await?;
    debug!(
        "[{}] state switched to [{}]; destination [{}]",
        peer,
        conn.state(),
        dest
    );

    conn.connect_and_relay(&dest, dialer, config.nodelay(), stats).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthMethod, StaticBackend};
    use crate::read_exact;
    use crate::stats::{MemoryStats, NoopStats};
    use tokio::io::{duplex, AsyncReadExt};

    #[tokio::test]
    async fn init_reaches_host_directly_under_noauth() {
        let (server_side, mut client) = duplex(1024);
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();

        let conn = Socks5Connection::start(server_side);
        assert_eq!(conn.state(), StateTag::Init);

        let negotiated = conn.negotiate_auth(&MethodTable::no_auth_only()).await.unwrap();
        let conn = match negotiated {
            Negotiated::Host(conn) => conn,
            Negotiated::Auth(_) => panic!("no-auth must not pass through AUTH"),
        };
        assert_eq!(conn.state(), StateTag::Host);

        let reply = read_exact!(client, [0u8; 2]).unwrap();
        assert_eq!(reply, [0x05, 0x00]);
    }

    #[tokio::test]
    async fn init_auth_host_data_under_userpass() {
        let (server_side, mut client) = duplex(1024);
        let stats = MemoryStats::new();
        let backend = StaticBackend::new().with_user("alice", "opensesame");

        client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();

        let table = MethodTable::user_password_only();
        let conn = match Socks5Connection::start(server_side)
            .negotiate_auth(&table)
            .await
            .unwrap()
        {
            Negotiated::Auth(conn) => conn,
            Negotiated::Host(_) => panic!("user/password must pass through AUTH"),
        };
        assert_eq!(conn.state(), StateTag::Auth);
        let reply = read_exact!(client, [0u8; 2]).unwrap();
        assert_eq!(reply, [0x05, 0x02]);

        let sub = UserPassRequest {
            version: 0x01,
            username: "alice".to_string(),
            password: "opensesame".to_string(),
        };
        client.write_all(&sub.encode()).await.unwrap();

        let conn = conn.authenticate(&backend, &stats).await.unwrap();
        assert_eq!(conn.state(), StateTag::Host);
        let reply = read_exact!(client, [0u8; 2]).unwrap();
        assert_eq!(reply, [0x01, 0x00]);
        assert_eq!(stats.get(keys::AUTH_ATTEMPTS), 1);
        assert_eq!(stats.get(keys::AUTH_FAILURES), 0);

        // CONNECT to 127.0.0.1:80
        client
            .write_all(&[0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x50])
            .await
            .unwrap();

        let (conn, dest) = conn.read_request().await.unwrap();
        assert_eq!(conn.state(), StateTag::Data);
        assert_eq!(dest, TargetAddr::Ip("127.0.0.1:80".parse().unwrap()));
    }

    #[tokio::test]
    async fn wrong_password_gets_failure_reply() {
        let (server_side, mut client) = duplex(1024);
        let stats = MemoryStats::new();
        let backend = StaticBackend::new().with_user("alice", "opensesame");

        client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
        let conn = match Socks5Connection::start(server_side)
            .negotiate_auth(&MethodTable::user_password_only())
            .await
            .unwrap()
        {
            Negotiated::Auth(conn) => conn,
            Negotiated::Host(_) => unreachable!(),
        };
        let _ = read_exact!(client, [0u8; 2]).unwrap();

        let sub = UserPassRequest {
            version: 0x01,
            username: "alice".to_string(),
            password: "wrong".to_string(),
        };
        client.write_all(&sub.encode()).await.unwrap();

        let err = conn.authenticate(&backend, &stats).await.unwrap_err();
        assert!(matches!(err, SocksError::AuthenticationFailed(_)));
        let reply = read_exact!(client, [0u8; 2]).unwrap();
        assert_eq!(reply, [0x01, 0xff]);
        assert_eq!(stats.get(keys::AUTH_FAILURES), 1);
    }

    #[tokio::test]
    async fn no_acceptable_method_replies_ff() {
        let (server_side, mut client) = duplex(1024);
        // Client only offers GSS-API, which is not implemented.
        client.write_all(&[0x05, 0x01, 0x01]).await.unwrap();

        let err = Socks5Connection::start(server_side)
            .negotiate_auth(&MethodTable::new(vec![AuthMethod::UserPassword, AuthMethod::NoAuth]).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, SocksError::AuthMethodUnacceptable(_)));

        let reply = read_exact!(client, [0u8; 2]).unwrap();
        assert_eq!(reply, [0x05, 0xff]);
    }

    #[tokio::test]
    async fn server_priority_beats_client_order() {
        // Client prefers no-auth, server configured user/password first.
        for offered in [[0x00u8, 0x02], [0x02u8, 0x00]] {
            let (server_side, mut client) = duplex(1024);
            client.write_all(&[0x05, 0x02]).await.unwrap();
            client.write_all(&offered).await.unwrap();

            let table =
                MethodTable::new(vec![AuthMethod::UserPassword, AuthMethod::NoAuth]).unwrap();
            let negotiated = Socks5Connection::start(server_side)
                .negotiate_auth(&table)
                .await
                .unwrap();
            assert!(matches!(negotiated, Negotiated::Auth(_)));

            let reply = read_exact!(client, [0u8; 2]).unwrap();
            assert_eq!(reply, [0x05, 0x02]);
        }
    }

    #[tokio::test]
    async fn unsupported_version_closes_without_reply() {
        let (server_side, mut client) = duplex(1024);
        client.write_all(&[0x04, 0x01, 0x00]).await.unwrap();

        let err = Socks5Connection::start(server_side)
            .negotiate_auth(&MethodTable::no_auth_only())
            .await
            .unwrap_err();
        assert!(matches!(err, SocksError::UnsupportedSocksVersion(0x04)));

        // The server side has been dropped without writing anything: the
        // client sees a bare EOF, not a reply.
        let mut buf = [0u8; 1];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(n, 0, "no reply bytes expected");
    }

    #[tokio::test]
    async fn bind_command_gets_command_not_supported() {
        let (server_side, mut client) = duplex(1024);
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();

        let conn = match Socks5Connection::start(server_side)
            .negotiate_auth(&MethodTable::no_auth_only())
            .await
            .unwrap()
        {
            Negotiated::Host(conn) => conn,
            Negotiated::Auth(_) => unreachable!(),
        };
        let _ = read_exact!(client, [0u8; 2]).unwrap();

        // BIND request
        client
            .write_all(&[0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x50])
            .await
            .unwrap();

        let err = conn.read_request().await.unwrap_err();
        assert!(matches!(err, SocksError::UnsupportedCommand(0x02)));

        let reply = read_exact!(client, [0u8; 10]).unwrap();
        assert_eq!(reply[0], 0x05);
        assert_eq!(reply[1], consts::SOCKS5_REPLY_COMMAND_NOT_SUPPORTED);
    }

    #[tokio::test]
    async fn malformed_domain_length_is_rejected() {
        let (server_side, mut client) = duplex(1024);
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();

        let conn = match Socks5Connection::start(server_side)
            .negotiate_auth(&MethodTable::no_auth_only())
            .await
            .unwrap()
        {
            Negotiated::Host(conn) => conn,
            Negotiated::Auth(_) => unreachable!(),
        };
        let _ = read_exact!(client, [0u8; 2]).unwrap();

        // ATYP=3 with a length byte far past the actual payload, then EOF.
        client
            .write_all(&[0x05, 0x01, 0x00, 0x03, 0xff, b'a', b'b'])
            .await
            .unwrap();
        drop(client);

        let err = conn.read_request().await.unwrap_err();
        match err {
            SocksError::MalformedMessage(_) | SocksError::Io(_) | SocksError::Other(_) => {}
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn inbound_hangup_aborts_a_stalled_dial() {
        let (server_side, mut client) = duplex(1024);
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();

        let conn = match Socks5Connection::start(server_side)
            .negotiate_auth(&MethodTable::no_auth_only())
            .await
            .unwrap()
        {
            Negotiated::Host(conn) => conn,
            Negotiated::Auth(_) => unreachable!(),
        };
        let _ = read_exact!(client, [0u8; 2]).unwrap();

        // CONNECT to a TEST-NET-1 blackhole that will not answer.
        client
            .write_all(&[0x05, 0x01, 0x00, 0x01, 192, 0, 2, 1, 0x00, 0x50])
            .await
            .unwrap();
        let (conn, dest) = conn.read_request().await.unwrap();

        // Hang up while the dial is still in flight; the connect timeout is
        // far beyond the assertion bound, so only the hangup can end the call.
        drop(client);
        let dialer = Dialer::direct(60);
        let finished = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            conn.connect_and_relay(&dest, &dialer, false, &NoopStats),
        )
        .await;
        assert!(finished.is_ok(), "dial not aborted on inbound hangup");
    }

    #[tokio::test]
    async fn missing_backend_is_a_config_error() {
        let (server_side, mut client) = duplex(1024);
        client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();

        let config = ServerConfig::default().with_method_table(MethodTable::user_password_only());
        let dialer = Dialer::direct(config.request_timeout());
        let err = serve_connection(
            server_side,
            "127.0.0.1:9999".parse().unwrap(),
            &config,
            &dialer,
            &NoopStats,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SocksError::ArgumentInputError(_)));
    }
}
