//! Authentication method negotiation and credential verification.
//!
//! The server owns an ordered [`MethodTable`]; negotiation picks the first
//! *configured* method that the client also offers, so the server's priority
//! order decides, never the client's. Username/password verification is
//! delegated to a swappable [`CredentialBackend`].

use crate::consts;
use crate::{Result, SocksError};
use std::collections::HashMap;
use std::path::Path;

/// An authentication method the server can be configured with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    /// "NO AUTHENTICATION REQUIRED", ID 00h. The connection proceeds
    /// straight to the request phase.
    NoAuth,
    /// RFC 1929 "USERNAME/PASSWORD", ID 02h. Requires a sub-negotiation
    /// round before the request phase.
    UserPassword,
}

impl AuthMethod {
    #[inline]
    pub fn method_id(self) -> u8 {
        match self {
            AuthMethod::NoAuth => consts::SOCKS5_AUTH_METHOD_NONE,
            AuthMethod::UserPassword => consts::SOCKS5_AUTH_METHOD_PASSWORD,
        }
    }

    /// Whether the method needs a credential round before the request phase.
    #[inline]
    pub fn requires_credentials(self) -> bool {
        matches!(self, AuthMethod::UserPassword)
    }
}

/// The server's ordered authentication method configuration.
///
/// Position in the list is the priority: when several methods are offered by
/// the client, the earliest configured one wins.
#[derive(Debug, Clone)]
pub struct MethodTable {
    methods: Vec<AuthMethod>,
}

impl MethodTable {
    pub fn new(methods: Vec<AuthMethod>) -> Result<Self> {
        if methods.is_empty() {
            return Err(SocksError::ArgumentInputError(
                "at least one auth method must be configured",
            ));
        }
        Ok(MethodTable { methods })
    }

    pub fn no_auth_only() -> Self {
        MethodTable {
            methods: vec![AuthMethod::NoAuth],
        }
    }

    pub fn user_password_only() -> Self {
        MethodTable {
            methods: vec![AuthMethod::UserPassword],
        }
    }

    /// Pick the method both sides support, preferring the server's
    /// configured order over the order the client sent.
    pub fn negotiate(&self, offered: &[u8]) -> Option<AuthMethod> {
        self.methods
            .iter()
            .copied()
            .find(|method| offered.contains(&method.method_id()))
    }

    pub fn methods(&self) -> &[AuthMethod] {
        &self.methods
    }
}

/// Verifies a username/password pair.
///
/// Backends are read-only from the connection's perspective and shared by
/// every connection task, so implementations must be immutable or internally
/// synchronized.
#[async_trait::async_trait]
pub trait CredentialBackend: Send + Sync {
    /// `true` when the pair matches a known user. An unknown username is a
    /// plain `false`, never an error.
    async fn authenticate(&self, username: &str, password: &str) -> bool;
}

/// Exact string match against a preconfigured username -> password table.
#[derive(Debug, Default, Clone)]
pub struct StaticBackend {
    users: HashMap<String, String>,
}

impl StaticBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.users.insert(username.into(), password.into());
        self
    }
}

impl FromIterator<(String, String)> for StaticBackend {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        StaticBackend {
            users: iter.into_iter().collect(),
        }
    }
}

#[async_trait::async_trait]
impl CredentialBackend for StaticBackend {
    async fn authenticate(&self, username: &str, password: &str) -> bool {
        self.users.get(username).map(String::as_str) == Some(password)
    }
}

/// A user table persisted as a `username:password` flat file.
///
/// The file is read once when the backend is opened; provisioning new users
/// means rewriting the file and reopening the backend, which keeps
/// authentication lookups lock-free for every connection task.
#[derive(Debug, Clone)]
pub struct StoreBackend {
    users: HashMap<String, String>,
}

impl StoreBackend {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path).await?;
        Ok(Self::parse(&contents))
    }

    fn parse(contents: &str) -> Self {
        let users = contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| {
                line.split_once(':')
                    .map(|(user, pass)| (user.to_string(), pass.to_string()))
            })
            .collect();
        StoreBackend { users }
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

#[async_trait::async_trait]
impl CredentialBackend for StoreBackend {
    async fn authenticate(&self, username: &str, password: &str) -> bool {
        // A missing row is a failed authentication, not an error.
        self.users.get(username).map(String::as_str) == Some(password)
    }
}
