//! Authentication and authorization for MQTT clients.

use std::collections::HashMap;
use std::net::SocketAddr;

use serde::Deserialize;

use crate::types::ConnectReturnCode;

/// Why the authenticator refused a request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// The client identifier is not known.
    #[error("client not authorized")]
    ClientUnauthorized,
    /// The client is known but the username or password is wrong.
    #[error("bad username or password")]
    CredentialsInvalid,
    /// An ACL rule denied the action.
    #[error("denied: {0}")]
    Denied(String),
}

impl AuthError {
    /// CONNACK code reported for a refused CONNECT.
    pub fn connect_return_code(&self) -> ConnectReturnCode {
        match self {
            AuthError::ClientUnauthorized => ConnectReturnCode::NotAuthorized,
            AuthError::CredentialsInvalid | AuthError::Denied(_) => {
                ConnectReturnCode::BadUsernamePassword
            }
        }
    }
}

/// Action checked by [`Authenticator::authorize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Publish,
    Subscribe,
}

/// Authentication and authorization for MQTT clients.
pub trait Authenticator: Send + Sync {
    /// Authenticate a client connection.
    ///
    /// Called when a client sends CONNECT packet.
    fn authenticate(
        &self,
        client_id: &str,
        username: &str,
        password: &[u8],
    ) -> Result<(), AuthError>;

    /// Check ACL permissions.
    ///
    /// Called for every inbound PUBLISH (with its topic name) and every
    /// SUBSCRIBE filter.
    fn authorize(
        &self,
        action: Action,
        client_id: &str,
        username: &str,
        remote_addr: &SocketAddr,
        topic: &str,
    ) -> Result<(), AuthError>;
}

/// Allow-all authenticator (default).
#[derive(Debug, Default, Clone)]
pub struct AllowAll;

impl Authenticator for AllowAll {
    fn authenticate(&self, _client_id: &str, _username: &str, _password: &[u8]) -> Result<(), AuthError> {
        Ok(())
    }

    fn authorize(
        &self,
        _action: Action,
        _client_id: &str,
        _username: &str,
        _remote_addr: &SocketAddr,
        _topic: &str,
    ) -> Result<(), AuthError> {
        Ok(())
    }
}

/// Credentials for one client in a [`StaticAuthenticator`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Credential {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

/// Fixed credential table keyed by client identifier.
///
/// Loaded from YAML such as:
///
/// ```yaml
/// clients:
///   sensor-1:
///     username: alice
///     password: s3cret
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StaticAuthenticator {
    #[serde(default)]
    clients: HashMap<String, Credential>,
}

impl StaticAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a client entry.
    pub fn with_client(
        mut self,
        client_id: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.clients.insert(
            client_id.into(),
            Credential { username: username.into(), password: password.into() },
        );
        self
    }

    /// Parse a YAML credential table.
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

impl Authenticator for StaticAuthenticator {
    fn authenticate(&self, client_id: &str, username: &str, password: &[u8]) -> Result<(), AuthError> {
        let credential = self.clients.get(client_id).ok_or(AuthError::ClientUnauthorized)?;
        if credential.username != username || credential.password.as_bytes() != password {
            return Err(AuthError::CredentialsInvalid);
        }
        Ok(())
    }

    fn authorize(
        &self,
        _action: Action,
        client_id: &str,
        _username: &str,
        _remote_addr: &SocketAddr,
        _topic: &str,
    ) -> Result<(), AuthError> {
        if self.clients.contains_key(client_id) {
            Ok(())
        } else {
            Err(AuthError::Denied(format!("unknown client {client_id}")))
        }
    }
}
