//! Pluggable SASL authentication performed during the connection handshake.

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};

/// Type to represent an authentication error message.
pub type AuthError = String;

/// One authentication exchange with a single server.
#[async_trait]
pub trait AuthenticatorSession: Send + Sync {
    /// Answers an AUTH_CHALLENGE. The token format is specific to the
    /// server's authenticator and may be absent.
    async fn evaluate_challenge(
        &mut self,
        token: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>, AuthError>;

    /// Called on AUTH_SUCCESS with the server's final token, if any.
    async fn success(&mut self, token: Option<&[u8]>) -> Result<(), AuthError>;
}

/// Factory of [`AuthenticatorSession`]s, one per connection handshake.
///
/// Set it with `ConnectionConfig::with_authenticator`. Without a provider,
/// a server that answers STARTUP with AUTHENTICATE fails the handshake.
#[async_trait]
pub trait AuthenticatorProvider: Sync + Send {
    /// Returns the initial response for the server's authenticator
    /// together with the session that will handle further challenges.
    async fn start_authentication_session(
        &self,
        authenticator_name: &str,
    ) -> Result<(Option<Vec<u8>>, Box<dyn AuthenticatorSession>), AuthError>;
}

struct PlainTextAuthenticatorSession;

#[async_trait]
impl AuthenticatorSession for PlainTextAuthenticatorSession {
    async fn evaluate_challenge(
        &mut self,
        _token: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>, AuthError> {
        Err("Challenges are not expected during PlainTextAuthentication".to_string())
    }

    async fn success(&mut self, _token: Option<&[u8]>) -> Result<(), AuthError> {
        Ok(())
    }
}

/// SASL PLAIN authenticator, accepted by `PasswordAuthenticator`
/// and `DseAuthenticator` with internal authentication.
pub struct PlainTextAuthenticator {
    username: String,
    password: String,
}

impl PlainTextAuthenticator {
    /// Creates new [`PlainTextAuthenticator`] instance with provided username and password.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        PlainTextAuthenticator {
            username: username.into(),
            password: password.into(),
        }
    }

    fn initial_response(&self) -> Vec<u8> {
        let mut response = BytesMut::with_capacity(self.username.len() + self.password.len() + 2);
        response.put_u8(0);
        response.put_slice(self.username.as_bytes());
        response.put_u8(0);
        response.put_slice(self.password.as_bytes());
        response.to_vec()
    }
}

impl std::fmt::Debug for PlainTextAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlainTextAuthenticator")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl AuthenticatorProvider for PlainTextAuthenticator {
    async fn start_authentication_session(
        &self,
        _authenticator_name: &str,
    ) -> Result<(Option<Vec<u8>>, Box<dyn AuthenticatorSession>), AuthError> {
        Ok((
            Some(self.initial_response()),
            Box::new(PlainTextAuthenticatorSession),
        ))
    }
}
