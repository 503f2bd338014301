//! Session provider seam.
//!
//! Token acquisition and refresh live outside this crate; the core only
//! needs to know whether a session exists, whose identity it carries, and
//! what credential to attach to requests.

/// Authenticated-session interface consulted by the stream transport (to
/// build the subscribe URL and gate activity) and the batch writer (to
/// attach a credential to outbound requests).
pub trait SessionProvider {
    /// A usable session exists.
    fn ready(&self) -> bool;

    /// The current credential has expired and must not be used.
    fn is_expired(&self) -> bool;

    /// Stable user identity, once known. Substituted into the subscribe
    /// path's `$uid` placeholder.
    fn user_uid(&self) -> Option<&str>;

    /// Bearer credential attached as the `auth` query parameter. `None`
    /// means requests go out unauthenticated.
    fn credential(&self) -> Option<&str>;
}

/// Fixed-token session, for tests and deployments where credentials are
/// provisioned out of band.
#[derive(Debug, Clone, Default)]
pub struct StaticSession {
    pub uid: Option<String>,
    pub token: Option<String>,
}

impl StaticSession {
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: Some(uid.into()),
            token: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

impl SessionProvider for StaticSession {
    fn ready(&self) -> bool {
        self.uid.is_some()
    }

    fn is_expired(&self) -> bool {
        false
    }

    fn user_uid(&self) -> Option<&str> {
        self.uid.as_deref()
    }

    fn credential(&self) -> Option<&str> {
        self.token.as_deref()
    }
}
