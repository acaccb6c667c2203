//! Client identity resolution.
//!
//! The resolver walks an ordered strategy chain and always produces an identity:
//! an authenticated user, else the caller's public address, else a locally
//! persisted session token. The same person is therefore keyed differently before
//! and after logging in; admission state does not migrate across that switch.

use std::fmt;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use rand::Rng;

use crate::error::{Collaborator, CollaboratorError, StoreError};
use crate::timeout::CallTimeout;

/// Who is calling.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ClientIdentity {
    User(String),
    NetworkAddress(String),
    SessionToken(String),
}

impl ClientIdentity {
    /// The key all rate and ban state is tracked under.
    pub fn key(&self) -> String {
        match self {
            ClientIdentity::User(id) => format!("user_{id}"),
            ClientIdentity::NetworkAddress(addr) => addr.clone(),
            ClientIdentity::SessionToken(token) => format!("session_{token}"),
        }
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Authenticated-session collaborator.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn current_user_id(&self) -> Result<Option<String>, StoreError>;
}

/// Best-effort public address lookup.
#[async_trait]
pub trait AddressLookup: Send + Sync {
    async fn resolve_public_address(&self) -> Result<String, StoreError>;
}

/// Locally persisted session token; infallible.
pub trait SessionTokenStore: Send + Sync {
    fn get_or_create(&self) -> String;
}

/// Generates one random 128-bit token on first use and keeps it for the life of
/// the store.
#[derive(Debug, Default)]
pub struct InMemorySessionTokens {
    token: OnceLock<String>,
}

impl InMemorySessionTokens {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionTokenStore for InMemorySessionTokens {
    fn get_or_create(&self) -> String {
        self.token
            .get_or_init(|| {
                let mut bytes = [0u8; 16];
                rand::rng().fill(&mut bytes);
                bytes.iter().map(|b| format!("{b:02x}")).collect()
            })
            .clone()
    }
}

/// Fixed answer, for tests and single-user tools.
#[derive(Debug, Clone, Default)]
pub struct StaticSessionProvider(pub Option<String>);

#[async_trait]
impl SessionProvider for StaticSessionProvider {
    async fn current_user_id(&self) -> Result<Option<String>, StoreError> {
        Ok(self.0.clone())
    }
}

/// Fixed answer, for tests and deployments behind a known address.
#[derive(Debug, Clone)]
pub struct StaticAddressLookup(pub String);

#[async_trait]
impl AddressLookup for StaticAddressLookup {
    async fn resolve_public_address(&self) -> Result<String, StoreError> {
        Ok(self.0.clone())
    }
}

#[derive(Clone)]
enum Strategy {
    AuthenticatedUser(Arc<dyn SessionProvider>),
    PublicAddress(Arc<dyn AddressLookup>),
}

impl Strategy {
    fn collaborator(&self) -> Collaborator {
        match self {
            Strategy::AuthenticatedUser(_) => Collaborator::SessionProvider,
            Strategy::PublicAddress(_) => Collaborator::AddressLookup,
        }
    }

    async fn resolve(&self, timeout: &CallTimeout) -> Result<Option<ClientIdentity>, CollaboratorError> {
        match self {
            Strategy::AuthenticatedUser(provider) => {
                let user = timeout.call(self.collaborator(), provider.current_user_id()).await?;
                Ok(user.filter(|id| !id.is_empty()).map(ClientIdentity::User))
            }
            Strategy::PublicAddress(lookup) => {
                let addr = timeout.call(self.collaborator(), lookup.resolve_public_address()).await?;
                let addr = addr.trim();
                Ok((!addr.is_empty()).then(|| ClientIdentity::NetworkAddress(addr.to_string())))
            }
        }
    }
}

/// The identity plus whatever went wrong on the way to it.
#[derive(Debug)]
pub struct Resolution {
    pub identity: ClientIdentity,
    pub faults: Vec<CollaboratorError>,
}

/// Ordered strategy chain ending in the session-token fallback.
#[derive(Clone)]
pub struct IdentityResolver {
    chain: Vec<Strategy>,
    tokens: Arc<dyn SessionTokenStore>,
}

impl fmt::Debug for IdentityResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let chain: Vec<_> = self.chain.iter().map(Strategy::collaborator).collect();
        f.debug_struct("IdentityResolver").field("chain", &chain).finish()
    }
}

impl Default for IdentityResolver {
    fn default() -> Self {
        Self::new(InMemorySessionTokens::new())
    }
}

impl IdentityResolver {
    /// A resolver that only knows the session-token fallback.
    pub fn new<T: SessionTokenStore + 'static>(tokens: T) -> Self {
        Self { chain: Vec::new(), tokens: Arc::new(tokens) }
    }

    /// Append an authenticated-user strategy to the chain.
    pub fn with_session_provider<P: SessionProvider + 'static>(mut self, provider: P) -> Self {
        self.chain.push(Strategy::AuthenticatedUser(Arc::new(provider)));
        self
    }

    /// Append a public-address strategy to the chain.
    pub fn with_address_lookup<L: AddressLookup + 'static>(mut self, lookup: L) -> Self {
        self.chain.push(Strategy::PublicAddress(Arc::new(lookup)));
        self
    }

    /// First strategy with an answer wins. Never fails.
    pub async fn resolve(&self, timeout: &CallTimeout) -> Resolution {
        let mut faults = Vec::new();
        for strategy in &self.chain {
            match strategy.resolve(timeout).await {
                Ok(Some(identity)) => return Resolution { identity, faults },
                Ok(None) => {}
                Err(fault) => {
                    tracing::debug!(
                        target: "gatekeeper::identity",
                        error = %fault,
                        "identity strategy failed; trying next"
                    );
                    faults.push(fault);
                }
            }
        }
        Resolution { identity: ClientIdentity::SessionToken(self.tokens.get_or_create()), faults }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct FailingLookup;

    #[async_trait]
    impl AddressLookup for FailingLookup {
        async fn resolve_public_address(&self) -> Result<String, StoreError> {
            Err("lookup service unreachable".into())
        }
    }

    fn timeout() -> CallTimeout {
        CallTimeout::new(Duration::from_millis(100)).unwrap()
    }

    #[test]
    fn keys_are_tagged() {
        assert_eq!(ClientIdentity::User("42".into()).key(), "user_42");
        assert_eq!(ClientIdentity::NetworkAddress("203.0.113.9".into()).key(), "203.0.113.9");
        assert_eq!(ClientIdentity::SessionToken("ab".into()).key(), "session_ab");
    }

    #[test]
    fn session_token_is_stable_and_random() {
        let tokens = InMemorySessionTokens::new();
        let first = tokens.get_or_create();
        assert_eq!(first.len(), 32);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(tokens.get_or_create(), first);
        assert_ne!(InMemorySessionTokens::new().get_or_create(), first);
    }

    #[tokio::test]
    async fn logged_in_user_wins() {
        let resolver = IdentityResolver::default()
            .with_session_provider(StaticSessionProvider(Some("7".into())))
            .with_address_lookup(StaticAddressLookup("198.51.100.1".into()));
        let resolution = resolver.resolve(&timeout()).await;
        assert_eq!(resolution.identity, ClientIdentity::User("7".into()));
        assert!(resolution.faults.is_empty());
    }

    #[tokio::test]
    async fn anonymous_caller_falls_back_to_address() {
        let resolver = IdentityResolver::default()
            .with_session_provider(StaticSessionProvider(None))
            .with_address_lookup(StaticAddressLookup(" 198.51.100.1 ".into()));
        let resolution = resolver.resolve(&timeout()).await;
        assert_eq!(resolution.identity.key(), "198.51.100.1");
    }

    #[tokio::test]
    async fn failed_lookup_falls_back_to_session_token() {
        let resolver = IdentityResolver::new(InMemorySessionTokens::new())
            .with_session_provider(StaticSessionProvider(Some(String::new())))
            .with_address_lookup(FailingLookup);
        let resolution = resolver.resolve(&timeout()).await;
        assert!(matches!(resolution.identity, ClientIdentity::SessionToken(_)));
        assert!(resolution.identity.key().starts_with("session_"));
        assert_eq!(resolution.faults.len(), 1);
        assert_eq!(resolution.faults[0].collaborator(), Collaborator::AddressLookup);
    }
}
