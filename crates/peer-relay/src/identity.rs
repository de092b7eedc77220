use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{RelayError, RelayResult};

/// Separator joining the components of a [`DomainKey`]. Identity components may not contain it.
pub const DOMAIN_SEPARATOR: &str = "_.";

/// A remote endpoint on the relay: a user running a given application.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerIdentity {
    pub user: String,
    #[serde(rename = "app", alias = "application")]
    pub application: String,
}

impl PeerIdentity {
    pub fn new(user: impl Into<String>, application: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            application: application.into(),
        }
    }

    pub fn validate(&self) -> RelayResult<()> {
        validate_component("user", &self.user)?;
        validate_component("application", &self.application)
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user, self.application)
    }
}

fn validate_component(field: &str, value: &str) -> RelayResult<()> {
    if value.is_empty() {
        return Err(RelayError::InvalidIdentity(format!("{field} must not be empty")));
    }
    if value.contains(DOMAIN_SEPARATOR) {
        return Err(RelayError::InvalidIdentity(format!(
            "{field} `{value}` contains reserved separator `{DOMAIN_SEPARATOR}`"
        )));
    }
    Ok(())
}

/// Registry key for a peer, also used verbatim as the peer's virtual host name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DomainKey(String);

impl DomainKey {
    pub fn new(application: &str, user: &str, provider_domain: &str) -> Self {
        Self(format!(
            "{application}{DOMAIN_SEPARATOR}{user}{DOMAIN_SEPARATOR}{provider_domain}"
        ))
    }

    pub fn for_peer(peer: &PeerIdentity, provider_domain: &str) -> Self {
        Self::new(&peer.application, &peer.user, provider_domain)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DomainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Authenticated identity on the relay, established from an access token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessSession {
    pub user_id: String,
    pub access_token: String,
    pub source: PeerIdentity,
}

impl AccessSession {
    /// Parses a `<user>:<secret>` token. Exactly one colon is accepted.
    pub fn from_token(token: &str, application: &str) -> RelayResult<Self> {
        let mut parts = token.split(':');
        let (Some(user_id), Some(_secret), None) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(RelayError::TokenFormat);
        };
        if user_id.is_empty() {
            return Err(RelayError::TokenFormat);
        }
        Ok(Self {
            user_id: user_id.to_string(),
            access_token: token.to_string(),
            source: PeerIdentity::new(user_id, application),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn token_yields_user_id() {
        let session = AccessSession::from_token("abc:def", "chat.example").expect("valid token");
        assert_eq!(session.user_id, "abc");
        assert_eq!(session.access_token, "abc:def");
        assert_eq!(session.source, PeerIdentity::new("abc", "chat.example"));
    }

    #[test]
    fn token_requires_exactly_one_colon() {
        for token in ["abc", "a:b:c", ":def", ""] {
            assert_eq!(
                AccessSession::from_token(token, "app"),
                Err(RelayError::TokenFormat),
                "token {token:?}"
            );
        }
    }

    #[test]
    fn domain_key_layout() {
        let key = DomainKey::new("chat.example", "bob", "relay.example.com.8443");
        assert_eq!(key.as_str(), "chat.example_.bob_.relay.example.com.8443");
    }

    #[test]
    fn domain_key_is_injective_over_separator_free_triples() {
        let parts = ["a", "a_", "_a", ".a", "a.", "a_b", "b", "_", "."];
        let providers = ["p", "p.q", "_p"];
        let mut seen = HashSet::new();
        let mut triples = 0;
        for app in parts {
            for user in parts {
                for provider in providers {
                    let peer = PeerIdentity::new(user, app);
                    if peer.validate().is_err() {
                        continue;
                    }
                    triples += 1;
                    assert!(
                        seen.insert(DomainKey::for_peer(&peer, provider)),
                        "collision for ({app}, {user}, {provider})"
                    );
                }
            }
        }
        assert_eq!(seen.len(), triples);
    }

    #[test]
    fn identity_rejects_reserved_separator() {
        assert!(PeerIdentity::new("bob_.evil", "app").validate().is_err());
        assert!(PeerIdentity::new("bob", "").validate().is_err());
        assert!(PeerIdentity::new("bob", "app.example").validate().is_ok());
    }

    #[test]
    fn identity_accepts_either_application_field() {
        let short: PeerIdentity =
            serde_json::from_str(r#"{"user":"bob","app":"chat"}"#).expect("app field");
        let long: PeerIdentity =
            serde_json::from_str(r#"{"user":"bob","application":"chat"}"#).expect("long field");
        assert_eq!(short, long);
        assert_eq!(
            serde_json::to_value(&short).expect("serialize"),
            serde_json::json!({"user": "bob", "app": "chat"})
        );
    }
}
