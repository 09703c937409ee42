//! Caller identity resolution
//!
//! Credential issuance lives outside the gateway. This module only maps
//! presented credentials to an opaque [`UserId`] and decides whether a
//! caller holds a service key.

use crate::proxy::headers::{AUTHORIZATION, BEARER_PREFIX, X_API_KEY};
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use http::HeaderMap;
use nutype::nutype;
use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use tracing::warn;

/// Opaque identifier of an end user
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 256),
    derive(Clone, Debug, Display, PartialEq, Eq, Hash, Serialize, Deserialize, AsRef)
)]
pub struct UserId(String);

/// Capability to identify callers from request headers
pub trait IdentityResolver: Send + Sync {
    /// The end user behind the request, if any credential maps to one
    fn resolve(&self, headers: &HeaderMap) -> Option<UserId>;

    /// Whether the request carries a service (privileged) credential
    fn is_service_caller(&self, headers: &HeaderMap) -> bool;
}

/// Who is calling, as established by the identity middleware
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CallerIdentity {
    pub user: Option<UserId>,
    pub service: bool,
}

impl CallerIdentity {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn user(user: UserId) -> Self {
        Self {
            user: Some(user),
            service: false,
        }
    }

    pub fn service() -> Self {
        Self {
            user: None,
            service: true,
        }
    }
}

impl<S: Send + Sync> FromRequestParts<S> for CallerIdentity {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(parts
            .extensions
            .get::<CallerIdentity>()
            .cloned()
            .unwrap_or_default())
    }
}

/// Static credential tables: bearer token → user, plus accepted service keys
#[derive(Clone, Debug, Default)]
pub struct TokenIdentityResolver {
    user_tokens: HashMap<String, UserId>,
    service_keys: HashSet<String>,
}

impl TokenIdentityResolver {
    /// Build from raw tables; entries whose user id is blank are skipped
    pub fn new(
        user_tokens: impl IntoIterator<Item = (String, String)>,
        service_keys: impl IntoIterator<Item = String>,
    ) -> Self {
        let user_tokens = user_tokens
            .into_iter()
            .filter_map(|(token, user)| match UserId::try_new(user) {
                Ok(user) => Some((token, user)),
                Err(e) => {
                    warn!(error = %e, "Ignoring bearer token mapped to an invalid user id");
                    None
                }
            })
            .collect();

        Self {
            user_tokens,
            service_keys: service_keys
                .into_iter()
                .filter(|key| !key.trim().is_empty())
                .collect(),
        }
    }
}

impl IdentityResolver for TokenIdentityResolver {
    fn resolve(&self, headers: &HeaderMap) -> Option<UserId> {
        let token = headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix(BEARER_PREFIX))
            .map(str::trim)?;
        self.user_tokens.get(token).cloned()
    }

    fn is_service_caller(&self, headers: &HeaderMap) -> bool {
        headers
            .get(X_API_KEY)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|key| self.service_keys.contains(key.trim()))
    }
}
