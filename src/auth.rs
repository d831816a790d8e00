use std::collections::HashMap;

use async_trait::async_trait;
use axum::http::HeaderMap;
use sha2::{Digest, Sha256};
use sqlx::{PgPool, Row};
use tracing::warn;

use crate::{
    error::{ChatError, ChatResult},
    types::{CustomerDetails, Role},
};

/// Who is on the other end of a bearer credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub role: Role,
    pub display_name: String,
    pub email: String,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, role: Role) -> Self {
        Self {
            user_id: user_id.into(),
            role,
            display_name: String::new(),
            email: String::new(),
        }
    }

    pub fn customer_details(&self) -> CustomerDetails {
        CustomerDetails {
            customer_id: self.user_id.clone(),
            name: self.display_name.clone(),
            email: self.email.clone(),
        }
    }
}

#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve(&self, token: &str) -> ChatResult<Option<Identity>>;
}

pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let header = headers.get("authorization")?.to_str().ok()?;
    let token = header.strip_prefix("Bearer ")?;
    let token = token.trim();
    (!token.is_empty()).then(|| token.to_string())
}

pub fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// Resolves tokens against the session issuer's `auth_tokens` table.
/// Only digests are stored there.
pub struct PgIdentityResolver {
    db: PgPool,
}

impl PgIdentityResolver {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl IdentityResolver for PgIdentityResolver {
    async fn resolve(&self, token: &str) -> ChatResult<Option<Identity>> {
        let row = sqlx::query(
            "SELECT u.id, u.role, u.display_name, u.email FROM auth_tokens t JOIN users u ON u.id = t.user_id WHERE t.token_sha256 = $1",
        )
        .bind(sha256_hex(token))
        .fetch_optional(&self.db)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let role_raw: String = row.get("role");
        let role = match role_raw.parse::<Role>() {
            Ok(role) => role,
            Err(_) => {
                warn!(role = %role_raw, "auth token resolved to an unknown role");
                return Ok(None);
            }
        };

        Ok(Some(Identity {
            user_id: row.get("id"),
            role,
            display_name: row
                .get::<Option<String>, _>("display_name")
                .unwrap_or_default(),
            email: row.get::<Option<String>, _>("email").unwrap_or_default(),
        }))
    }
}

/// Fixed token table, for local runs and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentityResolver {
    tokens: HashMap<String, Identity>,
}

impl StaticIdentityResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, token: impl Into<String>, identity: Identity) -> Self {
        self.tokens.insert(token.into(), identity);
        self
    }

    /// Parses `token:userId:role[:name[:email]]` entries separated by commas.
    pub fn parse(entries: &str) -> ChatResult<Self> {
        let mut resolver = Self::new();
        for entry in entries.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let parts = entry.splitn(5, ':').collect::<Vec<_>>();
            if parts.len() < 3 || parts[0].is_empty() || parts[1].is_empty() {
                return Err(ChatError::validation(format!(
                    "malformed static token entry `{entry}`"
                )));
            }
            let mut identity = Identity::new(parts[1], parts[2].parse::<Role>()?);
            identity.display_name = parts.get(3).copied().unwrap_or_default().to_string();
            identity.email = parts.get(4).copied().unwrap_or_default().to_string();
            resolver.tokens.insert(parts[0].to_string(), identity);
        }
        Ok(resolver)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl IdentityResolver for StaticIdentityResolver {
    async fn resolve(&self, token: &str) -> ChatResult<Option<Identity>> {
        Ok(self.tokens.get(token).cloned())
    }
}
