use std::fmt;

use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;
use zeroize::Zeroizing;

/// Prefix carried by every issued token value.
pub const TOKEN_PREFIX: &str = "tkd_";

const MAX_IDENTITY_LEN: usize = 128;

// ── Identity ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("identity must not be empty")]
    Empty,
    #[error("identity exceeds 128 characters")]
    TooLong,
    #[error("identity must not start with '.'")]
    LeadingDot,
    #[error("identity contains invalid character {0:?}")]
    InvalidChar(char),
}

/// The principal a token is issued to.
///
/// Identities double as on-disk file names, so only `[A-Za-z0-9._@-]` is
/// accepted and a leading dot is refused.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identity(String);

impl Identity {
    pub fn parse(raw: impl Into<String>) -> Result<Self, IdentityError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(IdentityError::Empty);
        }
        if raw.chars().count() > MAX_IDENTITY_LEN {
            return Err(IdentityError::TooLong);
        }
        if raw.starts_with('.') {
            return Err(IdentityError::LeadingDot);
        }
        if let Some(c) = raw
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '@')))
        {
            return Err(IdentityError::InvalidChar(c));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Identity {
    type Error = IdentityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<Identity> for String {
    fn from(value: Identity) -> Self {
        value.0
    }
}

// ── Secret ───────────────────────────────────────────────────

/// A freshly generated token value. Only ever handed out once, at issuance.
///
/// The buffer is wiped on drop and `Debug` never prints it.
pub struct TokenSecret(Zeroizing<String>);

impl TokenSecret {
    /// 32 bytes from the OS RNG, hex encoded behind [`TOKEN_PREFIX`].
    pub fn generate() -> Self {
        let mut bytes = Zeroizing::new([0u8; 32]);
        OsRng.fill_bytes(&mut *bytes);
        Self(Zeroizing::new(format!("{}{}", TOKEN_PREFIX, hex::encode(&bytes[..]))))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn digest(&self) -> String {
        digest_value(&self.0)
    }
}

impl fmt::Debug for TokenSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TokenSecret(****)")
    }
}

/// Hex SHA-256 of a presented token value.
pub fn digest_value(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

// ── Record ───────────────────────────────────────────────────

/// A persisted credential entry bound to an identity.
///
/// Only the digest of the value is stored; the value itself is returned to
/// the caller once and then forgotten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub identity: Identity,
    pub value_digest: String,
    pub issued_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub revoked: bool,
    #[serde(default)]
    pub revoked_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub renewed_at: Option<DateTime<Utc>>,
}

impl TokenRecord {
    pub fn new(
        identity: Identity,
        secret: &TokenSecret,
        issued_at: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            identity,
            value_digest: secret.digest(),
            issued_at,
            expires_at,
            revoked: false,
            revoked_at: None,
            renewed_at: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }

    /// Neither revoked nor expired.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        !self.revoked && !self.is_expired(now)
    }

    /// Constant-time comparison of the presented value against the stored digest.
    pub fn matches(&self, presented: &str) -> bool {
        let presented = digest_value(presented);
        presented
            .as_bytes()
            .ct_eq(self.value_digest.as_bytes())
            .into()
    }

    /// When the record stopped being usable, if it has.
    pub fn dead_since(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.revoked {
            return Some(self.revoked_at.unwrap_or(self.issued_at));
        }
        self.expires_at.filter(|exp| *exp <= now)
    }

    pub fn state(&self, now: DateTime<Utc>) -> TokenState {
        if self.revoked {
            TokenState::Revoked
        } else if self.is_expired(now) {
            TokenState::Expired
        } else {
            TokenState::Active
        }
    }
}

/// A newly issued token: the persisted record plus its one-time secret.
#[derive(Debug)]
pub struct IssuedToken {
    pub record: TokenRecord,
    pub value: TokenSecret,
}

// ── Status ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenState {
    Active,
    Expired,
    Revoked,
}

/// Value-free view of a record, safe to return from any endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenStatus {
    pub identity: Identity,
    pub state: TokenState,
    pub issued_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub renewed_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    /// Seconds until expiry; `None` for non-expiring tokens, clamped at zero.
    pub remaining_secs: Option<i64>,
    /// Active but inside the renewal margin (or already dead).
    pub needs_renewal: bool,
}

impl TokenStatus {
    pub fn from_record(
        record: &TokenRecord,
        now: DateTime<Utc>,
        renewal_margin: chrono::Duration,
    ) -> Self {
        let state = record.state(now);
        let remaining = record.expires_at.map(|exp| exp - now);
        let needs_renewal = match state {
            TokenState::Active => remaining.is_some_and(|r| r <= renewal_margin),
            TokenState::Expired | TokenState::Revoked => true,
        };

        Self {
            identity: record.identity.clone(),
            state,
            issued_at: record.issued_at,
            expires_at: record.expires_at,
            renewed_at: record.renewed_at,
            revoked_at: record.revoked_at,
            remaining_secs: remaining.map(|r| r.num_seconds().max(0)),
            needs_renewal,
        }
    }
}
