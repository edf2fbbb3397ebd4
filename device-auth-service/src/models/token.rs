//! Opaque device-bound tokens.
//!
//! The three token classes differ only in lifetime and ability set, so they
//! share one tagged record type. Tokens are registry-backed rather than
//! self-contained: supersession must invalidate the old pair instantly,
//! which a stateless format cannot do.

use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::FromRow;
use uuid::Uuid;

pub const ABILITY_ALL: &str = "*";
pub const ABILITY_REFRESH: &str = "refresh";
pub const ABILITY_LIMITED: &str = "limited";

/// Token class discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    Access,
    Refresh,
    LongTerm,
}

impl TokenKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenKind::Access => "access",
            TokenKind::Refresh => "refresh",
            TokenKind::LongTerm => "long_term",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "access" => Some(TokenKind::Access),
            "refresh" => Some(TokenKind::Refresh),
            "long_term" => Some(TokenKind::LongTerm),
            _ => None,
        }
    }

    /// Ability set granted to freshly minted tokens of this class.
    pub fn abilities(&self) -> Vec<String> {
        match self {
            TokenKind::Access => vec![ABILITY_ALL.to_string()],
            TokenKind::Refresh => vec![ABILITY_REFRESH.to_string()],
            TokenKind::LongTerm => vec![ABILITY_LIMITED.to_string()],
        }
    }
}

/// One stored token of any class.
#[derive(Debug, Clone, FromRow)]
pub struct AuthToken {
    pub token_id: Uuid,
    pub user_id: Uuid,
    pub device_id: String,
    /// SHA-256 hash of the secret half of the wire token.
    pub token_hash: String,
    pub kind: String,
    pub abilities: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub revoked: bool,
}

impl AuthToken {
    /// Mint a token of the given class. Returns the record and the plaintext
    /// wire token (`{token_id}|{secret}`), which is never stored.
    pub fn mint(
        user_id: Uuid,
        device_id: String,
        kind: TokenKind,
        lifetime: Duration,
    ) -> (Self, String) {
        let token_id = Uuid::new_v4();
        let secret = random_token_secret();
        let now = Utc::now();

        let token = Self {
            token_id,
            user_id,
            device_id,
            token_hash: Self::hash_secret(&secret),
            kind: kind.as_str().to_string(),
            abilities: kind.abilities(),
            created_at: now,
            expires_at: now + lifetime,
            last_used_at: None,
            revoked: false,
        };

        (token, format!("{}|{}", token_id, secret))
    }

    /// Split a wire token into its id and secret halves.
    pub fn parse_wire(token: &str) -> Option<(Uuid, &str)> {
        let (id, secret) = token.split_once('|')?;
        let token_id = Uuid::parse_str(id).ok()?;
        if secret.is_empty() {
            return None;
        }
        Some((token_id, secret))
    }

    /// Hash a token secret using SHA-256.
    pub fn hash_secret(secret: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(secret.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn kind(&self) -> Option<TokenKind> {
        TokenKind::parse(&self.kind)
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Not expired and not revoked.
    pub fn is_valid(&self) -> bool {
        !self.is_expired() && !self.revoked
    }

    /// True when the token grants the ability, directly or via `*`.
    pub fn can(&self, ability: &str) -> bool {
        self.abilities
            .iter()
            .any(|a| a == ABILITY_ALL || a == ability)
    }
}

/// Rotation policy: rotation is due once elapsed lifetime / total lifetime
/// reaches the threshold. Pure function of the token timestamps; callers
/// decide whether to act.
pub fn should_rotate(
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    threshold: f64,
    now: DateTime<Utc>,
) -> bool {
    let total = (expires_at - created_at).num_milliseconds();
    if total <= 0 {
        return true;
    }
    let elapsed = (now - created_at).num_milliseconds();
    elapsed as f64 / total as f64 >= threshold
}

fn random_token_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mint_produces_parseable_wire_token() {
        let (token, wire) = AuthToken::mint(
            Uuid::new_v4(),
            "dev-abc1234567".to_string(),
            TokenKind::Access,
            Duration::minutes(15),
        );

        let (id, secret) = AuthToken::parse_wire(&wire).unwrap();
        assert_eq!(id, token.token_id);
        assert_eq!(AuthToken::hash_secret(secret), token.token_hash);
        assert_eq!(token.abilities, vec![ABILITY_ALL.to_string()]);
        assert!(token.is_valid());
    }

    #[test]
    fn parse_wire_rejects_malformed_tokens() {
        assert!(AuthToken::parse_wire("no-separator").is_none());
        assert!(AuthToken::parse_wire("not-a-uuid|secret").is_none());
        assert!(AuthToken::parse_wire(&format!("{}|", Uuid::new_v4())).is_none());
    }

    #[test]
    fn abilities_per_kind() {
        let (access, _) = AuthToken::mint(
            Uuid::new_v4(),
            "dev-abc1234567".into(),
            TokenKind::Access,
            Duration::minutes(15),
        );
        let (refresh, _) = AuthToken::mint(
            Uuid::new_v4(),
            "dev-abc1234567".into(),
            TokenKind::Refresh,
            Duration::hours(24),
        );
        let (long_term, _) = AuthToken::mint(
            Uuid::new_v4(),
            "dev-abc1234567".into(),
            TokenKind::LongTerm,
            Duration::days(30),
        );

        assert!(access.can("refresh"));
        assert!(access.can("anything"));
        assert!(refresh.can("refresh"));
        assert!(!refresh.can("anything"));
        assert!(long_term.can("limited"));
        assert!(!long_term.can("refresh"));
    }

    #[test]
    fn expired_or_revoked_tokens_are_invalid() {
        let (mut token, _) = AuthToken::mint(
            Uuid::new_v4(),
            "dev-abc1234567".into(),
            TokenKind::Access,
            Duration::minutes(15),
        );
        assert!(token.is_valid());

        token.expires_at = Utc::now() - Duration::seconds(1);
        assert!(token.is_expired());
        assert!(!token.is_valid());

        token.expires_at = Utc::now() + Duration::minutes(5);
        token.revoked = true;
        assert!(!token.is_valid());
    }

    #[test]
    fn rotation_threshold_boundaries() {
        let created = Utc::now();
        let expires = created + Duration::seconds(1000);

        // 79% elapsed: below the 0.8 threshold
        assert!(!should_rotate(
            created,
            expires,
            0.8,
            created + Duration::seconds(790)
        ));
        // 81% elapsed: due
        assert!(should_rotate(
            created,
            expires,
            0.8,
            created + Duration::seconds(810)
        ));
        // Past expiry is always due
        assert!(should_rotate(
            created,
            expires,
            0.8,
            created + Duration::seconds(2000)
        ));
    }
}
