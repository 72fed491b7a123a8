//! RBAC tokens and authorization.
//!
//! Tokens are `<payload_b64url>.<signature_b64url>` where the signature is
//! HMAC-SHA256 over the payload under the key named by the claims' `kid`.
//! Rotation keeps retired keys verifying through a grace period; revocation
//! tracks `jti` values. Authorization is default-deny: a request passes
//! only when one of its roles grants the permission and the token's scopes
//! (when present) cover the resource.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::{info, warn};

use hoist_core::{QueueError, QueueResult, RbacConfig};

type HmacSha256 = Hmac<Sha256>;

/// Fixed role set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Maintainer,
    Operator,
    Viewer,
}

/// Permission classes the roles map onto
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Read,
    Enqueue,
    Bench,
    /// Mutating operations short of an all-purge
    Mutate,
    /// Queue purges and other wipe-everything operations
    PurgeAll,
}

impl Role {
    /// admin: all; maintainer: mutations except all-purge; operator:
    /// read + enqueue + bench; viewer: read.
    pub fn allows(self, permission: Permission) -> bool {
        match self {
            Self::Admin => true,
            Self::Maintainer => !matches!(permission, Permission::PurgeAll),
            Self::Operator => matches!(
                permission,
                Permission::Read | Permission::Enqueue | Permission::Bench
            ),
            Self::Viewer => matches!(permission, Permission::Read),
        }
    }
}

/// Signed token claims
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    pub subject: String,
    pub roles: Vec<Role>,
    /// Resource scopes; empty means unscoped
    #[serde(default)]
    pub scopes: Vec<String>,
    pub exp: i64,
    pub nbf: i64,
    pub jti: String,
    pub kid: String,
}

/// Authenticated request context handed to handlers
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub claims: TokenClaims,
    pub request_id: String,
}

impl AuthContext {
    /// Default-deny check: some role must grant the permission, and when
    /// the token is scoped, the resource must fall under a scope.
    pub fn authorize(&self, permission: Permission, resource: &str) -> QueueResult<()> {
        let role_grants = self.claims.roles.iter().any(|r| r.allows(permission));
        if !role_grants {
            return Err(QueueError::Forbidden(format!(
                "no role grants {:?}",
                permission
            )));
        }
        if !self.claims.scopes.is_empty()
            && !self
                .claims
                .scopes
                .iter()
                .any(|scope| resource == scope || resource.starts_with(scope.as_str()))
        {
            return Err(QueueError::Forbidden(format!(
                "token not scoped for '{}'",
                resource
            )));
        }
        Ok(())
    }
}

struct SigningKey {
    secret: Vec<u8>,
    retired_at: Option<DateTime<Utc>>,
}

/// Issues and verifies tokens; owns rotation and revocation state
pub struct TokenAuthority {
    keys: RwLock<HashMap<String, SigningKey>>,
    active_kid: RwLock<String>,
    revoked: RwLock<HashSet<String>>,
    token_ttl: Duration,
    rotation_grace: Duration,
}

impl TokenAuthority {
    pub fn new(initial_kid: impl Into<String>, secret: impl Into<Vec<u8>>, config: &RbacConfig) -> Self {
        let kid = initial_kid.into();
        let mut keys = HashMap::new();
        keys.insert(
            kid.clone(),
            SigningKey {
                secret: secret.into(),
                retired_at: None,
            },
        );
        Self {
            keys: RwLock::new(keys),
            active_kid: RwLock::new(kid),
            revoked: RwLock::new(HashSet::new()),
            token_ttl: config.token_ttl,
            rotation_grace: config.rotation_grace,
        }
    }

    /// Install a new active key; the previous key keeps verifying through
    /// the grace period.
    pub fn rotate(&self, new_kid: impl Into<String>, secret: impl Into<Vec<u8>>) {
        let new_kid = new_kid.into();
        let mut keys = self.keys.write();
        let mut active = self.active_kid.write();
        if let Some(previous) = keys.get_mut(active.as_str()) {
            previous.retired_at = Some(Utc::now());
        }
        info!(kid = %new_kid, "signing key rotated");
        keys.insert(
            new_kid.clone(),
            SigningKey {
                secret: secret.into(),
                retired_at: None,
            },
        );
        *active = new_kid;
    }

    pub fn revoke(&self, jti: &str) {
        warn!(jti, "token revoked");
        self.revoked.write().insert(jti.to_string());
    }

    /// Issue a token for a subject
    pub fn issue(&self, subject: &str, roles: Vec<Role>, scopes: Vec<String>) -> QueueResult<String> {
        let now = Utc::now();
        let claims = TokenClaims {
            subject: subject.to_string(),
            roles,
            scopes,
            exp: (now + chrono::Duration::from_std(self.token_ttl).unwrap_or_else(|_| chrono::Duration::hours(1))).timestamp(),
            nbf: now.timestamp(),
            jti: uuid::Uuid::new_v4().to_string(),
            kid: self.active_kid.read().clone(),
        };
        self.sign(&claims)
    }

    pub fn sign(&self, claims: &TokenClaims) -> QueueResult<String> {
        let keys = self.keys.read();
        let key = keys
            .get(&claims.kid)
            .ok_or_else(|| QueueError::Internal(format!("unknown signing key {}", claims.kid)))?;
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims)?);
        let mut mac = HmacSha256::new_from_slice(&key.secret)
            .map_err(|e| QueueError::Internal(format!("hmac init: {}", e)))?;
        mac.update(payload.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        Ok(format!("{}.{}", payload, signature))
    }

    /// Verify a bearer token and return its claims
    pub fn verify(&self, token: &str, now: DateTime<Utc>) -> QueueResult<TokenClaims> {
        let (payload, signature) = token
            .split_once('.')
            .ok_or_else(|| QueueError::NotAuthenticated("malformed token".to_string()))?;
        let claims_bytes = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| QueueError::NotAuthenticated("malformed token".to_string()))?;
        let claims: TokenClaims = serde_json::from_slice(&claims_bytes)
            .map_err(|_| QueueError::NotAuthenticated("malformed token".to_string()))?;

        let keys = self.keys.read();
        let key = keys
            .get(&claims.kid)
            .ok_or_else(|| QueueError::NotAuthenticated("unknown signing key".to_string()))?;
        if let Some(retired_at) = key.retired_at {
            let grace = chrono::Duration::from_std(self.rotation_grace)
                .unwrap_or_else(|_| chrono::Duration::hours(24));
            if now - retired_at > grace {
                return Err(QueueError::NotAuthenticated(
                    "signing key retired".to_string(),
                ));
            }
        }

        let mut mac = HmacSha256::new_from_slice(&key.secret)
            .map_err(|e| QueueError::Internal(format!("hmac init: {}", e)))?;
        mac.update(payload.as_bytes());
        let expected = mac.finalize().into_bytes();
        let provided = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| QueueError::NotAuthenticated("malformed signature".to_string()))?;
        if provided.as_slice() != expected.as_slice() {
            return Err(QueueError::NotAuthenticated(
                "signature mismatch".to_string(),
            ));
        }

        if now.timestamp() < claims.nbf {
            return Err(QueueError::NotAuthenticated("token not yet valid".to_string()));
        }
        if now.timestamp() >= claims.exp {
            return Err(QueueError::NotAuthenticated("token expired".to_string()));
        }
        if self.revoked.read().contains(&claims.jti) {
            return Err(QueueError::NotAuthenticated("token revoked".to_string()));
        }
        Ok(claims)
    }

    /// Parse `Authorization: Bearer <token>` and verify
    pub fn authenticate_header(&self, header: Option<&str>) -> QueueResult<TokenClaims> {
        let header = header
            .ok_or_else(|| QueueError::NotAuthenticated("missing authorization".to_string()))?
            .trim();
        let token = match header.split_once(' ') {
            Some((scheme, token)) if scheme.eq_ignore_ascii_case("bearer") => token.trim(),
            _ => {
                return Err(QueueError::NotAuthenticated(
                    "expected bearer scheme".to_string(),
                ))
            }
        };
        if token.is_empty() {
            return Err(QueueError::NotAuthenticated("empty token".to_string()));
        }
        self.verify(token, Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authority() -> TokenAuthority {
        TokenAuthority::new("k1", b"secret-one".to_vec(), &RbacConfig::default())
    }

    #[test]
    fn issue_and_verify_round_trip() {
        let authority = authority();
        let token = authority
            .issue("ops@example", vec![Role::Operator], vec![])
            .unwrap();
        let claims = authority.verify(&token, Utc::now()).unwrap();
        assert_eq!(claims.subject, "ops@example");
        assert_eq!(claims.roles, vec![Role::Operator]);
    }

    #[test]
    fn tampered_payload_rejected() {
        let authority = authority();
        let token = authority.issue("a", vec![Role::Viewer], vec![]).unwrap();
        let (payload, signature) = token.split_once('.').unwrap();

        let mut claims: TokenClaims =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(payload).unwrap()).unwrap();
        claims.roles = vec![Role::Admin];
        let forged_payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims).unwrap());
        let forged = format!("{}.{}", forged_payload, signature);

        assert!(matches!(
            authority.verify(&forged, Utc::now()),
            Err(QueueError::NotAuthenticated(_))
        ));
    }

    #[test]
    fn expired_and_premature_tokens_rejected() {
        let authority = authority();
        let token = authority.issue("a", vec![Role::Viewer], vec![]).unwrap();
        let far_future = Utc::now() + chrono::Duration::days(30);
        assert!(authority.verify(&token, far_future).is_err());
        let past = Utc::now() - chrono::Duration::hours(1);
        assert!(authority.verify(&token, past).is_err());
    }

    #[test]
    fn revoked_jti_rejected() {
        let authority = authority();
        let token = authority.issue("a", vec![Role::Admin], vec![]).unwrap();
        let claims = authority.verify(&token, Utc::now()).unwrap();
        authority.revoke(&claims.jti);
        assert!(matches!(
            authority.verify(&token, Utc::now()),
            Err(QueueError::NotAuthenticated(_))
        ));
    }

    #[test]
    fn rotation_keeps_old_key_through_grace() {
        let authority = authority();
        let old_token = authority.issue("a", vec![Role::Viewer], vec![]).unwrap();

        authority.rotate("k2", b"secret-two".to_vec());
        // Old token still verifies inside the grace window
        assert!(authority.verify(&old_token, Utc::now()).is_ok());

        // And new tokens carry the new kid
        let new_token = authority.issue("a", vec![Role::Viewer], vec![]).unwrap();
        let claims = authority.verify(&new_token, Utc::now()).unwrap();
        assert_eq!(claims.kid, "k2");

        // Past the grace window the old key stops verifying
        let beyond = Utc::now() + chrono::Duration::days(2);
        let result = authority.verify(&old_token, beyond);
        assert!(result.is_err());
    }

    #[test]
    fn role_permission_matrix() {
        assert!(Role::Admin.allows(Permission::PurgeAll));
        assert!(Role::Maintainer.allows(Permission::Mutate));
        assert!(!Role::Maintainer.allows(Permission::PurgeAll));
        assert!(Role::Operator.allows(Permission::Enqueue));
        assert!(Role::Operator.allows(Permission::Bench));
        assert!(!Role::Operator.allows(Permission::Mutate));
        assert!(Role::Viewer.allows(Permission::Read));
        assert!(!Role::Viewer.allows(Permission::Enqueue));
    }

    #[test]
    fn scoped_tokens_deny_outside_resources() {
        let authority = authority();
        let token = authority
            .issue(
                "a",
                vec![Role::Operator],
                vec!["queues/payments".to_string()],
            )
            .unwrap();
        let claims = authority.verify(&token, Utc::now()).unwrap();
        let ctx = AuthContext {
            claims,
            request_id: "r".to_string(),
        };
        assert!(ctx.authorize(Permission::Read, "queues/payments").is_ok());
        assert!(ctx.authorize(Permission::Read, "queues/other").is_err());
    }

    #[test]
    fn bearer_header_parsing() {
        let authority = authority();
        let token = authority.issue("a", vec![Role::Viewer], vec![]).unwrap();
        assert!(authority
            .authenticate_header(Some(&format!("Bearer {}", token)))
            .is_ok());
        assert!(authority
            .authenticate_header(Some(&format!("bearer {}", token)))
            .is_ok());
        assert!(authority.authenticate_header(None).is_err());
        assert!(authority.authenticate_header(Some("Basic abc")).is_err());
    }
}
