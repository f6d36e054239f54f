use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tracing;

use crate::error::SyncError;
use crate::types::{Identity, Role, UserId};

/// JWT claims carried by a session token
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub role: String,
    pub exp: usize,
}

/// Mint a session token for an identity
pub fn issue_token(identity: &Identity, secret: &str, expires_in_secs: u64) -> Result<String, SyncError> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| SyncError::Auth)?
        .as_secs();

    let claims = Claims {
        sub: identity.id.to_string(),
        role: identity.role.as_str().to_string(),
        exp: (now + expires_in_secs) as usize,
    };

    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_ref())).map_err(|e| {
        tracing::error!("Failed to issue session token: {}", e);
        SyncError::Auth
    })
}

/// Verify a session token and extract the identity it binds
pub fn identity_from_token(token: &str, secret: &str) -> Result<Identity, SyncError> {
    let token = token.trim();
    let token = token.strip_prefix("Bearer ").unwrap_or(token);

    let data = decode::<Claims>(token, &DecodingKey::from_secret(secret.as_ref()), &Validation::default())
        .map_err(|e| {
            tracing::debug!("Session token verification failed: {}", e);
            SyncError::Auth
        })?;

    let role = Role::parse(&data.claims.role).ok_or_else(|| {
        tracing::debug!("Session token carries unknown role: {}", data.claims.role);
        SyncError::Auth
    })?;

    Ok(Identity {
        id: UserId(data.claims.sub),
        role,
    })
}

/// Current identity of the session plus change notification.
///
/// Cloning shares the same binding.
#[derive(Clone)]
pub struct SessionBinding {
    tx: watch::Sender<Option<Identity>>,
}

impl Default for SessionBinding {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionBinding {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    pub fn bind(&self, identity: Identity) {
        let changed = self.tx.send_if_modified(|current| {
            if current.as_ref() == Some(&identity) {
                return false;
            }
            *current = Some(identity.clone());
            true
        });
        if changed {
            tracing::info!("Session bound to {} ({})", identity.id, identity.role);
        }
    }

    pub fn unbind(&self) {
        let changed = self.tx.send_if_modified(|current| current.take().is_some());
        if changed {
            tracing::info!("Session unbound");
        }
    }

    pub fn current(&self) -> Option<Identity> {
        self.tx.borrow().clone()
    }

    /// Receiver that wakes on every identity transition.
    pub fn subscribe(&self) -> watch::Receiver<Option<Identity>> {
        self.tx.subscribe()
    }
}
