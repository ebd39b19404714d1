// Session tokens and credential verification
//
// Stands in for the authentication collaborator: a login exchange issues an
// opaque token, and the gateway exchanges that token for an authenticated
// user id at connect time.

use crate::chatserver::error::{ChatError, ChatResult};
use crate::chatserver::store::ChatStore;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Issues, resolves, and revokes session tokens.
pub struct SessionManager {
    store: Arc<ChatStore>,
    sessions: RwLock<HashMap<String, i64>>,
}

impl SessionManager {
    pub fn new(store: Arc<ChatStore>) -> Self {
        Self {
            store,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Verify credentials and issue a fresh session token.
    pub async fn login(&self, username: &str, password: &str) -> ChatResult<(i64, String)> {
        let user = self
            .store
            .get_user_by_name(username)?
            .ok_or(ChatError::Unauthenticated)?;

        if !verify_password(password, &user.password_hash) {
            return Err(ChatError::Unauthenticated);
        }

        let token = generate_session_token();
        let mut sessions = self.sessions.write().await;
        sessions.insert(token.clone(), user.id);

        Ok((user.id, token))
    }

    /// Register a new user and log them in.
    pub async fn register(&self, username: &str, password: &str) -> ChatResult<(i64, String)> {
        let user = self.store.create_user(username, &hash_password(password))?;

        let token = generate_session_token();
        let mut sessions = self.sessions.write().await;
        sessions.insert(token.clone(), user.id);

        Ok((user.id, token))
    }

    /// The authenticated identity behind a token, if the session is live.
    pub async fn resolve(&self, token: &str) -> Option<i64> {
        let sessions = self.sessions.read().await;
        sessions.get(token).copied()
    }

    pub async fn revoke(&self, token: &str) {
        let mut sessions = self.sessions.write().await;
        sessions.remove(token);
    }
}

/// Salted SHA-256 credential hash, stored as `salt$digest` hex.
pub fn hash_password(password: &str) -> String {
    use rand::RngCore;

    let mut salt = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut salt);

    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    let digest = hasher.finalize();

    format!("{}${}", hex::encode(salt), hex::encode(digest))
}

pub fn verify_password(password: &str, stored: &str) -> bool {
    let Some((salt_hex, digest_hex)) = stored.split_once('$') else {
        return false;
    };
    let Ok(salt) = hex::decode(salt_hex) else {
        return false;
    };

    let mut hasher = Sha256::new();
    hasher.update(&salt);
    hasher.update(password.as_bytes());

    hex::encode(hasher.finalize()) == digest_hex
}

/// Generate an opaque session token.
fn generate_session_token() -> String {
    use rand::Rng;
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    const TOKEN_LEN: usize = 32;

    let mut rng = rand::thread_rng();
    (0..TOKEN_LEN)
        .map(|_| {
            let idx = rng.gen_range(0..CHARSET.len());
            CHARSET[idx] as char
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_password_roundtrip() {
        let stored = hash_password("secret");
        assert!(verify_password("secret", &stored));
        assert!(!verify_password("wrong", &stored));
        assert!(!verify_password("secret", "garbage"));

        // Fresh salt per hash
        assert_ne!(stored, hash_password("secret"));
    }

    #[test]
    fn test_token_shape() {
        let token = generate_session_token();
        assert_eq!(token.len(), 32);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[tokio::test]
    async fn test_login_and_resolve() {
        let dir = tempdir().unwrap();
        let store = Arc::new(ChatStore::new(dir.path()).unwrap());
        let sessions = SessionManager::new(store.clone());

        let (user_id, token) = sessions.register("alice", "secret").await.unwrap();
        assert_eq!(sessions.resolve(&token).await, Some(user_id));

        let (again, second_token) = sessions.login("alice", "secret").await.unwrap();
        assert_eq!(again, user_id);
        assert_ne!(token, second_token);

        assert!(matches!(
            sessions.login("alice", "wrong").await,
            Err(ChatError::Unauthenticated)
        ));
        assert!(matches!(
            sessions.login("nobody", "secret").await,
            Err(ChatError::Unauthenticated)
        ));

        sessions.revoke(&token).await;
        assert_eq!(sessions.resolve(&token).await, None);
    }
}
