//! Long-term credential authentication
//!
//! Keys are MD5(username ":" realm ":" password). Nonces are issued per
//! client tuple and expire after a configured interval.
// Copyright 2025 Francisco F. Pinochet
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


use crate::allocation::ClientTuple;
use crate::codec::DecodedMessage;
use crate::error::AuthError;
use async_trait::async_trait;
use iceturn_config::{ConfigError, TurnConfig};
use md5::{Digest, Md5};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Long-term credential key
pub type LongTermKey = [u8; 16];

/// MD5(username ":" realm ":" password)
pub fn long_term_key(username: &str, realm: &str, password: &str) -> LongTermKey {
    let mut hasher = Md5::new();
    hasher.update(username.as_bytes());
    hasher.update(b":");
    hasher.update(realm.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    hasher.finalize().into()
}

/// Source of long-term credential keys
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Key for `username` in `realm`, or `None` if the user is unknown
    async fn lookup_key(&self, username: &str, realm: &str) -> Option<LongTermKey>;
}

/// Fixed user list with precomputed keys
#[derive(Debug, Clone)]
pub struct StaticCredentials {
    realm: String,
    keys: HashMap<String, LongTermKey>,
}

impl StaticCredentials {
    pub fn new<I, U, P>(realm: &str, users: I) -> Self
    where
        I: IntoIterator<Item = (U, P)>,
        U: Into<String>,
        P: AsRef<str>,
    {
        let keys = users
            .into_iter()
            .map(|(username, password)| {
                let username = username.into();
                let key = long_term_key(&username, realm, password.as_ref());
                (username, key)
            })
            .collect();
        StaticCredentials {
            realm: realm.to_string(),
            keys,
        }
    }

    /// Users from the `users` setting in the configured realm
    pub fn from_config(config: &TurnConfig) -> Result<Self, ConfigError> {
        let users = config.credentials()?;
        Ok(StaticCredentials::new(
            &config.realm,
            users.into_iter().map(|u| (u.username, u.password)),
        ))
    }

    pub fn user_count(&self) -> usize {
        self.keys.len()
    }
}

#[async_trait]
impl CredentialStore for StaticCredentials {
    async fn lookup_key(&self, username: &str, realm: &str) -> Option<LongTermKey> {
        if realm != self.realm {
            return None;
        }
        self.keys.get(username).copied()
    }
}

/// Per-client nonce cache
pub struct NonceManager {
    lifetime: Duration,
    nonces: Mutex<HashMap<ClientTuple, (String, Instant)>>,
}

impl NonceManager {
    pub fn new(lifetime: Duration) -> Self {
        NonceManager {
            lifetime,
            nonces: Mutex::new(HashMap::new()),
        }
    }

    /// Issue a fresh nonce for `client`, replacing any previous one
    pub fn issue(&self, client: &ClientTuple) -> String {
        let nonce: String = rand::random::<[u8; 16]>()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect();
        self.nonces
            .lock()
            .insert(*client, (nonce.clone(), Instant::now() + self.lifetime));
        nonce
    }

    /// True if `nonce` is the current, unexpired nonce for `client`
    pub fn validate(&self, client: &ClientTuple, nonce: &str) -> bool {
        match self.nonces.lock().get(client) {
            Some((current, expires_at)) => current == nonce && Instant::now() < *expires_at,
            None => false,
        }
    }

    pub fn forget(&self, client: &ClientTuple) {
        self.nonces.lock().remove(client);
    }

    /// Drop expired nonces, returning how many were removed
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut nonces = self.nonces.lock();
        let before = nonces.len();
        nonces.retain(|_, (_, expires_at)| *expires_at > now);
        before - nonces.len()
    }

    pub fn len(&self) -> usize {
        self.nonces.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nonces.lock().is_empty()
    }
}

/// Successful authentication
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthOk {
    /// Authenticated username
    pub username: String,
    /// Key that signs the response
    pub key: LongTermKey,
}

/// Checks the long-term credential mechanism on requests
pub struct Authenticator {
    realm: String,
    store: Arc<dyn CredentialStore>,
    nonces: NonceManager,
}

impl Authenticator {
    pub fn new(realm: impl Into<String>, store: Arc<dyn CredentialStore>, nonce_lifetime: Duration) -> Self {
        Authenticator {
            realm: realm.into(),
            store,
            nonces: NonceManager::new(nonce_lifetime),
        }
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    pub fn nonces(&self) -> &NonceManager {
        &self.nonces
    }

    /// Fresh nonce to send with a 401 or 438 challenge
    pub fn issue_nonce(&self, client: &ClientTuple) -> String {
        self.nonces.issue(client)
    }

    /// Authenticate a request from `client`
    ///
    /// Checks run in order: credentials present, realm, nonce, user,
    /// integrity.
    pub async fn authenticate(
        &self,
        request: &DecodedMessage,
        client: &ClientTuple,
    ) -> Result<AuthOk, AuthError> {
        let message = &request.message;
        let (Some(username), Some(realm), Some(nonce)) =
            (message.username(), message.realm(), message.nonce())
        else {
            return Err(AuthError::MissingCredentials);
        };
        if !request.has_integrity() {
            return Err(AuthError::MissingCredentials);
        }

        if realm != self.realm {
            return Err(AuthError::WrongRealm(realm.to_string()));
        }

        if !self.nonces.validate(client, nonce) {
            debug!(client = %client.addr, "Stale or unknown nonce");
            return Err(AuthError::StaleNonce);
        }

        let key = self
            .store
            .lookup_key(username, realm)
            .await
            .ok_or_else(|| AuthError::UnknownUser(username.to_string()))?;

        if !request.verify_integrity(&key) {
            return Err(AuthError::IntegrityMismatch(username.to_string()));
        }

        Ok(AuthOk {
            username: username.to_string(),
            key,
        })
    }
}
