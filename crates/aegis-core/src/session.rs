//! Session bridge: persisted token state plus auth-change notification.
//!
//! The bridge answers one question for the rest of the application — "is the
//! visitor authenticated" — from locally persisted token artifacts, and tells
//! registered subscribers when the answer changes. No cryptographic
//! verification happens here; a present, non-expired identity token counts as
//! authenticated and real verification is the provider's job.

use std::sync::{Arc, Mutex, Weak};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::hosted;
use crate::storage::KeyValueStore;

/// Storage key leaf names, matching the provider-namespaced convention:
/// `<prefix>.<client_id>.LastAuthUser` and
/// `<prefix>.<client_id>.<username>.<leaf>`.
const LAST_AUTH_USER: &str = "LastAuthUser";
const ACCESS_TOKEN: &str = "accessToken";
const ID_TOKEN: &str = "idToken";
const REFRESH_TOKEN: &str = "refreshToken";

/// Marker key leaf recording "logged in: 1/absent" for fast-path checks.
const LOGIN_MARKER: &str = "loggedIn";

/// Scratch-store key leaf for the pending re-emit intent.
const RESUME_INTENT: &str = "pendingAuthEmit";

/// Token artifacts of an authenticated session.
///
/// Created on successful hydration, overwritten on refresh, deleted on
/// logout. The implicit flow hands back no refresh token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    pub id_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub username: String,
}

/// Typed replacement for the original's bare pending-emit flag: a value
/// persisted in the scratch store before an expected hard transition and
/// consumed exactly once on the next startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeIntent {
    /// Re-emit the auth change event (forced) after the next startup.
    ReEmitAuthChange,
}

type AuthCallback = Arc<dyn Fn(bool) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    subscribers: Vec<(u64, AuthCallback)>,
    last_broadcast: Option<bool>,
}

/// Subscription handle returned by [`SessionBridge::on_auth_change`].
///
/// Dropping the handle unsubscribes the callback.
pub struct AuthSubscription {
    registry: Weak<Mutex<Registry>>,
    id: u64,
}

impl AuthSubscription {
    /// Unsubscribes the callback. Equivalent to dropping the handle.
    pub fn unsubscribe(self) {}
}

impl Drop for AuthSubscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            let mut registry = lock(&registry);
            registry.subscribers.retain(|(id, _)| *id != self.id);
        }
    }
}

fn lock(registry: &Mutex<Registry>) -> std::sync::MutexGuard<'_, Registry> {
    registry
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Process-wide authentication state derived from persisted tokens.
pub struct SessionBridge {
    key_prefix: String,
    client_id: String,
    store: Arc<dyn KeyValueStore>,
    scratch: Arc<dyn KeyValueStore>,
    registry: Arc<Mutex<Registry>>,
}

impl SessionBridge {
    /// Creates a bridge over a persistent store and a short-lived scratch
    /// store (which only has to survive until the next startup).
    pub fn new(
        key_prefix: impl Into<String>,
        client_id: impl Into<String>,
        store: Arc<dyn KeyValueStore>,
        scratch: Arc<dyn KeyValueStore>,
    ) -> Self {
        Self {
            key_prefix: key_prefix.into(),
            client_id: client_id.into(),
            store,
            scratch,
            registry: Arc::new(Mutex::new(Registry::default())),
        }
    }

    fn namespace(&self) -> String {
        format!("{}.{}", self.key_prefix, self.client_id)
    }

    fn last_user_key(&self) -> String {
        format!("{}.{}", self.namespace(), LAST_AUTH_USER)
    }

    fn token_key(&self, username: &str, leaf: &str) -> String {
        format!("{}.{}.{}", self.namespace(), username, leaf)
    }

    fn marker_key(&self) -> String {
        format!("{}.{}", self.key_prefix, LOGIN_MARKER)
    }

    fn intent_key(&self) -> String {
        format!("{}.{}", self.key_prefix, RESUME_INTENT)
    }

    /// Reads a key, degrading storage failure to "absent".
    fn read(&self, key: &str) -> Option<String> {
        match self.store.get(key) {
            Ok(value) => value,
            Err(err) => {
                warn!("token storage unavailable, treating as logged out: {err:#}");
                None
            }
        }
    }

    /// Returns whether a usable (present, decodable, non-expired) identity
    /// token exists for the last authenticated user.
    ///
    /// Idempotent: repeated calls without intervening storage mutation return
    /// the same value. Every failure path returns `false`, never an error.
    pub fn is_logged_in(&self) -> bool {
        let Some(username) = self.read(&self.last_user_key()) else {
            return false;
        };
        let Some(id_token) = self.read(&self.token_key(&username, ID_TOKEN)) else {
            return false;
        };
        hosted::id_token_usable(&id_token)
    }

    /// Returns the persisted token set, if complete enough to be useful.
    pub fn tokens(&self) -> Option<TokenSet> {
        let username = self.read(&self.last_user_key())?;
        let access_token = self.read(&self.token_key(&username, ACCESS_TOKEN))?;
        let id_token = self.read(&self.token_key(&username, ID_TOKEN))?;
        let refresh_token = self.read(&self.token_key(&username, REFRESH_TOKEN));
        Some(TokenSet {
            access_token,
            id_token,
            refresh_token,
            username,
        })
    }

    /// Persists a token set under the provider-namespaced keys and records
    /// the owner as the last authenticated user.
    ///
    /// # Errors
    /// Returns an error if the persistent store is unavailable.
    pub fn store_tokens(&self, tokens: &TokenSet) -> Result<()> {
        let user = &tokens.username;
        self.store
            .set(&self.last_user_key(), user)
            .context("Failed to persist last auth user")?;
        self.store
            .set(&self.token_key(user, ACCESS_TOKEN), &tokens.access_token)
            .context("Failed to persist access token")?;
        self.store
            .set(&self.token_key(user, ID_TOKEN), &tokens.id_token)
            .context("Failed to persist identity token")?;
        if let Some(refresh) = &tokens.refresh_token {
            self.store
                .set(&self.token_key(user, REFRESH_TOKEN), refresh)
                .context("Failed to persist refresh token")?;
        }
        self.store
            .set(&self.marker_key(), "1")
            .context("Failed to persist login marker")?;
        Ok(())
    }

    /// Removes every provider-namespaced key plus the login marker, then
    /// broadcasts the (changed) state. Returns whether anything was removed.
    ///
    /// # Errors
    /// Returns an error if the persistent store is unavailable.
    pub fn logout(&self) -> Result<bool> {
        let namespace = format!("{}.", self.namespace());
        let mut removed = false;
        for key in self.store.keys().context("Failed to list token keys")? {
            if key.starts_with(&namespace) {
                self.store
                    .remove(&key)
                    .with_context(|| format!("Failed to remove token key {key}"))?;
                removed = true;
            }
        }
        self.store
            .remove(&self.marker_key())
            .context("Failed to remove login marker")?;
        self.notify_auth_change(false);
        Ok(removed)
    }

    /// Registers a subscriber for auth-change broadcasts.
    ///
    /// Subscribers may observe a broadcast in arbitrary registration order,
    /// but all see the same boolean value.
    pub fn on_auth_change(&self, callback: impl Fn(bool) + Send + Sync + 'static) -> AuthSubscription {
        let mut registry = lock(&self.registry);
        let id = registry.next_id;
        registry.next_id += 1;
        registry.subscribers.push((id, Arc::new(callback)));
        AuthSubscription {
            registry: Arc::downgrade(&self.registry),
            id,
        }
    }

    /// Re-evaluates the authentication state, refreshes the login marker,
    /// and broadcasts to subscribers if the value changed since the last
    /// broadcast — or unconditionally when `force` is set.
    pub fn notify_auth_change(&self, force: bool) {
        let value = self.is_logged_in();

        // Marker maintenance is best-effort; the token keys stay the source
        // of truth.
        let marker = if value {
            self.store.set(&self.marker_key(), "1")
        } else {
            self.store.remove(&self.marker_key())
        };
        if let Err(err) = marker {
            warn!("failed to update login marker: {err:#}");
        }

        let callbacks: Vec<AuthCallback> = {
            let mut registry = lock(&self.registry);
            if !force && registry.last_broadcast == Some(value) {
                return;
            }
            registry.last_broadcast = Some(value);
            registry
                .subscribers
                .iter()
                .map(|(_, cb)| Arc::clone(cb))
                .collect()
        };

        // Invoke outside the lock so a callback may subscribe/unsubscribe.
        for callback in callbacks {
            callback(value);
        }
    }

    /// Persists a resume intent in the scratch store ahead of an expected
    /// hard transition.
    ///
    /// # Errors
    /// Returns an error if the scratch store is unavailable.
    pub fn set_resume_intent(&self, intent: ResumeIntent) -> Result<()> {
        let value = serde_json::to_string(&intent).context("Failed to serialize resume intent")?;
        self.scratch
            .set(&self.intent_key(), &value)
            .context("Failed to persist resume intent")
    }

    /// Consumes the pending resume intent, if any. Unreadable or malformed
    /// intents are discarded.
    pub fn take_resume_intent(&self) -> Option<ResumeIntent> {
        let key = self.intent_key();
        let raw = match self.scratch.get(&key) {
            Ok(value) => value?,
            Err(err) => {
                warn!("scratch storage unavailable, dropping resume intent: {err:#}");
                return None;
            }
        };
        if let Err(err) = self.scratch.remove(&key) {
            warn!("failed to clear resume intent: {err:#}");
        }
        serde_json::from_str(&raw).ok()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::storage::MemoryStore;

    fn bridge_with_store(store: Arc<dyn KeyValueStore>) -> SessionBridge {
        SessionBridge::new(
            "IdentityServiceProvider",
            "client-1",
            store,
            Arc::new(MemoryStore::new()),
        )
    }

    fn bridge() -> SessionBridge {
        bridge_with_store(Arc::new(MemoryStore::new()))
    }

    fn tokens() -> TokenSet {
        TokenSet {
            access_token: "access-token".to_string(),
            id_token: crate::hosted::tests::unsigned_token_with_exp(
                crate::hosted::now_secs() + 3600,
            ),
            refresh_token: Some("refresh-token".to_string()),
            username: "alice".to_string(),
        }
    }

    /// Test: token round-trip — store then is_logged_in is true, logout
    /// flips it to false.
    #[test]
    fn test_token_round_trip() {
        let bridge = bridge();
        assert!(!bridge.is_logged_in());

        bridge.store_tokens(&tokens()).unwrap();
        assert!(bridge.is_logged_in());
        assert!(bridge.is_logged_in()); // idempotent

        let removed = bridge.logout().unwrap();
        assert!(removed);
        assert!(!bridge.is_logged_in());
        assert_eq!(bridge.tokens(), None);
    }

    /// Test: an expired identity token does not count as logged in.
    #[test]
    fn test_expired_id_token_is_logged_out() {
        let bridge = bridge();
        let mut expired = tokens();
        expired.id_token =
            crate::hosted::tests::unsigned_token_with_exp(crate::hosted::now_secs() - 60);
        bridge.store_tokens(&expired).unwrap();
        assert!(!bridge.is_logged_in());
    }

    /// Test: logout removes every provider-namespaced key and the marker.
    #[test]
    fn test_logout_clears_namespaced_keys() {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        store.set("unrelated.key", "keep").unwrap();
        let bridge = bridge_with_store(Arc::<MemoryStore>::clone(&store));

        bridge.store_tokens(&tokens()).unwrap();
        bridge.logout().unwrap();

        let keys = store.keys().unwrap();
        assert_eq!(keys, vec!["unrelated.key"]);
    }

    /// Test: exactly one callback per state-changing notify; none for
    /// no-change calls unless forced.
    #[test]
    fn test_notify_exactly_once_per_change() {
        let bridge = bridge();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let _sub = {
            let count = Arc::clone(&count);
            let seen = Arc::clone(&seen);
            bridge.on_auth_change(move |value| {
                count.fetch_add(1, Ordering::SeqCst);
                seen.lock().unwrap().push(value);
            })
        };

        bridge.notify_auth_change(false); // None -> false: broadcasts
        bridge.notify_auth_change(false); // unchanged: silent
        bridge.notify_auth_change(false); // unchanged: silent
        assert_eq!(count.load(Ordering::SeqCst), 1);

        bridge.store_tokens(&tokens()).unwrap();
        bridge.notify_auth_change(false); // false -> true: broadcasts
        bridge.notify_auth_change(false); // unchanged: silent
        assert_eq!(count.load(Ordering::SeqCst), 2);

        bridge.notify_auth_change(true); // forced: broadcasts
        assert_eq!(count.load(Ordering::SeqCst), 3);

        assert_eq!(*seen.lock().unwrap(), vec![false, true, true]);
    }

    /// Test: all subscribers see the same value.
    #[test]
    fn test_all_subscribers_see_same_value() {
        let bridge = bridge();
        let a = Arc::new(Mutex::new(Vec::new()));
        let b = Arc::new(Mutex::new(Vec::new()));

        let _sub_a = {
            let a = Arc::clone(&a);
            bridge.on_auth_change(move |v| a.lock().unwrap().push(v))
        };
        let _sub_b = {
            let b = Arc::clone(&b);
            bridge.on_auth_change(move |v| b.lock().unwrap().push(v))
        };

        bridge.store_tokens(&tokens()).unwrap();
        bridge.notify_auth_change(false);

        assert_eq!(*a.lock().unwrap(), vec![true]);
        assert_eq!(*b.lock().unwrap(), vec![true]);
    }

    /// Test: dropping the subscription stops callbacks.
    #[test]
    fn test_unsubscribe_on_drop() {
        let bridge = bridge();
        let count = Arc::new(AtomicUsize::new(0));

        let sub = {
            let count = Arc::clone(&count);
            bridge.on_auth_change(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };

        bridge.notify_auth_change(true);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        sub.unsubscribe();
        bridge.notify_auth_change(true);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    /// Test: resume intent is consumed exactly once.
    #[test]
    fn test_resume_intent_take_once() {
        let bridge = bridge();
        assert_eq!(bridge.take_resume_intent(), None);

        bridge
            .set_resume_intent(ResumeIntent::ReEmitAuthChange)
            .unwrap();
        assert_eq!(
            bridge.take_resume_intent(),
            Some(ResumeIntent::ReEmitAuthChange)
        );
        assert_eq!(bridge.take_resume_intent(), None);
    }

    /// Test: storage unavailability degrades to logged out, never panics.
    #[test]
    fn test_unavailable_storage_degrades_to_logged_out() {
        struct BrokenStore;

        impl KeyValueStore for BrokenStore {
            fn get(&self, _key: &str) -> Result<Option<String>> {
                anyhow::bail!("storage unavailable")
            }
            fn set(&self, _key: &str, _value: &str) -> Result<()> {
                anyhow::bail!("storage unavailable")
            }
            fn remove(&self, _key: &str) -> Result<()> {
                anyhow::bail!("storage unavailable")
            }
            fn keys(&self) -> Result<Vec<String>> {
                anyhow::bail!("storage unavailable")
            }
        }

        let bridge = bridge_with_store(Arc::new(BrokenStore));
        assert!(!bridge.is_logged_in());
        bridge.notify_auth_change(true); // marker write fails silently
        assert!(bridge.store_tokens(&tokens()).is_err());
    }
}
