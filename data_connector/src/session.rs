//! Connector-owned session storage.
//!
//! Sessions live under `<providerName>_token`, so connectors for different
//! providers can share one store without clobbering each other.

use std::sync::Arc;

use dashmap::DashMap;

use crate::core::{Provider, Session, User};

#[derive(Debug, Clone, Default)]
pub struct SessionStore {
    sessions: Arc<DashMap<String, Session>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, provider: Provider) -> Option<Session> {
        self.sessions
            .get(&provider.session_key())
            .map(|entry| entry.value().clone())
    }

    pub fn token(&self, provider: Provider) -> Option<String> {
        self.sessions
            .get(&provider.session_key())
            .map(|entry| entry.token.clone())
    }

    pub fn user(&self, provider: Provider) -> Option<User> {
        self.sessions
            .get(&provider.session_key())
            .map(|entry| entry.user.clone())
    }

    pub fn put(&self, provider: Provider, session: Session) {
        self.sessions.insert(provider.session_key(), session);
    }

    pub fn remove(&self, provider: Provider) -> Option<Session> {
        self.sessions
            .remove(&provider.session_key())
            .map(|(_, session)| session)
    }

    pub fn contains(&self, provider: Provider) -> bool {
        self.sessions.contains_key(&provider.session_key())
    }

    /// Keys currently held, for diagnostics.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(user: &str, token: &str) -> Session {
        Session {
            user: User::new(user),
            token: token.to_string(),
            refresh_token: None,
        }
    }

    #[test]
    fn sessions_are_namespaced_per_provider() {
        let store = SessionStore::new();
        store.put(Provider::PushAuthStore, session("u1", "t1"));
        store.put(Provider::PollingRestStore, session("u2", "t2"));

        assert_eq!(store.token(Provider::PushAuthStore).as_deref(), Some("t1"));
        assert_eq!(store.token(Provider::PollingRestStore).as_deref(), Some("t2"));
        assert!(store.get(Provider::ChannelRealtimeStore).is_none());
        assert_eq!(
            store.keys(),
            vec!["pollingRestStore_token", "pushAuthStore_token"]
        );

        store.remove(Provider::PushAuthStore);
        assert!(!store.contains(Provider::PushAuthStore));
        assert_eq!(store.user(Provider::PollingRestStore).unwrap().id, "u2");
    }

    #[test]
    fn clones_share_state() {
        let store = SessionStore::new();
        let shared = store.clone();
        shared.put(Provider::ChannelRealtimeStore, session("u", "t"));
        assert!(store.contains(Provider::ChannelRealtimeStore));
    }

    #[test]
    fn remove_missing_is_noop() {
        let store = SessionStore::new();
        assert!(store.remove(Provider::PushAuthStore).is_none());
    }
}
