//! Connector factory and the caller-facing façade.
//!
//! The factory validates the configuration synchronously and builds the
//! adapter for the selected provider; no network I/O happens until
//! [`Connector::connect`].

use std::sync::Arc;

use tracing::info;

use crate::{
    channel_realtime::ChannelRealtimeStoreAdapter,
    config::{ConnectorConfig, ProviderConfig},
    core::{Deleted, Provider, ProviderAdapter, ReadOptions, Record, RecordData, Session, User},
    error::ConnectorResult,
    polling_rest::PollingRestStoreAdapter,
    push_auth::PushAuthStoreAdapter,
    query::QueryPredicate,
    session::SessionStore,
    subscription::{SnapshotResult, SnapshotStream, Subscription},
};

/// Create a connector with its own session store.
pub fn create_connector(config: &ConnectorConfig) -> ConnectorResult<Connector> {
    create_connector_with_session(config, SessionStore::new())
}

/// Create a connector that persists its session in `sessions`.
///
/// Several connectors for different providers can share one store; sessions
/// are keyed per provider.
pub fn create_connector_with_session(
    config: &ConnectorConfig,
    sessions: SessionStore,
) -> ConnectorResult<Connector> {
    let adapter: Arc<dyn ProviderAdapter> = match config.validate()? {
        ProviderConfig::PushAuthStore(cfg) => {
            Arc::new(PushAuthStoreAdapter::new(cfg, sessions.clone())?)
        }
        ProviderConfig::ChannelRealtimeStore(cfg) => {
            Arc::new(ChannelRealtimeStoreAdapter::new(cfg, sessions.clone())?)
        }
        ProviderConfig::PollingRestStore(cfg) => {
            Arc::new(PollingRestStoreAdapter::new(cfg, sessions.clone())?)
        }
    };
    info!(provider = %adapter.provider(), "Created connector");
    Ok(Connector { adapter, sessions })
}

/// A configured, not yet connected, connector.
#[derive(Clone)]
pub struct Connector {
    adapter: Arc<dyn ProviderAdapter>,
    sessions: SessionStore,
}

impl Connector {
    pub fn provider(&self) -> Provider {
        self.adapter.provider()
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Run the provider's connect step and hand out the `auth`/`db` façade.
    pub async fn connect(&self) -> ConnectorResult<ConnectedClient> {
        self.adapter.connect().await?;
        Ok(ConnectedClient {
            auth: Auth {
                adapter: self.adapter.clone(),
            },
            db: Db {
                adapter: self.adapter.clone(),
            },
        })
    }
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("provider", &self.provider())
            .finish()
    }
}

/// Façade returned by [`Connector::connect`].
#[derive(Clone)]
pub struct ConnectedClient {
    pub auth: Auth,
    pub db: Db,
}

impl std::fmt::Debug for ConnectedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectedClient")
            .field("provider", &self.auth.adapter.provider())
            .finish()
    }
}

#[derive(Clone)]
pub struct Auth {
    adapter: Arc<dyn ProviderAdapter>,
}

impl Auth {
    pub async fn sign_in(&self) -> ConnectorResult<Session> {
        self.adapter.sign_in().await
    }

    pub async fn sign_out(&self) -> ConnectorResult<()> {
        self.adapter.sign_out().await
    }

    pub async fn current_user(&self) -> Option<User> {
        self.adapter.current_user().await
    }
}

#[derive(Clone)]
pub struct Db {
    adapter: Arc<dyn ProviderAdapter>,
}

impl Db {
    pub async fn read(&self, path: &str, options: ReadOptions) -> ConnectorResult<Vec<Record>> {
        self.adapter.read(path, options).await
    }

    /// Read the records matching a single predicate.
    pub async fn query(
        &self,
        path: &str,
        predicate: QueryPredicate,
    ) -> ConnectorResult<Vec<Record>> {
        self.adapter.read(path, ReadOptions::filtered(predicate)).await
    }

    pub async fn write(&self, path: &str, id: &str, data: RecordData) -> ConnectorResult<Record> {
        self.adapter.write(path, id, data).await
    }

    pub async fn update(&self, path: &str, id: &str, data: RecordData) -> ConnectorResult<Record> {
        self.adapter.update(path, id, data).await
    }

    pub async fn delete(&self, path: &str, id: &str) -> ConnectorResult<Deleted> {
        self.adapter.delete(path, id).await
    }

    pub fn snapshots(&self, path: &str) -> ConnectorResult<SnapshotStream> {
        self.adapter.snapshots(path)
    }

    /// Invoke `callback` with every full snapshot of `path` until unsubscribed.
    pub fn on_snapshot<F>(&self, path: &str, callback: F) -> ConnectorResult<Subscription>
    where
        F: FnMut(SnapshotResult) + Send + 'static,
    {
        let stream = self.adapter.snapshots(path)?;
        Ok(Subscription::attach(stream, callback))
    }
}
