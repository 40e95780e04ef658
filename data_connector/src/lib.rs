//! Multi-provider data-and-auth connector.
//!
//! One configuration selects a backend; the connector then exposes the same
//! auth, CRUD, query and snapshot-subscription surface for all of them.
//!
//! Supported providers:
//! - `pushAuthStore`: document tree with push auth state and event-stream changes
//! - `channelRealtimeStore`: relational REST API with realtime channels
//! - `pollingRestStore`: key-signed document REST API, changes by polling
//!
//! Every failure is a [`NormalizedError`] with a provider-prefixed code.

mod channel_realtime;
mod common;
pub mod config;
mod core;
pub mod error;
mod factory;
mod polling_rest;
mod push_auth;
pub mod query;
mod session;
mod subscription;

pub use channel_realtime::ChannelRealtimeStoreAdapter;
pub use config::{
    ChannelRealtimeStoreConfig, ConnectorConfig, PollingRestStoreConfig, ProviderConfig,
    PushAuthStoreConfig,
};
pub use core::{
    Deleted, Operation, Provider, ProviderAdapter, ReadOptions, Record, RecordData, Session, User,
};
pub use error::{ConnectorResult, NormalizedError};
pub use factory::{
    create_connector, create_connector_with_session, Auth, ConnectedClient, Connector, Db,
};
pub use polling_rest::PollingRestStoreAdapter;
pub use push_auth::{AuthState, PushAuthStoreAdapter};
pub use query::{translate, NativeFilter, Operator, QueryPredicate};
pub use session::SessionStore;
pub use subscription::{SnapshotResult, SnapshotStream, Subscription, SubscriptionState};
