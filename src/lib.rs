//! Client-side sync session core for the Lagoon embedded database.
//!
//! The crate multiplexes any number of logical sessions (one per local
//! database file) over pooled framed-transport connections, drives the
//! two-level protocol state machine, sequences upload/download exchanges,
//! coordinates client resets and partition↔flexible migrations, and
//! delivers progress and completion notifications.
//!
//! The local storage engine, the identity layer and the transport are
//! consumed through the traits in [`replication`] and
//! [`client::transport`].

#![forbid(unsafe_code)]

pub mod client;
pub mod config;
pub mod core;
pub mod replication;

pub use crate::client::{
    ConnectionState, SyncClient, SyncSession, SyncSessionState,
};
pub use crate::config::{
    ClientConfig, ClientResyncMode, ReconnectBackoff, ReconnectMode, SessionConfig,
    SessionStopPolicy,
};
pub use crate::core::{Status, StatusCode, SyncError};
pub use crate::replication::{
    HistoryStatus, MigrationStore, ReplicationHistory, SessionStores, StoreOpener,
    SubscriptionStore, SyncUser,
};
