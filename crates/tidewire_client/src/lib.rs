//! # Tidewire Client
//!
//! Real-time data synchronization client.
//!
//! This crate provides:
//! - A connection state machine with handshake, authentication, heartbeat,
//!   redirects and reconnection with linear backoff
//! - Shared versioned records with offline persistence, dirty tracking and
//!   conflict resolution through merge strategies
//! - Publish/subscribe events with pattern listening
//! - Remote procedure calls
//!
//! ## Architecture
//!
//! The engine is **sans-IO**. A [`Client`] owns the engine behind a lock; the
//! transport pushes events into a channel and the engine processes them when
//! pumped, either by hand ([`Client::pump`]) or by the tokio driver
//! ([`Client::spawn_driver`]). User callbacks never run while the lock is
//! held, so they may call back into the client.
//!
//! ## Key Invariants
//!
//! - One record core per name, shared by every handle
//! - Record versions never move backwards without a merge
//! - Writes made while offline are persisted and marked dirty until the
//!   server confirms them
//! - Every outstanding request fails when the connection is lost

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod bulk;
mod client;
mod clock;
mod config;
mod connection;
mod emitter;
mod engine;
mod error;
mod event;
mod ids;
mod json_path;
mod listen;
mod outbox;
mod record;
mod rpc;
mod services;
mod state_machine;
mod task;
mod timeout_registry;
mod timer;
mod transport;

#[cfg(test)]
mod testing;

pub use client::{Client, ClientBuilder};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ClientConfig, ReconnectConfig, TimerStrategy};
pub use connection::ConnectionState;
pub use emitter::{Listener, ListenerId};
pub use error::{ClientError, ClientResult};
pub use event::Events;
pub use ids::{IdGenerator, SequentialIdGenerator, UidGenerator};
pub use listen::{ListenCallback, ListenResponse};
pub use outbox::{ClientEvent, ErrorKind};
pub use record::{
    AnonymousRecord, List, MergeContext, MergeStrategy, Record, RecordEvent, RecordSnapshot,
    RecordState, Records,
};
pub use rpc::{Provider, Rpc, RpcResponse};
pub use transport::{
    MockNetwork, MockTransport, MockTransportFactory, Transport, TransportEvent, TransportFactory,
    TransportSink,
};

pub use tidewire_protocol::{Message, WireFormat};
pub use tidewire_storage::{FileStore, InMemoryStore, NoopStore, OfflineStore, Snapshot};
