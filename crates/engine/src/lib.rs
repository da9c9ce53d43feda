//! Snapshot store engine
//!
//! This crate ties the lower layers together:
//! - SnapshotStore: open/recover a store root, publish the latest snapshot
//! - Transient and received snapshots: staging, validation, commit
//! - Persisted snapshots: reservations, deletion, chunked reads
//! - SnapshotActor: the single worker every mutation runs on
//!
//! The engine is the only component that knows about:
//! - Supersession of older snapshots
//! - Reservation bookkeeping across restarts
//! - Listener notification

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod actor;
pub mod config;
pub mod listener;
pub mod metrics;
pub mod persisted;
pub mod received;
mod recovery;
pub mod reservation;
pub mod store;
pub mod transient;

pub use actor::{ActorFuture, ActorStats, SnapshotActor};
pub use config::{ConfigError, SnapshotStoreConfig};
pub use listener::SnapshotListener;
pub use metrics::SnapshotCounters;
pub use persisted::PersistedSnapshot;
pub use received::{ReceivedPhase, ReceivedSnapshot};
pub use reservation::{Reservation, ReservationId};
pub use store::SnapshotStore;
pub use transient::{TransientPhase, TransientSnapshot};
