//! Promcat Core - catalog store behind the promcat service registry
//!
//! Hosts register under a name with targets and labels; entries are merged,
//! deduplicated and expired after a TTL, and the live set is written out as a
//! file-based service discovery document.
//! - File-based store shared by independent worker processes
//! - Marker-file lock serializing every writer
//! - Periodic expiration sweep

pub mod catalog;
pub mod discovery;
pub mod entry;
pub mod error;
pub mod lock;
pub mod store;
pub mod sweep;

pub use catalog::{
    CatalogMetrics, CatalogService, DEFAULT_TIME_TO_LIVE, RegisterOutcome, RegisterRequest,
    merge_labels, merge_targets,
};
pub use discovery::DiscoveryWriter;
pub use entry::{
    CatalogEntry, DiscoveryTarget, EXPIRATION_FORMAT, Labels, format_expiration, parse_expiration,
};
pub use error::{CatalogError, Result};
pub use lock::{DEFAULT_POLL_INTERVAL, LockGuard, LockHolder, LockManager, default_lock_path};
pub use store::{
    DynRecordStore, EntryPredicate, JsonFileStore, RecordStore, SqliteStore, StoreBackend,
    UpsertOutcome, by_hostname, open_store,
};
pub use sweep::{DEFAULT_SWEEP_INTERVAL, SweepScheduler, SweepState};
