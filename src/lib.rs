//! Reactive query subscriptions over SQLite.
//!
//! Declare a statement once, receive its result set now and again after
//! every committed mutation of a table it references. Identical statements
//! on the same connection share one subscription; one-shot loads running
//! concurrently share one fetch.

pub mod backend;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod observer;
pub mod row;
pub mod statement;
pub mod types;
pub mod watch_set;

pub use backend::{Backend, DirectBackend, QueueBackend};
pub use config::{RuntimeContext, StorageLocation};
pub use dispatcher::{Dispatcher, FetchKey, SharedRows, WatchHandle};
pub use error::{DecodeError, FreshetError, Result};
pub use observer::{ListenerId, WatchGuard};
pub use row::{ColumnKind, FromRow, Row};
pub use statement::{Binding, CompiledStatement};
pub use types::SqlValue;
pub use watch_set::referenced_tables;
