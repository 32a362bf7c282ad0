//! Runtime context and storage location resolution.
//!
//! The same application code runs against different storage depending on
//! where it is hosted: a real database file in normal operation, a throwaway
//! copy under the system temp directory for previews, and pure in-memory
//! storage under test.

use std::env;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};

/// Which environment the process is running in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeContext {
    /// Normal operation; durable storage under the application data dir.
    Live,
    /// Ephemeral preview; a fresh directory under the system temp dir.
    Preview,
    /// Automated tests; in-memory storage only.
    Test,
}

/// Where a backend keeps its data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageLocation {
    File(PathBuf),
    Memory,
}

static PREVIEW_SEQ: AtomicU64 = AtomicU64::new(0);

impl StorageLocation {
    /// Resolve the storage location for a named database under `context`.
    ///
    /// Live databases land at `<base_dir>/<name>.db`. Previews get a
    /// process-unique directory under the system temp dir so concurrent
    /// previews never collide. Tests always resolve to memory.
    pub fn resolve(context: RuntimeContext, base_dir: &Path, name: &str) -> StorageLocation {
        match context {
            RuntimeContext::Live => StorageLocation::File(base_dir.join(format!("{name}.db"))),
            RuntimeContext::Preview => {
                let seq = PREVIEW_SEQ.fetch_add(1, Ordering::Relaxed);
                let dir = env::temp_dir().join(format!(
                    "{name}-preview-{pid}-{seq}",
                    pid = process::id()
                ));
                StorageLocation::File(dir.join(format!("{name}.db")))
            }
            RuntimeContext::Test => StorageLocation::Memory,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            StorageLocation::File(path) => Some(path),
            StorageLocation::Memory => None,
        }
    }

    pub fn is_memory(&self) -> bool {
        matches!(self, StorageLocation::Memory)
    }
}
