//! Durable storage for the Waypost tracking engine.
//!
//! This crate provides a SQLite-backed [`KeyValueStore`](waypost_types::KeyValueStore)
//! so the engine's session state, nearby cache, and replay buffer survive
//! process restarts.
//!
//! # Example
//!
//! ```no_run
//! use waypost_store::SqliteStore;
//!
//! let store = SqliteStore::open_default()?;
//! for key in store.keys()? {
//!     println!("{key}");
//! }
//! # Ok::<(), waypost_store::Error>(())
//! ```

mod error;
mod models;
mod schema;
mod store;

pub use error::{Error, Result};
pub use models::StoredEntry;
pub use schema::SCHEMA_VERSION;
pub use store::SqliteStore;

/// Default database path following platform conventions.
///
/// - Linux: `~/.local/share/waypost/state.db`
/// - macOS: `~/Library/Application Support/waypost/state.db`
/// - Windows: `C:\Users\<user>\AppData\Local\waypost\state.db`
pub fn default_db_path() -> std::path::PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join("waypost")
        .join("state.db")
}
