//! SQLite backend for Muster.
//!
//! Wraps [`tokio_rusqlite`] so all database access runs on a dedicated thread
//! without blocking the async runtime. One [`SqliteStore`] serves as the
//! record store, the notification outbox and the member directory.

mod encode;
mod schema;
mod store;

pub mod error;

pub use error::{Error, Result};
pub use store::{OutboxEntry, SqliteStore};

#[cfg(test)]
mod tests;
