//! Core types, collaborator traits and workflow components for Muster.
//!
//! This crate is deliberately free of HTTP and database dependencies. The
//! record store, notification emitter and member directory are traits; the
//! SQLite backend lives in `muster-store-sqlite`.

// Trait signatures spell out `+ Send` on their futures; impls use `async fn`.
#![allow(async_fn_in_trait)]

pub mod application;
pub mod clock;
pub mod error;
pub mod exam;
pub mod id;
pub mod lifecycle;
pub mod limiter;
pub mod notify;
pub mod scoring;
pub mod sessions;
pub mod store;

pub use error::{Error, Result};
pub use lifecycle::LifecycleController;
pub use limiter::RateLimiter;
pub use sessions::TestSessionManager;

#[cfg(test)]
mod tests;
