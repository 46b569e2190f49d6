//! Durable storage for pulsewatch.
//!
//! SQLite with embedded refinery migrations.

mod models;
mod store;
mod tdigest_utils;

pub use models::*;
pub use store::*;
pub use tdigest_utils::*;
