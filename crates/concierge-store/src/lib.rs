//! # concierge-store
//!
//! Durable, append-only message log backed by SQLite.
//!
//! The crate exposes a synchronous `Database` handle that wraps a
//! `rusqlite::Connection`. Messages are never updated or deleted; ordering
//! is by `(created_at, id)` and the append path guarantees that id order and
//! timestamp order agree.

pub mod database;
pub mod messages;
pub mod migrations;
pub mod models;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;
