//! Concord relay server.
//!
//! Terminates WebSocket connections, authenticates them, and routes each
//! one to a per-document [`room::Room`] which synchronises CRDT state
//! across the room's clients and optionally journals every applied
//! update to a SQLite file.

#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![forbid(unsafe_code)]

pub mod auth;
pub mod prelude;
pub mod relay;
pub mod room;

pub use relay::{RelayOpts, RelayServer};
pub use room::{Room, RoomOpts};

// vim: ts=4
