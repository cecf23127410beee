//! Client-side components of the Concord collaborative editing stack.
//!
//! [`provider::Provider`] keeps a local [`concord_types::doc::SharedDoc`]
//! in sync with one room on a relay, over a transparently reconnecting
//! [`connection::Connection`]. [`awareness::Awareness`] tracks transient
//! per-client presence and [`renderer::TextRenderer`] materialises a
//! text object to disk.

#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![forbid(unsafe_code)]

pub mod awareness;
pub mod connection;
pub mod prelude;
pub mod provider;
pub mod renderer;

pub use connection::{ConnectOptions, Connection};
pub use provider::Provider;

// vim: ts=4
