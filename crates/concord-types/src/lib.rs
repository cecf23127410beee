//! Shared types for the Concord collaborative editing stack.
//!
//! This crate contains the pieces every other Concord crate builds on:
//! the error type, the binary sync message codec, the handle over a
//! shared CRDT document, and the supervised component runtime. It is
//! deliberately free of any transport or storage dependency so that the
//! server, the client and the adapters can compile in parallel.

#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![forbid(unsafe_code)]

pub mod component;
pub mod doc;
pub mod error;
pub mod prelude;
pub mod protocol;

// vim: ts=4
