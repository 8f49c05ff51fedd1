//! Value types shared between the handle core, its plugins and the daemon.
//!
//! Everything here is plain data: identifiers, kinds and client identities.
//! None of these types carry behaviour that depends on table state.

pub mod client;
pub mod handle;

pub use client::*;
pub use handle::*;
