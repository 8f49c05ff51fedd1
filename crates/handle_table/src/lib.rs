//! # DirSvc Handle Table
//!
//! Reference-lifecycle core of the directory-service daemon.
//!
//! ## Components
//! - **HandleTable**: typed, hierarchical handles with cascading removal
//! - **ClientSessionIndex**: per-client top-level handles and live counts
//! - **ContinuationStore**: resume tokens for paginated calls, owned by nodes
//!
//! Both tables share one numbering scheme: a small generation counter above a
//! (segment, slot) index, so lookups are direct indexing into lazily grown
//! segments with a hard ceiling.
//!
//! Locks are never held while plugin or release callbacks run; callbacks may
//! re-enter any public operation.

mod arena;
pub mod client_index;
pub mod config;
pub mod continuation;
pub mod errors;
pub mod table;
pub mod types;

pub use client_index::{ClientSessionIndex, CountUpdate};
pub use config::{ArenaLimits, TableLimits};
pub use continuation::{ContinuationPayload, ContinuationStore};
pub use errors::*;
pub use table::HandleTable;
pub use types::*;

pub use dirsvc_types::{ClientIdentity, ContinuationToken, HandleId, HandleKind};
