//! # DirSvc Node
//!
//! Daemon wiring around the handle table: configuration, the request
//! dispatch layer, and build information.

pub mod dispatch;
pub mod settings;
pub mod version;

pub use dispatch::{
    memory_dispatcher, BackendError, ClientError, ClientResult, DirectoryBackend, Dispatcher,
    MemoryDirectory, SearchPage,
};
pub use settings::AppConfig;
