// Crate root library declaration and module exports.
pub mod backend;
pub mod channel;
pub mod cli;
pub mod config;
pub mod context;
pub mod error;
pub mod logging;
pub mod membership;
pub mod model;
pub mod scheduler;
pub mod store;
pub mod subscription;
pub mod sync;
pub mod token;

pub use error::{SyncError, SyncResult};
