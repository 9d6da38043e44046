// File: ./src/sync/mod.rs
//! Sync orchestration.
//!
//! A single [`SyncActor`] per session owns the event list, the subscription
//! table, room membership and the timers. Commands, real-time notifications,
//! timer ticks and network completions are all handled in inbox order.
pub mod actor;
pub mod handle;
pub mod message;

pub use actor::{SyncActor, SyncSettings};
pub use handle::{InboundSender, Inbox, SyncHandle};
pub use message::{Command, FetchMode, Message, Notice};
