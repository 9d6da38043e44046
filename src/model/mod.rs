// File: ./src/model/mod.rs
pub mod event;
pub mod raw;

pub use event::{CalendarEvent, CalendarRef};
pub use raw::{RawDateTime, RawEmailAddress, RawEvent, RawNotification, RawOrganizer};
