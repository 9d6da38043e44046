// Normalized calendar data shared by the store, the sync actor and the rendering surface.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single event as shown on the calendar grid.
///
/// Identity is the backend `id`; two values with the same `id` describe the
/// same event, possibly at different revisions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarEvent {
    pub id: String,
    /// Backend identifier of the owning calendar.
    pub calendar_id: String,
    pub title: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub organizer: String,
}

impl CalendarEvent {
    pub fn duration(&self) -> chrono::Duration {
        self.end - self.start
    }
}

/// A calendar as listed by the backend.
///
/// `index` is only a label for presentation. It is reassigned on every
/// calendar-list refresh, so everything that must survive a refresh keys by `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarRef {
    pub index: usize,
    pub name: String,
    pub id: String,
}

impl CalendarRef {
    /// Builds a fresh list, numbering entries in backend order.
    pub fn enumerate<I>(entries: I) -> Vec<CalendarRef>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        entries
            .into_iter()
            .enumerate()
            .map(|(index, (id, name))| CalendarRef { index, name, id })
            .collect()
    }
}
