// File: src/model/raw.rs
// Converts backend list payloads and real-time notification payloads into CalendarEvent.
use crate::error::{SyncError, SyncResult};
use crate::model::event::CalendarEvent;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Event as returned by the calendar backend's event listing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEvent {
    pub id: String,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub organizer: Option<RawOrganizer>,
    #[serde(default)]
    pub start: Option<RawDateTime>,
    #[serde(default)]
    pub end: Option<RawDateTime>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawOrganizer {
    #[serde(default)]
    pub email_address: Option<RawEmailAddress>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawEmailAddress {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
}

/// Nested date object. `date_time` carries no offset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawDateTime {
    pub date_time: String,
    #[serde(default)]
    pub time_zone: Option<String>,
}

/// Flat payload pushed over the real-time channel.
///
/// Update notifications may carry only the fields that changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawNotification {
    pub id: String,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
    #[serde(default)]
    pub organizer: Option<String>,
}

/// Backend timestamps are naive but always UTC. A `Z` marker is appended before parsing.
pub fn parse_backend_timestamp(value: &str) -> SyncResult<DateTime<Utc>> {
    let trimmed = value.trim();
    let marked = format!("{}Z", trimmed);
    if let Ok(dt) = DateTime::parse_from_rfc3339(&marked) {
        return Ok(dt.with_timezone(&Utc));
    }
    // Some payloads already carry an offset; accept them unchanged.
    DateTime::parse_from_rfc3339(trimmed)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SyncError::InvalidPayload(format!("bad timestamp '{}': {}", value, e)))
}

/// Notification timestamps are either epoch milliseconds or naive ISO strings.
pub fn parse_notification_timestamp(value: &str) -> SyncResult<DateTime<Utc>> {
    let trimmed = value.trim();
    let is_epoch = !trimmed.is_empty()
        && trimmed
            .trim_start_matches('-')
            .chars()
            .all(|c| c.is_ascii_digit());

    if is_epoch {
        let millis: i64 = trimmed
            .parse()
            .map_err(|_| SyncError::InvalidPayload(format!("bad epoch '{}'", value)))?;
        return Utc
            .timestamp_millis_opt(millis)
            .single()
            .ok_or_else(|| SyncError::InvalidPayload(format!("epoch out of range '{}'", value)));
    }

    parse_backend_timestamp(trimmed)
}

impl RawEvent {
    pub fn normalize(&self, calendar_id: &str) -> SyncResult<CalendarEvent> {
        let start = self
            .start
            .as_ref()
            .ok_or_else(|| SyncError::InvalidPayload(format!("event {} has no start", self.id)))?;
        let end = self
            .end
            .as_ref()
            .ok_or_else(|| SyncError::InvalidPayload(format!("event {} has no end", self.id)))?;

        let organizer = self
            .organizer
            .as_ref()
            .and_then(|o| o.email_address.as_ref())
            .and_then(|e| e.name.clone().or_else(|| e.address.clone()))
            .unwrap_or_default();

        Ok(CalendarEvent {
            id: self.id.clone(),
            calendar_id: calendar_id.to_string(),
            title: self.subject.clone().unwrap_or_default(),
            start: parse_backend_timestamp(&start.date_time)?,
            end: parse_backend_timestamp(&end.date_time)?,
            organizer,
        })
    }
}

impl RawNotification {
    /// Full conversion; used for add notifications, which must carry start and end.
    pub fn normalize(&self, calendar_id: &str) -> SyncResult<CalendarEvent> {
        let start = self.start.as_deref().ok_or_else(|| {
            SyncError::InvalidPayload(format!("notification {} has no start", self.id))
        })?;
        let end = self.end.as_deref().ok_or_else(|| {
            SyncError::InvalidPayload(format!("notification {} has no end", self.id))
        })?;

        Ok(CalendarEvent {
            id: self.id.clone(),
            calendar_id: calendar_id.to_string(),
            title: self.subject.clone().unwrap_or_default(),
            start: parse_notification_timestamp(start)?,
            end: parse_notification_timestamp(end)?,
            organizer: self.organizer.clone().unwrap_or_default(),
        })
    }

    /// Overlays the fields present in this notification on an existing event.
    pub fn merge_into(&self, existing: &CalendarEvent) -> SyncResult<CalendarEvent> {
        let mut merged = existing.clone();
        if let Some(subject) = &self.subject {
            merged.title = subject.clone();
        }
        if let Some(start) = &self.start {
            merged.start = parse_notification_timestamp(start)?;
        }
        if let Some(end) = &self.end {
            merged.end = parse_notification_timestamp(end)?;
        }
        if let Some(organizer) = &self.organizer {
            merged.organizer = organizer.clone();
        }
        Ok(merged)
    }
}
