// File: ./src/channel/mod.rs
//! Real-time channel: room signals out, change notifications in.
pub mod ws;

use crate::error::SyncResult;
use crate::model::RawNotification;
use serde::{Deserialize, Serialize};

pub use ws::WsChannel;

/// Messages the client sends to the notification server.
///
/// Wire form is `{"event": "join_calendar_room", "data": {"userId": ..., "calendarId": ...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum Outbound {
    JoinCalendarRoom { user_id: String, calendar_id: String },
    LeaveCalendarRoom { user_id: String, calendar_id: String },
    AccessToken { user_id: String, access_token: String },
}

impl Outbound {
    pub fn event_name(&self) -> &'static str {
        match self {
            Outbound::JoinCalendarRoom { .. } => "join_calendar_room",
            Outbound::LeaveCalendarRoom { .. } => "leave_calendar_room",
            Outbound::AccessToken { .. } => "access_token",
        }
    }
}

/// Messages delivered by the channel into the sync actor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum Inbound {
    AddEvent {
        #[serde(default)]
        calendar_id: Option<String>,
        event: RawNotification,
    },
    UpdateEvent {
        #[serde(default)]
        calendar_id: Option<String>,
        event: RawNotification,
    },
    DeleteEvent {
        event_id: String,
        #[serde(default)]
        calendar_id: Option<String>,
    },
    /// Produced locally by the adapter after a connection is re-established.
    Reconnect,
}

impl Inbound {
    pub fn parse(text: &str) -> SyncResult<Inbound> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Outbound side of the real-time channel.
///
/// `emit` must not block: implementations queue the message for a writer task.
pub trait RealtimeChannel: Send + Sync {
    fn emit(&self, message: Outbound) -> SyncResult<()>;
}
