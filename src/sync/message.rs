// File: ./src/sync/message.rs
// Everything that can arrive in the sync actor's inbox.
use crate::backend::SubscriptionRecord;
use crate::channel::Inbound;
use crate::error::{SyncError, SyncResult};
use crate::model::{CalendarRef, RawEvent};
use crate::token::Token;
use tokio::sync::oneshot;

/// Requests from the rendering surface.
#[derive(Debug)]
pub enum Command {
    Select(String),
    Deselect(String),
    SelectAll,
    DeselectAll,
    /// Refetch every selected calendar.
    Refresh,
    RefreshCalendars,
    /// Answered once every message queued before it has been handled.
    Flush(oneshot::Sender<()>),
    Shutdown,
}

/// How a completed fetch is merged into the event list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    /// Initial load after selection: keep events that arrived by notification.
    Merge,
    /// Periodic or post-reconnect refresh: the fetch is authoritative.
    Replace,
}

#[derive(Debug)]
pub enum Message {
    Command(Command),
    Inbound(Inbound),
    CalendarsLoaded(SyncResult<Vec<CalendarRef>>),
    EventsFetched {
        calendar_id: String,
        generation: u64,
        mode: FetchMode,
        result: SyncResult<Vec<RawEvent>>,
    },
    SubscriptionCreated {
        calendar_id: String,
        result: SyncResult<SubscriptionRecord>,
    },
    SubscriptionRenewed {
        subscription_id: String,
        calendar_id: String,
        result: SyncResult<SubscriptionRecord>,
    },
    SubscriptionDeleted {
        subscription_id: String,
        result: SyncResult<()>,
    },
    TokenRefreshed(SyncResult<Token>),
}

/// Status and escalated errors for the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Error(SyncError),
    CalendarsUpdated(usize),
    Reconnected,
}

impl std::fmt::Display for Notice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Notice::Error(e) => write!(f, "{}", e),
            Notice::CalendarsUpdated(n) => write!(f, "{} calendar(s) available", n),
            Notice::Reconnected => write!(f, "Reconnected to notification server"),
        }
    }
}
