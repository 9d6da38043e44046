// File: src/membership.rs
// Tracks which calendar rooms this client has joined on the notification server.
use crate::channel::{Outbound, RealtimeChannel};
use crate::error::SyncResult;
use std::collections::BTreeSet;

/// Joined rooms, keyed by backend calendar id.
///
/// Join and leave always emit, even when the local set already agrees: the
/// server treats repeats as no-ops, and after a reconnect its view may differ
/// from ours.
#[derive(Debug)]
pub struct RoomMembership {
    user_id: String,
    joined: BTreeSet<String>,
}

impl RoomMembership {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            joined: BTreeSet::new(),
        }
    }

    pub fn is_joined(&self, calendar_id: &str) -> bool {
        self.joined.contains(calendar_id)
    }

    pub fn joined(&self) -> impl Iterator<Item = &str> {
        self.joined.iter().map(String::as_str)
    }

    pub fn join(&mut self, channel: &dyn RealtimeChannel, calendar_id: &str) -> SyncResult<()> {
        self.joined.insert(calendar_id.to_string());
        channel.emit(Outbound::JoinCalendarRoom {
            user_id: self.user_id.clone(),
            calendar_id: calendar_id.to_string(),
        })
    }

    pub fn leave(&mut self, channel: &dyn RealtimeChannel, calendar_id: &str) -> SyncResult<()> {
        self.joined.remove(calendar_id);
        channel.emit(Outbound::LeaveCalendarRoom {
            user_id: self.user_id.clone(),
            calendar_id: calendar_id.to_string(),
        })
    }

    /// Rebuilds membership after a reconnect: exactly one join per selected calendar.
    pub fn reconcile<'a, I>(&mut self, channel: &dyn RealtimeChannel, selected: I) -> SyncResult<()>
    where
        I: IntoIterator<Item = &'a str>,
    {
        self.joined.clear();
        let targets: BTreeSet<&str> = selected.into_iter().collect();
        log::info!("Rejoining {} calendar room(s)", targets.len());
        for calendar_id in targets {
            self.join(channel, calendar_id)?;
        }
        Ok(())
    }
}
