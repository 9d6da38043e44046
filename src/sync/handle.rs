// File: ./src/sync/handle.rs
// Inbox plumbing and the handle the rendering surface holds.
use crate::channel::Inbound;
use crate::error::{SyncError, SyncResult};
use crate::model::{CalendarEvent, CalendarRef};
use crate::sync::message::{Command, Message, Notice};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

pub const DEFAULT_INBOX_CAPACITY: usize = 256;

/// The actor's single ordered inbox.
///
/// Created before the actor so the real-time channel adapter can be handed an
/// [`InboundSender`] first and the actor can be handed the adapter afterwards.
#[derive(Debug)]
pub struct Inbox {
    pub(crate) tx: mpsc::Sender<Message>,
    pub(crate) rx: mpsc::Receiver<Message>,
}

impl Inbox {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self { tx, rx }
    }

    pub fn inbound(&self) -> InboundSender {
        InboundSender {
            tx: self.tx.clone(),
        }
    }
}

impl Default for Inbox {
    fn default() -> Self {
        Self::new(DEFAULT_INBOX_CAPACITY)
    }
}

/// Posts real-time notifications into the actor inbox.
#[derive(Debug, Clone)]
pub struct InboundSender {
    tx: mpsc::Sender<Message>,
}

impl InboundSender {
    pub async fn send(&self, inbound: Inbound) -> SyncResult<()> {
        self.tx
            .send(Message::Inbound(inbound))
            .await
            .map_err(|_| SyncError::ChannelClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Cloneable front end of a running sync actor.
#[derive(Debug, Clone)]
pub struct SyncHandle {
    pub(crate) tx: mpsc::Sender<Message>,
    pub(crate) view: watch::Receiver<Arc<Vec<CalendarEvent>>>,
    pub(crate) calendars: watch::Receiver<Arc<Vec<CalendarRef>>>,
    pub(crate) notices: broadcast::Sender<Notice>,
}

impl SyncHandle {
    /// Current ordered event list.
    pub fn view(&self) -> Arc<Vec<CalendarEvent>> {
        self.view.borrow().clone()
    }

    /// Receiver that is marked changed once per coalesced view update.
    pub fn subscribe_view(&self) -> watch::Receiver<Arc<Vec<CalendarEvent>>> {
        self.view.clone()
    }

    pub fn calendars(&self) -> Arc<Vec<CalendarRef>> {
        self.calendars.borrow().clone()
    }

    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    pub fn inbound(&self) -> InboundSender {
        InboundSender {
            tx: self.tx.clone(),
        }
    }

    async fn send(&self, cmd: Command) -> SyncResult<()> {
        self.tx
            .send(Message::Command(cmd))
            .await
            .map_err(|_| SyncError::ChannelClosed)
    }

    pub async fn select(&self, calendar_id: impl Into<String>) -> SyncResult<()> {
        self.send(Command::Select(calendar_id.into())).await
    }

    pub async fn deselect(&self, calendar_id: impl Into<String>) -> SyncResult<()> {
        self.send(Command::Deselect(calendar_id.into())).await
    }

    pub async fn select_all(&self) -> SyncResult<()> {
        self.send(Command::SelectAll).await
    }

    pub async fn deselect_all(&self) -> SyncResult<()> {
        self.send(Command::DeselectAll).await
    }

    pub async fn refresh(&self) -> SyncResult<()> {
        self.send(Command::Refresh).await
    }

    pub async fn refresh_calendars(&self) -> SyncResult<()> {
        self.send(Command::RefreshCalendars).await
    }

    /// Resolves once the actor has handled everything queued before this call.
    ///
    /// Network calls the actor spawned earlier may still be in flight.
    pub async fn flush(&self) -> SyncResult<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Flush(tx)).await?;
        rx.await.map_err(|_| SyncError::ChannelClosed)
    }

    pub async fn shutdown(&self) -> SyncResult<()> {
        self.send(Command::Shutdown).await
    }
}
