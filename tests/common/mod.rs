// Shared in-memory doubles for the integration tests.
#![allow(dead_code)]
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use roomcal::backend::{CalendarBackend, CreateSubscription, SubscriptionRecord};
use roomcal::channel::{Outbound, RealtimeChannel};
use roomcal::model::{CalendarRef, RawEvent};
use roomcal::scheduler::SessionClock;
use roomcal::subscription::SubscriptionPolicy;
use roomcal::sync::{Inbox, SyncActor, SyncHandle, SyncSettings};
use roomcal::token::{Token, TokenProvider};
use roomcal::{SyncError, SyncResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

pub const USER: &str = "u1";
pub const HOOK_URL: &str = "https://hooks.example.com/notify";

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 8, 0, 0).unwrap()
}

pub fn raw_event(id: &str, subject: &str, start: &str, end: &str) -> RawEvent {
    serde_json::from_value(serde_json::json!({
        "id": id,
        "subject": subject,
        "organizer": { "emailAddress": { "name": "Alice", "address": "alice@example.com" } },
        "start": { "dateTime": start, "timeZone": "UTC" },
        "end": { "dateTime": end, "timeZone": "UTC" }
    }))
    .unwrap()
}

/// Calendar backend held entirely in memory.
#[derive(Default)]
pub struct FakeBackend {
    pub calendars: Mutex<Vec<CalendarRef>>,
    pub events: Mutex<HashMap<String, Vec<RawEvent>>>,
    pub created: Mutex<Vec<CreateSubscription>>,
    pub renewed: Mutex<Vec<(String, DateTime<Utc>)>>,
    pub deleted: Mutex<Vec<String>>,
    pub fetches: AtomicUsize,
    pub create_attempts: AtomicUsize,
    pub fail_create: Mutex<Option<SyncError>>,
    pub fail_renew: Mutex<Option<SyncError>>,
    pub fail_events: Mutex<Option<SyncError>>,
    /// When set, every `list_events` waits for one permit.
    pub fetch_gate: Option<Arc<Semaphore>>,
    next_id: AtomicUsize,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gated() -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let backend = Self {
            fetch_gate: Some(gate.clone()),
            ..Self::default()
        };
        (backend, gate)
    }

    pub fn with_calendar(self, id: &str, name: &str, events: Vec<RawEvent>) -> Self {
        {
            let mut cals = self.calendars.lock().unwrap();
            let index = cals.len();
            cals.push(CalendarRef {
                index,
                name: name.to_string(),
                id: id.to_string(),
            });
        }
        self.events.lock().unwrap().insert(id.to_string(), events);
        self
    }

    pub fn set_events(&self, calendar_id: &str, events: Vec<RawEvent>) {
        self.events
            .lock()
            .unwrap()
            .insert(calendar_id.to_string(), events);
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    pub fn deleted_ids(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }

    pub fn renewals(&self) -> Vec<(String, DateTime<Utc>)> {
        self.renewed.lock().unwrap().clone()
    }
}

#[async_trait]
impl CalendarBackend for FakeBackend {
    async fn list_calendars(&self) -> SyncResult<Vec<CalendarRef>> {
        Ok(self.calendars.lock().unwrap().clone())
    }

    async fn list_events(&self, calendar_id: &str) -> SyncResult<Vec<RawEvent>> {
        if let Some(gate) = &self.fetch_gate {
            gate.acquire().await.unwrap().forget();
        }
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = self.fail_events.lock().unwrap().clone() {
            return Err(e);
        }
        Ok(self
            .events
            .lock()
            .unwrap()
            .get(calendar_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn create_subscription(
        &self,
        request: &CreateSubscription,
    ) -> SyncResult<SubscriptionRecord> {
        self.create_attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = self.fail_create.lock().unwrap().clone() {
            return Err(e);
        }
        self.created.lock().unwrap().push(request.clone());
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SubscriptionRecord {
            id: format!("sub-{}", n),
            resource: request.resource.clone(),
            expiration_date_time: request.expiration_date_time,
        })
    }

    async fn renew_subscription(
        &self,
        subscription_id: &str,
        new_expiry: DateTime<Utc>,
    ) -> SyncResult<SubscriptionRecord> {
        if let Some(e) = self.fail_renew.lock().unwrap().clone() {
            return Err(e);
        }
        self.renewed
            .lock()
            .unwrap()
            .push((subscription_id.to_string(), new_expiry));
        Ok(SubscriptionRecord {
            id: subscription_id.to_string(),
            resource: String::new(),
            expiration_date_time: new_expiry,
        })
    }

    async fn delete_subscription(&self, subscription_id: &str) -> SyncResult<()> {
        self.deleted
            .lock()
            .unwrap()
            .push(subscription_id.to_string());
        Ok(())
    }
}

/// Channel that records every outbound message.
#[derive(Default)]
pub struct RecordingChannel {
    pub sent: Mutex<Vec<Outbound>>,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Outbound> {
        self.sent.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }

    pub fn joins(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter_map(|m| match m {
                Outbound::JoinCalendarRoom { calendar_id, .. } => Some(calendar_id),
                _ => None,
            })
            .collect()
    }

    pub fn leaves(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter_map(|m| match m {
                Outbound::LeaveCalendarRoom { calendar_id, .. } => Some(calendar_id),
                _ => None,
            })
            .collect()
    }

    pub fn tokens(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter_map(|m| match m {
                Outbound::AccessToken { access_token, .. } => Some(access_token),
                _ => None,
            })
            .collect()
    }
}

impl RealtimeChannel for RecordingChannel {
    fn emit(&self, message: Outbound) -> SyncResult<()> {
        self.sent.lock().unwrap().push(message);
        Ok(())
    }
}

/// Hands out `tok-1`, `tok-2`, ... or a configured failure.
#[derive(Default)]
pub struct FakeTokenProvider {
    pub calls: AtomicUsize,
    pub forced: AtomicUsize,
    pub fail: Mutex<Option<SyncError>>,
}

#[async_trait]
impl TokenProvider for FakeTokenProvider {
    async fn get_token(&self, _scopes: &[String], force_refresh: bool) -> SyncResult<Token> {
        if force_refresh {
            self.forced.fetch_add(1, Ordering::SeqCst);
        }
        if let Some(e) = self.fail.lock().unwrap().clone() {
            return Err(e);
        }
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Token::new(format!("tok-{}", n)))
    }
}

pub fn settings() -> SyncSettings {
    SyncSettings {
        user_id: USER.to_string(),
        scopes: vec!["Calendars.Read".to_string()],
        policy: SubscriptionPolicy::new(
            chrono::Duration::seconds(60),
            chrono::Duration::seconds(3),
            HOOK_URL,
        ),
        token_refresh_interval: Duration::from_secs(600),
        auto_refresh_interval: None,
        initial_selection: Vec::new(),
        select_all_on_start: false,
    }
}

pub struct Harness {
    pub handle: SyncHandle,
    pub task: JoinHandle<()>,
    pub backend: Arc<FakeBackend>,
    pub channel: Arc<RecordingChannel>,
    pub tokens: Arc<FakeTokenProvider>,
}

impl Harness {
    pub fn start(backend: FakeBackend) -> Self {
        Self::start_with(backend, settings())
    }

    pub fn start_with(backend: FakeBackend, settings: SyncSettings) -> Self {
        let backend = Arc::new(backend);
        let channel = Arc::new(RecordingChannel::new());
        let tokens = Arc::new(FakeTokenProvider::default());
        let (handle, task) = SyncActor::spawn(
            settings,
            backend.clone(),
            channel.clone(),
            tokens.clone(),
            Inbox::default(),
            SessionClock::starting_at(t0()),
        );
        Self {
            handle,
            task,
            backend,
            channel,
            tokens,
        }
    }

    /// Lets spawned network tasks finish and their results be handled.
    ///
    /// Nothing here advances the paused clock past pending timers: only
    /// yields and inbox round trips.
    pub async fn settle(&self) {
        for _ in 0..4 {
            for _ in 0..8 {
                tokio::task::yield_now().await;
            }
            self.handle.flush().await.unwrap();
        }
    }

    pub async fn stop(self) {
        self.handle.shutdown().await.unwrap();
        self.task.await.unwrap();
    }
}
