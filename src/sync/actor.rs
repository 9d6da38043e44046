// File: ./src/sync/actor.rs
// The per-session sync actor: one inbox, one loop, network calls spawned off.
use crate::backend::CalendarBackend;
use crate::channel::{Inbound, Outbound, RealtimeChannel};
use crate::config::Config;
use crate::error::{SyncError, SyncResult};
use crate::membership::RoomMembership;
use crate::model::{CalendarEvent, CalendarRef, RawEvent, RawNotification};
use crate::scheduler::{Scheduler, SessionClock, Timer};
use crate::store::{EventList, NotifiedIds};
use crate::subscription::{CreateOutcome, Subscription, SubscriptionManager, SubscriptionPolicy};
use crate::sync::handle::{Inbox, SyncHandle};
use crate::sync::message::{Command, FetchMode, Message, Notice};
use crate::token::{Token, TokenProvider};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Minimum spacing between renewal ticks while a renewal keeps failing.
const RENEWAL_RETRY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub user_id: String,
    pub scopes: Vec<String>,
    pub policy: SubscriptionPolicy,
    pub token_refresh_interval: Duration,
    pub auto_refresh_interval: Option<Duration>,
    /// Calendars selected as soon as the actor starts.
    pub initial_selection: Vec<String>,
    /// Select every calendar once the first calendar list arrives.
    pub select_all_on_start: bool,
}

impl SyncSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            user_id: config.user_id.clone(),
            scopes: config.scopes.clone(),
            policy: config.subscription_policy(),
            token_refresh_interval: config.token_refresh_interval(),
            auto_refresh_interval: config.auto_refresh_interval(),
            initial_selection: config.default_calendars.clone(),
            select_all_on_start: config.select_all_on_start,
        }
    }
}

/// Per-calendar selection state. Unselected calendars have no entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Selection {
    /// Initial fetch in flight.
    Selecting(u64),
    Selected(u64),
}

impl Selection {
    fn generation(self) -> u64 {
        match self {
            Selection::Selecting(g) | Selection::Selected(g) => g,
        }
    }
}

/// Fetches of one calendar still in flight, and what notifications changed
/// since the first of them was spawned.
#[derive(Debug, Default)]
struct PendingFetch {
    generation: u64,
    in_flight: usize,
    notified: NotifiedIds,
}

enum Wake {
    Message(Option<Message>),
    Timer(Timer),
}

pub struct SyncActor {
    settings: SyncSettings,
    backend: Arc<dyn CalendarBackend>,
    channel: Arc<dyn RealtimeChannel>,
    tokens: Arc<dyn TokenProvider>,
    clock: SessionClock,

    rx: mpsc::Receiver<Message>,
    // Weak so that dropping every handle ends the loop.
    tx: mpsc::WeakSender<Message>,

    calendars: Vec<CalendarRef>,
    selection: BTreeMap<String, Selection>,
    next_generation: u64,
    select_all_pending: bool,
    /// Calendars whose subscription create failed; not retried until
    /// reselected or refreshed.
    subscription_failed: HashSet<String>,
    pending_fetches: HashMap<String, PendingFetch>,

    events: EventList,
    subscriptions: SubscriptionManager,
    membership: RoomMembership,
    scheduler: Scheduler,

    dirty: bool,
    view_tx: watch::Sender<Arc<Vec<CalendarEvent>>>,
    calendars_tx: watch::Sender<Arc<Vec<CalendarRef>>>,
    notices: broadcast::Sender<Notice>,
}

impl SyncActor {
    /// Builds the actor and its handle without starting it.
    pub fn new(
        settings: SyncSettings,
        backend: Arc<dyn CalendarBackend>,
        channel: Arc<dyn RealtimeChannel>,
        tokens: Arc<dyn TokenProvider>,
        inbox: Inbox,
        clock: SessionClock,
    ) -> (Self, SyncHandle) {
        let (view_tx, view_rx) = watch::channel(Arc::new(Vec::new()));
        let (calendars_tx, calendars_rx) = watch::channel(Arc::new(Vec::new()));
        let (notices, _) = broadcast::channel(64);

        let Inbox { tx, rx } = inbox;
        let handle = SyncHandle {
            tx: tx.clone(),
            view: view_rx,
            calendars: calendars_rx,
            notices: notices.clone(),
        };

        let actor = Self {
            subscriptions: SubscriptionManager::new(settings.policy.clone()),
            membership: RoomMembership::new(settings.user_id.clone()),
            scheduler: Scheduler::new(
                settings.token_refresh_interval,
                settings.auto_refresh_interval,
            ),
            select_all_pending: settings.select_all_on_start,
            settings,
            backend,
            channel,
            tokens,
            clock,
            rx,
            tx: tx.downgrade(),
            calendars: Vec::new(),
            selection: BTreeMap::new(),
            next_generation: 0,
            subscription_failed: HashSet::new(),
            pending_fetches: HashMap::new(),
            events: EventList::new(),
            dirty: false,
            view_tx,
            calendars_tx,
            notices,
        };
        (actor, handle)
    }

    /// Builds the actor and runs it on a new task.
    pub fn spawn(
        settings: SyncSettings,
        backend: Arc<dyn CalendarBackend>,
        channel: Arc<dyn RealtimeChannel>,
        tokens: Arc<dyn TokenProvider>,
        inbox: Inbox,
        clock: SessionClock,
    ) -> (SyncHandle, JoinHandle<()>) {
        let (actor, handle) = Self::new(settings, backend, channel, tokens, inbox, clock);
        (handle, tokio::spawn(actor.run()))
    }

    pub async fn run(mut self) {
        self.startup();

        loop {
            let wake = tokio::select! {
                msg = self.rx.recv() => Wake::Message(msg),
                timer = self.scheduler.next_timer() => Wake::Timer(timer),
            };

            let msg = match wake {
                Wake::Message(Some(msg)) => msg,
                Wake::Message(None) => break,
                Wake::Timer(timer) => {
                    self.on_timer(timer);
                    self.publish_if_dirty();
                    continue;
                }
            };

            let mut keep_running = self.handle(msg);
            // Drain whatever queued up behind it so one view update covers the batch.
            while keep_running && let Ok(msg) = self.rx.try_recv() {
                keep_running = self.handle(msg);
            }
            self.publish_if_dirty();

            if !keep_running {
                break;
            }
        }

        self.teardown().await;
    }

    fn startup(&mut self) {
        log::info!("Sync actor starting for user '{}'", self.settings.user_id);
        self.scheduler.start(Instant::now());
        self.spawn_calendar_list();
        self.spawn_token_refresh(false);
        for calendar_id in self.settings.initial_selection.clone() {
            self.select(&calendar_id);
        }
    }

    async fn teardown(&mut self) {
        log::info!("Sync actor stopping");
        self.scheduler.stop();
        for calendar_id in self.selection.keys().cloned().collect::<Vec<_>>() {
            if let Err(e) = self.membership.leave(self.channel.as_ref(), &calendar_id) {
                log::debug!("Leave on shutdown failed: {}", e);
            }
        }
        for subscription_id in self.subscriptions.clear() {
            if let Err(e) = self.backend.delete_subscription(&subscription_id).await {
                log::warn!("Failed to delete subscription {}: {}", subscription_id, e);
            }
        }
    }

    /// Handles one message. Returns `false` when the actor should stop.
    fn handle(&mut self, msg: Message) -> bool {
        match msg {
            Message::Command(cmd) => return self.on_command(cmd),
            Message::Inbound(inbound) => self.on_inbound(inbound),
            Message::CalendarsLoaded(result) => self.on_calendars_loaded(result),
            Message::EventsFetched {
                calendar_id,
                generation,
                mode,
                result,
            } => self.on_events_fetched(&calendar_id, generation, mode, result),
            Message::SubscriptionCreated {
                calendar_id,
                result,
            } => {
                let outcome = self.subscriptions.finish_subscribe(&calendar_id, result);
                self.on_subscription_created(&calendar_id, outcome);
            }
            Message::SubscriptionRenewed {
                subscription_id,
                calendar_id,
                result,
            } => {
                let result = self.subscriptions.finish_renew(&subscription_id, result);
                self.on_subscription_renewed(&calendar_id, result);
            }
            Message::SubscriptionDeleted {
                subscription_id,
                result,
            } => {
                if let Err(e) = result {
                    log::warn!("Failed to delete subscription {}: {}", subscription_id, e);
                }
            }
            Message::TokenRefreshed(result) => self.on_token_refreshed(result),
        }
        true
    }

    // --- commands ---

    fn on_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Select(calendar_id) => self.select(&calendar_id),
            Command::Deselect(calendar_id) => self.deselect(&calendar_id),
            Command::SelectAll => {
                let ids: Vec<String> = self.calendars.iter().map(|c| c.id.clone()).collect();
                for id in ids {
                    self.select(&id);
                }
            }
            Command::DeselectAll => {
                for id in self.selected_ids() {
                    self.deselect(&id);
                }
            }
            Command::Refresh => {
                self.refresh_selected();
                self.retry_failed_subscriptions();
            }
            Command::RefreshCalendars => self.spawn_calendar_list(),
            Command::Flush(reply) => {
                let _ = reply.send(());
            }
            Command::Shutdown => return false,
        }
        true
    }

    fn select(&mut self, calendar_id: &str) {
        if self.selection.contains_key(calendar_id) {
            log::debug!("Calendar {} already selected", calendar_id);
            return;
        }
        self.next_generation += 1;
        let generation = self.next_generation;
        self.selection
            .insert(calendar_id.to_string(), Selection::Selecting(generation));
        self.subscription_failed.remove(calendar_id);
        log::info!("Selecting calendar {} (generation {})", calendar_id, generation);

        if let Err(e) = self.membership.join(self.channel.as_ref(), calendar_id) {
            self.report(e);
        }
        self.spawn_fetch(calendar_id, generation, FetchMode::Merge);
        self.start_subscription(calendar_id);
    }

    fn deselect(&mut self, calendar_id: &str) {
        if self.selection.remove(calendar_id).is_none() {
            log::debug!("Calendar {} not selected", calendar_id);
            return;
        }
        log::info!("Deselecting calendar {}", calendar_id);

        if let Err(e) = self.membership.leave(self.channel.as_ref(), calendar_id) {
            self.report(e);
        }
        if let Some(subscription_id) = self.subscriptions.detach(calendar_id) {
            self.spawn_subscription_delete(subscription_id);
        }
        self.subscription_failed.remove(calendar_id);
        self.pending_fetches.remove(calendar_id);
        self.rearm_renewal();

        if self.events.purge_calendar(calendar_id) > 0 {
            self.dirty = true;
        }
    }

    fn refresh_selected(&mut self) {
        let targets: Vec<(String, u64)> = self
            .selection
            .iter()
            .map(|(id, sel)| (id.clone(), sel.generation()))
            .collect();
        for (calendar_id, generation) in targets {
            self.spawn_fetch(&calendar_id, generation, FetchMode::Replace);
        }
    }

    fn retry_failed_subscriptions(&mut self) {
        let failed: Vec<String> = self.subscription_failed.drain().collect();
        for calendar_id in failed {
            if self.selection.contains_key(&calendar_id) {
                self.start_subscription(&calendar_id);
            }
        }
    }

    fn selected_ids(&self) -> Vec<String> {
        self.selection.keys().cloned().collect()
    }

    // --- inbound notifications ---

    fn on_inbound(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::AddEvent { calendar_id, event } => self.on_add_event(calendar_id, event),
            Inbound::UpdateEvent { calendar_id, event } => {
                self.on_update_event(calendar_id, event)
            }
            Inbound::DeleteEvent { event_id, .. } => {
                for pending in self.pending_fetches.values_mut() {
                    pending.notified.tombstone(&event_id);
                }
                if self.events.apply_delete(&event_id) {
                    self.dirty = true;
                }
            }
            Inbound::Reconnect => self.on_reconnect(),
        }
    }

    /// Resolves the owning calendar of a notification. Without an explicit
    /// calendar id the event is attributed to the only joined room, if there
    /// is exactly one.
    fn owning_calendar(&self, calendar_id: Option<String>) -> Option<String> {
        match calendar_id {
            Some(id) => self.membership.is_joined(&id).then_some(id),
            None => {
                let mut joined = self.membership.joined();
                match (joined.next(), joined.next()) {
                    (Some(only), None) => Some(only.to_string()),
                    _ => None,
                }
            }
        }
    }

    fn on_add_event(&mut self, calendar_id: Option<String>, raw: RawNotification) {
        let Some(owner) = self.owning_calendar(calendar_id.clone()) else {
            log::debug!(
                "Dropping add_event {} for calendar {:?}: room not joined",
                raw.id,
                calendar_id
            );
            return;
        };
        match raw.normalize(&owner) {
            Ok(event) => {
                self.note_touched(&event.id);
                if self.events.apply_add(event) {
                    self.dirty = true;
                }
            }
            Err(e) => self.report(e),
        }
    }

    fn on_update_event(&mut self, calendar_id: Option<String>, raw: RawNotification) {
        let Some(existing) = self.events.get(&raw.id).cloned() else {
            log::debug!("update_event for unknown event {}", raw.id);
            return;
        };
        let owner = match calendar_id {
            Some(id) if self.membership.is_joined(&id) => id,
            Some(id) => {
                log::debug!("Dropping update_event {}: room {} not joined", raw.id, id);
                return;
            }
            None => existing.calendar_id.clone(),
        };

        match raw.merge_into(&existing) {
            Ok(mut merged) => {
                merged.calendar_id = owner;
                self.note_touched(&merged.id);
                if self.events.apply_update(merged) {
                    self.dirty = true;
                }
            }
            Err(e) => self.report(e),
        }
    }

    /// A fetch still in flight must not overwrite what a notification just did.
    fn note_touched(&mut self, event_id: &str) {
        for pending in self.pending_fetches.values_mut() {
            pending.notified.touch(event_id);
        }
    }

    fn on_reconnect(&mut self) {
        log::info!("Real-time channel reconnected");
        let selected = self.selected_ids();
        if let Err(e) = self
            .membership
            .reconcile(self.channel.as_ref(), selected.iter().map(String::as_str))
        {
            self.report(e);
        }
        // The new server session needs our token and may have missed notifications.
        self.spawn_token_refresh(false);
        self.refresh_selected();
        let _ = self.notices.send(Notice::Reconnected);
    }

    // --- network completions ---

    fn on_calendars_loaded(&mut self, result: SyncResult<Vec<CalendarRef>>) {
        let calendars = match result {
            Ok(c) => c,
            Err(e) => return self.report(e),
        };
        log::info!("Loaded {} calendar(s)", calendars.len());

        let known: HashSet<&str> = calendars.iter().map(|c| c.id.as_str()).collect();
        let vanished: Vec<String> = self
            .selection
            .keys()
            .filter(|id| !known.contains(id.as_str()))
            .cloned()
            .collect();

        self.calendars = calendars;
        self.calendars_tx
            .send_replace(Arc::new(self.calendars.clone()));
        let _ = self
            .notices
            .send(Notice::CalendarsUpdated(self.calendars.len()));

        for id in vanished {
            log::warn!("Selected calendar {} is no longer listed", id);
            self.deselect(&id);
        }

        if self.select_all_pending {
            self.select_all_pending = false;
            let ids: Vec<String> = self.calendars.iter().map(|c| c.id.clone()).collect();
            for id in ids {
                self.select(&id);
            }
        }
    }

    fn on_events_fetched(
        &mut self,
        calendar_id: &str,
        generation: u64,
        mode: FetchMode,
        result: SyncResult<Vec<RawEvent>>,
    ) {
        match self.selection.get(calendar_id) {
            Some(sel) if sel.generation() == generation => {}
            _ => {
                log::debug!("{}", SyncError::StaleResult(calendar_id.to_string()));
                return;
            }
        }

        let notified = self.finish_fetch(calendar_id, generation);
        let raw = match result {
            Ok(raw) => raw,
            Err(e) => return self.report(e),
        };

        let mut events = Vec::with_capacity(raw.len());
        for item in &raw {
            match item.normalize(calendar_id) {
                Ok(ev) => events.push(ev),
                Err(e) => log::warn!("Skipping event from {}: {}", calendar_id, e),
            }
        }
        log::debug!("Fetched {} event(s) for {}", events.len(), calendar_id);

        let changed = match mode {
            FetchMode::Merge => self.events.bulk_add_after(calendar_id, events, &notified),
            FetchMode::Replace => self.events.bulk_replace_after(calendar_id, events, &notified),
        };
        self.dirty |= changed;
        self.selection
            .insert(calendar_id.to_string(), Selection::Selected(generation));
    }

    /// Counts one fetch of `calendar_id` as done and returns the ids
    /// notifications changed since it was spawned.
    fn finish_fetch(&mut self, calendar_id: &str, generation: u64) -> NotifiedIds {
        let Some(pending) = self.pending_fetches.get_mut(calendar_id) else {
            return NotifiedIds::default();
        };
        if pending.generation != generation {
            return NotifiedIds::default();
        }
        pending.in_flight = pending.in_flight.saturating_sub(1);
        if pending.in_flight > 0 {
            return pending.notified.clone();
        }
        self.pending_fetches
            .remove(calendar_id)
            .map(|p| p.notified)
            .unwrap_or_default()
    }

    fn on_subscription_created(&mut self, calendar_id: &str, outcome: CreateOutcome) {
        match outcome {
            CreateOutcome::Active(_) => {
                self.subscription_failed.remove(calendar_id);
            }
            CreateOutcome::Orphaned { subscription_id } => {
                log::debug!(
                    "{}; deleting orphan subscription {}",
                    SyncError::StaleResult(calendar_id.to_string()),
                    subscription_id
                );
                self.spawn_subscription_delete(subscription_id);
            }
            CreateOutcome::Failed(e) => {
                // A create that timed out may still exist remotely, so a retry
                // waits for the user to reselect or refresh.
                self.subscription_failed.insert(calendar_id.to_string());
                log::error!("Subscription for {} not created: {}", calendar_id, e);
                let _ = self.notices.send(Notice::Error(e));
            }
        }
        self.rearm_renewal();
    }

    fn on_subscription_renewed(&mut self, calendar_id: &str, result: SyncResult<Subscription>) {
        match result {
            Ok(_) => {}
            Err(e @ SyncError::RejectedByBackend { .. }) => {
                self.report(e);
                // The record is gone; start over if the calendar is still wanted.
                if self.selection.contains_key(calendar_id) {
                    self.start_subscription(calendar_id);
                }
            }
            Err(e) => self.report(e),
        }
        self.rearm_renewal();
    }

    fn on_token_refreshed(&mut self, result: SyncResult<Token>) {
        match result {
            Ok(token) => {
                let push = Outbound::AccessToken {
                    user_id: self.settings.user_id.clone(),
                    access_token: token.access_token,
                };
                if let Err(e) = self.channel.emit(push) {
                    self.report(e);
                }
            }
            Err(e) => {
                // Token problems always reach the user, transient or not.
                log::error!("Token refresh failed: {}", e);
                let _ = self.notices.send(Notice::Error(e));
            }
        }
    }

    // --- timers ---

    fn on_timer(&mut self, timer: Timer) {
        log::debug!("Timer fired: {}", timer);
        self.scheduler.fired(timer, Instant::now());
        match timer {
            Timer::Renewal => self.on_renewal_tick(),
            Timer::TokenRefresh => self.spawn_token_refresh(true),
            Timer::AutoRefresh => self.refresh_selected(),
        }
    }

    fn on_renewal_tick(&mut self) {
        let now = self.clock.now();

        for request in self.subscriptions.plan_due(now) {
            let backend = self.backend.clone();
            self.spawn_task(async move {
                let result = backend
                    .renew_subscription(&request.subscription_id, request.new_expiry)
                    .await;
                Message::SubscriptionRenewed {
                    subscription_id: request.subscription_id,
                    calendar_id: request.calendar_id,
                    result,
                }
            });
        }

        for calendar_id in self.subscriptions.expired() {
            if let Some(subscription_id) = self.subscriptions.detach(&calendar_id) {
                self.spawn_subscription_delete(subscription_id);
            }
        }

        // Covers subscriptions that lapsed and were dropped above.
        for calendar_id in self.selected_ids() {
            if !self.subscriptions.contains(&calendar_id)
                && !self.subscription_failed.contains(&calendar_id)
            {
                self.start_subscription(&calendar_id);
            }
        }

        self.rearm_renewal();
    }

    /// Points the renewal timer at the earliest due subscription. Selected
    /// calendars still lacking a subscription get a retry one period out.
    fn rearm_renewal(&mut self) {
        let now = Instant::now();
        let mut at = self.subscriptions.next_due().map(|due| {
            let due = self.clock.instant_at(due);
            if due > now { due } else { now + RENEWAL_RETRY }
        });

        let missing = self.push_enabled()
            && self.selection.keys().any(|id| {
                !self.subscriptions.contains(id) && !self.subscription_failed.contains(id)
            });
        if missing {
            let period = self
                .subscriptions
                .renewal_period()
                .unwrap_or(self.settings.policy.lifetime - self.settings.policy.handicap)
                .to_std()
                .unwrap_or(RENEWAL_RETRY)
                .max(RENEWAL_RETRY);
            let retry = now + period;
            at = Some(at.map_or(retry, |a| a.min(retry)));
        }

        self.scheduler.arm_renewal(at);
    }

    // --- spawning ---

    fn push_enabled(&self) -> bool {
        !self.settings.policy.notification_url.is_empty()
    }

    fn start_subscription(&mut self, calendar_id: &str) {
        if !self.push_enabled() {
            log::debug!("No notification URL configured; skipping subscription for {}", calendar_id);
            return;
        }
        let Some(request) = self.subscriptions.begin_subscribe(calendar_id, self.clock.now()) else {
            return;
        };
        let backend = self.backend.clone();
        let calendar_id = calendar_id.to_string();
        self.spawn_task(async move {
            let result = backend.create_subscription(&request).await;
            Message::SubscriptionCreated {
                calendar_id,
                result,
            }
        });
    }

    fn spawn_fetch(&mut self, calendar_id: &str, generation: u64, mode: FetchMode) {
        let pending = self
            .pending_fetches
            .entry(calendar_id.to_string())
            .or_default();
        if pending.generation != generation {
            *pending = PendingFetch {
                generation,
                ..PendingFetch::default()
            };
        }
        pending.in_flight += 1;

        let backend = self.backend.clone();
        let calendar_id = calendar_id.to_string();
        self.spawn_task(async move {
            let result = backend.list_events(&calendar_id).await;
            Message::EventsFetched {
                calendar_id,
                generation,
                mode,
                result,
            }
        });
    }

    fn spawn_calendar_list(&self) {
        let backend = self.backend.clone();
        self.spawn_task(async move { Message::CalendarsLoaded(backend.list_calendars().await) });
    }

    fn spawn_subscription_delete(&self, subscription_id: String) {
        let backend = self.backend.clone();
        self.spawn_task(async move {
            let result = backend.delete_subscription(&subscription_id).await;
            Message::SubscriptionDeleted {
                subscription_id,
                result,
            }
        });
    }

    fn spawn_token_refresh(&self, force_refresh: bool) {
        let tokens = self.tokens.clone();
        let scopes = self.settings.scopes.clone();
        self.spawn_task(async move {
            Message::TokenRefreshed(tokens.get_token(&scopes, force_refresh).await)
        });
    }

    /// Runs `fut` on its own task and posts its result back into the inbox.
    fn spawn_task<F>(&self, fut: F)
    where
        F: Future<Output = Message> + Send + 'static,
    {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let msg = fut.await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(msg).await;
            }
        });
    }

    // --- output ---

    fn publish_if_dirty(&mut self) {
        if !self.dirty {
            return;
        }
        self.dirty = false;
        let snapshot = Arc::new(self.events.snapshot());
        log::debug!("View changed: {} event(s)", snapshot.len());
        self.view_tx.send_replace(snapshot);
    }

    fn report(&self, e: SyncError) {
        match &e {
            SyncError::StaleResult(_) => log::debug!("{}", e),
            _ if e.is_escalated() => {
                log::error!("{}", e);
                let _ = self.notices.send(Notice::Error(e));
            }
            _ => log::warn!("{}", e),
        }
    }
}
