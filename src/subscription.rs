// File: src/subscription.rs
// Push-subscription lifecycle: create, renew ahead of expiry, delete.
use crate::backend::{CHANGE_TYPES, CalendarBackend, CreateSubscription, SubscriptionRecord};
use crate::error::{SyncError, SyncResult};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use strum::Display;

/// Resource path watched by the subscription for a calendar.
pub fn resource_for(calendar_id: &str) -> String {
    format!("me/calendars/{}/events", calendar_id)
}

/// Inverse of [`resource_for`].
pub fn calendar_id_from_resource(resource: &str) -> Option<&str> {
    let rest = resource.trim_start_matches('/').strip_prefix("me/calendars/")?;
    let id = rest.strip_suffix("/events")?;
    if id.is_empty() || id.contains('/') {
        None
    } else {
        Some(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum SubscriptionState {
    /// Create request sent, no backend id yet.
    Pending,
    Active,
    /// Renewal request in flight.
    RenewalDue,
    Expired,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// Backend identifier; `None` while the create is pending.
    pub id: Option<String>,
    pub resource: String,
    pub calendar_id: String,
    pub expiration: DateTime<Utc>,
    pub lifetime: Duration,
    pub state: SubscriptionState,
}

impl Subscription {
    /// Instant at which a renewal should be issued.
    pub fn due_at(&self, handicap: Duration) -> DateTime<Utc> {
        self.expiration - handicap
    }

    pub fn is_due(&self, now: DateTime<Utc>, handicap: Duration) -> bool {
        self.due_at(handicap) <= now
    }
}

#[derive(Debug, Clone)]
pub struct SubscriptionPolicy {
    pub lifetime: Duration,
    pub handicap: Duration,
    pub notification_url: String,
}

impl SubscriptionPolicy {
    pub fn new(lifetime: Duration, handicap: Duration, notification_url: impl Into<String>) -> Self {
        Self {
            lifetime,
            handicap,
            notification_url: notification_url.into(),
        }
    }
}

/// A renewal the caller has to send to the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenewRequest {
    pub subscription_id: String,
    pub calendar_id: String,
    pub new_expiry: DateTime<Utc>,
}

/// Result of feeding a create completion back into the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    Active(Subscription),
    Failed(SyncError),
    /// The calendar was dropped while the create was in flight. The remote
    /// subscription has no owner and should be deleted.
    Orphaned { subscription_id: String },
}

/// Owns every subscription record, keyed by backend calendar id.
///
/// Each network operation is split into a `begin_*` half that updates the
/// table and returns the request to send, and a `finish_*` half that consumes
/// the backend response. The sync actor runs the request in a spawned task
/// between the two. The async methods at the bottom compose both halves for
/// sequential callers.
#[derive(Debug)]
pub struct SubscriptionManager {
    policy: SubscriptionPolicy,
    records: HashMap<String, Subscription>,
}

impl SubscriptionManager {
    pub fn new(policy: SubscriptionPolicy) -> Self {
        Self {
            policy,
            records: HashMap::new(),
        }
    }

    pub fn policy(&self) -> &SubscriptionPolicy {
        &self.policy
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, calendar_id: &str) -> bool {
        self.records.contains_key(calendar_id)
    }

    /// Cloned snapshot of the record for `calendar_id`.
    pub fn get(&self, calendar_id: &str) -> Option<Subscription> {
        self.records.get(calendar_id).cloned()
    }

    // --- create ---

    /// Registers a pending record and returns the create request, or `None`
    /// when the calendar already has a live subscription.
    pub fn begin_subscribe(
        &mut self,
        calendar_id: &str,
        now: DateTime<Utc>,
    ) -> Option<CreateSubscription> {
        if let Some(existing) = self.records.get(calendar_id)
            && !matches!(
                existing.state,
                SubscriptionState::Expired | SubscriptionState::Deleted
            )
        {
            return None;
        }

        let resource = resource_for(calendar_id);
        let expiration = now + self.policy.lifetime;
        self.records.insert(
            calendar_id.to_string(),
            Subscription {
                id: None,
                resource: resource.clone(),
                calendar_id: calendar_id.to_string(),
                expiration,
                lifetime: self.policy.lifetime,
                state: SubscriptionState::Pending,
            },
        );

        Some(CreateSubscription {
            change_type: CHANGE_TYPES.to_string(),
            notification_url: self.policy.notification_url.clone(),
            resource,
            expiration_date_time: expiration,
        })
    }

    pub fn finish_subscribe(
        &mut self,
        calendar_id: &str,
        result: SyncResult<SubscriptionRecord>,
    ) -> CreateOutcome {
        let is_pending = self
            .records
            .get(calendar_id)
            .is_some_and(|s| s.state == SubscriptionState::Pending);

        match (is_pending, result) {
            (true, Ok(record)) => match self.records.get_mut(calendar_id) {
                Some(sub) => {
                    sub.id = Some(record.id);
                    sub.expiration = record.expiration_date_time;
                    sub.state = SubscriptionState::Active;
                    log::info!(
                        "Subscription for {} active until {}",
                        calendar_id,
                        sub.expiration
                    );
                    CreateOutcome::Active(sub.clone())
                }
                None => CreateOutcome::Orphaned {
                    subscription_id: record.id,
                },
            },
            (true, Err(e)) => {
                self.records.remove(calendar_id);
                CreateOutcome::Failed(e)
            }
            (false, Ok(record)) => CreateOutcome::Orphaned {
                subscription_id: record.id,
            },
            (false, Err(_)) => CreateOutcome::Failed(SyncError::StaleResult(format!(
                "create for {} no longer pending",
                calendar_id
            ))),
        }
    }

    // --- renew ---

    /// Marks an active subscription as renewing and returns the request.
    ///
    /// The new expiry extends the current expiration, not `now`.
    pub fn begin_renew(&mut self, subscription_id: &str) -> Option<RenewRequest> {
        let sub = self.record_by_id_mut(subscription_id)?;
        if sub.state != SubscriptionState::Active {
            return None;
        }
        sub.state = SubscriptionState::RenewalDue;
        Some(RenewRequest {
            subscription_id: subscription_id.to_string(),
            calendar_id: sub.calendar_id.clone(),
            new_expiry: sub.expiration + sub.lifetime,
        })
    }

    /// Applies a renewal response.
    ///
    /// Transient failures leave the record as it was so the next tick retries.
    /// A rejection means the backend no longer knows the subscription, so the
    /// record is dropped and the caller may create a fresh one.
    pub fn finish_renew(
        &mut self,
        subscription_id: &str,
        result: SyncResult<SubscriptionRecord>,
    ) -> SyncResult<Subscription> {
        let Some(calendar_id) = self
            .record_by_id(subscription_id)
            .map(|s| s.calendar_id.clone())
        else {
            return Err(SyncError::StaleResult(format!(
                "renewal for unknown subscription {}",
                subscription_id
            )));
        };

        match result {
            Ok(record) => {
                let sub = self
                    .records
                    .get_mut(&calendar_id)
                    .ok_or_else(|| SyncError::StaleResult(calendar_id.clone()))?;
                sub.expiration = record.expiration_date_time;
                sub.state = SubscriptionState::Active;
                log::debug!(
                    "Renewed subscription {} until {}",
                    subscription_id,
                    sub.expiration
                );
                Ok(sub.clone())
            }
            Err(e @ SyncError::RejectedByBackend { .. }) => {
                log::warn!(
                    "Backend rejected renewal of {} ({}), dropping record",
                    subscription_id,
                    e
                );
                self.records.remove(&calendar_id);
                Err(e)
            }
            Err(e) => {
                if let Some(sub) = self.records.get_mut(&calendar_id)
                    && sub.state == SubscriptionState::RenewalDue
                {
                    sub.state = SubscriptionState::Active;
                }
                Err(e)
            }
        }
    }

    /// Plans renewals for every subscription whose due instant has passed.
    ///
    /// Subscriptions already past their expiration are marked `Expired`
    /// instead of renewed.
    pub fn plan_due(&mut self, now: DateTime<Utc>) -> Vec<RenewRequest> {
        let handicap = self.policy.handicap;
        let mut due_ids = Vec::new();

        for sub in self.records.values_mut() {
            if sub.state != SubscriptionState::Active || !sub.is_due(now, handicap) {
                continue;
            }
            if sub.expiration <= now {
                log::warn!("Subscription for {} lapsed at {}", sub.calendar_id, sub.expiration);
                sub.state = SubscriptionState::Expired;
                continue;
            }
            if let Some(id) = &sub.id {
                due_ids.push(id.clone());
            }
        }

        due_ids.sort();
        due_ids
            .iter()
            .filter_map(|id| self.begin_renew(id))
            .collect()
    }

    /// Calendars whose subscription lapsed and needs to be created again.
    pub fn expired(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .records
            .values()
            .filter(|s| s.state == SubscriptionState::Expired)
            .map(|s| s.calendar_id.clone())
            .collect();
        ids.sort();
        ids
    }

    // --- delete ---

    /// Removes the local record unconditionally. Returns the backend id to
    /// delete remotely, if the subscription got that far.
    pub fn detach(&mut self, calendar_id: &str) -> Option<String> {
        let mut sub = self.records.remove(calendar_id)?;
        sub.state = SubscriptionState::Deleted;
        sub.id
    }

    pub fn clear(&mut self) -> Vec<String> {
        self.records.drain().filter_map(|(_, s)| s.id).collect()
    }

    // --- schedule ---

    /// Shared renewal period: shortest lifetime minus the handicap.
    pub fn renewal_period(&self) -> Option<Duration> {
        let shortest = self.records.values().map(|s| s.lifetime).min()?;
        let period = shortest - self.policy.handicap;
        Some(period.max(Duration::seconds(1)))
    }

    /// Earliest instant at which some active subscription becomes due.
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.records
            .values()
            .filter(|s| s.state == SubscriptionState::Active)
            .map(|s| s.due_at(self.policy.handicap))
            .min()
    }

    fn record_by_id(&self, subscription_id: &str) -> Option<&Subscription> {
        self.records
            .values()
            .find(|s| s.id.as_deref() == Some(subscription_id))
    }

    fn record_by_id_mut(&mut self, subscription_id: &str) -> Option<&mut Subscription> {
        self.records
            .values_mut()
            .find(|s| s.id.as_deref() == Some(subscription_id))
    }

    // --- sequential convenience forms ---

    pub async fn subscribe(
        &mut self,
        backend: &dyn CalendarBackend,
        calendar_id: &str,
        now: DateTime<Utc>,
    ) -> SyncResult<Subscription> {
        let Some(request) = self.begin_subscribe(calendar_id, now) else {
            return self
                .get(calendar_id)
                .ok_or_else(|| SyncError::StaleResult(calendar_id.to_string()));
        };

        let result = backend.create_subscription(&request).await;
        match self.finish_subscribe(calendar_id, result) {
            CreateOutcome::Active(sub) => Ok(sub),
            CreateOutcome::Failed(e) => Err(e),
            CreateOutcome::Orphaned { subscription_id } => {
                if let Err(e) = backend.delete_subscription(&subscription_id).await {
                    log::warn!("Failed to delete orphan subscription {}: {}", subscription_id, e);
                }
                Err(SyncError::StaleResult(calendar_id.to_string()))
            }
        }
    }

    pub async fn renew(
        &mut self,
        backend: &dyn CalendarBackend,
        subscription_id: &str,
    ) -> SyncResult<Subscription> {
        let request = self.begin_renew(subscription_id).ok_or_else(|| {
            SyncError::StaleResult(format!("subscription {} not renewable", subscription_id))
        })?;
        let result = backend
            .renew_subscription(&request.subscription_id, request.new_expiry)
            .await;
        self.finish_renew(subscription_id, result)
    }

    pub async fn unsubscribe(&mut self, backend: &dyn CalendarBackend, calendar_id: &str) {
        if let Some(id) = self.detach(calendar_id)
            && let Err(e) = backend.delete_subscription(&id).await
        {
            log::warn!("Failed to delete subscription {}: {}", id, e);
        }
    }

    pub async fn renew_all_due(
        &mut self,
        backend: &dyn CalendarBackend,
        now: DateTime<Utc>,
    ) -> Vec<SyncResult<Subscription>> {
        let mut results = Vec::new();
        for request in self.plan_due(now) {
            let result = backend
                .renew_subscription(&request.subscription_id, request.new_expiry)
                .await;
            results.push(self.finish_renew(&request.subscription_id, result));
        }
        results
    }
}
