// File: ./src/backend/mod.rs
//! Calendar backend abstraction.
//!
//! The sync actor only talks to the backend through [`CalendarBackend`], so
//! tests can swap in an in-memory implementation and production uses
//! [`graph::GraphBackend`].
pub mod graph;

use crate::error::SyncResult;
use crate::model::{CalendarRef, RawEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use graph::GraphBackend;

/// Change types every subscription asks for.
pub const CHANGE_TYPES: &str = "created,updated,deleted";

/// Body of a create-subscription request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSubscription {
    pub change_type: String,
    pub notification_url: String,
    pub resource: String,
    pub expiration_date_time: DateTime<Utc>,
}

/// Subscription as acknowledged by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRecord {
    pub id: String,
    #[serde(default)]
    pub resource: String,
    pub expiration_date_time: DateTime<Utc>,
}

#[async_trait]
pub trait CalendarBackend: Send + Sync {
    async fn list_calendars(&self) -> SyncResult<Vec<CalendarRef>>;

    async fn list_events(&self, calendar_id: &str) -> SyncResult<Vec<RawEvent>>;

    async fn create_subscription(
        &self,
        request: &CreateSubscription,
    ) -> SyncResult<SubscriptionRecord>;

    async fn renew_subscription(
        &self,
        subscription_id: &str,
        new_expiry: DateTime<Utc>,
    ) -> SyncResult<SubscriptionRecord>;

    async fn delete_subscription(&self, subscription_id: &str) -> SyncResult<()>;
}
