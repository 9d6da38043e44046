// File: src/backend/graph.rs
// Microsoft Graph implementation of the calendar backend.
use crate::backend::{CalendarBackend, CreateSubscription, SubscriptionRecord};
use crate::error::{SyncError, SyncResult};
use crate::model::{CalendarRef, RawEvent};
use crate::token::TokenProvider;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use http::header::CONTENT_TYPE;
use http::{HeaderValue, Method, Request, StatusCode};
use http_body_util::BodyExt;
use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tower_http::auth::AddAuthorization;
use tower_service::Service;

type HttpsClient = Client<hyper_rustls::HttpsConnector<HttpConnector>, String>;

const EVENT_FIELDS: &str = "subject,organizer,start,end";

/// Graph collection page.
#[derive(Debug, Deserialize)]
struct Page<T> {
    #[serde(default = "Vec::new")]
    value: Vec<T>,
    #[serde(rename = "@odata.nextLink", default)]
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GraphCalendar {
    id: String,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct GraphErrorBody {
    error: GraphErrorDetail,
}

#[derive(Debug, Deserialize)]
struct GraphErrorDetail {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

/// Maps an HTTP status and body onto the error taxonomy.
pub fn classify(status: StatusCode, body: &str) -> SyncError {
    let detail = serde_json::from_str::<GraphErrorBody>(body)
        .map(|b| format!("{}: {}", b.error.code, b.error.message))
        .unwrap_or_else(|_| body.chars().take(200).collect());

    if status == StatusCode::UNAUTHORIZED {
        SyncError::AuthExpired(detail)
    } else if status.is_client_error() {
        SyncError::rejected(status.as_u16(), detail)
    } else {
        SyncError::BackendUnavailable(format!("{}: {}", status, detail))
    }
}

#[derive(Clone)]
pub struct GraphBackend {
    base_url: String,
    client: HttpsClient,
    tokens: Arc<dyn TokenProvider>,
    scopes: Vec<String>,
}

impl std::fmt::Debug for GraphBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphBackend")
            .field("base_url", &self.base_url)
            .field("scopes", &self.scopes)
            .finish()
    }
}

impl GraphBackend {
    pub fn new(
        base_url: &str,
        tokens: Arc<dyn TokenProvider>,
        scopes: Vec<String>,
    ) -> SyncResult<Self> {
        let _: http::Uri = base_url
            .parse()
            .map_err(|e: http::uri::InvalidUri| SyncError::InvalidPayload(e.to_string()))?;

        let mut root_store = rustls::RootCertStore::empty();
        let result = rustls_native_certs::load_native_certs();
        root_store.add_parsable_certificates(result.certs);
        if root_store.is_empty() {
            log::warn!("No system certificates found; only plain http endpoints will work");
        }
        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        let tls_config = rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| SyncError::BackendUnavailable(format!("TLS setup failed: {}", e)))?
            .with_root_certificates(root_store)
            .with_no_client_auth();

        let https_connector = HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .build();

        let client = Client::builder(TokioExecutor::new()).build(https_connector);

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            tokens,
            scopes,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Sends one request. A 401 is retried once with a forced token refresh.
    async fn send(&self, method: Method, url: &str, body: Option<String>) -> SyncResult<String> {
        let mut force_refresh = false;
        loop {
            let token = self.tokens.get_token(&self.scopes, force_refresh).await?;
            match self.send_once(&method, url, body.clone(), &token.access_token).await {
                Err(SyncError::AuthExpired(msg)) if !force_refresh => {
                    log::debug!("Graph returned 401 ({}), retrying with fresh token", msg);
                    force_refresh = true;
                }
                other => return other,
            }
        }
    }

    async fn send_once(
        &self,
        method: &Method,
        url: &str,
        body: Option<String>,
        token: &str,
    ) -> SyncResult<String> {
        // AddAuthorization panics on values that are not valid header text.
        HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|_| SyncError::AuthExpired("token is not a valid header value".into()))?;

        let mut builder = Request::builder().method(method.clone()).uri(url);
        if body.is_some() {
            builder = builder.header(CONTENT_TYPE, "application/json");
        }
        let req = builder
            .header("Prefer", "outlook.timezone=\"UTC\"")
            .body(body.unwrap_or_default())
            .map_err(|e| SyncError::InvalidPayload(e.to_string()))?;

        let mut svc = AddAuthorization::bearer(self.client.clone(), token);
        futures::future::poll_fn(|cx| svc.poll_ready(cx))
            .await
            .map_err(|e| SyncError::BackendUnavailable(e.to_string()))?;

        log::debug!("{} {}", method, url);
        let resp = svc
            .call(req)
            .await
            .map_err(|e| SyncError::BackendUnavailable(e.to_string()))?;

        let status = resp.status();
        let bytes = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| SyncError::BackendUnavailable(e.to_string()))?
            .to_bytes();
        let text = String::from_utf8_lossy(&bytes).to_string();

        if status.is_success() {
            Ok(text)
        } else {
            Err(classify(status, &text))
        }
    }

    async fn get_json<T: DeserializeOwned + Send>(&self, url: &str) -> SyncResult<T> {
        let text = self.send(Method::GET, url, None).await?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Collects every page of a collection, following `@odata.nextLink`.
    async fn get_all<T: DeserializeOwned + Send>(&self, first_url: String) -> SyncResult<Vec<T>> {
        let mut items = Vec::new();
        let mut next = Some(first_url);
        while let Some(url) = next {
            let page: Page<T> = self.get_json(&url).await?;
            items.extend(page.value);
            next = page.next_link;
        }
        Ok(items)
    }
}

#[async_trait]
impl CalendarBackend for GraphBackend {
    async fn list_calendars(&self) -> SyncResult<Vec<CalendarRef>> {
        let cals: Vec<GraphCalendar> = self
            .get_all(self.url("me/calendars?$select=id,name"))
            .await?;
        Ok(CalendarRef::enumerate(
            cals.into_iter().map(|c| (c.id, c.name)),
        ))
    }

    async fn list_events(&self, calendar_id: &str) -> SyncResult<Vec<RawEvent>> {
        let url = self.url(&format!(
            "me/calendars/{}/events?$select={}",
            calendar_id, EVENT_FIELDS
        ));
        self.get_all(url).await
    }

    async fn create_subscription(
        &self,
        request: &CreateSubscription,
    ) -> SyncResult<SubscriptionRecord> {
        let body = serde_json::to_string(request)?;
        let text = self
            .send(Method::POST, &self.url("subscriptions"), Some(body))
            .await?;
        Ok(serde_json::from_str(&text)?)
    }

    async fn renew_subscription(
        &self,
        subscription_id: &str,
        new_expiry: DateTime<Utc>,
    ) -> SyncResult<SubscriptionRecord> {
        let body = serde_json::json!({ "expirationDateTime": new_expiry }).to_string();
        let text = self
            .send(
                Method::PATCH,
                &self.url(&format!("subscriptions/{}", subscription_id)),
                Some(body),
            )
            .await?;
        Ok(serde_json::from_str(&text)?)
    }

    async fn delete_subscription(&self, subscription_id: &str) -> SyncResult<()> {
        self.send(
            Method::DELETE,
            &self.url(&format!("subscriptions/{}", subscription_id)),
            None,
        )
        .await?;
        Ok(())
    }
}
