//! Analytics event tracking
//!
//! Handlers hand events to a `Tracker`. `dispatch` runs the sink on a
//! detached task and drops any error after logging it; only the `/track`
//! endpoint awaits the sink and reports failures.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::{header, HeaderMap};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, thiserror::Error)]
pub enum AnalyticsError {
    #[error("Analytics transport failed: {0}")]
    Transport(String),

    #[error("Analytics endpoint rejected event with status {0}")]
    Rejected(u16),
}

impl From<reqwest::Error> for AnalyticsError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => AnalyticsError::Rejected(status.as_u16()),
            None => AnalyticsError::Transport(err.to_string()),
        }
    }
}

/// A named event with free-form properties
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingEvent {
    #[serde(rename = "event", alias = "name")]
    pub name: String,
    #[serde(default)]
    pub properties: Map<String, Value>,
    #[serde(
        rename = "trackingID",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub tracking_id: Option<String>,
}

impl TrackingEvent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: Map::new(),
            tracking_id: None,
        }
    }

    pub fn property(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.properties.insert(key.to_string(), value.into());
        self
    }

    pub fn tracking_id(mut self, tracking_id: Option<String>) -> Self {
        self.tracking_id = tracking_id.filter(|t| !t.is_empty());
        self
    }
}

/// Request metadata forwarded with every event
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

impl RequestContext {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let get = |name: &str| {
            headers
                .get(name)
                .and_then(|h| h.to_str().ok())
                .map(str::to_owned)
        };

        let ip = get("x-forwarded-for")
            .and_then(|xff| xff.split(',').next().map(|s| s.trim().to_string()))
            .or_else(|| get("x-real-ip"));

        Self {
            ip,
            user_agent: get(header::USER_AGENT.as_str()),
        }
    }
}

/// Where tracked events go
#[async_trait]
pub trait AnalyticsSink: Send + Sync {
    async fn track(
        &self,
        event: &TrackingEvent,
        context: &RequestContext,
        user_email: Option<&str>,
    ) -> Result<(), AnalyticsError>;
}

/// Writes events to the log
pub struct LogSink;

#[async_trait]
impl AnalyticsSink for LogSink {
    async fn track(
        &self,
        event: &TrackingEvent,
        context: &RequestContext,
        user_email: Option<&str>,
    ) -> Result<(), AnalyticsError> {
        tracing::info!(
            event = %event.name,
            tracking_id = ?event.tracking_id,
            email = ?user_email,
            ip = ?context.ip,
            properties = %serde_json::Value::Object(event.properties.clone()),
            "analytics event"
        );
        Ok(())
    }
}

/// Posts events as JSON to an HTTP collector
pub struct HttpSink {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
}

impl HttpSink {
    pub fn new(endpoint: impl Into<String>, token: Option<String>) -> Result<Self, AnalyticsError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            token,
        })
    }

    fn payload(
        &self,
        event: &TrackingEvent,
        context: &RequestContext,
        user_email: Option<&str>,
    ) -> Value {
        let mut properties = event.properties.clone();
        let distinct_id = event
            .tracking_id
            .as_deref()
            .or(user_email)
            .map(str::to_owned);

        if let Some(token) = &self.token {
            properties.insert("token".into(), Value::from(token.as_str()));
        }
        if let Some(id) = distinct_id {
            properties.insert("distinct_id".into(), Value::from(id));
        }
        if let Some(email) = user_email {
            properties.insert("email".into(), Value::from(email));
        }
        if let Some(ip) = &context.ip {
            properties.insert("ip".into(), Value::from(ip.as_str()));
        }
        if let Some(ua) = &context.user_agent {
            properties.insert("user_agent".into(), Value::from(ua.as_str()));
        }

        serde_json::json!({
            "event": event.name,
            "properties": properties,
        })
    }
}

#[async_trait]
impl AnalyticsSink for HttpSink {
    async fn track(
        &self,
        event: &TrackingEvent,
        context: &RequestContext,
        user_email: Option<&str>,
    ) -> Result<(), AnalyticsError> {
        self.client
            .post(&self.endpoint)
            .json(&self.payload(event, context, user_email))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Front door for analytics
#[derive(Clone)]
pub struct Tracker {
    sink: Arc<dyn AnalyticsSink>,
}

impl Tracker {
    pub fn new(sink: Arc<dyn AnalyticsSink>) -> Self {
        Self { sink }
    }

    /// HTTP sink when an endpoint is configured, log sink otherwise
    pub fn from_config(
        endpoint: Option<&str>,
        token: Option<String>,
    ) -> Result<Self, AnalyticsError> {
        let sink: Arc<dyn AnalyticsSink> = match endpoint {
            Some(endpoint) => {
                tracing::info!(endpoint = %endpoint, "Analytics events sent over HTTP");
                Arc::new(HttpSink::new(endpoint, token)?)
            }
            None => {
                tracing::info!("ANALYTICS_ENDPOINT not set, analytics events are logged only");
                Arc::new(LogSink)
            }
        };
        Ok(Self::new(sink))
    }

    /// Send and wait for the sink's verdict
    pub async fn track(
        &self,
        event: &TrackingEvent,
        context: &RequestContext,
        user_email: Option<&str>,
    ) -> Result<(), AnalyticsError> {
        self.sink.track(event, context, user_email).await
    }

    /// Fire-and-forget: the sink runs on a detached task and its errors are dropped
    pub fn dispatch(&self, event: TrackingEvent, context: RequestContext, user_email: Option<String>) {
        let sink = self.sink.clone();
        tokio::spawn(async move {
            if let Err(e) = sink.track(&event, &context, user_email.as_deref()).await {
                tracing::warn!(event = %event.name, error = %e, "Dropped analytics event");
            }
        });
    }
}

/// Derive the `Source` property from a `ref` parameter (`"action: subscribed"` → `"action"`)
pub fn source_from_ref(reference: &str) -> String {
    let reference = reference.trim();
    reference
        .split_once(':')
        .map(|(source, _)| source.trim())
        .unwrap_or(reference)
        .to_string()
}
