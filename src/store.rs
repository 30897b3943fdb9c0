//! Collaborator interfaces consumed by the pipeline.
//!
//! The pipeline never owns persistence or notification delivery. It talks to
//! an [`ErrorStore`] and an [`AlertDispatcher`]; the in-memory and tracing
//! implementations here back tests and the CLI.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::analysis::RootCauseAnalysisResult;
use crate::errors::{DispatchError, StoreError};
use crate::monitor::{Alert, AlertPattern};
use crate::types::{ErrorClassification, ErrorContext, Severity, SystemEvent};

/// Filter for prior classifications.
#[derive(Debug, Clone, Default)]
pub struct ClassificationQuery {
    pub fingerprint: Option<String>,
    pub agent_type: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

/// Filter for system events.
#[derive(Debug, Clone)]
pub struct EventQuery {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub agent_id: Option<String>,
    pub min_severity: Option<Severity>,
    pub limit: Option<usize>,
}

impl EventQuery {
    pub fn between(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start,
            end,
            agent_id: None,
            min_severity: None,
            limit: None,
        }
    }
}

/// Persistent store of structured records.
#[async_trait]
pub trait ErrorStore: Send + Sync {
    async fn store_context(&self, context: &ErrorContext) -> Result<(), StoreError>;

    async fn get_context(&self, error_id: &str) -> Result<Option<ErrorContext>, StoreError>;

    /// Store a classification, superseding (never deleting) any previous one
    /// for the same error. Returns the stored version number.
    async fn store_classification(
        &self,
        classification: &ErrorClassification,
    ) -> Result<u32, StoreError>;

    async fn current_classification(
        &self,
        error_id: &str,
    ) -> Result<Option<ErrorClassification>, StoreError>;

    async fn classification_history(
        &self,
        error_id: &str,
    ) -> Result<Vec<ErrorClassification>, StoreError>;

    /// Current classifications matching the query.
    async fn find_classifications(
        &self,
        query: &ClassificationQuery,
    ) -> Result<Vec<ErrorClassification>, StoreError>;

    async fn append_event(&self, event: &SystemEvent) -> Result<(), StoreError>;

    async fn query_events(&self, query: &EventQuery) -> Result<Vec<SystemEvent>, StoreError>;

    async fn store_analysis(&self, result: &RootCauseAnalysisResult) -> Result<(), StoreError>;

    async fn get_analysis(
        &self,
        error_id: &str,
    ) -> Result<Option<RootCauseAnalysisResult>, StoreError>;

    async fn store_alert_pattern(&self, pattern: &AlertPattern) -> Result<(), StoreError>;

    async fn store_alert(&self, alert: &Alert) -> Result<(), StoreError>;
}

/// Outbound notification delivery, one channel per call.
#[async_trait]
pub trait AlertDispatcher: Send + Sync {
    async fn send(&self, alert: &Alert, channel: &str) -> Result<(), DispatchError>;
}

/// Send an alert to every channel in turn, logging and continuing past
/// per-channel failures. Returns the channels that accepted it.
pub async fn dispatch_to_channels(
    dispatcher: &dyn AlertDispatcher,
    alert: &Alert,
    channels: &[String],
) -> Vec<String> {
    let mut delivered = Vec::with_capacity(channels.len());
    for channel in channels {
        match dispatcher.send(alert, channel).await {
            Ok(()) => delivered.push(channel.clone()),
            Err(e) => {
                warn!(alert_id = %alert.id, channel = %channel, error = %e, "Alert delivery failed");
            }
        }
    }
    delivered
}

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Default)]
struct StoreState {
    contexts: HashMap<String, ErrorContext>,
    /// Per error id, oldest first. The last entry is current.
    classifications: HashMap<String, Vec<ErrorClassification>>,
    events: Vec<SystemEvent>,
    analyses: HashMap<String, RootCauseAnalysisResult>,
    alert_patterns: HashMap<String, AlertPattern>,
    alerts: Vec<Alert>,
}

/// Process-local [`ErrorStore`].
#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<StoreState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.state.read().alerts.clone()
    }

    pub fn alert_patterns(&self) -> Vec<AlertPattern> {
        self.state.read().alert_patterns.values().cloned().collect()
    }

    pub fn event_count(&self) -> usize {
        self.state.read().events.len()
    }
}

#[async_trait]
impl ErrorStore for InMemoryStore {
    async fn store_context(&self, context: &ErrorContext) -> Result<(), StoreError> {
        self.state
            .write()
            .contexts
            .insert(context.error_id.clone(), context.clone());
        Ok(())
    }

    async fn get_context(&self, error_id: &str) -> Result<Option<ErrorContext>, StoreError> {
        Ok(self.state.read().contexts.get(error_id).cloned())
    }

    async fn store_classification(
        &self,
        classification: &ErrorClassification,
    ) -> Result<u32, StoreError> {
        let mut state = self.state.write();
        let history = state
            .classifications
            .entry(classification.error_id.clone())
            .or_default();
        let version = history.last().map(|c| c.version + 1).unwrap_or(0);
        let mut record = classification.clone();
        record.version = version;
        history.push(record);
        Ok(version)
    }

    async fn current_classification(
        &self,
        error_id: &str,
    ) -> Result<Option<ErrorClassification>, StoreError> {
        Ok(self
            .state
            .read()
            .classifications
            .get(error_id)
            .and_then(|h| h.last().cloned()))
    }

    async fn classification_history(
        &self,
        error_id: &str,
    ) -> Result<Vec<ErrorClassification>, StoreError> {
        Ok(self
            .state
            .read()
            .classifications
            .get(error_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn find_classifications(
        &self,
        query: &ClassificationQuery,
    ) -> Result<Vec<ErrorClassification>, StoreError> {
        let state = self.state.read();
        let mut matches: Vec<ErrorClassification> = state
            .classifications
            .values()
            .filter_map(|h| h.last())
            .filter(|c| {
                query
                    .fingerprint
                    .as_ref()
                    .map(|f| &c.fingerprint == f)
                    .unwrap_or(true)
            })
            .filter(|c| {
                query
                    .agent_type
                    .as_ref()
                    .map(|t| &c.agent_type == t)
                    .unwrap_or(true)
            })
            .filter(|c| query.since.map(|s| c.classified_at >= s).unwrap_or(true))
            .cloned()
            .collect();
        matches.sort_by(|a, b| b.classified_at.cmp(&a.classified_at));
        if let Some(limit) = query.limit {
            matches.truncate(limit);
        }
        Ok(matches)
    }

    async fn append_event(&self, event: &SystemEvent) -> Result<(), StoreError> {
        self.state.write().events.push(event.clone());
        Ok(())
    }

    async fn query_events(&self, query: &EventQuery) -> Result<Vec<SystemEvent>, StoreError> {
        let state = self.state.read();
        let mut events: Vec<SystemEvent> = state
            .events
            .iter()
            .filter(|e| e.timestamp >= query.start && e.timestamp <= query.end)
            .filter(|e| {
                query
                    .agent_id
                    .as_ref()
                    .map(|a| &e.agent_id == a)
                    .unwrap_or(true)
            })
            .filter(|e| query.min_severity.map(|s| e.severity >= s).unwrap_or(true))
            .cloned()
            .collect();
        events.sort_by_key(|e| e.timestamp);
        if let Some(limit) = query.limit {
            events.truncate(limit);
        }
        Ok(events)
    }

    async fn store_analysis(&self, result: &RootCauseAnalysisResult) -> Result<(), StoreError> {
        self.state
            .write()
            .analyses
            .insert(result.error_id.clone(), result.clone());
        Ok(())
    }

    async fn get_analysis(
        &self,
        error_id: &str,
    ) -> Result<Option<RootCauseAnalysisResult>, StoreError> {
        Ok(self.state.read().analyses.get(error_id).cloned())
    }

    async fn store_alert_pattern(&self, pattern: &AlertPattern) -> Result<(), StoreError> {
        self.state
            .write()
            .alert_patterns
            .insert(pattern.name.clone(), pattern.clone());
        Ok(())
    }

    async fn store_alert(&self, alert: &Alert) -> Result<(), StoreError> {
        self.state.write().alerts.push(alert.clone());
        Ok(())
    }
}

// ============================================================================
// Dispatchers
// ============================================================================

/// Dispatcher that writes alerts to the tracing log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDispatcher;

#[async_trait]
impl AlertDispatcher for TracingDispatcher {
    async fn send(&self, alert: &Alert, channel: &str) -> Result<(), DispatchError> {
        info!(
            channel = %channel,
            alert_id = %alert.id,
            pattern = %alert.pattern_name,
            severity = %alert.severity,
            "{}",
            alert.message
        );
        Ok(())
    }
}

/// Dispatcher that forwards alerts to in-process consumers keyed by channel.
pub struct ChannelDispatcher {
    channels: HashMap<String, mpsc::Sender<Alert>>,
}

impl ChannelDispatcher {
    pub fn new() -> Self {
        Self {
            channels: HashMap::new(),
        }
    }

    /// Register a channel and return its receiving end.
    pub fn register(&mut self, channel: &str, buffer: usize) -> mpsc::Receiver<Alert> {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        self.channels.insert(channel.to_string(), tx);
        rx
    }
}

impl Default for ChannelDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AlertDispatcher for ChannelDispatcher {
    async fn send(&self, alert: &Alert, channel: &str) -> Result<(), DispatchError> {
        let tx = self
            .channels
            .get(channel)
            .ok_or_else(|| DispatchError::UnknownChannel(channel.to_string()))?;
        tx.send(alert.clone())
            .await
            .map_err(|e| DispatchError::Channel {
                channel: channel.to_string(),
                message: e.to_string(),
            })
    }
}
