//! Narrow seams to the outside world the coordinator depends on, together
//! with the in-process defaults used when nothing else is wired in.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::Result;

/// Existence checks for ids referenced by a request.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ValidationLookups: Send + Sync {
    async fn data_source_exists(&self, id: &str) -> Result<bool>;

    /// Returns the subset of `ids` that do not name a known rule.
    async fn invalid_rule_ids(&self, ids: &[String]) -> Result<Vec<String>>;
}

/// Per-requester throttle. Errors are treated as "allow".
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn check(&self, requester: &str) -> Result<bool>;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

pub type MetricLabels = Vec<(&'static str, String)>;

/// Counters, gauges and histograms.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn record(&self, kind: MetricKind, name: &'static str, value: f64, labels: MetricLabels);

    async fn increment(&self, name: &'static str, labels: MetricLabels) {
        self.record(MetricKind::Counter, name, 1.0, labels).await;
    }

    async fn gauge(&self, name: &'static str, value: f64, labels: MetricLabels) {
        self.record(MetricKind::Gauge, name, value, labels).await;
    }

    async fn histogram(&self, name: &'static str, value: f64, labels: MetricLabels) {
        self.record(MetricKind::Histogram, name, value, labels).await;
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub severity: AlertSeverity,
    pub source: String,
    pub message: String,
    pub value: Option<f64>,
    pub raised_at: DateTime<Utc>,
}

impl Alert {
    pub fn new(severity: AlertSeverity, source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity,
            source: source.into(),
            message: message.into(),
            value: None,
            raised_at: Utc::now(),
        }
    }

    pub fn with_value(mut self, value: f64) -> Self {
        self.value = Some(value);
        self
    }
}

/// Threshold-triggered notifications.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn notify(&self, alert: Alert) -> Result<()>;
}

/// Lookups backed by fixed id sets. `permissive()` accepts everything.
#[derive(Clone, Debug, Default)]
pub struct StaticValidationLookups {
    data_sources: Option<HashSet<String>>,
    rules: Option<HashSet<String>>,
}

impl StaticValidationLookups {
    pub fn permissive() -> Self {
        Self::default()
    }

    pub fn new<D, R>(data_sources: D, rules: R) -> Self
    where
        D: IntoIterator,
        D::Item: Into<String>,
        R: IntoIterator,
        R::Item: Into<String>,
    {
        Self {
            data_sources: Some(data_sources.into_iter().map(Into::into).collect()),
            rules: Some(rules.into_iter().map(Into::into).collect()),
        }
    }
}

#[async_trait]
impl ValidationLookups for StaticValidationLookups {
    async fn data_source_exists(&self, id: &str) -> Result<bool> {
        Ok(self
            .data_sources
            .as_ref()
            .is_none_or(|known| known.contains(id)))
    }

    async fn invalid_rule_ids(&self, ids: &[String]) -> Result<Vec<String>> {
        let Some(known) = &self.rules else {
            return Ok(Vec::new());
        };
        Ok(ids.iter().filter(|id| !known.contains(*id)).cloned().collect())
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopRateLimiter;

#[async_trait]
impl RateLimiter for NoopRateLimiter {
    async fn check(&self, _requester: &str) -> Result<bool> {
        Ok(true)
    }
}

/// Emits every metric as a structured tracing event.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingTelemetry;

#[async_trait]
impl TelemetrySink for TracingTelemetry {
    async fn record(&self, kind: MetricKind, name: &'static str, value: f64, labels: MetricLabels) {
        tracing::debug!(
            target: "scanflow::telemetry",
            metric = name,
            kind = ?kind,
            value,
            labels = ?labels,
            "metric"
        );
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct MetricRecord {
    pub kind: MetricKind,
    pub name: &'static str,
    pub value: f64,
    pub labels: MetricLabels,
}

/// Keeps every recorded metric; used by tests and the demo host.
#[derive(Clone, Default)]
pub struct InMemoryTelemetry {
    records: Arc<Mutex<Vec<MetricRecord>>>,
}

impl fmt::Debug for InMemoryTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("InMemoryTelemetry");
        match self.records.try_lock() {
            Ok(records) => debug.field("records", &records.len()),
            Err(_) => debug.field("records", &"<locked>"),
        };
        debug.finish()
    }
}

impl InMemoryTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<MetricRecord> {
        self.records.lock().await.clone()
    }

    pub async fn counter_total(&self, name: &str) -> f64 {
        self.records
            .lock()
            .await
            .iter()
            .filter(|r| r.kind == MetricKind::Counter && r.name == name)
            .map(|r| r.value)
            .sum()
    }

    pub async fn last_gauge(&self, name: &str) -> Option<f64> {
        self.records
            .lock()
            .await
            .iter()
            .rev()
            .find(|r| r.kind == MetricKind::Gauge && r.name == name)
            .map(|r| r.value)
    }
}

#[async_trait]
impl TelemetrySink for InMemoryTelemetry {
    async fn record(&self, kind: MetricKind, name: &'static str, value: f64, labels: MetricLabels) {
        self.records.lock().await.push(MetricRecord {
            kind,
            name,
            value,
            labels,
        });
    }
}

/// Logs alerts; critical ones at `warn`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn notify(&self, alert: Alert) -> Result<()> {
        match alert.severity {
            AlertSeverity::Info => info!(
                target: "scanflow::monitor",
                source = %alert.source,
                value = ?alert.value,
                "{}", alert.message
            ),
            AlertSeverity::Warning | AlertSeverity::Critical => warn!(
                target: "scanflow::monitor",
                severity = ?alert.severity,
                source = %alert.source,
                value = ?alert.value,
                "{}", alert.message
            ),
        }
        Ok(())
    }
}

/// Collects alerts in memory.
#[derive(Clone, Debug, Default)]
pub struct RecordingAlertSink {
    alerts: Arc<Mutex<Vec<Alert>>>,
}

impl RecordingAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().await.clone()
    }
}

#[async_trait]
impl AlertSink for RecordingAlertSink {
    async fn notify(&self, alert: Alert) -> Result<()> {
        self.alerts.lock().await.push(alert);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_lookups_report_unknown_ids() {
        let lookups = StaticValidationLookups::new(["warehouse"], ["pii", "gdpr"]);
        assert!(lookups.data_source_exists("warehouse").await.unwrap());
        assert!(!lookups.data_source_exists("lake").await.unwrap());
        let bad = lookups
            .invalid_rule_ids(&["pii".to_string(), "sox".to_string()])
            .await
            .unwrap();
        assert_eq!(bad, vec!["sox".to_string()]);

        let open = StaticValidationLookups::permissive();
        assert!(open.data_source_exists("anything").await.unwrap());
    }

    #[tokio::test]
    async fn in_memory_telemetry_aggregates() {
        let sink = InMemoryTelemetry::new();
        sink.increment("submitted", vec![]).await;
        sink.increment("submitted", vec![("priority", "high".into())]).await;
        sink.gauge("cpu", 0.4, vec![]).await;
        sink.gauge("cpu", 0.7, vec![]).await;
        assert_eq!(sink.counter_total("submitted").await, 2.0);
        assert_eq!(sink.last_gauge("cpu").await, Some(0.7));
        assert_eq!(sink.last_gauge("memory").await, None);
    }
}
