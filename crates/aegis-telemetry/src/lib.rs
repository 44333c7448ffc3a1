//! Aegis Telemetry
//!
//! The observation side of the proxy: the append-only [`AuditSink`] every
//! terminal decision flows through, the [`AnomalyDetector`] that pattern-
//! matches the audit stream, and an atomic [`MetricsCollector`] snapshot.

pub mod anomaly;
pub mod audit;
pub mod metrics;

pub use anomaly::{
    AlertListener, AlertSeverity, AnomalyAlert, AnomalyConfig, AnomalyDetector, Mitigation,
};
pub use audit::{AuditConfig, AuditEntry, AuditOutcome, AuditSink};
pub use metrics::{MetricsCollector, MetricsSnapshot};
