//! Audit events emitted by the pipeline.

use tracing::info;

/// Lifecycle events worth an audit trail entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditEvent {
    JobDeployed {
        username: String,
        job_name: String,
        job_version: String,
    },
    JobRedeployed {
        username: String,
        job_name: String,
        job_version: String,
    },
    JobMoved {
        username: String,
        job_name: String,
        job_version: String,
        target: String,
    },
    JobDeleted {
        username: String,
        job_name: String,
        job_version: String,
    },
}

pub trait AuditLog: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Audit sink writing structured log lines.
pub struct TracingAuditLog;

impl AuditLog for TracingAuditLog {
    fn record(&self, event: AuditEvent) {
        match &event {
            AuditEvent::JobDeployed {
                username,
                job_name,
                job_version,
            } => info!(%username, %job_name, %job_version, "audit: job deployed"),
            AuditEvent::JobRedeployed {
                username,
                job_name,
                job_version,
            } => info!(%username, %job_name, %job_version, "audit: job redeployed"),
            AuditEvent::JobMoved {
                username,
                job_name,
                job_version,
                target,
            } => info!(%username, %job_name, %job_version, %target, "audit: job moved"),
            AuditEvent::JobDeleted {
                username,
                job_name,
                job_version,
            } => info!(%username, %job_name, %job_version, "audit: job deleted"),
        }
    }
}
