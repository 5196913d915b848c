//! Administrative surface: thin pass-throughs for operators.
//!
//! Status queries expose the state, step and kind of the last error, never
//! the raw error text of a transport failure.

use chrono::{DateTime, Utc};
use hermes_types::{
    DltSystem, ErrorKind, GatewayId, GatewayRole, LocalLogEntry, Result, SessionId, SessionState,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::engine::Gateway;
use crate::recovery::RecoveryReport;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub id: SessionId,
    pub role: GatewayRole,
    pub state: SessionState,
    pub step: u32,
    pub last_sequence_number: u64,
    pub last_error_kind: Option<ErrorKind>,
    pub rollback: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub name: String,
    pub gateway_id: GatewayId,
    pub supported_dlts: Vec<DltSystem>,
    pub open_sessions: usize,
    pub storage_ok: bool,
}

impl Gateway {
    pub async fn session_status(&self, id: SessionId) -> Result<SessionStatus> {
        let session = self.store.get(&id).await?;
        Ok(SessionStatus {
            id: session.id,
            role: session.role,
            state: session.state,
            step: session.step,
            last_sequence_number: session.last_sequence_number,
            last_error_kind: session.last_error.as_ref().map(|e| e.kind),
            rollback: session.rollback,
            updated_at: session.updated_at,
        })
    }

    pub async fn list_session_ids(&self) -> Result<Vec<SessionId>> {
        self.store.list_ids().await
    }

    pub async fn trigger_recovery(&self) -> Result<RecoveryReport> {
        info!(parent: &self.span, "Recovery triggered by operator");
        self.recover_open_sessions().await
    }

    /// Never fails: a broken store is reported as `storage_ok = false`.
    pub async fn health_check(&self) -> HealthReport {
        let open = self.store.open_sessions().await;
        HealthReport {
            name: self.config.name.clone(),
            gateway_id: self.id,
            supported_dlts: self.supported.clone(),
            open_sessions: open.as_ref().map_or(0, Vec::len),
            storage_ok: open.is_ok(),
        }
    }

    /// Audit entries written in `[from, to]`.
    pub async fn audit_trail(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<LocalLogEntry>> {
        self.audit.read_by_time_interval(from, to).await
    }

    /// Latest audit entry for one session.
    pub async fn last_audit_entry(&self, id: SessionId) -> Result<Option<LocalLogEntry>> {
        self.audit.read_last_for_session(&id).await
    }
}
