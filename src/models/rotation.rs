use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::tenant_key::{KeyVersion, TenantId};

/// Per-tenant rotation state machine; `Committed` and `RolledBack` are terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationState {
    Started,
    Archived,
    Generated,
    Activated,
    Verifying,
    Committed,
    RolledBack,
    /// Aborted before any caller-visible key change
    Aborted,
}

impl RotationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RotationState::Committed | RotationState::RolledBack | RotationState::Aborted
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StateTransition {
    pub state: RotationState,
    pub at: DateTime<Utc>,
}

/// Audit trail of one tenant rotation
#[derive(Debug, Clone, Serialize)]
pub struct RotationRecord {
    pub tenant_id: TenantId,
    pub old_version: Option<KeyVersion>,
    pub new_version: Option<KeyVersion>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub state: RotationState,
    pub history: Vec<StateTransition>,
    /// Failure description; never contains key material or plaintext
    pub error: Option<String>,
    pub reencryption: Option<ReencryptionStats>,
}

impl RotationRecord {
    pub fn start(tenant_id: TenantId) -> Self {
        let now = Utc::now();
        Self {
            tenant_id,
            old_version: None,
            new_version: None,
            started_at: now,
            finished_at: None,
            state: RotationState::Started,
            history: vec![StateTransition { state: RotationState::Started, at: now }],
            error: None,
            reencryption: None,
        }
    }

    pub fn advance(&mut self, state: RotationState) {
        let at = Utc::now();
        self.state = state;
        self.history.push(StateTransition { state, at });
        if state.is_terminal() {
            self.finished_at = Some(at);
        }
    }

    pub fn fail(&mut self, state: RotationState, error: impl Into<String>) {
        self.error = Some(error.into());
        self.advance(state);
    }

    pub fn is_committed(&self) -> bool {
        self.state == RotationState::Committed
    }
}

/// Counters of one re-encryption pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReencryptionStats {
    pub scanned: usize,
    pub reencrypted: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl ReencryptionStats {
    pub fn merge(&mut self, other: &ReencryptionStats) {
        self.scanned += other.scanned;
        self.reencrypted += other.reencrypted;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}

/// Which tenants a rotation run covers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TenantSelector {
    All,
    Only(Vec<TenantId>),
}

/// Outcome of a multi-tenant rotation run
#[derive(Debug, Clone, Default, Serialize)]
pub struct RotationSummary {
    pub committed: usize,
    pub rolled_back: usize,
    pub failed: usize,
    pub records: Vec<RotationRecord>,
}

impl RotationSummary {
    pub fn push(&mut self, record: RotationRecord) {
        match record.state {
            RotationState::Committed => self.committed += 1,
            RotationState::RolledBack => self.rolled_back += 1,
            _ => self.failed += 1,
        }
        self.records.push(record);
    }

    pub fn all_committed(&self) -> bool {
        self.rolled_back == 0 && self.failed == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_history() {
        let mut record = RotationRecord::start(TenantId::new("D001").unwrap());
        record.advance(RotationState::Archived);
        assert!(record.finished_at.is_none());
        record.advance(RotationState::Committed);
        assert!(record.is_committed());
        assert!(record.finished_at.is_some());
        assert_eq!(record.history.len(), 3);
    }

    #[test]
    fn test_summary_counts() {
        let tenant = TenantId::new("D001").unwrap();
        let mut summary = RotationSummary::default();

        let mut ok = RotationRecord::start(tenant.clone());
        ok.advance(RotationState::Committed);
        summary.push(ok);
        assert!(summary.all_committed());

        let mut bad = RotationRecord::start(tenant);
        bad.fail(RotationState::Aborted, "archive write failed");
        summary.push(bad);

        assert_eq!(summary.committed, 1);
        assert_eq!(summary.failed, 1);
        assert!(!summary.all_committed());
    }
}
