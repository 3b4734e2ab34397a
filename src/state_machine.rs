//! Hot-migration state machine (component K): manages the marker/status
//! bookkeeping tables and the migrate/drain/cutover/cleanup-old
//! transitions described in §4.K.

use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::{info, info_span};

use crate::error::{MigrationError, MigrationResult};
use crate::migration_log::MarkerStatus;

pub const STATUS_TABLE: &str = "_migration_status";
pub const SCHEMA_IDENTITY_TABLE: &str = "_schema_identity";
pub const PROGRESS_TABLE: &str = "_migration_progress";
pub const ID_MAPPING_TABLE: &str = "_id_mapping";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationStatus {
    Migrating,
    Ready,
}

impl MigrationStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Migrating => "migrating",
            Self::Ready => "ready",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "migrating" => Some(Self::Migrating),
            "ready" => Some(Self::Ready),
            _ => None,
        }
    }
}

/// Snapshot of the old database's bookkeeping, read at the start of every
/// transition.
#[derive(Debug, Clone, Default)]
pub struct OldDbState {
    pub marker: Option<MarkerStatus>,
}

/// Snapshot of the new database's bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct NewDbState {
    pub status: Option<MigrationStatus>,
    pub schema_hash: Option<String>,
    pub schema_commit: Option<String>,
    pub last_replayed_log_id: Option<i64>,
    pub drain_completed: Option<bool>,
    pub id_mapping_present: bool,
    pub migration_progress_present: bool,
    pub migration_log_count: i64,
}

/// §4.K's full status report, reading all five bookkeeping tables with
/// `null` for any absent.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub old_marker: Option<String>,
    pub migration_log_count: i64,
    pub pending_replay_entries: Option<i64>,
    pub id_mapping_count: Option<i64>,
    pub new_status: Option<String>,
    pub schema_hash: Option<String>,
    pub schema_commit: Option<String>,
    pub id_mapping_present: bool,
    pub migration_progress_present: bool,
}

/// First 16 hex chars of the SHA-256 of `source` with LF line endings.
#[must_use]
pub fn schema_hash(source: &str) -> String {
    let normalized = source.replace("\r\n", "\n");
    let digest = Sha256::digest(normalized.as_bytes());
    hex::encode(digest)[..16].to_string()
}

/// **migrate**: old marker must be absent. Builds the bookkeeping rows the
/// caller must persist (the actual bulk copy — §4.H — runs separately and
/// feeds `id_mapping_count` in here for the report).
pub struct MigrateOutcome {
    pub schema_identity: SchemaIdentity,
    pub new_status: MigrationStatus,
    pub old_marker: MarkerStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchemaIdentity {
    pub schema_hash: String,
    pub schema_commit: Option<String>,
    pub created_utc: String,
}

/// Validates and performs the `migrate` transition per §4.K. Idempotent:
/// if `existing_new_db_matches` is true (a new-db file already exists with
/// a matching schema hash), returns the same outcome without requiring the
/// caller to redo the bulk copy.
pub fn migrate(old: &OldDbState, expected_schema_source: &str, schema_commit: Option<String>, existing_new_db_matches: bool) -> MigrationResult<MigrateOutcome> {
    let _span = info_span!("migrate").entered();
    if old.marker.is_some() && !existing_new_db_matches {
        return Err(MigrationError::StateTransition(
            "migrate requires the old database to have no migration marker".to_string(),
        ));
    }

    let identity = SchemaIdentity {
        schema_hash: schema_hash(expected_schema_source),
        schema_commit,
        created_utc: Utc::now().to_rfc3339(),
    };
    info!(hash = %identity.schema_hash, idempotent = existing_new_db_matches, "migrate");

    Ok(MigrateOutcome {
        schema_identity: identity,
        new_status: MigrationStatus::Migrating,
        old_marker: MarkerStatus::Recording,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct DrainTransition {
    /// Whether this call transitioned the marker `recording -> draining`.
    pub marker_transitioned: bool,
}

/// **drain** transition guard: the marker must be `recording` or
/// `draining`. On the first call it flips `recording -> draining`,
/// rejecting subsequent writes; later calls are no-ops on the marker.
pub fn begin_drain_transition(old: &OldDbState) -> MigrationResult<DrainTransition> {
    match old.marker {
        Some(MarkerStatus::Recording) => Ok(DrainTransition { marker_transitioned: true }),
        Some(MarkerStatus::Draining) => Ok(DrainTransition { marker_transitioned: false }),
        None => Err(MigrationError::StateTransition(
            "drain requires a migration marker in 'recording' or 'draining' state".to_string(),
        )),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CutoverOutcome {
    pub previous_status: MigrationStatus,
    pub id_mapping_dropped: bool,
    pub migration_progress_dropped: bool,
}

/// **cutover**: requires new-status in `{migrating, ready}`; if
/// `migrating`, `drain_completed` must be `true`. Idempotent when already
/// `ready` (drops nothing further, reports no-op drops).
pub fn cutover(new: &NewDbState) -> MigrationResult<CutoverOutcome> {
    let _span = info_span!("cutover").entered();
    let Some(status) = new.status else {
        return Err(MigrationError::StateTransition(
            "cutover requires a migration status row".to_string(),
        ));
    };
    match status {
        MigrationStatus::Migrating => {
            if new.drain_completed != Some(true) {
                return Err(MigrationError::StateTransition("Drain is not complete".to_string()));
            }
            Ok(CutoverOutcome {
                previous_status: status,
                id_mapping_dropped: new.id_mapping_present,
                migration_progress_dropped: new.migration_progress_present,
            })
        }
        MigrationStatus::Ready => Ok(CutoverOutcome {
            previous_status: status,
            id_mapping_dropped: false,
            migration_progress_dropped: false,
        }),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CleanupOutcome {
    pub marker_dropped: bool,
    pub log_dropped: bool,
    pub previous_marker_status: Option<String>,
}

/// **cleanup-old**: required old marker in `{draining, none}`; rejects
/// `recording`.
pub fn cleanup_old(old: &OldDbState) -> MigrationResult<CleanupOutcome> {
    let _span = info_span!("cleanup_old").entered();
    match old.marker {
        Some(MarkerStatus::Recording) => Err(MigrationError::StateTransition(
            "cleanup-old refuses while the marker is 'recording'".to_string(),
        )),
        Some(MarkerStatus::Draining) => Ok(CleanupOutcome {
            marker_dropped: true,
            log_dropped: true,
            previous_marker_status: Some(MarkerStatus::Draining.as_str().to_string()),
        }),
        None => Ok(CleanupOutcome {
            marker_dropped: false,
            log_dropped: false,
            previous_marker_status: None,
        }),
    }
}

/// Builds the full status report per §4.K from already-read table state.
#[must_use]
pub fn status_report(old: &OldDbState, new: &NewDbState) -> StatusReport {
    let pending_replay_entries = new
        .last_replayed_log_id
        .map(|last| (new.migration_log_count - last).max(0));
    StatusReport {
        old_marker: old.marker.map(|m| m.as_str().to_string()),
        migration_log_count: new.migration_log_count,
        pending_replay_entries,
        id_mapping_count: None,
        new_status: new.status.map(|s| s.as_str().to_string()),
        schema_hash: new.schema_hash.clone(),
        schema_commit: new.schema_commit.clone(),
        id_mapping_present: new.id_mapping_present,
        migration_progress_present: new.migration_progress_present,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrate_requires_absent_marker() {
        let old = OldDbState {
            marker: Some(MarkerStatus::Recording),
        };
        let result = migrate(&old, "CREATE TABLE t(id integer);", None, false);
        assert!(matches!(result, Err(MigrationError::StateTransition(_))));
    }

    #[test]
    fn migrate_idempotent_when_new_db_matches() {
        let old = OldDbState {
            marker: Some(MarkerStatus::Recording),
        };
        let result = migrate(&old, "CREATE TABLE t(id integer);", None, true);
        assert!(result.is_ok());
    }

    #[test]
    fn drain_requires_marker() {
        let old = OldDbState { marker: None };
        assert!(begin_drain_transition(&old).is_err());
    }

    #[test]
    fn drain_first_call_transitions_marker() {
        let old = OldDbState {
            marker: Some(MarkerStatus::Recording),
        };
        let t = begin_drain_transition(&old).unwrap();
        assert!(t.marker_transitioned);
    }

    #[test]
    fn scenario_6_cutover_refuses_when_drain_incomplete() {
        let new = NewDbState {
            status: Some(MigrationStatus::Migrating),
            drain_completed: Some(false),
            id_mapping_present: true,
            ..Default::default()
        };
        let result = cutover(&new);
        match result {
            Err(MigrationError::StateTransition(msg)) => assert_eq!(msg, "Drain is not complete"),
            other => panic!("expected StateTransition error, got {other:?}"),
        }
    }

    #[test]
    fn cutover_succeeds_when_drain_complete() {
        let new = NewDbState {
            status: Some(MigrationStatus::Migrating),
            drain_completed: Some(true),
            id_mapping_present: true,
            migration_progress_present: true,
            ..Default::default()
        };
        let outcome = cutover(&new).unwrap();
        assert!(outcome.id_mapping_dropped);
        assert!(outcome.migration_progress_dropped);
    }

    #[test]
    fn cutover_idempotent_when_ready() {
        let new = NewDbState {
            status: Some(MigrationStatus::Ready),
            ..Default::default()
        };
        let outcome = cutover(&new).unwrap();
        assert!(!outcome.id_mapping_dropped);
    }

    #[test]
    fn cleanup_rejects_recording() {
        let old = OldDbState {
            marker: Some(MarkerStatus::Recording),
        };
        assert!(cleanup_old(&old).is_err());
    }

    #[test]
    fn cleanup_drops_when_draining() {
        let old = OldDbState {
            marker: Some(MarkerStatus::Draining),
        };
        let outcome = cleanup_old(&old).unwrap();
        assert!(outcome.marker_dropped);
        assert!(outcome.log_dropped);
    }

    #[test]
    fn schema_hash_is_16_hex_chars() {
        let hash = schema_hash("CREATE TABLE t(id integer);\r\n");
        assert_eq!(hash.len(), 16);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(hash, schema_hash("CREATE TABLE t(id integer);\n"));
    }
}
