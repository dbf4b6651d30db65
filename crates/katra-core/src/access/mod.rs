//! Access Control
//!
//! Every query path filters returned records through one predicate. Query
//! filtering is silent (a filter, not an error); direct retrieval of a record
//! the requester cannot see raises the distinct `AccessDenied` code so
//! clients can tell authorization from absence.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection};

use crate::error::Result;
use crate::memory::{Isolation, MemoryRecord};

// ============================================================================
// TEAM DIRECTORY
// ============================================================================

/// Membership oracle for team-isolated records
///
/// The engine treats the team store as a collaborator: only this one question
/// is ever asked of it.
pub trait TeamDirectory: Send + Sync {
    /// Is `ci_id` a member of `team_name`?
    fn is_member(&self, team_name: &str, ci_id: &str) -> bool;
}

/// Directory that knows no teams; team-isolated records stay owner-only
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTeams;

impl TeamDirectory for NoTeams {
    fn is_member(&self, _team_name: &str, _ci_id: &str) -> bool {
        false
    }
}

/// SQLite-backed team directory over the shared `teams.db`
pub struct SqliteTeamDirectory {
    conn: Mutex<Connection>,
}

impl SqliteTeamDirectory {
    /// Open (and create if absent) the team directory at `path`
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;
             CREATE TABLE IF NOT EXISTS team_members (
                 team_name TEXT NOT NULL,
                 ci_id     TEXT NOT NULL,
                 added_at  TEXT NOT NULL,
                 PRIMARY KEY (team_name, ci_id)
             );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Add a member; idempotent
    pub fn add_member(&self, team_name: &str, ci_id: &str) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| crate::error::KatraError::Logic("team directory lock poisoned".into()))?;
        conn.execute(
            "INSERT OR IGNORE INTO team_members (team_name, ci_id, added_at) VALUES (?1, ?2, ?3)",
            params![team_name, ci_id, chrono::Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Remove a member; returns whether a row was deleted
    pub fn remove_member(&self, team_name: &str, ci_id: &str) -> Result<bool> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| crate::error::KatraError::Logic("team directory lock poisoned".into()))?;
        let n = conn.execute(
            "DELETE FROM team_members WHERE team_name = ?1 AND ci_id = ?2",
            params![team_name, ci_id],
        )?;
        Ok(n > 0)
    }
}

impl TeamDirectory for SqliteTeamDirectory {
    fn is_member(&self, team_name: &str, ci_id: &str) -> bool {
        let Ok(conn) = self.conn.lock() else {
            tracing::warn!("team directory lock poisoned; denying membership check");
            return false;
        };
        let found: rusqlite::Result<i64> = conn.query_row(
            "SELECT COUNT(*) FROM team_members WHERE team_name = ?1 AND ci_id = ?2",
            params![team_name, ci_id],
            |row| row.get(0),
        );
        match found {
            Ok(n) => n > 0,
            Err(e) => {
                tracing::warn!(team_name, ci_id, error = %e, "membership lookup failed; denying");
                false
            }
        }
    }
}

// ============================================================================
// ACCESS POLICY
// ============================================================================

/// The one access predicate applied on every query path
#[derive(Clone)]
pub struct AccessPolicy {
    teams: Arc<dyn TeamDirectory>,
}

impl AccessPolicy {
    /// Policy backed by a team directory
    pub fn new(teams: Arc<dyn TeamDirectory>) -> Self {
        Self { teams }
    }

    /// Policy with no team store; team isolation degrades to owner-only
    pub fn without_teams() -> Self {
        Self {
            teams: Arc::new(NoTeams),
        }
    }

    /// Grant access iff any holds: owner, public, team member, explicit share.
    ///
    /// `requester = None` means owner context: no filtering.
    pub fn permits(&self, record: &MemoryRecord, requester: Option<&str>) -> bool {
        let Some(requester) = requester else {
            return true;
        };
        if requester == record.ci_id {
            return true;
        }
        match record.isolation {
            Isolation::Public => return true,
            Isolation::Team => {
                if let Some(team) = record.team_name.as_deref() {
                    if self.teams.is_member(team, requester) {
                        return true;
                    }
                }
            }
            Isolation::Private => {}
        }
        record.shared_with.iter().any(|ci| ci == requester)
    }

    /// Silently drop records the requester cannot see
    pub fn filter(&self, records: Vec<MemoryRecord>, requester: Option<&str>) -> Vec<MemoryRecord> {
        records
            .into_iter()
            .filter(|r| self.permits(r, requester))
            .collect()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::RecordType;

    fn record(isolation: Isolation, team: Option<&str>) -> MemoryRecord {
        MemoryRecord::new("ci-owner", RecordType::Experience, "secret", 0.5)
            .unwrap()
            .with_isolation(isolation, team.map(String::from))
            .unwrap()
    }

    #[test]
    fn test_owner_context_sees_everything() {
        let policy = AccessPolicy::without_teams();
        let r = record(Isolation::Private, None);
        assert!(policy.permits(&r, None));
        assert!(policy.permits(&r, Some("ci-owner")));
    }

    #[test]
    fn test_private_denies_strangers() {
        let policy = AccessPolicy::without_teams();
        let r = record(Isolation::Private, None);
        assert!(!policy.permits(&r, Some("ci-other")));
    }

    #[test]
    fn test_public_grants_anyone() {
        let policy = AccessPolicy::without_teams();
        let r = record(Isolation::Public, None);
        assert!(policy.permits(&r, Some("ci-other")));
    }

    #[test]
    fn test_explicit_share_bypasses_isolation() {
        let policy = AccessPolicy::without_teams();
        let r = record(Isolation::Private, None).share_with("ci-friend");
        assert!(policy.permits(&r, Some("ci-friend")));
        assert!(!policy.permits(&r, Some("ci-stranger")));
    }

    #[test]
    fn test_team_membership_consulted() {
        let dir = tempfile::tempdir().unwrap();
        let teams = SqliteTeamDirectory::open(&dir.path().join("teams.db")).unwrap();
        teams.add_member("ops", "ci-mate").unwrap();

        let policy = AccessPolicy::new(Arc::new(teams));
        let r = record(Isolation::Team, Some("ops"));
        assert!(policy.permits(&r, Some("ci-mate")));
        assert!(!policy.permits(&r, Some("ci-outsider")));
    }

    #[test]
    fn test_filter_drops_silently() {
        let policy = AccessPolicy::without_teams();
        let visible = record(Isolation::Public, None);
        let hidden = record(Isolation::Private, None);
        let out = policy.filter(vec![visible.clone(), hidden], Some("ci-other"));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].record_id, visible.record_id);
    }
}
