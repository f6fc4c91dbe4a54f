#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::collections::BTreeMap;
use std::path::Path;

use achievement_sync_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, AchievementId, AuditAction, AuditEntryInput,
    AuditLogEntry, Award, AwardSource, PerformanceRecord, PlayerId, Rule, SessionId, StatShape,
};
use achievement_sync_engine::{
    AchievementRepository, AppliedAwardChanges, AuditSink, AwardChanges,
};
use anyhow::{anyhow, Context, Result};
use rusqlite::types::{Type, ValueRef};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};
use serde_json::{Map, Value};
use tracing::debug;
use ulid::Ulid;

const ACHIEVEMENT_MIGRATION_VERSION: i64 = 1;
const SYNC_LEASE_NAME: &str = "achievement_sync";

const SCHEMA_ACHIEVEMENTS_V1: &str = r"
CREATE TABLE IF NOT EXISTS achievements (
  id TEXT PRIMARY KEY,
  key TEXT NOT NULL UNIQUE,
  rule_type TEXT NOT NULL,
  rule_payload TEXT NOT NULL DEFAULT '{}',
  updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_achievements_rule_type
  ON achievements(rule_type, key);

CREATE TABLE IF NOT EXISTS sessions (
  id TEXT PRIMARY KEY,
  player_id NOT NULL
);

CREATE TABLE IF NOT EXISTS performance_stats (
  stat_id INTEGER PRIMARY KEY AUTOINCREMENT,
  session_id TEXT,
  skill TEXT NOT NULL,
  component TEXT,
  value_json TEXT,
  slots_json TEXT,
  recorded_at TEXT NOT NULL,
  CHECK (value_json IS NULL OR slots_json IS NULL)
);

CREATE INDEX IF NOT EXISTS idx_performance_stats_skill
  ON performance_stats(skill, stat_id);

CREATE TABLE IF NOT EXISTS player_achievements (
  award_id INTEGER PRIMARY KEY AUTOINCREMENT,
  achievement_id TEXT NOT NULL,
  player_id TEXT NOT NULL,
  source TEXT NOT NULL,
  metadata_json TEXT NOT NULL DEFAULT '{}',
  awarded_at TEXT NOT NULL,
  UNIQUE (achievement_id, player_id),
  FOREIGN KEY (achievement_id) REFERENCES achievements(id)
);

CREATE TABLE IF NOT EXISTS achievement_audit_log (
  entry_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  entry_id TEXT NOT NULL UNIQUE,
  pass_id TEXT NOT NULL,
  actor TEXT NOT NULL,
  achievement_id TEXT NOT NULL,
  player_id TEXT NOT NULL,
  action TEXT NOT NULL CHECK (action IN ('awarded', 'revoked')),
  details_json TEXT NOT NULL DEFAULT '{}',
  recorded_at TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_achievement_audit_log_no_update
BEFORE UPDATE ON achievement_audit_log
BEGIN
  SELECT RAISE(FAIL, 'achievement_audit_log is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_achievement_audit_log_no_delete
BEFORE DELETE ON achievement_audit_log
BEGIN
  SELECT RAISE(FAIL, 'achievement_audit_log is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_achievement_audit_log_achievement_seq
  ON achievement_audit_log(achievement_id, entry_seq);
CREATE INDEX IF NOT EXISTS idx_achievement_audit_log_pass_seq
  ON achievement_audit_log(pass_id, entry_seq);

CREATE TABLE IF NOT EXISTS sync_leases (
  lease_name TEXT PRIMARY KEY,
  holder TEXT NOT NULL,
  acquired_at TEXT NOT NULL,
  expires_at TEXT NOT NULL
);
";

pub struct SqliteAchievementStore {
    conn: Connection,
}

/// A performance record before the store assigns its stat id.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct PerformanceRecordInput {
    pub session_id: Option<SessionId>,
    pub skill: String,
    pub component: Option<String>,
    pub shape: StatShape,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct SyncLease {
    pub lease_name: String,
    pub holder: String,
    pub acquired_at: String,
    pub expires_at: String,
}

impl SqliteAchievementStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_ACHIEVEMENTS_V1)
            .context("failed to apply achievement schema")?;

        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![ACHIEVEMENT_MIGRATION_VERSION, now_rfc3339()?],
            )
            .context("failed to register achievement schema migration")?;

        Ok(())
    }

    pub fn upsert_rule(&self, rule: &Rule) -> Result<()> {
        if rule.key.trim().is_empty() {
            return Err(anyhow!("rule key MUST be provided"));
        }

        let payload =
            serde_json::to_string(&rule.rule_payload).context("failed to serialize rule payload")?;

        self.conn
            .execute(
                "INSERT INTO achievements(id, key, rule_type, rule_payload, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                   key = excluded.key,
                   rule_type = excluded.rule_type,
                   rule_payload = excluded.rule_payload,
                   updated_at = excluded.updated_at",
                params![rule.id.as_str(), rule.key, rule.rule_type, payload, now_rfc3339()?],
            )
            .with_context(|| format!("failed to upsert rule {}", rule.key))?;

        Ok(())
    }

    pub fn list_rules(&self, rule_type: &str) -> Result<Vec<Rule>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, key, rule_type, rule_payload
             FROM achievements
             WHERE lower(trim(rule_type)) = lower(trim(?1))
             ORDER BY key ASC",
        )?;

        let rows = stmt.query_map(params![rule_type], parse_rule_row)?;
        collect_rows(rows)
    }

    /// Records a session; `player_id` may be a JSON integer or string.
    pub fn insert_session(&self, session_id: &SessionId, player_id: &Value) -> Result<()> {
        let stored = if let Some(number) = player_id.as_i64() {
            rusqlite::types::Value::Integer(number)
        } else {
            let canonical = PlayerId::from_value(player_id)
                .ok_or_else(|| anyhow!("invalid player id for session {session_id}: {player_id}"))?;
            rusqlite::types::Value::Text(canonical.as_str().to_string())
        };

        self.conn
            .execute(
                "INSERT INTO sessions(id, player_id) VALUES (?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET player_id = excluded.player_id",
                params![session_id.as_str(), stored],
            )
            .with_context(|| format!("failed to record session {session_id}"))?;

        Ok(())
    }

    pub fn insert_performance_record(&self, input: &PerformanceRecordInput) -> Result<i64> {
        if input.skill.trim().is_empty() {
            return Err(anyhow!("performance record skill MUST be provided"));
        }

        let (value_json, slots_json) = match &input.shape {
            StatShape::Scalar { value } => (
                Some(serde_json::to_string(value).context("failed to serialize stat value")?),
                None,
            ),
            StatShape::Slots { slots } => (
                None,
                Some(serde_json::to_string(slots).context("failed to serialize stat slots")?),
            ),
        };

        self.conn
            .execute(
                "INSERT INTO performance_stats(
                    session_id, skill, component, value_json, slots_json, recorded_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    input.session_id.as_ref().map(SessionId::as_str),
                    input.skill,
                    input.component,
                    value_json,
                    slots_json,
                    now_rfc3339()?,
                ],
            )
            .context("failed to insert performance record")?;

        Ok(self.conn.last_insert_rowid())
    }

    pub fn list_stats_page(
        &self,
        skill: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<PerformanceRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT stat_id, session_id, skill, component, value_json, slots_json
             FROM performance_stats
             WHERE lower(trim(skill)) = lower(trim(?1))
             ORDER BY stat_id ASC
             LIMIT ?2 OFFSET ?3",
        )?;

        let rows = stmt.query_map(
            params![skill, to_sql_count(limit)?, to_sql_count(offset)?],
            parse_stat_row,
        )?;
        collect_rows(rows)
    }

    pub fn resolve_session_players(
        &self,
        session_ids: &[SessionId],
    ) -> Result<BTreeMap<SessionId, PlayerId>> {
        if session_ids.is_empty() {
            return Ok(BTreeMap::new());
        }

        let placeholders = (1..=session_ids.len())
            .map(|index| format!("?{index}"))
            .collect::<Vec<_>>()
            .join(", ");
        let query = format!("SELECT id, player_id FROM sessions WHERE id IN ({placeholders})");

        let mut stmt = self.conn.prepare(&query)?;
        let mut rows = stmt.query(params_from_iter(session_ids.iter().map(SessionId::as_str)))?;

        let mut players = BTreeMap::new();
        while let Some(row) = rows.next()? {
            let raw_session: String = row.get(0)?;
            let Some(session_id) = SessionId::parse(&raw_session) else {
                continue;
            };
            if let Some(player_id) = player_id_from_ref(row.get_ref(1)?) {
                players.insert(session_id, player_id);
            }
        }

        Ok(players)
    }

    pub fn list_awards(&self, achievement_id: &AchievementId) -> Result<Vec<Award>> {
        let mut stmt = self.conn.prepare(
            "SELECT achievement_id, player_id, source, metadata_json, awarded_at
             FROM player_achievements
             WHERE achievement_id = ?1
             ORDER BY award_id ASC",
        )?;

        let rows = stmt.query_map(params![achievement_id.as_str()], parse_award_row)?;
        collect_rows(rows)
    }

    /// Grants an award outside the sync engine's authority.
    pub fn grant_manual_award(
        &self,
        achievement_id: &AchievementId,
        player_id: &PlayerId,
        source_tag: &str,
        metadata: &Value,
    ) -> Result<()> {
        if AwardSource::parse(source_tag) == AwardSource::System {
            return Err(anyhow!("manual grants cannot use the system source tag"));
        }

        self.conn
            .execute(
                "INSERT INTO player_achievements(achievement_id, player_id, source, metadata_json, awarded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    achievement_id.as_str(),
                    player_id.as_str(),
                    source_tag,
                    serde_json::to_string(metadata).context("failed to serialize award metadata")?,
                    now_rfc3339()?,
                ],
            )
            .with_context(|| format!("failed to grant {achievement_id} to {player_id}"))?;

        Ok(())
    }

    pub fn apply_award_changes(&mut self, changes: &AwardChanges) -> Result<AppliedAwardChanges> {
        let awarded_at = now_rfc3339()?;
        let tx = self
            .conn
            .transaction()
            .context("failed to start award transaction")?;

        for award in &changes.insert {
            if award.achievement_id != changes.achievement_id {
                return Err(anyhow!(
                    "award for {} does not belong to change set {}",
                    award.achievement_id,
                    changes.achievement_id
                ));
            }

            tx.execute(
                "INSERT INTO player_achievements(achievement_id, player_id, source, metadata_json, awarded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    award.achievement_id.as_str(),
                    award.player_id.as_str(),
                    award.source.as_str(),
                    serde_json::to_string(&award.metadata)
                        .context("failed to serialize award metadata")?,
                    awarded_at,
                ],
            )
            .with_context(|| {
                format!(
                    "failed to insert award {} for player {}",
                    award.achievement_id, award.player_id
                )
            })?;
        }

        let mut removed = Vec::new();
        for player_id in &changes.remove {
            let deleted = tx
                .execute(
                    "DELETE FROM player_achievements
                     WHERE achievement_id = ?1
                       AND trim(player_id) = ?2
                       AND lower(trim(source)) = 'system'",
                    params![changes.achievement_id.as_str(), player_id.as_str()],
                )
                .with_context(|| {
                    format!(
                        "failed to revoke award {} for player {}",
                        changes.achievement_id, player_id
                    )
                })?;
            if deleted > 0 {
                removed.push(player_id.clone());
            }
        }

        tx.commit().context("failed to commit award transaction")?;
        debug!(
            achievement = %changes.achievement_id,
            inserted = changes.insert.len(),
            removed = removed.len(),
            "applied award changes"
        );

        Ok(AppliedAwardChanges {
            inserted: changes.insert.clone(),
            removed,
        })
    }

    pub fn append_audit_entry(&self, entry: &AuditEntryInput) -> Result<AuditLogEntry> {
        let recorded_at = now_rfc3339()?;

        self.conn
            .execute(
                "INSERT INTO achievement_audit_log(
                    entry_id, pass_id, actor, achievement_id, player_id,
                    action, details_json, recorded_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    entry.entry_id.to_string(),
                    entry.pass_id.to_string(),
                    entry.actor,
                    entry.achievement_id.as_str(),
                    entry.player_id.as_str(),
                    entry.action.as_str(),
                    serde_json::to_string(&entry.details)
                        .context("failed to serialize audit details")?,
                    recorded_at,
                ],
            )
            .context("failed to append audit entry")?;

        Ok(AuditLogEntry {
            entry_seq: self.conn.last_insert_rowid(),
            entry_id: entry.entry_id,
            pass_id: entry.pass_id,
            actor: entry.actor.clone(),
            achievement_id: entry.achievement_id.clone(),
            player_id: entry.player_id.clone(),
            action: entry.action,
            details: entry.details.clone(),
            recorded_at,
        })
    }

    /// Lists audit entries oldest first; with `limit`, only the most recent
    /// `limit` entries are returned.
    pub fn list_audit_entries(
        &self,
        achievement_id: Option<&AchievementId>,
        limit: Option<usize>,
    ) -> Result<Vec<AuditLogEntry>> {
        // A negative LIMIT means no limit in SQLite.
        let sql_limit = match limit {
            Some(raw_limit) => to_sql_count(raw_limit)?,
            None => -1,
        };

        let mut stmt = self.conn.prepare(
            "SELECT
                entry_seq, entry_id, pass_id, actor, achievement_id, player_id,
                action, details_json, recorded_at
             FROM (
               SELECT *
               FROM achievement_audit_log
               WHERE (?1 IS NULL OR achievement_id = ?1)
               ORDER BY entry_seq DESC
               LIMIT ?2
             )
             ORDER BY entry_seq ASC",
        )?;
        let rows = stmt.query_map(
            params![achievement_id.map(AchievementId::as_str), sql_limit],
            parse_audit_row,
        )?;
        collect_rows(rows)
    }

    /// Takes the pass lease for `holder`, replacing an expired lease.
    pub fn acquire_sync_lease(&mut self, holder: &str, ttl_seconds: u64) -> Result<SyncLease> {
        if holder.trim().is_empty() {
            return Err(anyhow!("lease holder MUST be provided"));
        }
        let ttl = i64::try_from(ttl_seconds)
            .with_context(|| format!("lease ttl out of range: {ttl_seconds}"))?;

        let now = now_utc();
        let lease = SyncLease {
            lease_name: SYNC_LEASE_NAME.to_string(),
            holder: holder.to_string(),
            acquired_at: format_rfc3339(now)?,
            expires_at: format_rfc3339(now + time::Duration::seconds(ttl))?,
        };

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start lease transaction")?;

        let current = tx
            .query_row(
                "SELECT lease_name, holder, acquired_at, expires_at
                 FROM sync_leases
                 WHERE lease_name = ?1",
                params![SYNC_LEASE_NAME],
                parse_lease_row,
            )
            .optional()
            .context("failed to read sync lease")?;

        if let Some(existing) = current {
            let expires_at = parse_rfc3339_utc(&existing.expires_at)
                .context("invalid stored lease expiry")?;
            if existing.holder != holder && expires_at > now {
                return Err(anyhow!(
                    "sync pass already in progress (holder={}, expires_at={})",
                    existing.holder,
                    existing.expires_at
                ));
            }
        }

        tx.execute(
            "INSERT INTO sync_leases(lease_name, holder, acquired_at, expires_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(lease_name) DO UPDATE SET
               holder = excluded.holder,
               acquired_at = excluded.acquired_at,
               expires_at = excluded.expires_at",
            params![lease.lease_name, lease.holder, lease.acquired_at, lease.expires_at],
        )
        .context("failed to write sync lease")?;
        tx.commit().context("failed to commit lease transaction")?;

        Ok(lease)
    }

    /// Releases the pass lease if `holder` still owns it.
    pub fn release_sync_lease(&self, holder: &str) -> Result<bool> {
        let deleted = self
            .conn
            .execute(
                "DELETE FROM sync_leases WHERE lease_name = ?1 AND holder = ?2",
                params![SYNC_LEASE_NAME, holder],
            )
            .context("failed to release sync lease")?;
        Ok(deleted > 0)
    }

    pub fn current_sync_lease(&self) -> Result<Option<SyncLease>> {
        let lease = self
            .conn
            .query_row(
                "SELECT lease_name, holder, acquired_at, expires_at
                 FROM sync_leases
                 WHERE lease_name = ?1",
                params![SYNC_LEASE_NAME],
                parse_lease_row,
            )
            .optional()
            .context("failed to read sync lease")?;
        Ok(lease)
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl AchievementRepository for SqliteAchievementStore {
    fn list_rules(&self, rule_type: &str) -> Result<Vec<Rule>> {
        SqliteAchievementStore::list_rules(self, rule_type)
    }

    fn list_stats_page(
        &self,
        skill: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<PerformanceRecord>> {
        SqliteAchievementStore::list_stats_page(self, skill, offset, limit)
    }

    fn resolve_session_players(
        &self,
        session_ids: &[SessionId],
    ) -> Result<BTreeMap<SessionId, PlayerId>> {
        SqliteAchievementStore::resolve_session_players(self, session_ids)
    }

    fn list_awards(&self, achievement_id: &AchievementId) -> Result<Vec<Award>> {
        SqliteAchievementStore::list_awards(self, achievement_id)
    }

    fn apply_award_changes(&mut self, changes: &AwardChanges) -> Result<AppliedAwardChanges> {
        SqliteAchievementStore::apply_award_changes(self, changes)
    }
}

impl AuditSink for SqliteAchievementStore {
    fn append_audit_entry(&mut self, entry: &AuditEntryInput) -> Result<()> {
        SqliteAchievementStore::append_audit_entry(self, entry).map(|_| ())
    }
}

fn parse_rule_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Rule> {
    let payload_raw: String = row.get(3)?;
    let rule_payload: Value = serde_json::from_str(&payload_raw)
        .map_err(|err| invalid_data(3, Type::Text, format!("invalid rule_payload: {err}")))?;

    Ok(Rule {
        id: AchievementId(row.get(0)?),
        key: row.get(1)?,
        rule_type: row.get(2)?,
        rule_payload,
    })
}

fn parse_stat_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PerformanceRecord> {
    let session_raw: Option<String> = row.get(1)?;
    let value_raw: Option<String> = row.get(4)?;
    let slots_raw: Option<String> = row.get(5)?;

    let shape = match (value_raw, slots_raw) {
        (Some(raw), _) => StatShape::Scalar {
            value: serde_json::from_str(&raw).unwrap_or(Value::String(raw)),
        },
        (None, Some(raw)) => {
            let slots = match serde_json::from_str::<Value>(&raw) {
                Ok(Value::Object(slots)) => slots,
                _ => Map::new(),
            };
            StatShape::Slots { slots }
        }
        (None, None) => StatShape::Scalar { value: Value::Null },
    };

    Ok(PerformanceRecord {
        stat_id: row.get(0)?,
        session_id: session_raw.as_deref().and_then(SessionId::parse),
        skill: row.get(2)?,
        component: row.get(3)?,
        shape,
    })
}

fn parse_award_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Award> {
    let player_id = player_id_from_ref(row.get_ref(1)?)
        .ok_or_else(|| invalid_data(1, Type::Text, "invalid award player_id".to_string()))?;
    let source_raw: String = row.get(2)?;
    let metadata_raw: String = row.get(3)?;
    let metadata: Value = serde_json::from_str(&metadata_raw)
        .map_err(|err| invalid_data(3, Type::Text, format!("invalid metadata_json: {err}")))?;

    Ok(Award {
        achievement_id: AchievementId(row.get(0)?),
        player_id,
        source: AwardSource::parse(&source_raw),
        metadata,
        awarded_at: row.get(4)?,
    })
}

fn parse_audit_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditLogEntry> {
    let entry_id_raw: String = row.get(1)?;
    let pass_id_raw: String = row.get(2)?;
    let player_raw: String = row.get(5)?;
    let action_raw: String = row.get(6)?;
    let details_raw: String = row.get(7)?;

    let entry_id = Ulid::from_string(&entry_id_raw)
        .map_err(|_| invalid_data(1, Type::Text, format!("invalid entry_id ULID: {entry_id_raw}")))?;
    let pass_id = Ulid::from_string(&pass_id_raw)
        .map_err(|_| invalid_data(2, Type::Text, format!("invalid pass_id ULID: {pass_id_raw}")))?;
    let player_id = PlayerId::parse(&player_raw)
        .ok_or_else(|| invalid_data(5, Type::Text, format!("invalid player_id: {player_raw}")))?;
    let action = AuditAction::parse(&action_raw)
        .ok_or_else(|| invalid_data(6, Type::Text, format!("invalid action: {action_raw}")))?;
    let details: Value = serde_json::from_str(&details_raw)
        .map_err(|err| invalid_data(7, Type::Text, format!("invalid details_json: {err}")))?;

    Ok(AuditLogEntry {
        entry_seq: row.get(0)?,
        entry_id,
        pass_id,
        actor: row.get(3)?,
        achievement_id: AchievementId(row.get(4)?),
        player_id,
        action,
        details,
        recorded_at: row.get(8)?,
    })
}

fn parse_lease_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncLease> {
    Ok(SyncLease {
        lease_name: row.get(0)?,
        holder: row.get(1)?,
        acquired_at: row.get(2)?,
        expires_at: row.get(3)?,
    })
}

fn player_id_from_ref(value: ValueRef<'_>) -> Option<PlayerId> {
    match value {
        ValueRef::Integer(number) => PlayerId::from_value(&Value::from(number)),
        ValueRef::Real(number) => PlayerId::from_value(&Value::from(number)),
        ValueRef::Text(bytes) => std::str::from_utf8(bytes).ok().and_then(PlayerId::parse),
        ValueRef::Null | ValueRef::Blob(_) => None,
    }
}

fn invalid_data(column: usize, kind: Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        kind,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn to_sql_count(value: usize) -> Result<i64> {
    i64::try_from(value).with_context(|| format!("count out of range: {value}"))
}

fn now_rfc3339() -> Result<String> {
    Ok(format_rfc3339(now_utc())?)
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
