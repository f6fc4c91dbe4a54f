//! Achievement sync orchestration over a narrow repository interface.
//!
//! [`SyncEngine::run`] is the single trigger: it loads every rule of the
//! configured type and, per rule, aggregates stats, resolves winners,
//! reconciles awards and records audit entries. A failing rule is reported in
//! its summary row and never aborts the pass; only failing to read the rule
//! list itself fails the whole operation.

use std::collections::{BTreeMap, BTreeSet};

use achievement_sync_core::{
    aggregate_player_averages, plan_reconciliation, resolve_winners, AchievementId,
    AuditEntryInput, Award, LeaderboardCriteria, NewAward, PerformanceRecord, PlayerId,
    ReconciliationPlan, Rule, SessionId, StatSource, SyncConfig, SyncError, Winner,
};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use ulid::Ulid;

pub const RESPONSE_STATUS_OK: &str = "ok";

/// Read and write contracts the orchestrator needs from the backing store.
pub trait AchievementRepository {
    #[allow(clippy::missing_errors_doc)]
    fn list_rules(&self, rule_type: &str) -> Result<Vec<Rule>>;

    /// Returns at most `limit` records tagged with `skill` (case-insensitive),
    /// ordered by stat id, skipping the first `offset`.
    #[allow(clippy::missing_errors_doc)]
    fn list_stats_page(
        &self,
        skill: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<PerformanceRecord>>;

    #[allow(clippy::missing_errors_doc)]
    fn resolve_session_players(
        &self,
        session_ids: &[SessionId],
    ) -> Result<BTreeMap<SessionId, PlayerId>>;

    #[allow(clippy::missing_errors_doc)]
    fn list_awards(&self, achievement_id: &AchievementId) -> Result<Vec<Award>>;

    /// Applies inserts and system-scoped removals for one rule atomically.
    #[allow(clippy::missing_errors_doc)]
    fn apply_award_changes(&mut self, changes: &AwardChanges) -> Result<AppliedAwardChanges>;
}

/// Post-mutation hook that receives one entry per committed award transition.
///
/// Entries are appended after the award mutation has committed; the two are
/// not transactional.
pub trait AuditSink {
    #[allow(clippy::missing_errors_doc)]
    fn append_audit_entry(&mut self, entry: &AuditEntryInput) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AwardChanges {
    pub achievement_id: AchievementId,
    pub insert: Vec<NewAward>,
    pub remove: Vec<PlayerId>,
}

impl AwardChanges {
    #[must_use]
    pub fn from_plan(plan: &ReconciliationPlan) -> Self {
        Self {
            achievement_id: plan.achievement_id.clone(),
            insert: plan.new_awards(),
            remove: plan.removed_players(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.insert.is_empty() && self.remove.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppliedAwardChanges {
    pub inserted: Vec<NewAward>,
    pub removed: Vec<PlayerId>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    #[default]
    Full,
    Preview,
}

impl SyncMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Preview => "preview",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "full" => Some(Self::Full),
            "preview" => Some(Self::Preview),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SyncRequest {
    #[serde(default)]
    pub mode: SyncMode,
    /// Accepted for compatibility; every pass evaluates all players.
    #[serde(default)]
    pub player_id: Option<PlayerId>,
}

impl SyncRequest {
    /// Decodes a trigger request.
    ///
    /// # Errors
    /// Returns [`SyncError::Validation`] for unknown modes or malformed fields.
    pub fn from_json(value: &Value) -> Result<Self, SyncError> {
        serde_json::from_value(value.clone())
            .map_err(|err| SyncError::Validation(format!("invalid sync request: {err}")))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RuleStatus {
    Synced,
    Skipped,
    Error,
    Preview,
}

impl RuleStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Synced => "synced",
            Self::Skipped => "skipped",
            Self::Error => "error",
            Self::Preview => "preview",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuleSummary {
    pub achievement: String,
    pub achievement_id: AchievementId,
    pub status: RuleStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub winners: Option<Vec<PlayerId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub added: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub removed: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl RuleSummary {
    fn bare(rule: &Rule, status: RuleStatus) -> Self {
        Self {
            achievement: rule.key.clone(),
            achievement_id: rule.id.clone(),
            status,
            winners: None,
            added: None,
            removed: None,
            error: None,
            reason: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncResponse {
    pub status: String,
    pub pass_id: Ulid,
    pub mode: SyncMode,
    pub summary: Vec<RuleSummary>,
}

impl SyncResponse {
    #[must_use]
    pub fn total_added(&self) -> usize {
        self.summary.iter().filter_map(|item| item.added).sum()
    }

    #[must_use]
    pub fn total_removed(&self) -> usize {
        self.summary.iter().filter_map(|item| item.removed).sum()
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct AuditOutcome {
    pub written: usize,
    pub failed: usize,
}

/// Writes one audit entry per committed award transition.
///
/// Failures are logged and counted, never propagated: the award mutation has
/// already committed and is not rolled back.
#[derive(Debug, Clone)]
pub struct AuditLogger<'a> {
    pass_id: Ulid,
    actor: &'a str,
    rule_key: &'a str,
}

impl<'a> AuditLogger<'a> {
    #[must_use]
    pub fn new(pass_id: Ulid, actor: &'a str, rule_key: &'a str) -> Self {
        Self {
            pass_id,
            actor,
            rule_key,
        }
    }

    pub fn record<S: AuditSink + ?Sized>(
        &self,
        sink: &mut S,
        awarded: &[NewAward],
        revoked: &[Award],
    ) -> AuditOutcome {
        let entries = awarded
            .iter()
            .map(|award| AuditEntryInput::awarded(self.pass_id, self.actor, self.rule_key, award))
            .chain(revoked.iter().map(|award| {
                AuditEntryInput::revoked(self.pass_id, self.actor, self.rule_key, award)
            }));

        let mut outcome = AuditOutcome::default();
        for entry in entries {
            match sink.append_audit_entry(&entry) {
                Ok(()) => outcome.written += 1,
                Err(err) => {
                    outcome.failed += 1;
                    warn!(
                        achievement = %entry.achievement_id,
                        player_id = %entry.player_id,
                        action = entry.action.as_str(),
                        error = %format!("{err:#}"),
                        "audit entry dropped after committed award change"
                    );
                }
            }
        }
        outcome
    }
}

pub struct SyncEngine<'r, R> {
    repository: &'r mut R,
    config: SyncConfig,
}

impl<'r, R> SyncEngine<'r, R>
where
    R: AchievementRepository + AuditSink,
{
    /// Builds an engine over `repository`.
    ///
    /// # Errors
    /// Returns [`SyncError::Configuration`] when `config` is invalid.
    pub fn new(repository: &'r mut R, config: SyncConfig) -> Result<Self, SyncError> {
        config.validate()?;
        Ok(Self { repository, config })
    }

    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Runs one full pass with a freshly generated pass id.
    ///
    /// # Errors
    /// Returns [`SyncError::DataAccess`] when the rule list cannot be read.
    pub fn run(&mut self, request: &SyncRequest) -> Result<SyncResponse, SyncError> {
        self.run_pass(Ulid::new(), request)
    }

    /// Runs one full pass attributing every transition to `pass_id`.
    ///
    /// # Errors
    /// Returns [`SyncError::DataAccess`] when the rule list cannot be read.
    pub fn run_pass(
        &mut self,
        pass_id: Ulid,
        request: &SyncRequest,
    ) -> Result<SyncResponse, SyncError> {
        if let Some(player_id) = &request.player_id {
            debug!(%player_id, "player_id is advisory; evaluating all players");
        }

        let rule_type = self.config.rule_type.clone();
        let rules = self
            .repository
            .list_rules(&rule_type)
            .map_err(data_access)?
            .into_iter()
            .filter(|rule| rule.rule_type.trim().eq_ignore_ascii_case(rule_type.trim()))
            .collect::<Vec<_>>();

        info!(%pass_id, mode = request.mode.as_str(), rules = rules.len(), "starting achievement sync pass");

        let summary = rules
            .iter()
            .map(|rule| self.sync_rule(pass_id, request.mode, rule))
            .collect::<Vec<_>>();

        let response = SyncResponse {
            status: RESPONSE_STATUS_OK.to_string(),
            pass_id,
            mode: request.mode,
            summary,
        };

        info!(
            %pass_id,
            added = response.total_added(),
            removed = response.total_removed(),
            "achievement sync pass finished"
        );
        Ok(response)
    }

    #[instrument(skip_all, fields(achievement = %rule.key, %pass_id))]
    fn sync_rule(&mut self, pass_id: Ulid, mode: SyncMode, rule: &Rule) -> RuleSummary {
        let criteria = match LeaderboardCriteria::from_rule(rule) {
            Ok(value) => value,
            Err(err) => {
                info!(reason = %err, "skipping rule");
                let mut summary = RuleSummary::bare(rule, RuleStatus::Skipped);
                summary.reason = Some(err.to_string());
                return summary;
            }
        };

        match self.reconcile_rule(pass_id, mode, rule, &criteria) {
            Ok(summary) => summary,
            Err(err) => {
                warn!(error = %err, "rule sync failed");
                let mut summary = RuleSummary::bare(rule, RuleStatus::Error);
                summary.error = Some(err.to_string());
                summary
            }
        }
    }

    fn reconcile_rule(
        &mut self,
        pass_id: Ulid,
        mode: SyncMode,
        rule: &Rule,
        criteria: &LeaderboardCriteria,
    ) -> Result<RuleSummary, SyncError> {
        let winners = self.evaluate_winners(criteria)?;
        let existing = self.repository.list_awards(&rule.id).map_err(data_access)?;
        let plan = plan_reconciliation(&rule.id, &winners, &existing);

        let winner_ids = winners
            .iter()
            .map(|winner| winner.player_id.clone())
            .collect::<Vec<_>>();

        if mode == SyncMode::Preview {
            let mut summary = RuleSummary::bare(rule, RuleStatus::Preview);
            summary.winners = Some(winner_ids);
            summary.added = Some(plan.to_add.len());
            summary.removed = Some(plan.to_remove.len());
            return Ok(summary);
        }

        let applied = if plan.is_empty() {
            AppliedAwardChanges::default()
        } else {
            self.repository
                .apply_award_changes(&AwardChanges::from_plan(&plan))
                .map_err(data_access)?
        };

        let removed_now: BTreeSet<&PlayerId> = applied.removed.iter().collect();
        let revoked = plan
            .to_remove
            .iter()
            .filter(|award| removed_now.contains(&award.player_id))
            .cloned()
            .collect::<Vec<_>>();

        let audit = AuditLogger::new(pass_id, &self.config.actor, &rule.key).record(
            &mut *self.repository,
            &applied.inserted,
            &revoked,
        );

        info!(
            winners = winner_ids.len(),
            added = applied.inserted.len(),
            removed = applied.removed.len(),
            audit_written = audit.written,
            audit_failed = audit.failed,
            "rule synced"
        );

        let mut summary = RuleSummary::bare(rule, RuleStatus::Synced);
        summary.winners = Some(winner_ids);
        summary.added = Some(applied.inserted.len());
        summary.removed = Some(applied.removed.len());
        Ok(summary)
    }

    fn evaluate_winners(&self, criteria: &LeaderboardCriteria) -> Result<Vec<Winner>, SyncError> {
        let records = self.load_records(&criteria.skill)?;
        let players = self.resolve_players(&records)?;
        let averages = aggregate_player_averages(
            &records,
            &criteria.skill,
            criteria.component.as_deref(),
            &players,
        );
        debug!(
            records = records.len(),
            players = averages.len(),
            top_n = criteria.top_n,
            "aggregated player averages"
        );
        Ok(resolve_winners(&averages, criteria.top_n))
    }

    fn load_records(&self, skill: &str) -> Result<Vec<PerformanceRecord>, SyncError> {
        let page_size = self.config.page_size;
        let mut records = Vec::new();
        let mut offset = 0_usize;

        loop {
            let page = self
                .repository
                .list_stats_page(skill, offset, page_size)
                .map_err(data_access)?;
            let fetched = page.len();
            debug!(offset, fetched, "fetched stats page");
            records.extend(page);

            if fetched < page_size {
                break;
            }
            offset += fetched;
        }

        Ok(records)
    }

    fn resolve_players(
        &self,
        records: &[PerformanceRecord],
    ) -> Result<BTreeMap<SessionId, PlayerId>, SyncError> {
        let session_ids = records
            .iter()
            .filter_map(StatSource::session_id)
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect::<Vec<_>>();

        let mut players = BTreeMap::new();
        for chunk in session_ids.chunks(self.config.page_size) {
            let resolved = self
                .repository
                .resolve_session_players(chunk)
                .map_err(data_access)?;
            players.extend(resolved);
        }
        Ok(players)
    }
}

#[allow(clippy::needless_pass_by_value)]
fn data_access(err: anyhow::Error) -> SyncError {
    SyncError::DataAccess(format!("{err:#}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use achievement_sync_core::{AuditAction, AwardSource, StatShape};
    use anyhow::anyhow;
    use serde_json::json;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn must_some<T>(value: Option<T>) -> T {
        match value {
            Some(inner) => inner,
            None => panic!("expected Some(..), got None"),
        }
    }

    fn player(raw: &str) -> PlayerId {
        must_some(PlayerId::parse(raw))
    }

    fn session(raw: &str) -> SessionId {
        must_some(SessionId::parse(raw))
    }

    #[derive(Default)]
    struct FakeRepository {
        rules: Vec<Rule>,
        stats: Vec<PerformanceRecord>,
        sessions: BTreeMap<SessionId, PlayerId>,
        awards: Vec<Award>,
        audit: Vec<AuditEntryInput>,
        fail_rules: bool,
        fail_stats_for_skill: Option<String>,
        fail_apply: bool,
        fail_audit: bool,
        apply_calls: usize,
    }

    impl FakeRepository {
        fn add_rule(&mut self, id: &str, payload: Value) {
            self.rules.push(Rule {
                id: AchievementId(id.to_string()),
                key: format!("{id}-key"),
                rule_type: "leaderboard".to_string(),
                rule_payload: payload,
            });
        }

        fn add_stat(&mut self, session_id: &str, player_id: &str, skill: &str, value: f64) {
            let stat_id = i64::try_from(self.stats.len()).unwrap_or(i64::MAX) + 1;
            self.stats.push(PerformanceRecord {
                stat_id,
                session_id: Some(session(session_id)),
                skill: skill.to_string(),
                component: Some("speed".to_string()),
                shape: StatShape::Scalar { value: json!(value) },
            });
            self.sessions.insert(session(session_id), player(player_id));
        }

        fn grant(&mut self, achievement_id: &str, player_id: &str, source: AwardSource) {
            self.awards.push(Award {
                achievement_id: AchievementId(achievement_id.to_string()),
                player_id: player(player_id),
                source,
                metadata: json!({}),
                awarded_at: "2026-02-07T12:00:00Z".to_string(),
            });
        }

        fn holders(&self, achievement_id: &str) -> Vec<&str> {
            let mut holders = self
                .awards
                .iter()
                .filter(|award| award.achievement_id.as_str() == achievement_id)
                .map(|award| award.player_id.as_str())
                .collect::<Vec<_>>();
            holders.sort_unstable();
            holders
        }
    }

    impl AchievementRepository for FakeRepository {
        fn list_rules(&self, rule_type: &str) -> Result<Vec<Rule>> {
            if self.fail_rules {
                return Err(anyhow!("rule store unavailable"));
            }
            Ok(self
                .rules
                .iter()
                .filter(|rule| rule.rule_type == rule_type)
                .cloned()
                .collect())
        }

        fn list_stats_page(
            &self,
            skill: &str,
            offset: usize,
            limit: usize,
        ) -> Result<Vec<PerformanceRecord>> {
            if self
                .fail_stats_for_skill
                .as_deref()
                .is_some_and(|failing| failing.eq_ignore_ascii_case(skill))
            {
                return Err(anyhow!("stats query timed out"));
            }
            Ok(self
                .stats
                .iter()
                .filter(|record| record.skill.eq_ignore_ascii_case(skill))
                .skip(offset)
                .take(limit)
                .cloned()
                .collect())
        }

        fn resolve_session_players(
            &self,
            session_ids: &[SessionId],
        ) -> Result<BTreeMap<SessionId, PlayerId>> {
            Ok(session_ids
                .iter()
                .filter_map(|id| self.sessions.get(id).map(|player| (id.clone(), player.clone())))
                .collect())
        }

        fn list_awards(&self, achievement_id: &AchievementId) -> Result<Vec<Award>> {
            Ok(self
                .awards
                .iter()
                .filter(|award| &award.achievement_id == achievement_id)
                .cloned()
                .collect())
        }

        fn apply_award_changes(&mut self, changes: &AwardChanges) -> Result<AppliedAwardChanges> {
            if self.fail_apply {
                return Err(anyhow!("write rejected"));
            }
            let mut removed = Vec::new();
            for player_id in &changes.remove {
                let before = self.awards.len();
                self.awards.retain(|award| {
                    !(award.achievement_id == changes.achievement_id
                        && &award.player_id == player_id
                        && award.source == AwardSource::System)
                });
                if self.awards.len() < before {
                    removed.push(player_id.clone());
                }
            }
            for award in &changes.insert {
                self.awards.push(Award {
                    achievement_id: award.achievement_id.clone(),
                    player_id: award.player_id.clone(),
                    source: award.source,
                    metadata: award.metadata.clone(),
                    awarded_at: "2026-02-08T00:00:00Z".to_string(),
                });
            }
            Ok(AppliedAwardChanges {
                inserted: changes.insert.clone(),
                removed,
            })
        }
    }

    impl AuditSink for FakeRepository {
        fn append_audit_entry(&mut self, entry: &AuditEntryInput) -> Result<()> {
            if self.fail_audit {
                return Err(anyhow!("audit table locked"));
            }
            self.audit.push(entry.clone());
            Ok(())
        }
    }

    struct CountingRepository(FakeRepository);

    impl AchievementRepository for CountingRepository {
        fn list_rules(&self, rule_type: &str) -> Result<Vec<Rule>> {
            self.0.list_rules(rule_type)
        }

        fn list_stats_page(
            &self,
            skill: &str,
            offset: usize,
            limit: usize,
        ) -> Result<Vec<PerformanceRecord>> {
            assert!(limit <= 2, "page size must bound every stats query");
            self.0.list_stats_page(skill, offset, limit)
        }

        fn resolve_session_players(
            &self,
            session_ids: &[SessionId],
        ) -> Result<BTreeMap<SessionId, PlayerId>> {
            assert!(session_ids.len() <= 2);
            self.0.resolve_session_players(session_ids)
        }

        fn list_awards(&self, achievement_id: &AchievementId) -> Result<Vec<Award>> {
            self.0.list_awards(achievement_id)
        }

        fn apply_award_changes(&mut self, changes: &AwardChanges) -> Result<AppliedAwardChanges> {
            self.0.apply_calls += 1;
            self.0.apply_award_changes(changes)
        }
    }

    impl AuditSink for CountingRepository {
        fn append_audit_entry(&mut self, entry: &AuditEntryInput) -> Result<()> {
            self.0.append_audit_entry(entry)
        }
    }

    fn leaderboard_fixture() -> FakeRepository {
        let mut repo = FakeRepository::default();
        repo.add_rule("fastest", json!({"skill": "sprint", "component": "speed", "top_n": 2}));
        repo.add_stat("s-a", "a", "sprint", 10.0);
        repo.add_stat("s-b", "b", "sprint", 9.0);
        repo.add_stat("s-c", "c", "Sprint", 9.0);
        repo.add_stat("s-d", "d", "sprint", 8.0);
        repo
    }

    fn run_full(repo: &mut FakeRepository) -> SyncResponse {
        let mut engine = must_ok(SyncEngine::new(repo, SyncConfig::default()));
        must_ok(engine.run(&SyncRequest::default()))
    }

    #[test]
    fn full_sync_awards_tied_winners_and_logs_each_grant() {
        let mut repo = leaderboard_fixture();

        let response = run_full(&mut repo);

        assert_eq!(response.status, "ok");
        let row = &response.summary[0];
        assert_eq!(row.status, RuleStatus::Synced);
        assert_eq!(
            row.winners,
            Some(vec![player("a"), player("b"), player("c")])
        );
        assert_eq!(row.added, Some(3));
        assert_eq!(row.removed, Some(0));
        assert_eq!(repo.holders("fastest"), vec!["a", "b", "c"]);
        assert_eq!(repo.audit.len(), 3);
        assert!(repo
            .audit
            .iter()
            .all(|entry| entry.action == AuditAction::Awarded && entry.pass_id == response.pass_id));
        assert_eq!(repo.awards[0].metadata, json!({"avg": 10.0}));
    }

    #[test]
    fn second_pass_without_data_change_is_a_no_op() {
        let mut repo = leaderboard_fixture();
        let _ = run_full(&mut repo);
        let audit_after_first = repo.audit.len();

        let second = run_full(&mut repo);

        assert_eq!(second.total_added(), 0);
        assert_eq!(second.total_removed(), 0);
        assert_eq!(repo.audit.len(), audit_after_first);
    }

    #[test]
    fn stale_system_award_is_revoked_and_manual_award_kept() {
        let mut repo = leaderboard_fixture();
        repo.grant("fastest", "d", AwardSource::System);
        repo.grant("fastest", "e", AwardSource::Manual);

        let response = run_full(&mut repo);

        assert_eq!(response.summary[0].removed, Some(1));
        assert_eq!(repo.holders("fastest"), vec!["a", "b", "c", "e"]);
        let revoked = repo
            .audit
            .iter()
            .filter(|entry| entry.action == AuditAction::Revoked)
            .collect::<Vec<_>>();
        assert_eq!(revoked.len(), 1);
        assert_eq!(revoked[0].player_id, player("d"));
    }

    #[test]
    fn manual_holder_who_wins_is_not_granted_twice() {
        let mut repo = leaderboard_fixture();
        repo.grant("fastest", "a", AwardSource::Manual);

        let response = run_full(&mut repo);

        assert_eq!(response.summary[0].added, Some(2));
        assert_eq!(repo.holders("fastest"), vec!["a", "b", "c"]);
    }

    #[test]
    fn rule_without_skill_is_skipped_not_errored() {
        let mut repo = leaderboard_fixture();
        repo.add_rule("broken", json!({"component": "speed"}));

        let response = run_full(&mut repo);

        let row = &response.summary[1];
        assert_eq!(row.status, RuleStatus::Skipped);
        assert!(row.reason.as_deref().is_some_and(|reason| reason.contains("skill")));
        assert!(row.error.is_none());
        assert!(row.winners.is_none());
    }

    #[test]
    fn data_access_failure_is_isolated_to_its_rule() {
        let mut repo = leaderboard_fixture();
        repo.add_rule("jumpers", json!({"skill": "jump"}));
        repo.add_rule("throwers", json!({"skill": "throw"}));
        repo.add_stat("s-t", "t", "throw", 40.0);
        repo.fail_stats_for_skill = Some("jump".to_string());

        let response = run_full(&mut repo);

        let statuses = response
            .summary
            .iter()
            .map(|row| row.status)
            .collect::<Vec<_>>();
        assert_eq!(
            statuses,
            vec![RuleStatus::Synced, RuleStatus::Error, RuleStatus::Synced]
        );
        assert!(response.summary[1]
            .error
            .as_deref()
            .is_some_and(|error| error.contains("stats query timed out")));
        assert_eq!(repo.holders("throwers"), vec!["t"]);
    }

    #[test]
    fn failed_apply_marks_rule_error_without_audit_entries() {
        let mut repo = leaderboard_fixture();
        repo.fail_apply = true;

        let response = run_full(&mut repo);

        assert_eq!(response.summary[0].status, RuleStatus::Error);
        assert!(repo.awards.is_empty());
        assert!(repo.audit.is_empty());
    }

    #[test]
    fn audit_failures_do_not_undo_or_fail_the_rule() {
        let mut repo = leaderboard_fixture();
        repo.fail_audit = true;

        let response = run_full(&mut repo);

        assert_eq!(response.summary[0].status, RuleStatus::Synced);
        assert_eq!(response.summary[0].added, Some(3));
        assert!(response.summary[0].error.is_none());
        assert_eq!(repo.holders("fastest").len(), 3);
        assert!(repo.audit.is_empty());
    }

    #[test]
    fn rule_list_failure_fails_the_whole_pass() {
        let mut repo = leaderboard_fixture();
        repo.fail_rules = true;

        let mut engine = must_ok(SyncEngine::new(&mut repo, SyncConfig::default()));
        let result = engine.run(&SyncRequest::default());

        assert!(matches!(result, Err(SyncError::DataAccess(message)) if message.contains("rule store unavailable")));
    }

    #[test]
    fn preview_reports_delta_without_mutating() {
        let mut repo = leaderboard_fixture();
        repo.grant("fastest", "d", AwardSource::System);

        let mut engine = must_ok(SyncEngine::new(&mut repo, SyncConfig::default()));
        let request = must_ok(SyncRequest::from_json(&json!({"mode": "preview"})));
        let response = must_ok(engine.run(&request));

        let row = &response.summary[0];
        assert_eq!(row.status, RuleStatus::Preview);
        assert_eq!(row.added, Some(3));
        assert_eq!(row.removed, Some(1));
        assert_eq!(repo.holders("fastest"), vec!["d"]);
        assert!(repo.audit.is_empty());
    }

    #[test]
    fn stats_and_sessions_are_read_in_bounded_pages() {
        let mut counting = CountingRepository(leaderboard_fixture());
        counting.0.add_stat("s-e", "e", "sprint", 1.0);
        let config = SyncConfig {
            page_size: 2,
            ..SyncConfig::default()
        };

        let mut engine = must_ok(SyncEngine::new(&mut counting, config));
        let response = must_ok(engine.run(&SyncRequest::default()));

        assert_eq!(response.summary[0].added, Some(3));
        assert_eq!(counting.0.apply_calls, 1);
    }

    #[test]
    fn player_id_in_request_does_not_narrow_evaluation() {
        let mut repo = leaderboard_fixture();

        let mut engine = must_ok(SyncEngine::new(&mut repo, SyncConfig::default()));
        let request = must_ok(SyncRequest::from_json(&json!({"mode": "full", "player_id": 99})));
        let response = must_ok(engine.run(&request));

        assert_eq!(request.player_id, Some(player("99")));
        assert_eq!(response.summary[0].added, Some(3));
    }

    #[test]
    fn unknown_mode_is_rejected() {
        let result = SyncRequest::from_json(&json!({"mode": "turbo"}));
        assert!(matches!(result, Err(SyncError::Validation(_))));
    }

    #[test]
    fn invalid_config_is_rejected_at_construction() {
        let mut repo = FakeRepository::default();
        let config = SyncConfig {
            page_size: 0,
            ..SyncConfig::default()
        };
        assert!(matches!(
            SyncEngine::new(&mut repo, config),
            Err(SyncError::Configuration(_))
        ));
    }

    #[test]
    fn summary_serializes_only_relevant_fields() {
        let mut repo = leaderboard_fixture();
        repo.add_rule("broken", json!({}));

        let response = run_full(&mut repo);
        let value = must_ok(serde_json::to_value(&response));

        assert_eq!(value["status"], json!("ok"));
        assert_eq!(value["summary"][0]["achievement"], json!("fastest-key"));
        assert_eq!(value["summary"][0]["winners"], json!(["a", "b", "c"]));
        assert_eq!(value["summary"][1]["status"], json!("skipped"));
        assert!(value["summary"][1].get("winners").is_none());
        assert!(value["summary"][1].get("error").is_none());
    }
}
