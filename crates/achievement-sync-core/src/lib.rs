//! Pure achievement synchronization domain.
//!
//! Everything here is free of I/O: identifier canonicalization, rule payload
//! parsing, per-record value extraction, per-player aggregation, top-N winner
//! resolution and the award reconciliation diff. Storage and orchestration
//! live in `achievement-sync-engine` and `achievement-sync-store-sqlite`.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

pub const LEADERBOARD_RULE_TYPE: &str = "leaderboard";
pub const SYSTEM_ACTOR: &str = "system";

const MAX_PAGE_SIZE: usize = 10_000;
// Largest magnitude at which every integral f64 is still exactly representable.
const MAX_EXACT_INTEGRAL_F64: f64 = 9_007_199_254_740_992.0;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum SyncError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("data access error: {0}")]
    DataAccess(String),
    #[error("validation error: {0}")]
    Validation(String),
}

/// Renders a JSON scalar as a canonical identifier string.
///
/// Integers (and integral floats) render without a fraction so that `42`,
/// `42.0` and `"42"` all compare equal. Strings are trimmed. Anything else,
/// including blank strings, is not an identifier.
#[must_use]
pub fn canonical_identifier(value: &Value) -> Option<String> {
    match value {
        Value::String(raw) => canonical_identifier_str(raw),
        Value::Number(number) => {
            if let Some(signed) = number.as_i64() {
                return Some(signed.to_string());
            }
            if let Some(unsigned) = number.as_u64() {
                return Some(unsigned.to_string());
            }
            number.as_f64().and_then(integral_identifier)
        }
        Value::Null | Value::Bool(_) | Value::Array(_) | Value::Object(_) => None,
    }
}

#[allow(clippy::float_cmp, clippy::cast_possible_truncation)]
fn integral_identifier(float: f64) -> Option<String> {
    if float.is_finite() && float.fract() == 0.0 && float.abs() < MAX_EXACT_INTEGRAL_F64 {
        Some((float as i64).to_string())
    } else {
        None
    }
}

fn canonical_identifier_str(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "Value", into = "String")]
pub struct PlayerId(String);

impl PlayerId {
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        canonical_identifier_str(raw).map(Self)
    }

    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        canonical_identifier(value).map(Self)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for PlayerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<Value> for PlayerId {
    type Error = SyncError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::from_value(&value)
            .ok_or_else(|| SyncError::Validation(format!("invalid player id: {value}")))
    }
}

impl From<PlayerId> for String {
    fn from(value: PlayerId) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "Value", into = "String")]
pub struct SessionId(String);

impl SessionId {
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        canonical_identifier_str(raw).map(Self)
    }

    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        canonical_identifier(value).map(Self)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<Value> for SessionId {
    type Error = SyncError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::from_value(&value)
            .ok_or_else(|| SyncError::Validation(format!("invalid session id: {value}")))
    }
}

impl From<SessionId> for String {
    fn from(value: SessionId) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct AchievementId(pub String);

impl AchievementId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for AchievementId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A rule definition as handed over by the rule store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Rule {
    pub id: AchievementId,
    pub key: String,
    pub rule_type: String,
    pub rule_payload: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct LeaderboardCriteria {
    pub skill: String,
    pub component: Option<String>,
    pub top_n: usize,
}

impl LeaderboardCriteria {
    /// Reads the leaderboard criteria carried in a rule payload.
    ///
    /// # Errors
    /// Returns [`SyncError::Configuration`] when the payload has no usable
    /// skill name.
    pub fn from_payload(payload: &Value) -> Result<Self, SyncError> {
        let empty = Map::new();
        let fields = payload.as_object().unwrap_or(&empty);

        let skill = payload_field(fields, &["skill", "skill_name"])
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                SyncError::Configuration("rule payload is missing a skill name".to_string())
            })?;

        let component = payload_field(fields, &["component", "component_name"])
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string);

        Ok(Self {
            skill: skill.to_string(),
            component,
            top_n: parse_top_n(payload_field(fields, &["top_n", "topN", "top"])),
        })
    }

    /// Reads the leaderboard criteria of `rule`.
    ///
    /// # Errors
    /// Returns [`SyncError::Configuration`] when the payload has no usable
    /// skill name.
    pub fn from_rule(rule: &Rule) -> Result<Self, SyncError> {
        Self::from_payload(&rule.rule_payload).map_err(|err| match err {
            SyncError::Configuration(message) => {
                SyncError::Configuration(format!("{message} (rule {})", rule.key))
            }
            other => other,
        })
    }
}

fn payload_field<'a>(fields: &'a Map<String, Value>, names: &[&str]) -> Option<&'a Value> {
    names
        .iter()
        .filter_map(|name| fields.get(*name))
        .find(|value| !value.is_null())
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn parse_top_n(value: Option<&Value>) -> usize {
    let parsed = match value {
        Some(Value::Number(number)) => number
            .as_u64()
            .or_else(|| {
                number
                    .as_f64()
                    .filter(|float| float.is_finite() && *float >= 1.0)
                    .map(|float| float.floor() as u64)
            }),
        Some(Value::String(raw)) => raw.trim().parse::<u64>().ok(),
        _ => None,
    };

    match parsed.and_then(|value| usize::try_from(value).ok()) {
        Some(top_n) if top_n >= 1 => top_n,
        _ => 1,
    }
}

/// One stored measurement. Exactly one shape is present per record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum StatShape {
    /// A single scalar paired with the record's `component` label.
    Scalar { value: Value },
    /// A fixed set of named component slots.
    Slots { slots: Map<String, Value> },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PerformanceRecord {
    pub stat_id: i64,
    pub session_id: Option<SessionId>,
    pub skill: String,
    pub component: Option<String>,
    #[serde(flatten)]
    pub shape: StatShape,
}

/// The capability the aggregator depends on. It never inspects record shape.
pub trait StatSource {
    fn skill(&self) -> &str;

    fn session_id(&self) -> Option<&SessionId>;

    /// Resolves the numeric value this record contributes for `component`.
    fn extract_value(&self, component: Option<&str>) -> Option<f64>;
}

impl StatSource for PerformanceRecord {
    fn skill(&self) -> &str {
        &self.skill
    }

    fn session_id(&self) -> Option<&SessionId> {
        self.session_id.as_ref()
    }

    fn extract_value(&self, component: Option<&str>) -> Option<f64> {
        match &self.shape {
            StatShape::Scalar { value } => numeric_value(value),
            StatShape::Slots { slots } => {
                if let Some(slot) = component.and_then(|name| slot_value(slots, name)) {
                    return numeric_value(slot);
                }
                let own = self.component.as_deref()?;
                slot_value(slots, own).and_then(numeric_value)
            }
        }
    }
}

fn slot_value<'a>(slots: &'a Map<String, Value>, name: &str) -> Option<&'a Value> {
    let wanted = name.trim();
    if wanted.is_empty() {
        return None;
    }
    slots
        .iter()
        .find(|(slot, _)| slot.trim().eq_ignore_ascii_case(wanted))
        .map(|(_, value)| value)
        .filter(|value| !value.is_null())
}

/// Reads a finite number from a JSON number or numeric string.
#[must_use]
pub fn numeric_value(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(raw) => raw.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|float| float.is_finite())
}

/// Averages the extracted values of every record tagged with `skill`, per player.
///
/// Records whose session does not resolve to a player, or whose value cannot
/// be extracted, contribute nothing. Players without a contributing record
/// are absent from the result.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn aggregate_player_averages<S: StatSource>(
    records: &[S],
    skill: &str,
    component: Option<&str>,
    players: &BTreeMap<SessionId, PlayerId>,
) -> BTreeMap<PlayerId, f64> {
    let wanted_skill = skill.trim();
    let mut means: BTreeMap<PlayerId, (f64, usize)> = BTreeMap::new();

    for record in records {
        if !record.skill().trim().eq_ignore_ascii_case(wanted_skill) {
            continue;
        }
        let Some(player_id) = record.session_id().and_then(|session| players.get(session)) else {
            continue;
        };
        let Some(value) = record.extract_value(component) else {
            continue;
        };

        // Running mean; stays finite for any finite inputs.
        let (mean, count) = means.entry(player_id.clone()).or_insert((0.0, 0));
        *count += 1;
        let weight = *count as f64;
        *mean += value / weight - *mean / weight;
    }

    means
        .into_iter()
        .map(|(player_id, (mean, _))| (player_id, mean))
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Winner {
    pub player_id: PlayerId,
    pub average: f64,
}

/// Ranks players by average, descending, and keeps the top `top_n` plus
/// everyone tied with the player at rank `top_n`.
///
/// Equal averages are ordered by player id so the result is deterministic.
#[must_use]
pub fn resolve_winners(averages: &BTreeMap<PlayerId, f64>, top_n: usize) -> Vec<Winner> {
    let top_n = top_n.max(1);
    let mut ranked: Vec<Winner> = averages
        .iter()
        .map(|(player_id, average)| Winner {
            player_id: player_id.clone(),
            average: *average,
        })
        .collect();

    ranked.sort_by(|lhs, rhs| {
        rhs.average
            .total_cmp(&lhs.average)
            .then_with(|| lhs.player_id.cmp(&rhs.player_id))
    });

    if ranked.len() <= top_n {
        return ranked;
    }

    let cutoff = ranked[top_n - 1].average;
    ranked.retain(|winner| winner.average >= cutoff);
    ranked
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AwardSource {
    System,
    Manual,
}

impl AwardSource {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Manual => "manual",
        }
    }

    /// Only the literal `system` tag is machine-owned; every other tag is a
    /// manual grant.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("system") {
            Self::System
        } else {
            Self::Manual
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Award {
    pub achievement_id: AchievementId,
    pub player_id: PlayerId,
    pub source: AwardSource,
    pub metadata: Value,
    pub awarded_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewAward {
    pub achievement_id: AchievementId,
    pub player_id: PlayerId,
    pub source: AwardSource,
    pub metadata: Value,
}

impl NewAward {
    #[must_use]
    pub fn system(achievement_id: &AchievementId, winner: &Winner) -> Self {
        Self {
            achievement_id: achievement_id.clone(),
            player_id: winner.player_id.clone(),
            source: AwardSource::System,
            metadata: serde_json::json!({ "avg": winner.average }),
        }
    }
}

/// The minimal delta between the desired and the current award state of one rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconciliationPlan {
    pub achievement_id: AchievementId,
    pub to_add: Vec<Winner>,
    pub to_remove: Vec<Award>,
}

impl ReconciliationPlan {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }

    #[must_use]
    pub fn new_awards(&self) -> Vec<NewAward> {
        self.to_add
            .iter()
            .map(|winner| NewAward::system(&self.achievement_id, winner))
            .collect()
    }

    #[must_use]
    pub fn removed_players(&self) -> Vec<PlayerId> {
        self.to_remove
            .iter()
            .map(|award| award.player_id.clone())
            .collect()
    }
}

/// Diffs the winner set against the awards currently held for one rule.
///
/// A winner holding any award for the rule (manual included) is not added
/// again. Only `system` awards of players outside the winner set are removed;
/// manual grants are never scheduled for removal.
#[must_use]
pub fn plan_reconciliation(
    achievement_id: &AchievementId,
    winners: &[Winner],
    existing: &[Award],
) -> ReconciliationPlan {
    let snapshot: Vec<&Award> = existing
        .iter()
        .filter(|award| &award.achievement_id == achievement_id)
        .collect();

    let held: BTreeSet<&PlayerId> = snapshot.iter().map(|award| &award.player_id).collect();
    let winning: BTreeSet<&PlayerId> = winners.iter().map(|winner| &winner.player_id).collect();

    let mut seen_add = BTreeSet::new();
    let to_add = winners
        .iter()
        .filter(|winner| !held.contains(&winner.player_id))
        .filter(|winner| seen_add.insert(winner.player_id.clone()))
        .cloned()
        .collect();

    let mut seen_remove = BTreeSet::new();
    let to_remove = snapshot
        .into_iter()
        .filter(|award| award.source == AwardSource::System)
        .filter(|award| !winning.contains(&award.player_id))
        .filter(|award| seen_remove.insert(award.player_id.clone()))
        .cloned()
        .collect();

    ReconciliationPlan {
        achievement_id: achievement_id.clone(),
        to_add,
        to_remove,
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Awarded,
    Revoked,
}

impl AuditAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Awarded => "awarded",
            Self::Revoked => "revoked",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "awarded" => Some(Self::Awarded),
            "revoked" => Some(Self::Revoked),
            _ => None,
        }
    }
}

/// An audit entry before the store stamps it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEntryInput {
    pub entry_id: Ulid,
    pub pass_id: Ulid,
    pub actor: String,
    pub achievement_id: AchievementId,
    pub player_id: PlayerId,
    pub action: AuditAction,
    pub details: Value,
}

impl AuditEntryInput {
    #[must_use]
    pub fn awarded(pass_id: Ulid, actor: &str, rule_key: &str, award: &NewAward) -> Self {
        Self {
            entry_id: Ulid::new(),
            pass_id,
            actor: actor.to_string(),
            achievement_id: award.achievement_id.clone(),
            player_id: award.player_id.clone(),
            action: AuditAction::Awarded,
            details: serde_json::json!({
                "pass_id": pass_id.to_string(),
                "rule_key": rule_key,
                "source": award.source.as_str(),
                "metadata": award.metadata,
            }),
        }
    }

    #[must_use]
    pub fn revoked(pass_id: Ulid, actor: &str, rule_key: &str, award: &Award) -> Self {
        Self {
            entry_id: Ulid::new(),
            pass_id,
            actor: actor.to_string(),
            achievement_id: award.achievement_id.clone(),
            player_id: award.player_id.clone(),
            action: AuditAction::Revoked,
            details: serde_json::json!({
                "pass_id": pass_id.to_string(),
                "rule_key": rule_key,
                "previous_metadata": award.metadata,
                "awarded_at": award.awarded_at,
            }),
        }
    }
}

/// A stored, immutable audit entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditLogEntry {
    pub entry_seq: i64,
    pub entry_id: Ulid,
    pub pass_id: Ulid,
    pub actor: String,
    pub achievement_id: AchievementId,
    pub player_id: PlayerId,
    pub action: AuditAction,
    pub details: Value,
    pub recorded_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SyncConfig {
    pub rule_type: String,
    pub page_size: usize,
    pub actor: String,
    pub lease_ttl_seconds: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            rule_type: LEADERBOARD_RULE_TYPE.to_string(),
            page_size: 500,
            actor: SYSTEM_ACTOR.to_string(),
            lease_ttl_seconds: 300,
        }
    }
}

impl SyncConfig {
    /// Validates bounds of the sync configuration.
    ///
    /// # Errors
    /// Returns [`SyncError::Configuration`] when a field is out of bounds.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.rule_type.trim().is_empty() {
            return Err(SyncError::Configuration(
                "rule_type MUST be provided".to_string(),
            ));
        }

        if self.page_size == 0 || self.page_size > MAX_PAGE_SIZE {
            return Err(SyncError::Configuration(format!(
                "page_size MUST be in [1, {MAX_PAGE_SIZE}]"
            )));
        }

        if self.actor.trim().is_empty() {
            return Err(SyncError::Configuration(
                "actor MUST be provided".to_string(),
            ));
        }

        if self.lease_ttl_seconds == 0 {
            return Err(SyncError::Configuration(
                "lease_ttl_seconds MUST be >= 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Decodes and validates a sync configuration from JSON.
    ///
    /// # Errors
    /// Returns [`SyncError::Configuration`] when decoding fails or decoded
    /// values are out of bounds.
    pub fn from_json(value: &Value) -> Result<Self, SyncError> {
        let config: Self = serde_json::from_value(value.clone()).map_err(|err| {
            SyncError::Configuration(format!("invalid sync config JSON payload: {err}"))
        })?;
        config.validate()?;
        Ok(config)
    }
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`SyncError::Validation`] when parsing fails or the timestamp is
/// not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, SyncError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| SyncError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(SyncError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`SyncError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, SyncError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| SyncError::Validation(format!("failed to format RFC3339 timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
