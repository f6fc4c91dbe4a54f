//! Command surface for the achievement sync engine.
//!
//! Hosts that embed sync behavior should go through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_sync_with_db`] for a single sync pass against a DB path.
//! - [`run_sync`] for a sync pass against an existing [`SqliteAchievementStore`].

use std::path::{Path, PathBuf};

use achievement_sync_core::{AchievementId, SyncConfig};
use achievement_sync_engine::{SyncEngine, SyncMode, SyncRequest, SyncResponse};
use achievement_sync_store_sqlite::SqliteAchievementStore;
use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::Value;
use tracing::{info, warn};
use ulid::Ulid;

#[derive(Debug, Parser)]
#[command(name = "achsync")]
#[command(about = "Achievement synchronization CLI")]
pub struct Cli {
    #[arg(long, default_value = "./achievements.sqlite3")]
    pub db: PathBuf,

    /// Emit debug-level logs on stderr.
    #[arg(long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Sync {
        #[command(subcommand)]
        command: SyncCommand,
    },
    Rules {
        #[command(subcommand)]
        command: RulesCommand,
    },
    Awards {
        #[command(subcommand)]
        command: AwardsCommand,
    },
    Audit {
        #[command(subcommand)]
        command: AuditCommand,
    },
    Lease {
        #[command(subcommand)]
        command: LeaseCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum SyncCommand {
    Run(SyncRunArgs),
}

#[derive(Debug, Args)]
pub struct SyncRunArgs {
    #[arg(long, value_enum, default_value_t = ModeArg::Full)]
    pub mode: ModeArg,
    /// Accepted for trigger compatibility; every player is evaluated.
    #[arg(long)]
    pub player_id: Option<String>,
    /// Raw trigger request body, e.g. `{"mode":"preview"}`.
    #[arg(long, conflicts_with_all = ["mode", "player_id"])]
    pub request_json: Option<String>,
    #[arg(long)]
    pub config: Option<PathBuf>,
    #[arg(long)]
    pub page_size: Option<usize>,
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ModeArg {
    Full,
    Preview,
}

#[derive(Debug, Subcommand)]
pub enum RulesCommand {
    List(RulesListArgs),
}

#[derive(Debug, Args)]
pub struct RulesListArgs {
    #[arg(long)]
    pub rule_type: Option<String>,
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Subcommand)]
pub enum AwardsCommand {
    List(AwardsListArgs),
}

#[derive(Debug, Args)]
pub struct AwardsListArgs {
    #[arg(long)]
    pub achievement_id: String,
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Subcommand)]
pub enum AuditCommand {
    List(AuditListArgs),
}

#[derive(Debug, Args)]
pub struct AuditListArgs {
    #[arg(long)]
    pub achievement_id: Option<String>,
    /// Show only the most recent N entries.
    #[arg(long)]
    pub limit: Option<usize>,
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Subcommand)]
pub enum LeaseCommand {
    Status(LeaseStatusArgs),
}

#[derive(Debug, Args)]
pub struct LeaseStatusArgs {
    #[arg(long)]
    pub json: bool,
}

pub fn run_cli(cli: Cli) -> Result<()> {
    let mut store = SqliteAchievementStore::open(&cli.db)?;
    store.migrate()?;

    match cli.command {
        Command::Sync {
            command: SyncCommand::Run(args),
        } => run_sync_command(&args, &mut store),
        Command::Rules {
            command: RulesCommand::List(args),
        } => run_rules_list(&args, &store),
        Command::Awards {
            command: AwardsCommand::List(args),
        } => run_awards_list(&args, &store),
        Command::Audit {
            command: AuditCommand::List(args),
        } => run_audit_list(&args, &store),
        Command::Lease {
            command: LeaseCommand::Status(args),
        } => run_lease_status(&args, &store),
    }
}

pub fn run_sync_with_db(
    db_path: &Path,
    config: &SyncConfig,
    request: &SyncRequest,
) -> Result<SyncResponse> {
    let mut store = SqliteAchievementStore::open(db_path)?;
    store.migrate()?;
    run_sync(&mut store, config, request)
}

/// Runs one pass while holding the store's sync lease.
pub fn run_sync(
    store: &mut SqliteAchievementStore,
    config: &SyncConfig,
    request: &SyncRequest,
) -> Result<SyncResponse> {
    config.validate()?;

    let pass_id = Ulid::new();
    let holder = pass_id.to_string();
    let lease = store.acquire_sync_lease(&holder, config.lease_ttl_seconds)?;
    info!(%pass_id, expires_at = %lease.expires_at, "acquired sync lease");

    let outcome = SyncEngine::new(store, config.clone())
        .and_then(|mut engine| engine.run_pass(pass_id, request))
        .map_err(anyhow::Error::from);

    match store.release_sync_lease(&holder) {
        Ok(true) => {}
        Ok(false) => warn!(%pass_id, "sync lease was taken over before release"),
        Err(err) => warn!(%pass_id, error = %format!("{err:#}"), "failed to release sync lease"),
    }

    outcome
}

fn run_sync_command(args: &SyncRunArgs, store: &mut SqliteAchievementStore) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => SyncConfig::default(),
    };
    if let Some(page_size) = args.page_size {
        config.page_size = page_size;
    }

    let request = match &args.request_json {
        Some(raw) => {
            let body: Value = serde_json::from_str(raw)
                .with_context(|| format!("request_json must be valid JSON: {raw}"))?;
            SyncRequest::from_json(&body)?
        }
        None => SyncRequest {
            mode: map_mode(args.mode),
            player_id: args
                .player_id
                .as_deref()
                .map(|raw| {
                    achievement_sync_core::PlayerId::parse(raw)
                        .ok_or_else(|| anyhow!("player_id must be a non-empty identifier"))
                })
                .transpose()?,
        },
    };

    let response = run_sync(store, &config, &request)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&response)?);
    } else {
        println!("pass: {} mode: {}", response.pass_id, response.mode.as_str());
        println!(
            "{:<24} {:<8} {:>6} {:>8} {:>8}",
            "achievement", "status", "added", "removed", "winners"
        );
        println!("{}", "-".repeat(60));
        for entry in &response.summary {
            println!(
                "{:<24} {:<8} {:>6} {:>8} {:>8}",
                entry.achievement,
                entry.status.as_str(),
                display_count(entry.added),
                display_count(entry.removed),
                display_count(entry.winners.as_ref().map(Vec::len)),
            );
            if let Some(detail) = entry.error.as_ref().or(entry.reason.as_ref()) {
                println!("  {detail}");
            }
        }
    }

    Ok(())
}

fn run_rules_list(args: &RulesListArgs, store: &SqliteAchievementStore) -> Result<()> {
    let rule_type = args
        .rule_type
        .clone()
        .unwrap_or_else(|| SyncConfig::default().rule_type);
    let rules = store.list_rules(&rule_type)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&rules)?);
    } else {
        for rule in &rules {
            println!(
                "{} id={} payload={}",
                rule.key,
                rule.id,
                serde_json::to_string(&rule.rule_payload)?
            );
        }
    }
    Ok(())
}

fn run_awards_list(args: &AwardsListArgs, store: &SqliteAchievementStore) -> Result<()> {
    let awards = store.list_awards(&AchievementId(args.achievement_id.clone()))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&awards)?);
    } else {
        for award in &awards {
            println!(
                "{} source={} awarded_at={} metadata={}",
                award.player_id,
                award.source.as_str(),
                award.awarded_at,
                serde_json::to_string(&award.metadata)?
            );
        }
    }
    Ok(())
}

fn run_audit_list(args: &AuditListArgs, store: &SqliteAchievementStore) -> Result<()> {
    let achievement_id = args.achievement_id.clone().map(AchievementId);
    let entries = store.list_audit_entries(achievement_id.as_ref(), args.limit)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else {
        for entry in &entries {
            println!(
                "#{} {} {} {} {} pass={}",
                entry.entry_seq,
                entry.recorded_at,
                entry.action.as_str(),
                entry.achievement_id,
                entry.player_id,
                entry.pass_id
            );
        }
    }
    Ok(())
}

fn run_lease_status(args: &LeaseStatusArgs, store: &SqliteAchievementStore) -> Result<()> {
    let lease = store.current_sync_lease()?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&lease)?);
    } else {
        match lease {
            Some(lease) => println!(
                "held by {} since {} until {}",
                lease.holder, lease.acquired_at, lease.expires_at
            ),
            None => println!("no active sync lease"),
        }
    }
    Ok(())
}

fn load_config(path: &Path) -> Result<SyncConfig> {
    let body = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let value: Value = serde_json::from_str(&body)
        .with_context(|| format!("config file must be valid JSON: {}", path.display()))?;
    Ok(SyncConfig::from_json(&value)?)
}

fn map_mode(value: ModeArg) -> SyncMode {
    match value {
        ModeArg::Full => SyncMode::Full,
        ModeArg::Preview => SyncMode::Preview,
    }
}

fn display_count(value: Option<usize>) -> String {
    value.map_or_else(|| "-".to_string(), |count| count.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use achievement_sync_core::{PlayerId, Rule, SessionId, StatShape};
    use achievement_sync_engine::RuleStatus;
    use achievement_sync_store_sqlite::PerformanceRecordInput;
    use serde_json::json;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn must_some<T>(value: Option<T>) -> T {
        match value {
            Some(inner) => inner,
            None => panic!("expected Some(..), got None"),
        }
    }

    fn seeded_store() -> SqliteAchievementStore {
        let store = must(SqliteAchievementStore::open(Path::new(":memory:")));
        must(store.migrate());
        must(store.upsert_rule(&Rule {
            id: AchievementId("fastest".to_string()),
            key: "fastest-sprinter".to_string(),
            rule_type: "leaderboard".to_string(),
            rule_payload: json!({"skill": "sprint"}),
        }));
        let session = must_some(SessionId::parse("s1"));
        must(store.insert_session(&session, &json!(7)));
        let _ = must(store.insert_performance_record(&PerformanceRecordInput {
            session_id: Some(session),
            skill: "sprint".to_string(),
            component: None,
            shape: StatShape::Scalar { value: json!(12.5) },
        }));
        store
    }

    #[test]
    fn cli_parses_sync_run_flags() {
        let cli = match Cli::try_parse_from([
            "achsync",
            "--db",
            "/tmp/x.sqlite3",
            "sync",
            "run",
            "--mode",
            "preview",
            "--page-size",
            "50",
            "--json",
        ]) {
            Ok(value) => value,
            Err(err) => panic!("failed to parse cli: {err}"),
        };

        match cli.command {
            Command::Sync {
                command: SyncCommand::Run(args),
            } => {
                assert!(matches!(args.mode, ModeArg::Preview));
                assert_eq!(args.page_size, Some(50));
                assert!(args.json);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn request_json_conflicts_with_mode_flag() {
        let parsed = Cli::try_parse_from([
            "achsync",
            "sync",
            "run",
            "--mode",
            "full",
            "--request-json",
            "{}",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn run_sync_releases_the_lease_after_the_pass() {
        let mut store = seeded_store();

        let response = must(run_sync(
            &mut store,
            &SyncConfig::default(),
            &SyncRequest::default(),
        ));

        assert_eq!(response.summary[0].status, RuleStatus::Synced);
        assert_eq!(
            response.summary[0].winners,
            Some(vec![must_some(PlayerId::parse("7"))])
        );
        assert!(must(store.current_sync_lease()).is_none());
    }

    #[test]
    fn run_sync_refuses_while_another_pass_holds_the_lease() {
        let mut store = seeded_store();
        let _ = must(store.acquire_sync_lease("other-pass", 300));

        let result = run_sync(&mut store, &SyncConfig::default(), &SyncRequest::default());

        let message = match result {
            Ok(_) => panic!("expected lease conflict"),
            Err(err) => format!("{err:#}"),
        };
        assert!(message.contains("sync pass already in progress"));
        assert!(must(store.list_awards(&AchievementId("fastest".to_string()))).is_empty());
    }

    #[test]
    fn invalid_config_is_rejected_before_taking_the_lease() {
        let mut store = seeded_store();
        let config = SyncConfig {
            page_size: 0,
            ..SyncConfig::default()
        };

        assert!(run_sync(&mut store, &config, &SyncRequest::default()).is_err());
        assert!(must(store.current_sync_lease()).is_none());
    }
}
