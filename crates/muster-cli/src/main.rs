//! `muster` maintenance binary.
//!
//! Reads `muster.toml` (or the path given with `--config`), opens the SQLite
//! store and runs one maintenance or inspection command. Meant to be called
//! from cron or a systemd timer for the periodic jobs:
//!
//! ```text
//! 0 0 1 * *   muster reset-limits
//! */15 * * * * muster reap-sessions --grace-minutes 5
//! ```

mod settings;

use std::{path::PathBuf, sync::Arc};

use anyhow::Context as _;
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use muster_core::{
  LifecycleController, TestSessionManager,
  application::ApplicationType,
  clock::{Clock, SystemClock},
  exam::NewTest,
  id::UserId,
};
use muster_store_sqlite::SqliteStore;
use serde::Serialize;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::settings::MusterConfig;

type Lifecycle = LifecycleController<SqliteStore, SqliteStore, SqliteStore>;

#[derive(Parser)]
#[command(author, version, about = "Muster maintenance tool")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, default_value = "muster.toml")]
  config: PathBuf,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand)]
enum Command {
  /// Announce that monthly application limits have been refreshed.
  ResetLimits,
  /// Abandon test sessions that ran past their time limit.
  ReapSessions {
    /// Extra minutes allowed beyond each test's duration.
    #[arg(long, default_value_t = 0)]
    grace_minutes: i64,
  },
  /// Print a member's quota usage for the current month.
  Stats { user: i64 },
  /// Check whether a member may submit an application of a type.
  CanSubmit { user: i64, kind: ApplicationType },
  /// Create a test from a JSON definition.
  ImportTest { file: PathBuf },
  /// Register a member, optionally as a reviewer.
  AddMember {
    user:     i64,
    #[arg(long)]
    reviewer: bool,
  },
  /// Print undelivered notifications.
  Outbox {
    #[arg(long, default_value_t = 50)]
    limit: usize,
    /// Mark the printed notifications as delivered.
    #[arg(long)]
    ack:   bool,
  },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .with_writer(std::io::stderr)
    .init();

  let cli = Cli::parse();
  let cfg = MusterConfig::load(&cli.config)?;

  let store_path = cfg.resolved_store_path();
  if let Some(parent) = store_path.parent().filter(|p| !p.as_os_str().is_empty()) {
    std::fs::create_dir_all(parent)
      .with_context(|| format!("failed to create {parent:?}"))?;
  }
  let store = Arc::new(
    SqliteStore::open(&store_path)
      .await
      .with_context(|| format!("failed to open store at {store_path:?}"))?,
  );

  let lifecycle = Arc::new(
    LifecycleController::new(
      Arc::clone(&store),
      Arc::clone(&store),
      Arc::clone(&store),
      Arc::new(SystemClock) as Arc<dyn Clock>,
    )
    .with_calendar(cfg.calendar()?),
  );

  run(cli.command, &store, lifecycle).await
}

async fn run(command: Command, store: &SqliteStore, lifecycle: Arc<Lifecycle>) -> anyhow::Result<()> {
  match command {
    Command::ResetLimits => {
      let notified = lifecycle
        .reset_monthly_limits()
        .await
        .context("failed to announce limit refresh")?;
      println!("notified {notified} members");
    }

    Command::ReapSessions { grace_minutes } => {
      let sessions = TestSessionManager::new(lifecycle);
      let reaped = sessions
        .reap_stale(Duration::minutes(grace_minutes))
        .await
        .context("failed to reap sessions")?;
      println!("abandoned {} sessions", reaped.len());
    }

    Command::Stats { user } => {
      let stats = lifecycle
        .limiter()
        .user_stats(UserId(user))
        .await
        .context("failed to compute stats")?;
      print_json(&stats)?;
    }

    Command::CanSubmit { user, kind } => {
      let decision = lifecycle
        .limiter()
        .can_submit(UserId(user), kind)
        .await
        .context("failed to check limits")?;
      print_json(&decision)?;
    }

    Command::ImportTest { file } => {
      let raw = std::fs::read_to_string(&file)
        .with_context(|| format!("failed to read {file:?}"))?;
      let input: NewTest =
        serde_json::from_str(&raw).with_context(|| format!("{file:?} is not a test definition"))?;
      let sessions = TestSessionManager::new(lifecycle);
      let test = sessions.create_test(input).await.context("failed to import test")?;
      println!("created test {} ({} questions)", test.id, test.questions.len());
    }

    Command::AddMember { user, reviewer } => {
      store
        .add_member(UserId(user), reviewer)
        .await
        .context("failed to add member")?;
      tracing::info!(%user, reviewer, "member registered");
    }

    Command::Outbox { limit, ack } => {
      let entries = store
        .pending_notifications(limit)
        .await
        .context("failed to read outbox")?;
      print_json(&entries)?;
      if ack {
        let ids = entries.iter().map(|e| e.id).collect();
        let marked = store
          .mark_delivered(ids, Utc::now())
          .await
          .context("failed to acknowledge notifications")?;
        tracing::info!(marked, "notifications acknowledged");
      }
    }
  }
  Ok(())
}

fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}
