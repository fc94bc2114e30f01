//! `posture`: server and batch commands for the rating engine.
//!
//! Reads `config.toml` (or the path given with `--config`) layered with
//! `POSTURE_*` environment variables and opens the SQLite store it names.
//!
//! ```text
//! posture serve
//! posture rebuild --history --as-of 2024-01-01T00:00:00Z
//! posture default-ratings
//! posture merge --source <id> --source <id> --name "New" --country NL --kind municipality
//! posture stats --weeks-back 4
//! ```

use std::{
  path::{Path, PathBuf},
  sync::Arc,
};

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use posture_api::ApiState;
use posture_core::{
  builder::{self, RebuildRequest},
  lineage::MergeRequest,
  locks::OrganizationLocks,
  stats,
  store::RatingStore,
};
use posture_server::{ServerConfig, worker::RebuildPool};
use posture_store_sqlite::SqliteStore;
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(author, version, about = "Temporal security posture ratings")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, default_value = "config.toml")]
  config: PathBuf,

  #[command(subcommand)]
  command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
  /// Serve the JSON API (the default).
  Serve,

  /// Rebuild ratings for one organization, or every living one.
  Rebuild {
    #[arg(long)]
    organization: Option<Uuid>,
    /// Evaluate every significant moment instead of only `--as-of`.
    #[arg(long)]
    history:      bool,
    #[arg(long)]
    as_of:        Option<DateTime<Utc>>,
  },

  /// Give organizations without any rating an unrated snapshot.
  DefaultRatings {
    #[arg(long)]
    as_of: Option<DateTime<Utc>>,
  },

  /// Merge organizations into a new successor.
  Merge {
    #[arg(long = "source", required = true)]
    sources: Vec<Uuid>,
    #[arg(long)]
    name:    String,
    #[arg(long)]
    country: String,
    #[arg(long)]
    kind:    String,
    #[arg(long)]
    when:    Option<DateTime<Utc>>,
  },

  /// Print the statistics series as JSON.
  Stats {
    #[arg(long)]
    as_of:           Option<DateTime<Utc>>,
    #[arg(long, default_value_t = 0)]
    weeks_back:      u32,
    /// Print the per-finding-type vulnerability series instead.
    #[arg(long)]
    vulnerabilities: bool,
  },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  // Initialise tracing.
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .init();

  let cli = Cli::parse();

  let config = ServerConfig::load(&cli.config)
    .with_context(|| format!("failed to load configuration from {:?}", cli.config))?;

  let store_path = expand_tilde(&config.store_path);
  let store = Arc::new(
    SqliteStore::open(&store_path)
      .await
      .with_context(|| format!("failed to open store at {store_path:?}"))?,
  );
  let locks = OrganizationLocks::new();

  match cli.command.unwrap_or(Command::Serve) {
    Command::Serve => serve(config, store, locks).await,
    Command::Rebuild { organization, history, as_of } => {
      let as_of = as_of.unwrap_or_else(Utc::now);
      match organization {
        Some(organization_id) => {
          let report = builder::rebuild(
            store.as_ref(),
            RebuildRequest { organization_id, create_history: history, as_of },
          )
          .await
          .context("rebuild failed")?;
          print_json(&report)
        }
        None => {
          let pool = RebuildPool::spawn(store.clone(), locks, config.workers);
          pool.submit_all(store.as_ref(), as_of, history).await?;
          let tally = pool.shutdown().await?;
          tracing::info!(
            rebuilt = tally.rebuilt,
            failed = tally.failed,
            snapshots = tally.organization_snapshots,
            "rebuild finished"
          );
          if tally.failed > 0 {
            anyhow::bail!("{} rebuilds failed", tally.failed);
          }
          Ok(())
        }
      }
    }
    Command::DefaultRatings { as_of } => {
      let created = builder::default_ratings(store.as_ref(), as_of.unwrap_or_else(Utc::now))
        .await
        .context("default ratings failed")?;
      println!("{created}");
      Ok(())
    }
    Command::Merge { sources, name, country, kind, when } => {
      let request = MergeRequest {
        sources,
        target_name: name,
        country,
        kind,
        when: when.unwrap_or_else(Utc::now),
      };
      let outcome = store.merge_organizations(request).await.context("merge failed")?;
      print_json(&outcome)
    }
    Command::Stats { as_of, weeks_back, vulnerabilities } => {
      let as_of = as_of.unwrap_or_else(Utc::now);
      if vulnerabilities {
        let series =
          stats::vulnerability_series(store.as_ref(), as_of, weeks_back, &config.timeframes)
            .await
            .context("statistics failed")?;
        print_json(&series)
      } else {
        let series = stats::statistics(store.as_ref(), as_of, weeks_back, &config.timeframes)
          .await
          .context("statistics failed")?;
        print_json(&series)
      }
    }
  }
}

async fn serve(
  config: ServerConfig,
  store: Arc<SqliteStore>,
  locks: OrganizationLocks,
) -> anyhow::Result<()> {
  let pool = Arc::new(RebuildPool::spawn(store.clone(), locks.clone(), config.workers));
  let api = ApiState::new(store, locks, config.timeframes.clone());
  let app = posture_server::router(api, pool);

  let address = config.address();
  tracing::info!("Listening on http://{address}");
  let listener = TcpListener::bind(&address)
    .await
    .with_context(|| format!("failed to bind {address}"))?;

  axum::serve(listener, app).await.context("server error")?;

  Ok(())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
  let s = path.to_string_lossy();
  if let Some(rest) = s.strip_prefix("~/")
    && let Ok(home) = std::env::var("HOME")
  {
    return PathBuf::from(home).join(rest);
  }
  path.to_path_buf()
}
