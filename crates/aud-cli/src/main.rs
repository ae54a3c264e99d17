use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use aud_config::{EngineConfig, UnusedKeyPolicy};
use aud_fetch::HttpUpdateFetcher;
use aud_runtime::{ReconciliationEngine, ScheduleRequest};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "aud")]
#[command(about = "Scheduled audience reconciliation CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database commands
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },

    /// Compute layered config hash + print canonical JSON
    ConfigHash {
        /// Paths in merge order (base -> env -> overrides...)
        #[arg(required = true)]
        paths: Vec<String>,

        /// Fail instead of warning when the config has keys nothing reads
        #[arg(long, default_value_t = false)]
        strict: bool,
    },

    /// Queue a reconciliation request
    Schedule {
        #[arg(long)]
        owner: String,

        /// Buyer update endpoint; its host is the buyer
        #[arg(long)]
        uri: String,

        /// Minutes until the request becomes due
        #[arg(long = "delay-minutes", allow_hyphen_values = true)]
        delay_minutes: i64,

        /// JSON array of partial overrides, e.g. '[{"name":"x","user_bidding_signals":{}}]'
        #[arg(long = "overrides")]
        overrides: Option<String>,

        /// Name to leave before the response is applied (repeatable)
        #[arg(long = "leave")]
        leaves: Vec<String>,

        /// Replace a request already pending for (owner, uri)
        #[arg(long, default_value_t = false)]
        replace: bool,

        /// Let the response schedule follow-up requests
        #[arg(long = "allow-chaining", default_value_t = false)]
        allow_chaining: bool,

        /// Layered config paths in merge order
        #[arg(long = "config")]
        config_paths: Vec<String>,
    },

    /// List pending requests for an owner
    Pending {
        #[arg(long)]
        owner: String,
    },

    /// List an owner's active audiences
    Audiences {
        #[arg(long)]
        owner: String,
    },

    /// Run one reconciliation pass now
    RunOnce {
        #[arg(long = "config")]
        config_paths: Vec<String>,
    },

    /// Run a pass every --interval-secs until interrupted
    Daemon {
        #[arg(long = "interval-secs", default_value_t = 300)]
        interval_secs: u64,

        #[arg(long = "config")]
        config_paths: Vec<String>,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    Status,

    /// Apply SQL migrations.
    Migrate,

    /// Delete quarantine entries that have already expired.
    PurgeQuarantine,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Silent if the file does not exist.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let cli = Cli::parse();

    match cli.cmd {
        Commands::Db { cmd } => {
            let pool = aud_db::connect_from_env().await?;
            match cmd {
                DbCmd::Status => {
                    let s = aud_db::status(&pool).await?;
                    println!(
                        "db_ok={} has_schema={} pending_updates={}",
                        s.ok, s.has_schema, s.pending_updates
                    );
                }
                DbCmd::Migrate => {
                    aud_db::migrate(&pool).await?;
                    println!("migrations_applied=true");
                }
                DbCmd::PurgeQuarantine => {
                    let n = aud_db::purge_expired_quarantine(&pool, Utc::now()).await?;
                    println!("quarantine_purged={}", n);
                }
            }
        }

        Commands::ConfigHash { paths, strict } => {
            let path_refs: Vec<&str> = paths.iter().map(|s| s.as_str()).collect();
            let loaded = aud_config::load_layered_yaml(&path_refs)?;
            let policy = if strict {
                UnusedKeyPolicy::Fail
            } else {
                UnusedKeyPolicy::Warn
            };
            let report = aud_config::report_unused_keys(&loaded.config_json, policy)?;
            for p in &report.unused_leaf_pointers {
                warn!(pointer = %p, "config key is not used");
            }
            EngineConfig::from_loaded(&loaded)?;
            println!("config_hash={}", loaded.config_hash);
            println!("{}", loaded.canonical_json);
        }

        Commands::Schedule {
            owner,
            uri,
            delay_minutes,
            overrides,
            leaves,
            replace,
            allow_chaining,
            config_paths,
        } => {
            let cfg = load_engine_config(&config_paths)?;
            let pool = aud_db::connect_from_env().await?;
            let scheduler = aud_runtime::Scheduler::new(pool, cfg.schedule);

            let req = ScheduleRequest {
                owner,
                update_uri: uri,
                partial_overrides: parse_overrides(overrides.as_deref())?,
                leaves,
                min_delay_minutes: delay_minutes,
                replace_pending: replace,
                allow_schedule_in_response: allow_chaining,
            };
            let update_id = scheduler.schedule(&req, Utc::now()).await?;
            println!("scheduled=true update_id={}", update_id);
        }

        Commands::Pending { owner } => {
            let pool = aud_db::connect_from_env().await?;
            let pending = aud_db::list_updates_for_owner(&pool, &owner).await?;
            for p in &pending {
                let u = &p.update;
                println!(
                    "update_id={} buyer={} uri={} due={} overrides={} leaves={}",
                    u.update_id,
                    u.buyer,
                    u.update_uri,
                    u.scheduled_time.to_rfc3339(),
                    p.partial_overrides.len(),
                    p.leaves.len()
                );
            }
            println!("pending={}", pending.len());
        }

        Commands::Audiences { owner } => {
            let pool = aud_db::connect_from_env().await?;
            let active = aud_db::list_active_audiences(&pool, &owner, Utc::now()).await?;
            for r in &active {
                println!(
                    "buyer={} name={} expires={} ads={}",
                    r.buyer,
                    r.name,
                    r.expiration_time.to_rfc3339(),
                    r.ads.len()
                );
            }
            println!("active={}", active.len());
        }

        Commands::RunOnce { config_paths } => {
            let engine = build_engine(&config_paths).await?;
            let s = engine.perform_scheduled_updates(Utc::now()).await;
            println!(
                "found={} stale_removed={} completed={} quarantined={} retry_pending={} malformed_dropped={}",
                s.found, s.stale_removed, s.completed, s.quarantined, s.retry_pending, s.malformed_dropped
            );
        }

        Commands::Daemon {
            interval_secs,
            config_paths,
        } => {
            if interval_secs == 0 {
                bail!("--interval-secs must be > 0");
            }
            let engine = build_engine(&config_paths).await?;
            info!(interval_secs, "reconciliation daemon started");
            let handle = aud_runtime::spawn_pass_tick(engine, Duration::from_secs(interval_secs));
            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for shutdown signal")?;
            handle.abort();
            info!("reconciliation daemon stopped");
        }
    }

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Defaults when no paths are given.
fn load_engine_config(paths: &[String]) -> Result<EngineConfig> {
    if paths.is_empty() {
        return Ok(EngineConfig::default());
    }
    let path_refs: Vec<&str> = paths.iter().map(|s| s.as_str()).collect();
    let loaded = aud_config::load_layered_yaml(&path_refs)?;
    let report = aud_config::report_unused_keys(&loaded.config_json, UnusedKeyPolicy::Warn)?;
    for p in &report.unused_leaf_pointers {
        warn!(pointer = %p, "config key is not used");
    }
    info!(config_hash = %loaded.config_hash, "config loaded");
    EngineConfig::from_loaded(&loaded)
}

async fn build_engine(config_paths: &[String]) -> Result<ReconciliationEngine> {
    let cfg = load_engine_config(config_paths)?;
    let pool = aud_db::connect_from_env().await?;
    aud_db::migrate(&pool).await?;
    let fetcher = HttpUpdateFetcher::new(&cfg.fetch).context("http fetcher init failed")?;
    Ok(ReconciliationEngine::new(pool, Arc::new(fetcher), cfg))
}

fn parse_overrides(raw: Option<&str>) -> Result<Vec<aud_schemas::PartialOverride>> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    let v: Value = serde_json::from_str(raw).context("--overrides is not valid JSON")?;
    let Value::Array(items) = v else {
        bail!("--overrides must be a JSON array");
    };
    items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            aud_directives::parse_override_json(item)
                .with_context(|| format!("--overrides[{i}] is not a valid partial override"))
        })
        .collect()
}
