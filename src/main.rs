use anyhow::Context;
use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use std::str::FromStr;
use testfarm_sched::catalog_import::CatalogImport;
use testfarm_sched::config::SchedConfig;
use testfarm_sched::logging::{init_logging, init_logging_with_profile, LogLevel};
use testfarm_sched::model::{SchedGroupId, TestBoxId};
use testfarm_sched::scheduler::Scheduler;
use testfarm_sched::store::SchedDb;
use testfarm_sched::timed_span;
use testfarm_sched::util::{format_duration, unix_now};

#[derive(Debug, Parser)]
#[command(name = "testfarm-sched", about = "Test farm scheduling engine")]
struct Cli {
    /// JSON config file
    #[arg(long)]
    config: Option<Utf8PathBuf>,

    /// Database path, overriding the config
    #[arg(long)]
    db: Option<Utf8PathBuf>,

    /// Write a chrome trace of the run to this file
    #[arg(long)]
    profile: Option<Utf8PathBuf>,

    /// Log level, overriding the config (error, warn, info, debug, trace)
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create the database schema
    InitDb,
    /// Replace the catalog with the contents of a JSON document
    ImportCatalog { path: Utf8PathBuf },
    /// Rebuild the queue of a scheduling group
    Rebuild { sched_group: SchedGroupId },
    /// Poll on behalf of one or more testboxes, in order
    Poll {
        #[arg(required = true)]
        test_boxes: Vec<TestBoxId>,
    },
    /// Time out gangs that have been gathering for too long
    Sweep,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => SchedConfig::load(path)?,
        None => SchedConfig::default(),
    };
    if let Some(db) = &cli.db {
        config.db_path = db.clone();
    }
    if let Some(level) = &cli.log_level {
        config.logging.level = LogLevel::from_str(level)?;
    }

    let _flush_guard = match &cli.profile {
        Some(path) => Some(init_logging_with_profile(&config.logging, path.as_std_path())?),
        None => {
            init_logging(&config.logging)?;
            None
        }
    };

    let db = SchedDb::open(&config.db_path)?;
    let mut scheduler = Scheduler::new(db, config);
    let now = unix_now();

    match cli.command {
        Command::InitDb => {
            tracing::info!("Database ready at {}", scheduler.config().db_path);
        }
        Command::ImportCatalog { path } => {
            let text = std::fs::read_to_string(&path).with_context(|| format!("Failed to read catalog [{}]", path))?;
            let doc = CatalogImport::from_json(&text).with_context(|| format!("Invalid catalog [{}]", path))?;
            scheduler.import_catalog(&doc, now)?;
        }
        Command::Rebuild { sched_group } => {
            let report = scheduler.rebuild_queue(sched_group, now)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.is_ok() {
                std::process::exit(1);
            }
        }
        Command::Poll { test_boxes } => {
            let span = timed_span!(tracing::Level::INFO, "poll_pass");
            let mut build_cache = scheduler.new_build_cache();
            let count = test_boxes.len();
            for test_box_id in test_boxes {
                let Some(view) = testfarm_sched::store::load_test_box_view(scheduler.db().conn(), test_box_id, now)? else {
                    tracing::error!("Testbox #{} does not exist", test_box_id);
                    continue;
                };
                let decision = scheduler.poll_with_cache(&view, now, &mut build_cache)?;
                println!(
                    "{}",
                    serde_json::json!({ "test_box_id": test_box_id, "decision": decision })
                );
            }
            tracing::info!(
                "Polled {} testboxes in {}, {} build pages fetched",
                count,
                format_duration(span.elapsed()),
                build_cache.pages_fetched()
            );
        }
        Command::Sweep => {
            let swept = scheduler.sweep_gang_timeouts(now)?;
            println!("{}", serde_json::json!({ "swept": swept }));
        }
    }
    Ok(())
}
