use std::env;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use orgtree::cache::MemoryCache;
use orgtree::entity::EntityKind;
use orgtree::events::Operation;
use orgtree::permission::Role;
use orgtree::request::BatchRequest;
use orgtree::store::SeaStore;
use orgtree::{db, integrity, Config, OrgState};

fn print_usage() {
    println!("Usage: orgtree [OPTIONS] <COMMAND>");
    println!("Commands:");
    println!("  check                      Scan stored hierarchies for corruption");
    println!("  import <kind> <file.json>  Create records of a kind from a JSON array");
    println!("Options:");
    println!("  -config <path>  Path to configuration file (default: ./etc/orgtree.toml)");
    println!("  -help, --help   Print this help message");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command line arguments
    let args: Vec<String> = env::args().collect();
    if args.iter().any(|arg| arg == "-help" || arg == "--help") {
        print_usage();
        return Ok(());
    }

    let config_path = args
        .iter()
        .skip_while(|arg| arg.as_str() != "-config")
        .nth(1)
        .map(|s| s.to_string())
        .unwrap_or_else(|| "./etc/orgtree.toml".to_string());

    // Positional arguments, with the -config pair removed
    let mut positional = Vec::new();
    let mut rest = args.iter().skip(1);
    while let Some(arg) = rest.next() {
        if arg == "-config" {
            rest.next();
        } else {
            positional.push(arg.as_str());
        }
    }

    // Load configuration first (before logging init)
    let config = Config::load(&config_path).unwrap_or_else(|e| {
        eprintln!("Could not load config file: {}, using defaults", e);
        Config::default()
    });

    // Initialize logging
    // Priority: RUST_LOG env var > config file > default "info"
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log.level));

    fmt::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    info!("Loading configuration from: {}", config_path);

    let db_conn = db::init_database(&config.database).await.map_err(|e| {
        tracing::error!("Database initialization failed: {}", e);
        anyhow::anyhow!("Database initialization failed: {}", e)
    })?;

    let cache = Arc::new(MemoryCache::new(config.cache.capacity));
    let state = OrgState::new(Arc::new(SeaStore::new(db_conn)), cache, config);

    let result = match positional.as_slice() {
        ["check"] => check(&state).await,
        ["import", kind, file] => import(&state, kind, file).await,
        _ => {
            print_usage();
            Err(anyhow::anyhow!("missing or unknown command"))
        }
    };

    state.close().await;
    result
}

async fn check(state: &OrgState) -> anyhow::Result<()> {
    let report = integrity::scan(
        state.store.as_repository(),
        state.config.hierarchy.max_depth,
    )
    .await?;

    for issue in &report.issues {
        warn!("{}", issue);
    }
    info!(
        "Scanned {} records, {} issue(s) found",
        report.scanned,
        report.issues.len()
    );

    if report.is_clean() {
        Ok(())
    } else {
        Err(anyhow::anyhow!("{} integrity issue(s)", report.issues.len()))
    }
}

async fn import(state: &OrgState, kind: &str, file: &str) -> anyhow::Result<()> {
    let kind: EntityKind = kind.parse().map_err(|e: String| anyhow::anyhow!(e))?;
    let content = std::fs::read_to_string(file)?;
    let records: Vec<serde_json::Value> = serde_json::from_str(&content)?;
    info!("Importing {} {} record(s) from {}", records.len(), kind, file);

    let (mut created, mut failed) = (0, 0);
    for chunk in records.chunks(state.config.bulk.limit.max(1)) {
        let request =
            BatchRequest::for_role(Role::Admin, kind, Operation::Create, chunk.to_vec(), None);
        let outcome = state.execute_batch(request).await?;
        for failure in &outcome.failed {
            warn!("Batch {}: {}", outcome.batch_id, failure);
        }
        created += outcome.succeeded.len();
        failed += outcome.failed.len();
    }

    info!("Import finished: {} created, {} failed", created, failed);
    Ok(())
}
