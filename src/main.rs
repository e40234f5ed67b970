use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use transparency_ledger::anchor::{
    AnchorBatcher, AnchorService, AnchorStore, BatchOutcome, RetryPolicy, SimulatedChainProvider,
};
use transparency_ledger::certificates::CertificateIssuer;
use transparency_ledger::config::AppConfig;
use transparency_ledger::database::Database;
use transparency_ledger::ledger::RecordLedger;
use transparency_ledger::server::{self, AppState};
use transparency_ledger::verification::VerificationEngine;

#[derive(Parser, Debug)]
#[command(name = "transparency-ledger", version, about = "Transparency ledger server")]
struct Args {
    /// Configuration file (defaults to TRANSPARENCY_CONFIG or transparency.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "transparency_ledger=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => AppConfig::load_from(Some(path)),
        None => AppConfig::load(),
    }
    .context("Failed to load configuration")?;

    if args.print_config {
        println!("{}", config.to_toml()?);
        return Ok(());
    }

    info!("Starting transparency ledger");

    let database = Database::new(&config.database_url).await?;
    database.run_migrations().await?;
    info!("Database migrations completed");

    let ledger = RecordLedger::new(&database);
    let anchors = AnchorStore::new(&database);

    let mut anchor_service =
        AnchorService::new(config.anchor.default_chain.clone(), RetryPolicy::from(&config.anchor));
    if config.anchor.simulate_chains {
        warn!("Registering simulated chains; anchors will not be publicly verifiable");
        for chain in &config.anchor.chains {
            anchor_service.register(Arc::new(SimulatedChainProvider::for_local_run(chain)));
        }
    } else {
        warn!(
            "No chain client available for {:?}; set anchor.simulate_chains = true for local runs",
            config.anchor.chains
        );
    }
    let anchor_service = Arc::new(anchor_service);

    if config.anchor.enabled && anchor_service.chains().is_empty() {
        warn!("Anchoring disabled: no chain providers registered");
    } else if config.anchor.enabled {
        let batcher = AnchorBatcher::new(
            ledger.clone(),
            anchors.clone(),
            anchor_service.clone(),
            config.anchor.priority,
        );
        let interval_secs = config.anchor.interval_secs;
        let batch_limit = config.anchor.batch_limit;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
            loop {
                interval.tick().await;

                match batcher.anchor_pending_records(batch_limit).await {
                    Ok(BatchOutcome::Anchored(report)) => info!(
                        "Anchored {} records on {} (tx {})",
                        report.record_count, report.chain, report.tx_hash
                    ),
                    Ok(BatchOutcome::Deferred { record_count, reason }) => {
                        warn!("Deferred {} records: {}", record_count, reason)
                    }
                    Ok(BatchOutcome::Rejected {
                        record_count,
                        chain,
                        reason,
                    }) => error!(
                        "{} rejected a batch of {} records: {}",
                        chain, record_count, reason
                    ),
                    Ok(BatchOutcome::NothingPending) => {}
                    Err(e) => error!("Anchoring run failed: {}", e),
                }

                match batcher.confirm_submitted_anchors().await {
                    Ok(report) if report.confirmed + report.rejected > 0 => info!(
                        "Confirmation pass: {} confirmed, {} rejected, {} outstanding",
                        report.confirmed, report.rejected, report.still_submitted
                    ),
                    Ok(_) => {}
                    Err(e) => error!("Anchor confirmation pass failed: {}", e),
                }
            }
        });
        info!(
            "Anchoring task started (every {}s, up to {} records)",
            interval_secs, batch_limit
        );
    }

    let state = AppState {
        verifier: VerificationEngine::new(ledger.clone(), anchors.clone(), anchor_service.clone()),
        certificates: CertificateIssuer::new(&database, ledger.clone(), &config.certificates),
        ledger,
        anchors,
        anchor_service,
    };
    let app = server::router(state);

    let addr = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
