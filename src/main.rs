use std::process::ExitCode;
use std::sync::Arc;

use ledgerd::compacter::Compacter;
use ledgerd::config::Config;
use ledgerd::consumer::Consumer;
use ledgerd::http::{router, AppState};
use ledgerd::ingest::IngestLog;
use ledgerd::metrics::Metrics;
use ledgerd::peer::StaticPeerDirectory;
use ledgerd::store::StoreLog;
use ledgerd::supervisor::{Actor, Supervisor};
use ledgerd::writer::{Modality, WriterListener};
use ledgerd_core::{Filesystem, RealFilesystem};
use log::LevelFilter;
use simple_logger::SimpleLogger;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> ExitCode {
    SimpleLogger::new().with_level(LevelFilter::Info).init().unwrap();

    let config = Config::from_env();
    log::info!("starting with config: {config:?}");

    let fs: Arc<dyn Filesystem> = Arc::new(RealFilesystem);
    let metrics = Arc::new(Metrics::new());

    let ingest = match IngestLog::open(config.ingest_path.clone(), fs.clone(), metrics.clone(), config.pending_timeout).await {
        Ok(log) => Arc::new(log),
        Err(e) => {
            log::error!("failed to open ingest log: {e}");
            return ExitCode::FAILURE;
        }
    };
    let store = match StoreLog::open(config.store_path.clone(), fs, config.segment_target_size, config.purge_age).await {
        Ok(log) => Arc::new(log),
        Err(e) => {
            log::error!("failed to open store log: {e}");
            return ExitCode::FAILURE;
        }
    };

    // One peer directory backs both peer kinds off the same configured
    // list -- a real membership layer would distinguish ingest/store
    // peers, but that discovery protocol is an external collaborator.
    let peers = Arc::new(StaticPeerDirectory::new(
        config.peers.clone(),
        config.peers.clone(),
        format!("ledgerd-{}", ledgerd_core::Ulid::new()),
    ));

    let mut supervisor = Supervisor::new();

    for (addr, modality) in [
        (config.fast_addr.clone(), Modality::Fast),
        (config.durable_addr.clone(), Modality::Durable),
        (config.bulk_addr.clone(), Modality::Bulk),
    ] {
        let listener = Arc::new(WriterListener::new(addr.clone(), modality, ingest.clone(), config.flush_size as u64, config.flush_age));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        supervisor.add(Actor::new(
            format!("writer:{addr}"),
            async move { listener.run(cancel_rx).await },
            move || {
                let _ = cancel_tx.send(true);
            },
        ));
    }

    {
        let consumer = Arc::new(Consumer::new(
            peers.clone(),
            store.clone(),
            metrics.clone(),
            config.claim_timeout,
            config.consumer_backoff,
        ));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        supervisor.add(Actor::new(
            "consumer",
            async move { consumer.run(cancel_rx).await },
            move || {
                let _ = cancel_tx.send(true);
            },
        ));
    }

    {
        let compacter = Arc::new(Compacter::new(store.clone(), metrics.clone(), config.retention, config.compacter_cycle * 10));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        supervisor.add(Actor::new(
            "compacter",
            async move { compacter.run(config.compacter_cycle, cancel_rx).await },
            move || {
                let _ = cancel_tx.send(true);
            },
        ));
    }

    {
        let app = router(AppState {
            ingest: ingest.clone(),
            store: store.clone(),
            metrics: metrics.clone(),
        });
        let http_addr = config.http_addr.clone();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        supervisor.add(Actor::new(
            format!("http:{http_addr}"),
            async move {
                let listener = tokio::net::TcpListener::bind(&http_addr).await?;
                axum::serve(listener, app)
                    .with_graceful_shutdown(async move {
                        let mut rx = cancel_rx;
                        let _ = rx.changed().await;
                    })
                    .await?;
                Ok(())
            },
            move || {
                let _ = cancel_tx.send(true);
            },
        ));
    }

    match supervisor.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("shutting down after actor failure: {e}");
            ExitCode::FAILURE
        }
    }
}
