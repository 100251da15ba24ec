//! Lot sniper: scheduled storefront purchases behind a small HTTP API.
//!
//!   POST /schedule-purchases ──→ PurchaseEngine ──(fire time)──→ storefront
//!
//! Configuration comes from the environment (a `.env` file is honoured).

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use lot_sniper::api;
use lot_sniper::purchase::{EngineConfig, PurchaseEngine};
use lot_sniper::storefront::{HttpStorefront, StorefrontClassifier, StorefrontConfig};

fn init_logging() -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter).with(fmt::layer());

    match std::env::var("LOG_DIR") {
        Ok(dir) if !dir.trim().is_empty() => {
            let appender = tracing_appender::rolling::daily(dir.trim(), "purchase_server.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            registry
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        _ => {
            registry.init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let _log_guard = init_logging();

    info!("═══════════════════════════════════════════════════");
    info!("  Lot Sniper: scheduled purchase engine");
    info!("═══════════════════════════════════════════════════");

    let store_cfg = StorefrontConfig::from_env().context("storefront configuration")?;
    info!("🏪 Storefront: {} (login={})", store_cfg.base_url, store_cfg.login);
    let storefront = HttpStorefront::new(store_cfg);

    let engine = PurchaseEngine::new(
        EngineConfig::from_env(),
        Arc::new(storefront),
        Arc::new(StorefrontClassifier),
    );
    let sweeper = engine.spawn_retention_sweeper();

    let bind = std::env::var("API_BIND").unwrap_or_else(|_| "0.0.0.0:8000".into());
    let addr: SocketAddr = bind
        .parse()
        .with_context(|| format!("invalid API_BIND {:?}", bind))?;

    let stop = CancellationToken::new();
    let mut server = tokio::spawn(api::serve(Arc::clone(&engine), addr, stop.clone()));

    let finished = tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                warn!("signal handler failed: {}", e);
            }
            info!("🛑 Ctrl-C received");
            None
        }
        res = &mut server => Some(res),
    };

    engine.shutdown();
    stop.cancel();
    match finished {
        Some(res) => res.context("api task")??,
        None => server.await.context("api task")??,
    }

    if let Err(e) = sweeper.await {
        warn!("retention sweeper ended abnormally: {}", e);
    }

    info!("👋 Stopped | {:?}", engine.stats());
    Ok(())
}
