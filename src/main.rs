//! Lucky-draw console backend
//!
//! Runs four concurrent subsystems:
//!
//! - **Sync**: subscribes to the registry and keeps the local replica current.
//! - **Frame loop**: samples the wheel animation and commits each winner.
//! - **Celebration hook**: logs draw events without ever blocking a draw.
//! - **HTTP server**: the operator API plus `/health` and `/status` probes.

use actix_web::{web, App, HttpServer};
use anyhow::Context;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use lucky_draw::config::AppConfig;
use lucky_draw::engine::{self, DrawEngine, DrawEvent, DrawOutcome};
use lucky_draw::firebase::FirebaseRegistry;
use lucky_draw::memory::MemoryRegistry;
use lucky_draw::metrics::DrawMetrics;
use lucky_draw::registry::Registry;
use lucky_draw::server::{self, AppState};
use lucky_draw::sync::{self, Replica};

async fn celebrate(mut events: broadcast::Receiver<DrawEvent>) {
    loop {
        match events.recv().await {
            Ok(DrawEvent::Finished(DrawOutcome::Winner(winner))) => info!(
                number = %winner.number,
                email = winner.email.as_deref().unwrap_or("unknown"),
                slot = %winner.slot,
                persisted = winner.persisted,
                "Celebrating winner"
            ),
            Ok(DrawEvent::Finished(DrawOutcome::Void { reason })) => {
                info!(?reason, "No winner this spin, ready to spin again")
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Celebration hook fell behind")
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,reqwest=warn,hyper=warn")),
        )
        .with_target(true)
        .with_ansi(true)
        .init();

    let config = AppConfig::from_env().context("invalid configuration")?;

    let registry: Arc<dyn Registry> = if config.uses_memory_registry() {
        warn!("Using the in-process registry; nothing is shared or persisted");
        Arc::new(MemoryRegistry::new())
    } else {
        Arc::new(
            FirebaseRegistry::new(
                &config.registry_url,
                config.registry_auth.clone(),
                config.reconnect_delay(),
            )
            .context("failed to build registry client")?,
        )
    };
    info!(registry = %config.registry_url, "Registry configured");

    // Seed the replica before serving so the first request sees real data.
    let initial = Replica::load(registry.as_ref())
        .await
        .context("failed to read initial registry state")?;
    info!(
        registrants = initial.registrants.len(),
        slots = initial.counts.total(),
        "Initial registry state loaded"
    );
    let (replica_tx, replica_rx) = watch::channel(initial);

    // Background: stream registry changes into the replica.
    let sync_registry = registry.clone();
    tokio::spawn(async move {
        if let Err(e) = sync::run_sync(sync_registry, replica_tx).await {
            error!(error = %e, "Registry sync stopped");
        }
    });

    let metrics = Arc::new(DrawMetrics::new());
    let draw_engine = DrawEngine::new(
        registry.clone(),
        replica_rx.clone(),
        config.engine_options(),
        metrics.clone(),
    );
    tokio::spawn(celebrate(draw_engine.subscribe()));
    let draw_engine = Arc::new(Mutex::new(draw_engine));

    // Background: drive the wheel animation.
    tokio::spawn(engine::run_frames(
        draw_engine.clone(),
        config.frame_interval(),
    ));

    let state = web::Data::new(AppState {
        engine: draw_engine,
        registry,
        replica: replica_rx,
        metrics,
    });

    let addr = format!("0.0.0.0:{}", config.http_port);
    info!(addr = %addr, "Starting HTTP server");

    HttpServer::new(move || App::new().app_data(state.clone()).configure(server::routes))
        .bind(&addr)
        .with_context(|| format!("failed to bind {addr}"))?
        .run()
        .await
        .context("HTTP server failed")
}
