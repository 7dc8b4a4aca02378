//! SFU Signaling Server
//!
//! WebSocket signaling front end for a single-room selective forwarding unit.
//!
//! # Servers
//!
//! - WebSocket server for client signaling (default: 0.0.0.0:3000, `GET /ws`)
//! - HTTP server for health endpoints and metrics (default: 0.0.0.0:8081)
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize tracing and the Prometheus metrics recorder
//! 3. Start the media engine and create the room routing context
//! 4. Initialize the actor system (`SessionControllerActorHandle`)
//! 5. Start the health server, then the signaling server
//! 6. Wait for a shutdown signal or a fatal engine failure
//!
//! A fatal engine failure marks the service failed, closes every peer and
//! exits with status 1 after `SFU_FATAL_EXIT_DELAY_MS`.

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)] // main.rs orchestrates startup, naturally longer

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use common::config::{LogFormat, ObservabilityConfig};
use sfu_signaling::actors::{ActorMetrics, SessionControllerActorHandle};
use sfu_signaling::config::{Config, DEFAULT_LOG_FILTER};
use sfu_signaling::engine::{LoopbackEngine, MediaEngine};
use sfu_signaling::gateway::SignalingGateway;
use sfu_signaling::observability::metrics::init_metrics_recorder;
use sfu_signaling::observability::{health_router, metrics_router, HealthState};
use sfu_signaling::signaling::{signaling_router, SignalingState};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Deadline for closing peers on a graceful shutdown.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

/// Time servers get to finish in-flight work after the shutdown token fires.
const SERVER_DRAIN_DELAY: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Configuration decides the log format, so load it before tracing and
    // report a failure once tracing is up.
    let config = Config::from_env();
    let observability = match &config {
        Ok(config) => config.observability.clone(),
        Err(_) => ObservabilityConfig {
            log_filter: DEFAULT_LOG_FILTER.to_string(),
            log_format: LogFormat::default(),
        },
    };
    init_tracing(&observability);

    info!("Starting SFU signaling server");

    let config = config.map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        instance_id = %config.instance_id,
        signaling_bind_address = %config.signaling_bind_address,
        health_bind_address = %config.health_bind_address,
        listen_ip = %config.listen_ip,
        announced_ip = ?config.announced_ip,
        rtc_min_port = config.rtc_min_port,
        rtc_max_port = config.rtc_max_port,
        max_peers = config.max_peers,
        log_format = %config.observability.log_format,
        "Configuration loaded successfully"
    );

    // Must happen before any metric is recorded
    info!("Initializing Prometheus metrics recorder...");
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;
    info!("Prometheus metrics recorder initialized");

    let health_state = Arc::new(HealthState::new());

    // Media engine and room
    let engine: Arc<dyn MediaEngine> = Arc::new(LoopbackEngine::new(config.loopback_settings()));
    let gateway = SignalingGateway::new(engine, config.gateway_settings());
    let event_pump_token = CancellationToken::new();
    let event_pump = gateway.spawn_event_pump(event_pump_token.clone());

    if let Err(e) = gateway.ensure_room().await {
        error!(error = %e, "Failed to initialize room routing context");
        tokio::time::sleep(config.fatal_exit_delay).await;
        std::process::exit(1);
    }

    // Actor system
    info!("Initializing actor system...");
    let controller_handle = SessionControllerActorHandle::new(
        config.instance_id.clone(),
        Arc::clone(&gateway),
        config.max_peers,
        ActorMetrics::new(),
    );
    info!("Actor system initialized");

    let shutdown_token = controller_handle.child_token();

    // Health server (MUST succeed - fail startup if it doesn't)
    let health_addr: SocketAddr = config.health_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.health_bind_address, "Invalid health bind address");
        format!("Invalid health bind address: {e}")
    })?;

    let health_app = health_router(Arc::clone(&health_state))
        .merge(metrics_router(prometheus_handle))
        .layer(TraceLayer::new_for_http());

    // Bind listener BEFORE spawning to fail fast on bind errors
    let health_listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %health_addr, "Failed to bind health server");
            format!("Failed to bind health server to {health_addr}: {e}")
        })?;
    info!(addr = %health_addr, "Health server bound successfully");

    let health_shutdown_token = shutdown_token.child_token();
    tokio::spawn(async move {
        info!(addr = %health_addr, "Health server starting");
        let server = axum::serve(health_listener, health_app).with_graceful_shutdown(async move {
            health_shutdown_token.cancelled().await;
            info!("Health server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Health server failed");
        }
    });

    // Signaling server
    let signaling_addr: SocketAddr = config.signaling_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.signaling_bind_address, "Invalid signaling bind address");
        format!("Invalid signaling bind address: {e}")
    })?;

    let signaling_app = signaling_router(SignalingState {
        controller: controller_handle.clone(),
    })
    .layer(TraceLayer::new_for_http());

    let signaling_listener = tokio::net::TcpListener::bind(signaling_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %signaling_addr, "Failed to bind signaling server");
            format!("Failed to bind signaling server to {signaling_addr}: {e}")
        })?;
    info!(addr = %signaling_addr, "Signaling server bound successfully");

    let signaling_shutdown_token = shutdown_token.child_token();
    tokio::spawn(async move {
        info!(addr = %signaling_addr, "Signaling server starting");
        let server = axum::serve(signaling_listener, signaling_app).with_graceful_shutdown(
            async move {
                signaling_shutdown_token.cancelled().await;
                info!("Signaling server shutting down");
            },
        );
        if let Err(e) = server.await {
            error!(error = %e, "Signaling server failed");
        }
    });

    health_state.set_ready();
    info!("SFU signaling server running - press Ctrl+C to shutdown");

    let fatal_token = gateway.fatal_token();
    tokio::select! {
        () = shutdown_signal() => {}
        () = fatal_token.cancelled() => {
            let reason = gateway.fatal_reason().unwrap_or("unknown");
            error!(
                reason = %reason,
                exit_delay_ms = config.fatal_exit_delay.as_millis(),
                "Media engine failed, exiting"
            );
            health_state.mark_failed();
            controller_handle.cancel();
            event_pump_token.cancel();

            // Let log lines and close frames flush
            tokio::time::sleep(config.fatal_exit_delay).await;
            std::process::exit(1);
        }
    }

    info!("Shutdown signal received, initiating graceful shutdown...");

    // Mark as not ready immediately so k8s stops sending traffic
    health_state.set_not_ready();

    if let Err(e) = controller_handle.shutdown(SHUTDOWN_DEADLINE).await {
        warn!(error = %e, "Actor system shutdown error");
    }

    shutdown_token.cancel();
    event_pump_token.cancel();

    tokio::time::sleep(SERVER_DRAIN_DELAY).await;
    event_pump.abort();

    info!("SFU signaling server shutdown complete");
    Ok(())
}

/// Install the global subscriber.
///
/// `RUST_LOG` overrides the configured filter.
fn init_tracing(observability: &ObservabilityConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| observability.log_filter.clone().into());
    let json = observability.log_format == LogFormat::Json;

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(tracing_subscriber::fmt::layer))
        .init();
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed. This is acceptable because
/// without signal handlers, we cannot gracefully shut down the service.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
