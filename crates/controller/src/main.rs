//! Tier controller - adaptive resource-share control for multi-tier applications
//!
//! Runs one control loop per configured application against its simulated
//! plant, and serves health and metrics over HTTP.

use anyhow::{Context, Result};
use controller_lib::{
    health::{components, HealthRegistry},
    observability::ControlMetrics,
    sim::SimulatedApplication,
    ControlLoopRunnerBuilder, ControlManager, InMemoryActuator, PerformanceMetric,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const CONTROLLER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Tasks serving one application
struct AppTasks {
    name: String,
    runner: JoinHandle<ControlManager>,
    plant: JoinHandle<()>,
    reports: JoinHandle<()>,
}

fn spawn_app(
    app: &config::AppConfig,
    health: &HealthRegistry,
    shutdown: &broadcast::Sender<()>,
) -> Result<AppTasks> {
    let actuator = Arc::new(InMemoryActuator::new());
    let (mut plant, sensors) = SimulatedApplication::new(app.simulation.clone(), actuator.clone());

    let controller = app
        .controller
        .build()
        .with_context(|| format!("Failed to build controller for {}", app.name))?;
    let builder = ControlManager::builder(app.name.clone())
        .config(app.manager.clone())
        .target(PerformanceMetric::ResponseTime, app.response_time_target)
        .actuator(actuator)
        .controller(controller);
    let manager = sensors
        .attach(builder)
        .build()
        .with_context(|| format!("Failed to build control manager for {}", app.name))?;

    let sampling = Duration::from_secs(app.manager.sampling_secs);
    let (runner, mut reports_rx) = ControlLoopRunnerBuilder::new()
        .manager(manager)
        .jitter(Duration::from_millis(app.jitter_ms))
        .health(health.clone())
        .build()?;

    let runner = tokio::spawn(runner.run(shutdown.subscribe()));

    let mut plant_shutdown = shutdown.subscribe();
    let plant = tokio::spawn(async move {
        let mut ticker = interval(sampling);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => plant.step(),
                _ = plant_shutdown.recv() => break,
            }
        }
    });

    // ends once the runner drops its sender
    let reports = tokio::spawn(async move {
        while let Some(report) = reports_rx.recv().await {
            match serde_json::to_string(&report) {
                Ok(json) => debug!(app = %report.app, report = %json, "Interval report"),
                Err(e) => warn!(app = %report.app, error = %e, "Failed to serialize report"),
            }
        }
    });

    Ok(AppTasks {
        name: app.name.clone(),
        runner,
        plant,
        reports,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!(version = CONTROLLER_VERSION, "Starting tier-controller");

    let config = config::ControllerConfig::load()?;
    info!(apps = config.apps.len(), api_port = config.api_port, "Controller configured");

    let health_registry = HealthRegistry::new();
    health_registry.register(components::CONTROL_LOOP).await;
    health_registry.register(components::IDENTIFICATION).await;
    health_registry.register(components::ACTUATOR).await;

    let metrics = ControlMetrics::new();

    let (shutdown_tx, _) = broadcast::channel(1);
    let mut apps = Vec::with_capacity(config.apps.len());
    for app in &config.apps {
        apps.push(spawn_app(app, &health_registry, &shutdown_tx)?);
        info!(app = %app.name, controller = ?app.controller, "Control loop spawned");
    }

    let app_state = Arc::new(api::AppState::new(health_registry.clone(), metrics));
    health_registry.set_ready(true).await;

    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    health_registry.set_ready(false).await;
    let _ = shutdown_tx.send(());

    for app in apps {
        match app.runner.await {
            Ok(manager) => {
                let state = manager.state();
                info!(
                    app = %app.name,
                    controls = state.control_count,
                    applied = state.applied_count,
                    skipped = state.skip_count,
                    failed = state.fail_count,
                    sysid_failures = state.sysid_fail_count,
                    "Control loop stopped"
                );
            }
            Err(e) => warn!(app = %app.name, error = %e, "Control loop task failed"),
        }
        let _ = app.plant.await;
        let _ = app.reports.await;
    }

    api_handle.abort();
    Ok(())
}
