//! ==============================================================================
//! main.rs - grow node entry point
//! ==============================================================================
//!
//! purpose:
//!     samples a soil moisture probe and a DHT22 on recurring timers and
//!     republishes the readings as named variables over a small JSON api,
//!     alongside a motor-control command.
//!
//! responsibilities:
//!     - load node.toml and initialise logging
//!     - pick the hardware provider (rppal on a pi, MockHal elsewhere)
//!     - build the sensor devices and arm one manager per sensor category
//!     - serve the api until ctrl-c, then stop the managers
//!
//! relationships:
//!     - uses: config.rs, hal.rs / gpio.rs, sensors/*, manager.rs, store.rs, motor.rs
//!
//! architecture:
//!
//!     ┌─────────────────────────────────────────────────────────────┐
//!     │                    rust host (this file)                     │
//!     │  ┌───────────────┐  ┌───────────────┐  ┌────────────────┐   │
//!     │  │ moisture mgr  │  │ climate mgr   │  │ web server     │   │
//!     │  │ (5s timer)    │  │ (5min timer)  │  │ (port 3000)    │   │
//!     │  └───────┬───────┘  └───────┬───────┘  └───────┬────────┘   │
//!     │          │ write            │ write            │ read       │
//!     │          └──────────┬───────┘                  │            │
//!     │               ┌─────┴──────────────────────────┴─┐          │
//!     │               │   PublishedVariableStore         │          │
//!     │               └──────────────────────────────────┘          │
//!     └─────────────────────────────────────────────────────────────┘
//!
//! ==============================================================================

mod config;
mod domain;
mod error;
#[cfg(feature = "hardware")]
mod gpio;
mod hal;
mod manager;
mod motor;
mod sensors;
mod store;

use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use domain::{PublishedVariable, Quantity};
use hal::HardwareProvider;
use manager::{DiagnosticsHandle, FailurePolicy, ManagerConfig, ManagerDiagnostics, SensorManager};
use motor::{MotorController, MOTOR_CONTROL_FN};
use sensors::{Dht22Sensor, SensorDevice, SoilMoistureSensor};
use serde::Deserialize;
use std::sync::{Arc, Mutex};
use store::{PublishedVariableStore, VariableView};
use tower_http::cors::CorsLayer;
use tracing_subscriber::EnvFilter;

// ==============================================================================
// shared state
// ==============================================================================
// the managers write into the store on their own timers; the web server only
// ever reads it. the motor is the one thing the api mutates.

#[derive(Clone)]
struct AppState {
    store: Arc<PublishedVariableStore>,
    motor: Arc<Mutex<MotorController>>,
    diagnostics: Vec<DiagnosticsHandle>,
}

// ==============================================================================
// main entry point
// ==============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    // step 1: load configuration, then logging (its level lives in the config)
    let (config, source) = config::NodeConfig::load_or_default()?;
    init_tracing(&config.logging.level);

    tracing::info!("grow-node v{}", env!("CARGO_PKG_VERSION"));
    match &source {
        Some(path) => tracing::info!("[CONFIG] Loaded from {}", path.display()),
        None => tracing::warn!("[CONFIG] No config file found - using defaults"),
    }
    config.print_summary();

    // step 2: hardware and published state
    let hal = build_hal()?;
    let store = PublishedVariableStore::new();
    let policy = FailurePolicy {
        disable_after: config.failures.disable_after,
    };

    // step 3: one manager per sensor category
    let probe = SoilMoistureSensor::new(
        config.pins.soil_signal(),
        config.pins.soil_power(),
        config.moisture.thresholds(),
        config.moisture.adc_max,
        config.moisture.settle(),
        hal.clone(),
    )
    .context("failed to set up soil moisture probe")?;

    let moisture = SensorManager::start(
        ManagerConfig {
            name: "moisture".into(),
            period: config.polling.moisture_period(),
            failure_policy: policy,
            calibration: config.moisture.calibration(),
            show_sensor_data: config.logging.show_sensor_data,
        },
        vec![Box::new(probe) as Box<dyn SensorDevice>],
        vec![(
            Quantity::SoilMoisture,
            store.claim_writer(PublishedVariable::MoisturePercentage)?,
        )],
    )?;

    let climate = SensorManager::start(
        ManagerConfig {
            name: "climate".into(),
            period: config.polling.climate_period(),
            failure_policy: policy,
            calibration: config.moisture.calibration(),
            show_sensor_data: config.logging.show_sensor_data,
        },
        vec![Box::new(Dht22Sensor::new(config.pins.dht(), hal.clone())) as Box<dyn SensorDevice>],
        vec![
            (
                Quantity::Temperature,
                store.claim_writer(PublishedVariable::TemperatureFahrenheit)?,
            ),
            (
                Quantity::Humidity,
                store.claim_writer(PublishedVariable::HumidityPercentage)?,
            ),
        ],
    )?;

    // step 4: actuator
    let motor = MotorController::new(
        config.pins.motor(),
        config.motor.kind,
        config.motor.max_speed,
        Some(config.pins.status_led()),
        hal.clone(),
    )
    .context("failed to set up motor")?;

    let state = AppState {
        store,
        motor: Arc::new(Mutex::new(motor)),
        diagnostics: vec![moisture.diagnostics(), climate.diagnostics()],
    };

    // step 5: serve until ctrl-c
    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind))?;
    tracing::info!("API live at http://{}", config.server.bind);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // timers are cancelled before the devices go, so the probe ends unpowered
    tracing::info!("shutting down");
    for manager in [moisture, climate] {
        tracing::info!("[{}] {} polls this run", manager.name(), manager.executions());
        manager.shutdown().await;
    }
    Ok(())
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[cfg(feature = "hardware")]
fn build_hal() -> Result<Arc<dyn HardwareProvider>> {
    Ok(Arc::new(gpio::RpiHal::new()?))
}

#[cfg(not(feature = "hardware"))]
fn build_hal() -> Result<Arc<dyn HardwareProvider>> {
    Ok(Arc::new(hal::MockHal::new()))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
}

// ==============================================================================
// web server
// ==============================================================================

fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/variables", get(variables_handler))
        .route("/api/variables/:name", get(variable_handler))
        .route(&format!("/api/{}", MOTOR_CONTROL_FN), post(motor_handler))
        .route("/api/diagnostics", get(diagnostics_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// all published variables
async fn variables_handler(State(state): State<AppState>) -> Json<Vec<VariableView>> {
    Json(state.store.snapshot())
}

/// one published variable by its external name
async fn variable_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Response {
    match name.parse::<PublishedVariable>() {
        Ok(variable) => Json(state.store.view(variable)).into_response(),
        Err(()) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "unknown variable", "name": name})),
        )
            .into_response(),
    }
}

#[derive(Deserialize)]
struct MotorParams {
    arg: String,
}

/// motor control endpoint
/// POST /api/motorControl?arg=increase|decrease|reset|stop
async fn motor_handler(
    State(state): State<AppState>,
    Query(params): Query<MotorParams>,
) -> Json<serde_json::Value> {
    let motor = state.motor.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        let mut motor = motor.lock().unwrap_or_else(|e| e.into_inner());
        let outcome = motor.handle(&params.arg);
        tracing::debug!("{}({}) -> {:?}, speed {}", MOTOR_CONTROL_FN, params.arg, outcome, motor.speed());
        outcome
    })
    .await
    .unwrap_or(motor::CommandOutcome::Failure);

    Json(serde_json::json!({"return_value": outcome as i32}))
}

async fn diagnostics_handler(State(state): State<AppState>) -> Json<Vec<ManagerDiagnostics>> {
    Json(state.diagnostics.iter().map(|d| d.snapshot()).collect())
}
