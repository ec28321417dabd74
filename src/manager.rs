//! ==============================================================================
//! manager.rs - periodic sampling and publication
//! ==============================================================================
//!
//! purpose:
//!     a SensorManager owns a set of sensor devices, polls them on a recurring
//!     timer and writes the converted results into the published variable store.
//!     one manager per sensor category (soil moisture, climate).
//!
//! lifecycle:
//!     start() -> Armed (timer task running) -> stop()/shutdown()/drop -> Stopped
//!     there is no pause/resume. shutdown() runs the teardown on the blocking
//!     pool; drop on a runtime worker wraps it in block_in_place.
//!
//! timer model:
//!     the timer is a tokio task holding only a `Weak` reference (TickHandle) to
//!     the manager's shared state, and the manager holds the task's JoinHandle
//!     (TimerToken). the task awaits each handler run before waiting for the next
//!     tick, so the handler is single-flight; the device mutex enforces the same
//!     for direct task_handler() calls.
//!
//!     the blocking reads run in spawn_blocking, so aborting the timer task never
//!     tears a DHT22 handshake in half. teardown cancels the timer, then takes the
//!     device lock (waiting out any in-flight read), marks the manager stopped and
//!     only then drops the devices.
//!
//! relationships:
//!     - uses: sensors/* (SensorDevice), store.rs (VariableWriter), domain.rs
//!     - used by: main.rs (creates the two managers), main.rs api (diagnostics)
//!
//! ==============================================================================

use crate::domain::{
    to_published_unit, MoistureCalibration, MoistureLevel, PublishedVariable, Quantity, SensorReading,
};
use crate::error::{ConfigError, SensorError};
use crate::sensors::SensorDevice;
use crate::store::VariableWriter;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::{Duration, Instant};
use tokio::runtime::RuntimeFlavor;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// what to do with a device that keeps failing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FailurePolicy {
    /// skip a device once its consecutive failures reach this count.
    /// `None` never disables anything.
    pub disable_after: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub name: String,
    pub period: Duration,
    pub failure_policy: FailurePolicy,
    pub calibration: MoistureCalibration,
    /// log every publication at info instead of debug
    pub show_sensor_data: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ManagerState {
    Armed,
    Stopped,
}

/// outcome of one task handler run
#[derive(Debug, Clone, Default)]
pub struct PollReport {
    /// handler runs so far, including this one
    pub execution: u64,
    pub published: Vec<(PublishedVariable, i32)>,
    pub failures: Vec<(String, SensorError)>,
}

/// one value of a device's last successful sample, in its native unit
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReadingSummary {
    pub quantity: Quantity,
    pub value: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<MoistureLevel>,
}

impl From<&SensorReading> for ReadingSummary {
    fn from(reading: &SensorReading) -> Self {
        Self {
            quantity: reading.quantity,
            value: reading.value,
            level: reading.level,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceDiagnostics {
    pub label: String,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub disabled: bool,
    pub last_success_age_ms: Option<u64>,
    /// `None` until the device's first successful sample
    pub last_reading: Option<Vec<ReadingSummary>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManagerDiagnostics {
    pub name: String,
    pub state: ManagerState,
    pub period_ms: u64,
    pub executions: u64,
    pub devices: Vec<DeviceDiagnostics>,
}

struct DeviceSlot {
    device: Box<dyn SensorDevice>,
    consecutive_failures: u32,
    total_failures: u64,
    disabled: bool,
    last_success: Option<Instant>,
    last_reading: Option<Vec<SensorReading>>,
}

/// diagnostics as stored between ticks; ages are derived when a snapshot is taken
struct DiagnosticsRecord {
    name: String,
    state: ManagerState,
    period_ms: u64,
    executions: u64,
    devices: Vec<DeviceRecord>,
}

struct DeviceRecord {
    label: String,
    consecutive_failures: u32,
    total_failures: u64,
    disabled: bool,
    last_success: Option<Instant>,
    last_reading: Option<Vec<ReadingSummary>>,
}

struct Devices {
    armed: bool,
    slots: Vec<DeviceSlot>,
}

struct Shared {
    config: ManagerConfig,
    writers: HashMap<Quantity, VariableWriter>,
    devices: Mutex<Devices>,
    executions: AtomicU64,
    diagnostics: Arc<RwLock<DiagnosticsRecord>>,
}

impl Shared {
    fn lock_devices(&self) -> MutexGuard<'_, Devices> {
        // a device that panicked mid-read leaves its counters intact
        self.devices.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// poll every enabled device once and publish; what the timer runs each period
    fn task_handler(&self) -> Option<PollReport> {
        let mut devices = self.lock_devices();
        if !devices.armed {
            return None;
        }

        let execution = self.executions.fetch_add(1, Ordering::SeqCst) + 1;
        let mut report = PollReport {
            execution,
            ..PollReport::default()
        };
        let mut sums: HashMap<Quantity, (f32, u32)> = HashMap::new();

        for slot in devices.slots.iter_mut().filter(|s| !s.disabled) {
            let sample = slot.device.read();
            match sample.fault {
                None if sample.is_valid() => {
                    slot.consecutive_failures = 0;
                    slot.last_success = Some(Instant::now());
                    for reading in &sample.readings {
                        let value = to_published_unit(
                            reading.quantity,
                            reading.value,
                            &self.config.calibration,
                        );
                        let entry = sums.entry(reading.quantity).or_insert((0.0, 0));
                        entry.0 += value;
                        entry.1 += 1;
                    }
                    slot.last_reading = Some(sample.readings);
                }
                fault => {
                    let fault = fault.unwrap_or(SensorError::Hardware("invalid reading".into()));
                    slot.consecutive_failures += 1;
                    slot.total_failures += 1;
                    tracing::warn!(
                        "[{}] {} read failed ({} in a row): {}",
                        self.config.name,
                        slot.device.label(),
                        slot.consecutive_failures,
                        fault
                    );
                    if let Some(limit) = self.config.failure_policy.disable_after {
                        if slot.consecutive_failures >= limit {
                            slot.disabled = true;
                            tracing::error!(
                                "[{}] disabling {} after {} consecutive failures",
                                self.config.name,
                                slot.device.label(),
                                slot.consecutive_failures
                            );
                        }
                    }
                    report.failures.push((slot.device.label().to_string(), fault));
                }
            }
        }

        // writes stay under the device lock so teardown can fence them off
        for (quantity, (sum, count)) in sums {
            if let Some(writer) = self.writers.get(&quantity) {
                let value = (sum / count as f32).round() as i32;
                writer.set(value);
                report.published.push((writer.name(), value));
            }
        }
        report.published.sort_by_key(|(name, _)| name.index());

        self.refresh_diagnostics(&devices, ManagerState::Armed);
        Some(report)
    }

    fn refresh_diagnostics(&self, devices: &Devices, state: ManagerState) {
        let records: Vec<DeviceRecord> = devices
            .slots
            .iter()
            .map(|s| DeviceRecord {
                label: s.device.label().to_string(),
                consecutive_failures: s.consecutive_failures,
                total_failures: s.total_failures,
                disabled: s.disabled,
                last_success: s.last_success,
                last_reading: s
                    .last_reading
                    .as_ref()
                    .map(|readings| readings.iter().map(ReadingSummary::from).collect()),
            })
            .collect();

        let mut diag = self.diagnostics.write().unwrap_or_else(|e| e.into_inner());
        diag.state = state;
        diag.executions = self.executions.load(Ordering::SeqCst);
        // keep the device list once the devices have been released
        if !records.is_empty() {
            diag.devices = records;
        }
    }

    /// mark stopped and hand back the devices; waits out an in-flight read
    fn disarm(&self) -> Vec<DeviceSlot> {
        let mut devices = self.lock_devices();
        devices.armed = false;
        self.refresh_diagnostics(&devices, ManagerState::Stopped);
        std::mem::take(&mut devices.slots)
    }
}

/// run `f` where blocking is allowed. on a multi-thread runtime worker the
/// worker's other tasks are handed off first; a current-thread runtime has
/// nowhere to hand them, so `f` just runs.
fn blocking_section<T>(f: impl FnOnce() -> T) -> T {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

/// weak scheduling handle given to the timer; never keeps a manager alive
#[derive(Clone)]
pub struct TickHandle(Weak<Shared>);

impl TickHandle {
    /// run the task handler if the manager still exists and is armed
    pub fn fire(&self) -> Option<PollReport> {
        self.0.upgrade()?.task_handler()
    }
}

/// owned registration of the recurring timer
struct TimerToken {
    task: JoinHandle<()>,
}

impl TimerToken {
    fn arm(tick: TickHandle, name: String, period: Duration, show_data: bool) -> Self {
        let first = tokio::time::Instant::now() + period;
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(first, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let handle = tick.clone();
                match tokio::task::spawn_blocking(move || handle.fire()).await {
                    Ok(Some(report)) => log_report(&name, &report, show_data),
                    Ok(None) => {
                        tracing::debug!("[{}] timer found manager stopped", name);
                        break;
                    }
                    Err(e) => tracing::error!("[{}] task handler panicked: {}", name, e),
                }
            }
        });
        Self { task }
    }

    fn cancel(self) {
        self.task.abort();
    }
}

fn log_report(name: &str, report: &PollReport, show_data: bool) {
    for (variable, value) in &report.published {
        if show_data {
            tracing::info!("[{}] #{} {} = {}", name, report.execution, variable, value);
        } else {
            tracing::debug!("[{}] #{} {} = {}", name, report.execution, variable, value);
        }
    }
    if report.published.is_empty() {
        tracing::debug!(
            "[{}] #{} published nothing ({} failed)",
            name,
            report.execution,
            report.failures.len()
        );
    }
}

/// cloneable read-only view of a manager's diagnostics
#[derive(Clone)]
pub struct DiagnosticsHandle(Arc<RwLock<DiagnosticsRecord>>);

impl DiagnosticsHandle {
    pub fn snapshot(&self) -> ManagerDiagnostics {
        let record = self.0.read().unwrap_or_else(|e| e.into_inner());
        ManagerDiagnostics {
            name: record.name.clone(),
            state: record.state,
            period_ms: record.period_ms,
            executions: record.executions,
            devices: record
                .devices
                .iter()
                .map(|d| DeviceDiagnostics {
                    label: d.label.clone(),
                    consecutive_failures: d.consecutive_failures,
                    total_failures: d.total_failures,
                    disabled: d.disabled,
                    last_success_age_ms: d.last_success.map(|t| t.elapsed().as_millis() as u64),
                    last_reading: d.last_reading.clone(),
                })
                .collect(),
        }
    }
}

pub struct SensorManager {
    shared: Arc<Shared>,
    timer: Option<TimerToken>,
}

impl SensorManager {
    /// validate, take ownership of `devices` and arm the timer.
    ///
    /// must be called from within a tokio runtime. the first poll happens one
    /// period after this returns.
    pub fn start(
        config: ManagerConfig,
        devices: Vec<Box<dyn SensorDevice>>,
        writers: Vec<(Quantity, VariableWriter)>,
    ) -> Result<Self, ConfigError> {
        if config.period.is_zero() {
            return Err(ConfigError::InvalidPeriod {
                manager: config.name.clone(),
            });
        }
        if config.calibration.dry == config.calibration.wet {
            return Err(ConfigError::InvalidCalibration {
                dry: config.calibration.dry,
                wet: config.calibration.wet,
            });
        }

        let minimum = devices
            .iter()
            .map(|d| d.min_sample_interval())
            .max()
            .unwrap_or(Duration::ZERO);
        if config.period < minimum {
            return Err(ConfigError::PollingTooFast {
                manager: config.name.clone(),
                period_ms: config.period.as_millis() as u64,
                minimum_ms: minimum.as_millis() as u64,
            });
        }

        let writers: HashMap<Quantity, VariableWriter> = writers.into_iter().collect();
        for device in &devices {
            for quantity in device.quantities() {
                if !writers.contains_key(quantity) {
                    return Err(ConfigError::UnboundQuantity {
                        manager: config.name.clone(),
                        quantity: *quantity,
                    });
                }
            }
        }

        let slots = devices
            .into_iter()
            .map(|device| DeviceSlot {
                device,
                consecutive_failures: 0,
                total_failures: 0,
                disabled: false,
                last_success: None,
                last_reading: None,
            })
            .collect();

        let diagnostics = Arc::new(RwLock::new(DiagnosticsRecord {
            name: config.name.clone(),
            state: ManagerState::Armed,
            period_ms: config.period.as_millis() as u64,
            executions: 0,
            devices: Vec::new(),
        }));

        let shared = Arc::new(Shared {
            config,
            writers,
            devices: Mutex::new(Devices { armed: true, slots }),
            executions: AtomicU64::new(0),
            diagnostics,
        });
        shared.refresh_diagnostics(&shared.lock_devices(), ManagerState::Armed);

        let timer = TimerToken::arm(
            TickHandle(Arc::downgrade(&shared)),
            shared.config.name.clone(),
            shared.config.period,
            shared.config.show_sensor_data,
        );

        tracing::info!(
            "[{}] armed with {} device(s), polling every {:?}",
            shared.config.name,
            shared.lock_devices().slots.len(),
            shared.config.period
        );

        Ok(Self {
            shared,
            timer: Some(timer),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    pub fn executions(&self) -> u64 {
        self.shared.executions.load(Ordering::SeqCst)
    }

    pub fn diagnostics(&self) -> DiagnosticsHandle {
        DiagnosticsHandle(self.shared.diagnostics.clone())
    }

    /// cancel the timer, wait out any in-flight read, then release the devices
    pub fn stop(mut self) {
        self.teardown();
    }

    /// [`stop`](Self::stop) on the blocking pool, for callers on the runtime
    pub async fn shutdown(self) {
        let name = self.shared.config.name.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || self.stop()).await {
            tracing::error!("[{}] teardown panicked: {}", name, e);
        }
    }

    fn teardown(&mut self) {
        let Some(timer) = self.timer.take() else {
            return;
        };
        timer.cancel();

        let shared = &self.shared;
        let count = blocking_section(|| {
            let released = shared.disarm();
            let count = released.len();
            drop(released);
            count
        });

        tracing::info!("[{}] stopped, released {} device(s)", shared.config.name, count);
    }
}

#[cfg(test)]
impl SensorManager {
    /// run the task handler outside the timer; `None` once stopped
    pub fn task_handler(&self) -> Option<PollReport> {
        self.shared.task_handler()
    }

    pub fn tick_handle(&self) -> TickHandle {
        TickHandle(Arc::downgrade(&self.shared))
    }

    pub fn state(&self) -> ManagerState {
        if self.shared.lock_devices().armed {
            ManagerState::Armed
        } else {
            ManagerState::Stopped
        }
    }

    /// consecutive-failure counter per device label
    pub fn failure_counts(&self) -> Vec<(String, u32)> {
        self.shared
            .lock_devices()
            .slots
            .iter()
            .map(|s| (s.device.label().to_string(), s.consecutive_failures))
            .collect()
    }
}

impl Drop for SensorManager {
    fn drop(&mut self) {
        self.teardown();
    }
}

// ==============================================================================
// tests
// ==============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{MoistureThresholds, SensorReading};
    use crate::error::HalError;
    use crate::hal::{AdcChannel, DhtFrame, Level, MockHal, PinId};
    use crate::sensors::{Dht22Sensor, Sample, SoilMoistureSensor};
    use crate::store::{PublishedVariableStore, UNSET};
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    const CAL: MoistureCalibration = MoistureCalibration { dry: 0, wet: 1000 };

    fn config(name: &str, period_ms: u64) -> ManagerConfig {
        ManagerConfig {
            name: name.to_string(),
            period: Duration::from_millis(period_ms),
            failure_policy: FailurePolicy::default(),
            calibration: CAL,
            show_sensor_data: false,
        }
    }

    fn climate(
        store: &Arc<PublishedVariableStore>,
        hal: &Arc<MockHal>,
        cfg: ManagerConfig,
    ) -> SensorManager {
        SensorManager::start(
            cfg,
            vec![Box::new(Dht22Sensor::new(PinId(4), hal.clone()))],
            vec![
                (
                    Quantity::Temperature,
                    store.claim_writer(PublishedVariable::TemperatureFahrenheit).unwrap(),
                ),
                (
                    Quantity::Humidity,
                    store.claim_writer(PublishedVariable::HumidityPercentage).unwrap(),
                ),
            ],
        )
        .unwrap()
    }

    /// scripted device that counts its reads
    struct Scripted {
        label: String,
        values: Vec<Option<f32>>,
        reads: Arc<AtomicUsize>,
    }

    impl SensorDevice for Scripted {
        fn label(&self) -> &str {
            &self.label
        }

        fn quantities(&self) -> &'static [Quantity] {
            &[Quantity::SoilMoisture]
        }

        fn read(&mut self) -> Sample {
            let n = self.reads.fetch_add(1, Ordering::SeqCst);
            match self.values.get(n).copied().flatten() {
                Some(v) => Sample::ok(vec![SensorReading::valid(Quantity::SoilMoisture, v)]),
                None => Sample::failed(self.quantities(), SensorError::Timeout),
            }
        }
    }

    fn scripted(label: &str, values: Vec<Option<f32>>) -> (Box<dyn SensorDevice>, Arc<AtomicUsize>) {
        let reads = Arc::new(AtomicUsize::new(0));
        let device = Scripted {
            label: label.to_string(),
            values,
            reads: reads.clone(),
        };
        (Box::new(device), reads)
    }

    #[tokio::test]
    async fn test_successful_read_is_published() {
        let store = PublishedVariableStore::new();
        let hal = Arc::new(MockHal::new());
        hal.push_dht(Ok(DhtFrame {
            humidity_tenths: 456,
            temperature_tenths: 225,
        }));
        let manager = climate(&store, &hal, config("climate", 300_000));

        let report = manager.task_handler().unwrap();
        assert_eq!(report.execution, 1);
        assert!(report.failures.is_empty());
        // 22.5 C -> 72.5 F -> 73 (rounds half away from zero)
        assert_eq!(store.get(PublishedVariable::TemperatureFahrenheit), 73);
        assert_eq!(store.get(PublishedVariable::HumidityPercentage), 46);
        assert_eq!(
            report.published,
            vec![
                (PublishedVariable::TemperatureFahrenheit, 73),
                (PublishedVariable::HumidityPercentage, 46),
            ]
        );
    }

    #[tokio::test]
    async fn test_two_failed_dht_reads_leave_values_and_count() {
        let store = PublishedVariableStore::new();
        let hal = Arc::new(MockHal::new());
        hal.push_dht(Ok(DhtFrame {
            humidity_tenths: 500,
            temperature_tenths: 200,
        }));
        hal.push_dht(Err(HalError::Timeout));
        hal.push_dht(Err(HalError::Checksum));
        let manager = climate(&store, &hal, config("climate", 300_000));

        manager.task_handler().unwrap();
        assert_eq!(store.get(PublishedVariable::TemperatureFahrenheit), 68);
        assert_eq!(store.get(PublishedVariable::HumidityPercentage), 50);

        for expected in 1..=2u32 {
            let report = manager.task_handler().unwrap();
            assert_eq!(report.failures.len(), 1);
            assert!(report.published.is_empty());
            assert_eq!(store.get(PublishedVariable::TemperatureFahrenheit), 68);
            assert_eq!(store.get(PublishedVariable::HumidityPercentage), 50);
            assert_eq!(manager.failure_counts(), vec![("dht22-GPIO4".to_string(), expected)]);
        }

        // recovery resets the counter
        manager.task_handler().unwrap();
        assert_eq!(manager.failure_counts()[0].1, 0);
        let diag = manager.diagnostics().snapshot();
        assert_eq!(diag.devices[0].total_failures, 2);
        assert_eq!(diag.executions, 4);
    }

    #[tokio::test]
    async fn test_failure_before_first_success_keeps_sentinel() {
        let store = PublishedVariableStore::new();
        let hal = Arc::new(MockHal::new());
        hal.set_dht(None);
        let manager = climate(&store, &hal, config("climate", 300_000));

        manager.task_handler().unwrap();
        assert_eq!(store.get(PublishedVariable::TemperatureFahrenheit), UNSET);
        assert_eq!(store.get(PublishedVariable::HumidityPercentage), UNSET);
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_periods_three_executions() {
        let store = PublishedVariableStore::new();
        let (device, reads) = scripted("probe", vec![Some(100.0), Some(200.0), Some(300.0), Some(900.0)]);
        let manager = SensorManager::start(
            config("moisture", 5000),
            vec![device],
            vec![(
                Quantity::SoilMoisture,
                store.claim_writer(PublishedVariable::MoisturePercentage).unwrap(),
            )],
        )
        .unwrap();

        // armed, but nothing fires before the first period
        tokio::time::sleep(Duration::from_millis(4999)).await;
        assert_eq!(manager.executions(), 0);

        tokio::time::sleep(Duration::from_millis(10_001 + 2_500)).await;
        assert_eq!(manager.executions(), 3);
        assert_eq!(reads.load(Ordering::SeqCst), 3);
        // third reading: 300 counts of 0..1000 -> 30 %
        assert_eq!(store.get(PublishedVariable::MoisturePercentage), 30);
    }

    #[tokio::test]
    async fn test_polling_faster_than_dht_minimum_is_rejected() {
        let store = PublishedVariableStore::new();
        let hal = Arc::new(MockHal::new());
        let err = SensorManager::start(
            config("climate", 1000),
            vec![Box::new(Dht22Sensor::new(PinId(4), hal.clone()))],
            vec![
                (
                    Quantity::Temperature,
                    store.claim_writer(PublishedVariable::TemperatureFahrenheit).unwrap(),
                ),
                (
                    Quantity::Humidity,
                    store.claim_writer(PublishedVariable::HumidityPercentage).unwrap(),
                ),
            ],
        )
        .err()
        .unwrap();
        assert_eq!(
            err,
            ConfigError::PollingTooFast {
                manager: "climate".into(),
                period_ms: 1000,
                minimum_ms: 2000
            }
        );
    }

    #[tokio::test]
    async fn test_unbound_quantity_is_rejected() {
        let hal = Arc::new(MockHal::new());
        let err = SensorManager::start(
            config("climate", 5000),
            vec![Box::new(Dht22Sensor::new(PinId(4), hal.clone()))],
            vec![],
        )
        .err()
        .unwrap();
        assert!(matches!(err, ConfigError::UnboundQuantity { .. }));

        let err = SensorManager::start(config("x", 0), vec![], vec![]).err().unwrap();
        assert!(matches!(err, ConfigError::InvalidPeriod { .. }));
    }

    #[tokio::test]
    async fn test_teardown_then_fire_does_nothing() {
        let store = PublishedVariableStore::new();
        let hal = Arc::new(MockHal::new());
        let probe = SoilMoistureSensor::new(
            AdcChannel(0),
            PinId(22),
            MoistureThresholds::DEFAULT,
            1023,
            Duration::ZERO,
            hal.clone(),
        )
        .unwrap();
        hal.set_analog(AdcChannel(0), 500);
        let manager = SensorManager::start(
            config("moisture", 5000),
            vec![Box::new(probe)],
            vec![(
                Quantity::SoilMoisture,
                store.claim_writer(PublishedVariable::MoisturePercentage).unwrap(),
            )],
        )
        .unwrap();

        manager.task_handler().unwrap();
        assert_eq!(store.get(PublishedVariable::MoisturePercentage), 50);
        assert_eq!(manager.state(), ManagerState::Armed);

        let tick = manager.tick_handle();
        let diagnostics = manager.diagnostics();
        let events_before = hal.events().len();
        manager.stop();

        // teardown drove the probe's power pin low as the devices were released
        assert_eq!(hal.level(PinId(22)), Some(Level::Low));
        let events_after_stop = hal.events().len();
        assert!(events_after_stop > events_before);

        hal.set_analog(AdcChannel(0), 900);
        assert!(tick.fire().is_none());
        assert_eq!(store.get(PublishedVariable::MoisturePercentage), 50);
        assert_eq!(hal.events().len(), events_after_stop);

        let diag = diagnostics.snapshot();
        assert_eq!(diag.state, ManagerState::Stopped);
        assert_eq!(diag.executions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels_timer() {
        let store = PublishedVariableStore::new();
        let (device, reads) = scripted("probe", vec![Some(100.0); 10]);
        let manager = SensorManager::start(
            config("moisture", 5000),
            vec![device],
            vec![(
                Quantity::SoilMoisture,
                store.claim_writer(PublishedVariable::MoisturePercentage).unwrap(),
            )],
        )
        .unwrap();
        tokio::time::sleep(Duration::from_millis(5500)).await;
        assert_eq!(reads.load(Ordering::SeqCst), 1);

        drop(manager);
        tokio::time::sleep(Duration::from_millis(20_000)).await;
        assert_eq!(reads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_valid_readings_are_averaged() {
        let store = PublishedVariableStore::new();
        let (a, _) = scripted("a", vec![Some(200.0), None]);
        let (b, _) = scripted("b", vec![Some(500.0), Some(800.0)]);
        let manager = SensorManager::start(
            config("moisture", 5000),
            vec![a, b],
            vec![(
                Quantity::SoilMoisture,
                store.claim_writer(PublishedVariable::MoisturePercentage).unwrap(),
            )],
        )
        .unwrap();

        manager.task_handler().unwrap();
        assert_eq!(store.get(PublishedVariable::MoisturePercentage), 35);

        // only b is valid on the second tick
        let report = manager.task_handler().unwrap();
        assert_eq!(report.failures.len(), 1);
        assert_eq!(store.get(PublishedVariable::MoisturePercentage), 80);
    }

    #[tokio::test]
    async fn test_failure_policy_disables_device() {
        let store = PublishedVariableStore::new();
        let (device, reads) = scripted("flaky", vec![]);
        let mut cfg = config("moisture", 5000);
        cfg.failure_policy = FailurePolicy {
            disable_after: Some(2),
        };
        let manager = SensorManager::start(
            cfg,
            vec![device],
            vec![(
                Quantity::SoilMoisture,
                store.claim_writer(PublishedVariable::MoisturePercentage).unwrap(),
            )],
        )
        .unwrap();

        for _ in 0..5 {
            manager.task_handler().unwrap();
        }
        assert_eq!(reads.load(Ordering::SeqCst), 2);
        assert!(manager.diagnostics().snapshot().devices[0].disabled);
    }

    #[tokio::test]
    async fn test_default_policy_never_disables() {
        let store = PublishedVariableStore::new();
        let (device, reads) = scripted("flaky", vec![]);
        let manager = SensorManager::start(
            config("moisture", 5000),
            vec![device],
            vec![(
                Quantity::SoilMoisture,
                store.claim_writer(PublishedVariable::MoisturePercentage).unwrap(),
            )],
        )
        .unwrap();

        for _ in 0..50 {
            manager.task_handler().unwrap();
        }
        assert_eq!(reads.load(Ordering::SeqCst), 50);
        assert_eq!(manager.failure_counts()[0].1, 50);
    }

    #[tokio::test]
    async fn test_last_reading_survives_failed_tick() {
        let store = PublishedVariableStore::new();
        let hal = Arc::new(MockHal::new());
        hal.push_analog(AdcChannel(0), Ok(120));
        hal.push_analog(AdcChannel(0), Err(HalError::Timeout));
        let probe = SoilMoistureSensor::new(
            AdcChannel(0),
            PinId(22),
            MoistureThresholds::DEFAULT,
            1023,
            Duration::ZERO,
            hal.clone(),
        )
        .unwrap();
        let manager = SensorManager::start(
            config("moisture", 5000),
            vec![Box::new(probe)],
            vec![(
                Quantity::SoilMoisture,
                store.claim_writer(PublishedVariable::MoisturePercentage).unwrap(),
            )],
        )
        .unwrap();
        assert_eq!(manager.diagnostics().snapshot().devices[0].last_reading, None);

        manager.task_handler().unwrap();
        let expected = Some(vec![ReadingSummary {
            quantity: Quantity::SoilMoisture,
            value: 120.0,
            level: Some(MoistureLevel::Dry),
        }]);
        assert_eq!(manager.diagnostics().snapshot().devices[0].last_reading, expected);

        let report = manager.task_handler().unwrap();
        assert_eq!(report.failures.len(), 1);
        let device = &manager.diagnostics().snapshot().devices[0];
        assert_eq!(device.consecutive_failures, 1);
        assert_eq!(device.last_reading, expected);
    }

    #[tokio::test]
    async fn test_last_success_age_keeps_growing_between_ticks() {
        let store = PublishedVariableStore::new();
        let hal = Arc::new(MockHal::new());
        let manager = climate(&store, &hal, config("climate", 300_000));
        let diagnostics = manager.diagnostics();
        assert_eq!(diagnostics.snapshot().devices[0].last_success_age_ms, None);

        manager.task_handler().unwrap();
        std::thread::sleep(Duration::from_millis(60));

        let age = diagnostics.snapshot().devices[0].last_success_age_ms.unwrap();
        assert!(age >= 60, "age {} ms", age);
    }

    #[tokio::test]
    async fn test_degenerate_calibration_is_rejected() {
        let store = PublishedVariableStore::new();
        let (device, _) = scripted("probe", vec![Some(500.0)]);
        let mut cfg = config("moisture", 5000);
        cfg.calibration = MoistureCalibration { dry: 600, wet: 600 };
        let err = SensorManager::start(
            cfg,
            vec![device],
            vec![(
                Quantity::SoilMoisture,
                store.claim_writer(PublishedVariable::MoisturePercentage).unwrap(),
            )],
        )
        .err()
        .unwrap();
        assert_eq!(err, ConfigError::InvalidCalibration { dry: 600, wet: 600 });
    }

    /// device whose read takes a while and records how many reads overlap
    struct Slow {
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        reads: Arc<AtomicUsize>,
    }

    impl SensorDevice for Slow {
        fn label(&self) -> &str {
            "slow"
        }

        fn quantities(&self) -> &'static [Quantity] {
            &[Quantity::SoilMoisture]
        }

        fn read(&mut self) -> Sample {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(20));
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.active.fetch_sub(1, Ordering::SeqCst);
            Sample::ok(vec![SensorReading::valid(Quantity::SoilMoisture, 500.0)])
        }
    }

    #[tokio::test]
    async fn test_concurrent_handler_calls_are_serialized() {
        let store = PublishedVariableStore::new();
        let peak = Arc::new(AtomicUsize::new(0));
        let reads = Arc::new(AtomicUsize::new(0));
        let device = Slow {
            active: Arc::new(AtomicUsize::new(0)),
            peak: peak.clone(),
            reads: reads.clone(),
        };
        let manager = SensorManager::start(
            config("moisture", 60_000),
            vec![Box::new(device)],
            vec![(
                Quantity::SoilMoisture,
                store.claim_writer(PublishedVariable::MoisturePercentage).unwrap(),
            )],
        )
        .unwrap();

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| manager.task_handler().unwrap());
            }
        });

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(reads.load(Ordering::SeqCst), 4);
        assert_eq!(manager.executions(), 4);
    }

    /// device whose first read blocks until the test releases it
    struct Gated {
        gate: mpsc::Receiver<()>,
        reads: Arc<AtomicUsize>,
    }

    impl SensorDevice for Gated {
        fn label(&self) -> &str {
            "gated"
        }

        fn quantities(&self) -> &'static [Quantity] {
            &[Quantity::SoilMoisture]
        }

        fn read(&mut self) -> Sample {
            if self.reads.load(Ordering::SeqCst) == 0 {
                let _ = self.gate.recv();
            }
            self.reads.fetch_add(1, Ordering::SeqCst);
            Sample::ok(vec![SensorReading::valid(Quantity::SoilMoisture, 500.0)])
        }
    }

    fn gated() -> (Box<dyn SensorDevice>, mpsc::Sender<()>, Arc<AtomicUsize>) {
        let (release, gate) = mpsc::channel();
        let reads = Arc::new(AtomicUsize::new(0));
        let device = Gated {
            gate,
            reads: reads.clone(),
        };
        (Box::new(device), release, reads)
    }

    /// let the timer task and the blocking pool make progress without moving the clock
    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_overrunning_read_does_not_burst() {
        let store = PublishedVariableStore::new();
        let (device, release, reads) = gated();
        let manager = SensorManager::start(
            config("moisture", 1000),
            vec![device],
            vec![(
                Quantity::SoilMoisture,
                store.claim_writer(PublishedVariable::MoisturePercentage).unwrap(),
            )],
        )
        .unwrap();

        // first tick starts a read that stays in flight for three more periods
        tokio::time::advance(Duration::from_millis(1000)).await;
        settle().await;
        tokio::time::advance(Duration::from_millis(3500)).await;
        settle().await;
        assert_eq!(reads.load(Ordering::SeqCst), 0);

        release.send(()).unwrap();
        settle().await;
        // one catch-up tick, not one per missed period
        assert_eq!(reads.load(Ordering::SeqCst), 2);
        assert_eq!(manager.executions(), 2);

        // then a full period before the next one
        tokio::time::advance(Duration::from_millis(999)).await;
        settle().await;
        assert_eq!(reads.load(Ordering::SeqCst), 2);
        tokio::time::advance(Duration::from_millis(1)).await;
        settle().await;
        assert_eq!(reads.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_waits_for_in_flight_read() {
        let store = PublishedVariableStore::new();
        let (device, release, reads) = gated();
        let manager = SensorManager::start(
            config("moisture", 60_000),
            vec![device],
            vec![(
                Quantity::SoilMoisture,
                store.claim_writer(PublishedVariable::MoisturePercentage).unwrap(),
            )],
        )
        .unwrap();
        let diagnostics = manager.diagnostics();

        let tick = manager.tick_handle();
        let in_flight = std::thread::spawn(move || tick.fire());
        std::thread::sleep(Duration::from_millis(50));

        let stopping = tokio::spawn(manager.shutdown());
        // the runtime keeps serving other tasks while teardown waits
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!stopping.is_finished());
        assert_eq!(diagnostics.snapshot().state, ManagerState::Armed);

        release.send(()).unwrap();
        stopping.await.unwrap();
        let report = in_flight.join().unwrap().unwrap();
        assert_eq!(report.published, vec![(PublishedVariable::MoisturePercentage, 50)]);
        assert_eq!(reads.load(Ordering::SeqCst), 1);
        assert_eq!(diagnostics.snapshot().state, ManagerState::Stopped);
        assert_eq!(store.get(PublishedVariable::MoisturePercentage), 50);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_drop_on_worker_thread() {
        let store = PublishedVariableStore::new();
        let (device, reads) = scripted("probe", vec![Some(100.0)]);
        let manager = SensorManager::start(
            config("moisture", 60_000),
            vec![device],
            vec![(
                Quantity::SoilMoisture,
                store.claim_writer(PublishedVariable::MoisturePercentage).unwrap(),
            )],
        )
        .unwrap();
        let diagnostics = manager.diagnostics();

        tokio::spawn(async move {
            manager.task_handler().unwrap();
            drop(manager);
        })
        .await
        .unwrap();

        assert_eq!(reads.load(Ordering::SeqCst), 1);
        assert_eq!(diagnostics.snapshot().state, ManagerState::Stopped);
    }
}
