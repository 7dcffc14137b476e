//! API facade: owns the device registry, the joint registry, the active
//! transport and the monitor thread that advances every device's timeout
//! and parameter-refresh cycle.

use crate::callback::{CallbackHandle, CallbackRegistry};
use crate::config::{Config, DeviceRecord, JointRecord, MotorCalibration, ProcessConfig};
use crate::device::ServoEngine;
use crate::error::{DogBotError, Result};
use crate::homing::{HomingCoordinator, HomingOutcome};
use crate::joint::{DirectJoint, Joint, RelativeJoint};
use crate::packet::{ControlState, FaultCode, HomedState, Packet};
use crate::router::Router;
use crate::transport::Transport;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// The kind of device-registry lifecycle event a status callback observes,
/// mirroring the original API's `ServoUpdateTypeT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatusKind {
    Added,
    Removed,
    Updated,
}

/// One device-registry lifecycle notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceStatusEvent {
    pub device_id: u8,
    pub kind: DeviceStatusKind,
}

/// The derived fields that, when they change between monitor ticks, are
/// reported to status subscribers as `DeviceStatusKind::Updated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DerivedSnapshot {
    control_state: ControlState,
    homed_state: HomedState,
    fault_code: FaultCode,
}

impl DerivedSnapshot {
    fn of(engine: &ServoEngine) -> Self {
        DerivedSnapshot {
            control_state: engine.control_state(),
            homed_state: engine.homed_state(),
            fault_code: engine.fault_code(),
        }
    }
}

/// Top-level handle to the whole device/joint registry and transport.
pub struct DogBotApi {
    router: Arc<Router>,
    joints: Mutex<HashMap<String, Arc<dyn Joint>>>,
    joint_records: Mutex<HashMap<String, JointRecord>>,
    status_callbacks: CallbackRegistry<DeviceStatusEvent>,
    derived_snapshots: Mutex<HashMap<u8, DerivedSnapshot>>,
    process_config: ProcessConfig,
    monitor_terminate: Arc<AtomicBool>,
    monitor_thread: Mutex<Option<JoinHandle<()>>>,
    default_transport: Mutex<Option<Arc<dyn Transport>>>,
    pump_threads: Mutex<Vec<JoinHandle<()>>>,
}

impl DogBotApi {
    pub fn new(process_config: ProcessConfig) -> Arc<Self> {
        let api = Arc::new(DogBotApi {
            router: Arc::new(Router::new()),
            joints: Mutex::new(HashMap::new()),
            joint_records: Mutex::new(HashMap::new()),
            status_callbacks: CallbackRegistry::new(),
            derived_snapshots: Mutex::new(HashMap::new()),
            process_config,
            monitor_terminate: Arc::new(AtomicBool::new(false)),
            monitor_thread: Mutex::new(None),
            default_transport: Mutex::new(None),
            pump_threads: Mutex::new(Vec::new()),
        });
        api.clone().start_monitor();
        api
    }

    fn start_monitor(self: Arc<Self>) {
        let terminate = self.monitor_terminate.clone();
        let period = Duration::from_secs_f32(1.0 / self.process_config.monitor_tick_hz.max(1.0));
        let api = self.clone();
        let handle = std::thread::spawn(move || {
            while !terminate.load(Ordering::SeqCst) {
                let now = Instant::now();
                for engine in api.router.engines() {
                    engine.update_tick(now);
                    api.report_if_updated(&engine);
                }
                std::thread::sleep(period);
            }
        });
        *self.monitor_thread.lock().unwrap() = Some(handle);
    }

    fn report_if_updated(&self, engine: &Arc<ServoEngine>) {
        let current = DerivedSnapshot::of(engine);
        let mut snapshots = self.derived_snapshots.lock().unwrap();
        let changed = snapshots.get(&engine.device_id()) != Some(&current);
        snapshots.insert(engine.device_id(), current);
        drop(snapshots);
        if changed {
            self.status_callbacks.fire(&DeviceStatusEvent { device_id: engine.device_id(), kind: DeviceStatusKind::Updated });
        }
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Attach a transport that will carry traffic for every device id not
    /// explicitly bound elsewhere, and becomes the default for devices
    /// added afterward. `inbound` is the receiving end of the transport's
    /// decoded-frame channel (as returned alongside the transport itself by
    /// `UsbTransport::open`/`LoopbackTransport::new`); a dedicated thread
    /// drains it, decodes each buffer, and routes it to its owning device.
    pub fn attach_transport(&self, transport: Arc<dyn Transport>, inbound: Receiver<Vec<u8>>) {
        self.router.add_transport(transport.clone());
        *self.default_transport.lock().unwrap() = Some(transport);
        self.spawn_inbound_pump(inbound);
    }

    fn spawn_inbound_pump(&self, inbound: Receiver<Vec<u8>>) {
        let router = self.router.clone();
        let terminate = self.monitor_terminate.clone();
        let handle = std::thread::spawn(move || {
            while !terminate.load(Ordering::SeqCst) {
                match inbound.recv_timeout(Duration::from_millis(200)) {
                    Ok(bytes) => match Packet::decode(&bytes) {
                        Ok(packet) => router.handle_inbound(packet),
                        Err(e) => log::debug!("dropped malformed inbound frame: {e}"),
                    },
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        });
        self.pump_threads.lock().unwrap().push(handle);
    }

    pub fn add_device(&self, device_id: u8, gear_ratio: f32, motor_kv: f32) -> Arc<ServoEngine> {
        let engine = Arc::new(ServoEngine::new(device_id, gear_ratio, motor_kv));
        engine.set_process_tuning(self.process_config.bootloader_query_count, self.process_config.default_coms_timeout_ms);
        if let Some(transport) = self.default_transport.lock().unwrap().as_ref() {
            engine.bind_transport(Arc::downgrade(transport));
        }
        self.router.register_engine(device_id, engine.clone());
        self.derived_snapshots.lock().unwrap().insert(device_id, DerivedSnapshot::of(&engine));
        self.status_callbacks.fire(&DeviceStatusEvent { device_id, kind: DeviceStatusKind::Added });
        engine
    }

    /// Drop a device from the registry, notifying status subscribers.
    pub fn remove_device(&self, device_id: u8) -> Option<Arc<ServoEngine>> {
        let removed = self.router.remove_engine(device_id);
        if removed.is_some() {
            self.derived_snapshots.lock().unwrap().remove(&device_id);
            self.status_callbacks.fire(&DeviceStatusEvent { device_id, kind: DeviceStatusKind::Removed });
        }
        removed
    }

    pub fn device(&self, device_id: u8) -> Option<Arc<ServoEngine>> {
        self.router.engine(device_id)
    }

    pub fn devices(&self) -> Vec<Arc<ServoEngine>> {
        self.router.engines()
    }

    pub fn read_calibration(&self, device_id: u8) -> Result<Option<MotorCalibration>> {
        let engine = self.device(device_id).ok_or(DogBotError::UnknownDevice(device_id))?;
        Ok(engine.calibration())
    }

    pub fn write_calibration(&self, device_id: u8, calibration: MotorCalibration) -> Result<()> {
        let engine = self.device(device_id).ok_or(DogBotError::UnknownDevice(device_id))?;
        engine.set_calibration(calibration);
        Ok(())
    }

    /// Home a device by driving it through its index-sensor transitions.
    /// Terminal `TimedOut`/`TooManyCycles` outcomes surface as errors.
    pub fn home_device(&self, device_id: u8, restore_position: bool) -> Result<()> {
        let engine = self.device(device_id).ok_or(DogBotError::UnknownDevice(device_id))?;
        match HomingCoordinator::new(engine).home(restore_position)? {
            HomingOutcome::Homed { .. } => Ok(()),
            HomingOutcome::TimedOut => Err(DogBotError::HomingTimeout(device_id)),
            HomingOutcome::TooManyCycles => Err(DogBotError::HomingTooManyCycles(device_id)),
        }
    }

    pub fn joint(&self, name: &str) -> Option<Arc<dyn Joint>> {
        self.joints.lock().unwrap().get(name).cloned()
    }

    pub fn add_status_callback<F>(&self, f: F) -> CallbackHandle
    where
        F: Fn(&DeviceStatusEvent) + Send + Sync + 'static,
    {
        self.status_callbacks.add(f)
    }

    pub fn remove_status_callback(&self, handle: &CallbackHandle) {
        self.status_callbacks.remove(handle)
    }

    /// Route one inbound frame decoded off the wire.
    pub fn handle_inbound(&self, packet: crate::packet::Packet) {
        self.router.handle_inbound(packet);
    }

    /// Load devices and joints from a JSON configuration document,
    /// resolving `jointDrive`/`jointRef` by name against the device set
    /// built from the same document.
    pub fn load_config(&self, config: &Config) -> Result<()> {
        let mut device_engines: HashMap<String, Arc<ServoEngine>> = HashMap::new();
        for record in &config.devices {
            if !record.enabled {
                continue;
            }
            let engine = self.add_device(record.device_id, record.gear_ratio, record.motor_kv);
            engine.rebind_uid(record.uid1, record.uid2);
            engine.set_name(record.name.clone());
            engine.configure_admin(
                record.enabled,
                record.home_offset,
                record.end_stop_start,
                record.end_stop_final,
                record.end_stop_enable,
                record.safety_mode,
            );
            if let Some(setup) = &record.setup {
                engine.set_calibration(setup.clone());
            }
            device_engines.insert(record.name.clone(), engine);
        }

        let mut joints = self.joints.lock().unwrap();
        let mut joint_records = self.joint_records.lock().unwrap();
        for record in &config.joints {
            match record {
                JointRecord::Direct { name, device } => {
                    let engine = device_engines
                        .get(device)
                        .ok_or_else(|| DogBotError::Config(format!("joint '{name}' references unknown device '{device}'")))?;
                    joints.insert(name.clone(), Arc::new(DirectJoint::new(engine.clone())) as Arc<dyn Joint>);
                    joint_records.insert(name.clone(), record.clone());
                }
                JointRecord::Relative { name, joint_drive, joint_ref, ref_gain, ref_offset, gain } => {
                    let drive = device_engines
                        .get(joint_drive)
                        .ok_or_else(|| DogBotError::Config(format!("joint '{name}' references unknown drive '{joint_drive}'")))?;
                    let reference = device_engines
                        .get(joint_ref)
                        .ok_or_else(|| DogBotError::Config(format!("joint '{name}' references unknown reference '{joint_ref}'")))?;
                    joints.insert(
                        name.clone(),
                        RelativeJoint::new(drive.clone(), reference.clone(), *gain, *ref_gain, *ref_offset) as Arc<dyn Joint>,
                    );
                    joint_records.insert(name.clone(), record.clone());
                }
            }
        }
        Ok(())
    }

    /// Export the current device and joint registries as a configuration
    /// document, the inverse of [`Self::load_config`].
    pub fn save_config(&self) -> Config {
        let devices = self
            .router
            .engines()
            .into_iter()
            .map(|engine| {
                let admin = engine.admin_snapshot();
                DeviceRecord {
                    name: engine.name(),
                    uid1: admin.uid1,
                    uid2: admin.uid2,
                    device_id: engine.device_id(),
                    enabled: admin.enabled,
                    motor_kv: admin.motor_kv,
                    gear_ratio: admin.gear_ratio,
                    home_offset: admin.home_offset,
                    end_stop_start: admin.end_stop_start,
                    end_stop_final: admin.end_stop_final,
                    end_stop_enable: admin.end_stop_enable,
                    safety_mode: admin.safety_mode,
                    setup: admin.setup,
                }
            })
            .collect();
        let joints = self.joint_records.lock().unwrap().values().cloned().collect();
        Config { devices, joints }
    }

    /// Shut down the monitor thread. Idempotent.
    pub fn shutdown(&self) {
        self.monitor_terminate.store(true, Ordering::SeqCst);
        if let Some(handle) = self.monitor_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        for handle in self.pump_threads.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for DogBotApi {
    fn drop(&mut self) {
        self.shutdown();
    }
}
