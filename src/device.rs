//! Per-device protocol state, parameter synchronisation, and the position/
//! velocity/torque estimator for a single servo driver board.
//!
//! Two mutexes guard device state: `admin` covers configuration-like
//! fields (UIDs, motor constants, calibration), `state` covers telemetry
//! (position, velocity, torque, control/homed/fault state). `state` is
//! held only to extract or update data; it is never held across a
//! callback fire or a wire send, so a callback or a blocked send can never
//! deadlock against a concurrent report handler.

use crate::callback::{CallbackHandle, CallbackRegistry};
use crate::config::MotorCalibration;
use crate::error::{DogBotError, Result};
use crate::packet::{
    self, ControlDynamic, ControlState, FaultCode, HomedState, Packet, ParameterIndex,
    PositionReference, BOOTLOADER_QUERY_COUNT, TICK_DURATION_SECS,
};
use crate::transport::Transport;
use std::f32::consts::PI;
use std::sync::{Mutex, Weak};
use std::time::{Duration, Instant};

/// Admin fields in the shape a configuration document persists them.
#[derive(Debug, Clone)]
pub struct AdminSnapshot {
    pub uid1: u32,
    pub uid2: u32,
    pub enabled: bool,
    pub motor_kv: f32,
    pub gear_ratio: f32,
    pub home_offset: f32,
    pub end_stop_start: f32,
    pub end_stop_final: f32,
    pub end_stop_enable: bool,
    pub safety_mode: u8,
    pub setup: Option<MotorCalibration>,
}

/// A snapshot of a device's motion state, as delivered to subscribers.
#[derive(Debug, Clone, Copy)]
pub struct PositionUpdate {
    pub device_id: u8,
    pub position: f32,
    pub velocity: f32,
    pub torque: f32,
    pub position_ref: PositionReference,
    pub index_state: bool,
}

/// The last position/torque-limit pair demanded of a device, as delivered
/// to demand subscribers.
#[derive(Debug, Clone, Copy)]
pub struct DemandUpdate {
    pub position: f32,
    pub torque_limit: f32,
}

/// Configuration-like fields, protected by the `admin` mutex.
struct Admin {
    uid0: u32,
    uid1: u32,
    enabled: bool,
    motor_kv: f32,
    gear_ratio: f32,
    servo_kt: f32,
    max_current: f32,
    home_offset: f32,
    end_stop_start: f32,
    end_stop_final: f32,
    end_stop_enable: bool,
    safety_mode: u8,
    velocity_limit: f32,
    update_query: Vec<ParameterIndex>,
    bootloader_query_count: usize,
    coms_timeout: Duration,
    calibration: Option<MotorCalibration>,
}

fn servo_kt(gear_ratio: f32, motor_kv: f32) -> f32 {
    (60.0 * gear_ratio) / (2.0 * PI * motor_kv)
}

impl Admin {
    fn default_for(gear_ratio: f32, motor_kv: f32) -> Self {
        Admin {
            uid0: 0,
            uid1: 0,
            enabled: true,
            motor_kv,
            gear_ratio,
            servo_kt: servo_kt(gear_ratio, motor_kv),
            max_current: 20.0,
            home_offset: 0.0,
            end_stop_start: 0.0,
            end_stop_final: 0.0,
            end_stop_enable: false,
            safety_mode: 0,
            velocity_limit: 0.0,
            update_query: default_update_query(),
            bootloader_query_count: BOOTLOADER_QUERY_COUNT,
            coms_timeout: Duration::from_millis(500),
            calibration: None,
        }
    }
}

fn default_update_query() -> Vec<ParameterIndex> {
    use ParameterIndex::*;
    vec![
        FaultCode,
        ControlState,
        SafetyMode,
        Indicator,
        HomedState,
        PositionReference,
        PwmMode,
        CalibrationOffset,
        OtherJoint,
        OtherJointOffset,
        OtherJointGain,
        MotorIGain,
        VelocityPGain,
        VelocityIGain,
        VelocityLimit,
        PositionGain,
        HomeIndexPosition,
        MaxCurrent,
        EndStopEnable,
        EndStopStart,
        EndStopFinal,
    ]
}

/// Telemetry fields, protected by the `state` mutex.
struct State {
    control_state: ControlState,
    homed_state: HomedState,
    control_dynamic: ControlDynamic,
    fault_code: FaultCode,
    position_ref: PositionReference,
    position: f32,
    velocity: f32,
    torque: f32,
    index_state: bool,
    last_report_tick: u8,
    last_report_at: Option<Instant>,
    last_coms_at: Option<Instant>,
    refresh_cursor: usize,
    drive_temperature: f32,
    motor_temperature: f32,
    supply_voltage: f32,
}

impl Default for State {
    fn default() -> Self {
        State {
            control_state: ControlState::Ready,
            homed_state: HomedState::Lost,
            control_dynamic: ControlDynamic::Off,
            fault_code: FaultCode::None,
            position_ref: PositionReference::Relative,
            position: 0.0,
            velocity: 0.0,
            torque: 0.0,
            index_state: false,
            last_report_tick: 0,
            last_report_at: None,
            last_coms_at: None,
            refresh_cursor: 0,
            drive_temperature: 0.0,
            motor_temperature: 0.0,
            supply_voltage: 0.0,
        }
    }
}

/// Protocol engine and state tracker for one device.
pub struct ServoEngine {
    device_id: u8,
    name: Mutex<String>,
    transport: Mutex<Weak<dyn Transport>>,
    admin: Mutex<Admin>,
    state: Mutex<State>,
    position_callbacks: CallbackRegistry<PositionUpdate>,
    absolute_callbacks: CallbackRegistry<PositionUpdate>,
    param_callbacks: CallbackRegistry<ParameterIndex>,
    demand_callbacks: CallbackRegistry<DemandUpdate>,
    last_demand: Mutex<Option<(f32, f32)>>,
}

impl ServoEngine {
    pub fn new(device_id: u8, gear_ratio: f32, motor_kv: f32) -> Self {
        ServoEngine {
            device_id,
            name: Mutex::new(device_id.to_string()),
            transport: Mutex::new(Weak::<crate::transport::LoopbackTransport>::new()),
            admin: Mutex::new(Admin::default_for(gear_ratio, motor_kv)),
            state: Mutex::new(State::default()),
            position_callbacks: CallbackRegistry::new(),
            absolute_callbacks: CallbackRegistry::new(),
            param_callbacks: CallbackRegistry::new(),
            demand_callbacks: CallbackRegistry::new(),
            last_demand: Mutex::new(None),
        }
    }

    pub fn device_id(&self) -> u8 {
        self.device_id
    }

    /// The configuration-file name this device was loaded or registered
    /// under, defaulting to its device id.
    pub fn name(&self) -> String {
        self.name.lock().unwrap().clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.lock().unwrap() = name.into();
    }

    pub fn bind_transport(&self, transport: Weak<dyn Transport>) {
        *self.transport.lock().unwrap() = transport;
    }

    pub fn rebind_uid(&self, uid0: u32, uid1: u32) {
        let mut admin = self.admin.lock().unwrap();
        admin.uid0 = uid0;
        admin.uid1 = uid1;
    }

    /// Apply the admin-like fields a configuration record carries, beyond
    /// the UID pair and the motor constants `new` already took.
    #[allow(clippy::too_many_arguments)]
    pub fn configure_admin(
        &self,
        enabled: bool,
        home_offset: f32,
        end_stop_start: f32,
        end_stop_final: f32,
        end_stop_enable: bool,
        safety_mode: u8,
    ) {
        let mut admin = self.admin.lock().unwrap();
        admin.enabled = enabled;
        admin.home_offset = home_offset;
        admin.end_stop_start = end_stop_start;
        admin.end_stop_final = end_stop_final;
        admin.end_stop_enable = end_stop_enable;
        admin.safety_mode = safety_mode;
    }

    /// Apply process-wide tuning knobs (bootloader query depth, the
    /// `Ready`/`Diagnostic` comms timeout) to this device.
    pub fn set_process_tuning(&self, bootloader_query_count: usize, coms_timeout_ms: u64) {
        let mut admin = self.admin.lock().unwrap();
        admin.bootloader_query_count = bootloader_query_count;
        admin.coms_timeout = Duration::from_millis(coms_timeout_ms);
    }

    pub fn uid(&self) -> (u32, u32) {
        let admin = self.admin.lock().unwrap();
        (admin.uid0, admin.uid1)
    }

    /// Snapshot the admin fields this device would persist to a
    /// configuration document, keyed the way `DeviceRecord` names them.
    pub fn admin_snapshot(&self) -> AdminSnapshot {
        let admin = self.admin.lock().unwrap();
        AdminSnapshot {
            uid1: admin.uid0,
            uid2: admin.uid1,
            enabled: admin.enabled,
            motor_kv: admin.motor_kv,
            gear_ratio: admin.gear_ratio,
            home_offset: admin.home_offset,
            end_stop_start: admin.end_stop_start,
            end_stop_final: admin.end_stop_final,
            end_stop_enable: admin.end_stop_enable,
            safety_mode: admin.safety_mode,
            setup: admin.calibration.clone(),
        }
    }

    /// Read the motor calibration table currently held for this device, if any.
    pub fn calibration(&self) -> Option<MotorCalibration> {
        self.admin.lock().unwrap().calibration.clone()
    }

    /// Install a motor calibration table for this device.
    pub fn set_calibration(&self, calibration: MotorCalibration) {
        let mut admin = self.admin.lock().unwrap();
        admin.calibration = Some(calibration);
    }

    pub fn control_state(&self) -> ControlState {
        self.state.lock().unwrap().control_state
    }

    pub fn homed_state(&self) -> HomedState {
        self.state.lock().unwrap().homed_state
    }

    pub fn fault_code(&self) -> FaultCode {
        self.state.lock().unwrap().fault_code
    }

    pub fn control_dynamic(&self) -> ControlDynamic {
        self.state.lock().unwrap().control_dynamic
    }

    pub fn drive_temperature(&self) -> f32 {
        self.state.lock().unwrap().drive_temperature
    }

    pub fn motor_temperature(&self) -> f32 {
        self.state.lock().unwrap().motor_temperature
    }

    pub fn supply_voltage(&self) -> f32 {
        self.state.lock().unwrap().supply_voltage
    }

    pub fn add_position_update_callback<F>(&self, f: F) -> CallbackHandle
    where
        F: Fn(&PositionUpdate) + Send + Sync + 'static,
    {
        self.position_callbacks.add(f)
    }

    pub fn remove_position_update_callback(&self, handle: &CallbackHandle) {
        self.position_callbacks.remove(handle)
    }

    pub fn add_absolute_position_callback<F>(&self, f: F) -> CallbackHandle
    where
        F: Fn(&PositionUpdate) + Send + Sync + 'static,
    {
        self.absolute_callbacks.add(f)
    }

    pub fn add_parameter_callback<F>(&self, f: F) -> CallbackHandle
    where
        F: Fn(&ParameterIndex) + Send + Sync + 'static,
    {
        self.param_callbacks.add(f)
    }

    /// The last (position, torqueLimit) demanded of this device, if any.
    pub fn demand(&self) -> Option<(f32, f32)> {
        *self.last_demand.lock().unwrap()
    }

    pub fn add_demand_update_callback<F>(&self, f: F) -> CallbackHandle
    where
        F: Fn(&DemandUpdate) + Send + Sync + 'static,
    {
        self.demand_callbacks.add(f)
    }

    fn send(&self, packet: &Packet) -> Result<()> {
        let transport = self.transport.lock().unwrap().upgrade();
        match transport {
            Some(t) => t.send_packet(packet),
            None => Err(DogBotError::NoTransport),
        }
    }

    /// Read current telemetry regardless of homed state. Used internally by
    /// the homing coordinator, which must observe relative-mode reports.
    pub(crate) fn raw_state(&self) -> (f32, f32, f32, bool, PositionReference) {
        let state = self.state.lock().unwrap();
        (state.position, state.velocity, state.torque, state.index_state, state.position_ref)
    }

    /// Write an f32-valued parameter, e.g. to lower the velocity limit
    /// before homing.
    pub(crate) fn send_set_param_f32(&self, idx: ParameterIndex, value: f32) -> Result<()> {
        let packet = Packet::SetParam { dev_id: self.device_id, param: idx as u16, payload: value.to_le_bytes().to_vec() };
        self.send(&packet)
    }

    /// Write a single-byte parameter, e.g. to force `PwmMode` into Position.
    pub(crate) fn send_set_param_u8(&self, idx: ParameterIndex, value: u8) -> Result<()> {
        let packet = Packet::SetParam { dev_id: self.device_id, param: idx as u16, payload: vec![value] };
        self.send(&packet)
    }

    /// Non-blocking read of the current estimated state. Fails unless the
    /// device has achieved an absolute position reference.
    pub fn get_state(&self) -> Result<(u8, f32, f32, f32)> {
        let state = self.state.lock().unwrap();
        if state.position_ref != PositionReference::Absolute {
            return Err(DogBotError::NotAbsolute(self.device_id));
        }
        Ok((state.last_report_tick, state.position, state.velocity, state.torque))
    }

    /// Extrapolate position/velocity/torque at `at`, the current instant.
    /// Within 5 tick durations of the last report the position is linearly
    /// extrapolated from the last reported velocity; beyond that the last
    /// reported position is returned verbatim.
    pub fn get_state_at(&self, at: Instant) -> Result<(f32, f32, f32)> {
        let state = self.state.lock().unwrap();
        if state.position_ref != PositionReference::Absolute {
            return Err(DogBotError::NotAbsolute(self.device_id));
        }
        match state.last_report_at {
            Some(last) => {
                let elapsed = at.saturating_duration_since(last).as_secs_f32();
                if elapsed < 5.0 * TICK_DURATION_SECS {
                    Ok((state.position + state.velocity * elapsed, state.velocity, state.torque))
                } else {
                    Ok((state.position, state.velocity, state.torque))
                }
            }
            None => Ok((state.position, state.velocity, state.torque)),
        }
    }

    /// Demand a coil current equivalent to `torque_nm`, via `current = torque / servo_kt`.
    pub fn demand_torque(&self, torque_nm: f32) -> Result<()> {
        let current = torque_nm / self.admin.lock().unwrap().servo_kt;
        let packet = packet::encode_torque_command(self.device_id, current);
        self.send(&packet)
    }

    /// Demand an absolute position with a torque limit, in N*m. Refuses
    /// unless the device has achieved an absolute position reference.
    pub fn demand_position(&self, radians: f32, torque_limit_nm: f32) -> Result<()> {
        let pos_ref = {
            let state = self.state.lock().unwrap();
            if state.position_ref != PositionReference::Absolute {
                return Err(DogBotError::NotHomed(self.device_id));
            }
            state.position_ref
        };
        let packet = packet::encode_position_command(self.device_id, radians, torque_limit_nm, pos_ref);
        self.send(&packet)?;
        self.record_demand(radians, torque_limit_nm);
        Ok(())
    }

    /// Issue a position demand regardless of homed state, used internally
    /// by the homing coordinator while the position reference is still relative.
    pub(crate) fn demand_position_unchecked(&self, radians: f32, torque_limit_nm: f32, pos_ref: PositionReference) -> Result<()> {
        let packet = packet::encode_position_command(self.device_id, radians, torque_limit_nm, pos_ref);
        self.send(&packet)?;
        self.record_demand(radians, torque_limit_nm);
        Ok(())
    }

    fn record_demand(&self, position: f32, torque_limit: f32) {
        *self.last_demand.lock().unwrap() = Some((position, torque_limit));
        self.demand_callbacks.fire(&DemandUpdate { position, torque_limit });
    }

    /// Reset the parameter-refresh cursor so every parameter is re-queried.
    pub fn query_refresh(&self) {
        self.state.lock().unwrap().refresh_cursor = 0;
    }

    /// Dispatch one decoded inbound frame addressed to this device.
    pub fn handle_packet(&self, packet: &Packet) {
        self.state.lock().unwrap().last_coms_at = Some(Instant::now());
        match packet {
            Packet::ServoReport { position, torque, mode, timestamp, .. } => {
                self.handle_servo_report(*position, *torque, *mode, *timestamp)
            }
            Packet::ReportParam { param, payload, .. } => self.handle_report_param(*param, payload),
            Packet::Pong { .. } => log::debug!("device {} replied to ping", self.device_id),
            _ => {}
        }
    }

    fn handle_servo_report(&self, raw_position: i16, raw_torque: i16, mode: u8, timestamp: u8) {
        let pos_ref = PositionReference::from(mode);
        let index_state = (mode & 0x08) != 0;
        let new_position = raw_position as f32 / packet::POSITION_SCALE;

        let (update, became_absolute) = {
            let mut state = self.state.lock().unwrap();
            let admin = self.admin.lock().unwrap();

            let tick_diff = timestamp.wrapping_sub(state.last_report_tick);
            let out_of_sync = state.last_report_at.is_none() || tick_diff >= 128;

            let velocity = if out_of_sync {
                0.0
            } else {
                let effective_diff = if tick_diff == 0 { 1 } else { tick_diff };
                (new_position - state.position) / (TICK_DURATION_SECS * effective_diff as f32)
            };

            let torque = raw_torque as f32 * admin.max_current / 32767.0 * admin.servo_kt;

            let was_absolute = state.position_ref == PositionReference::Absolute;
            state.position = new_position;
            state.velocity = velocity;
            state.torque = torque;
            state.position_ref = pos_ref;
            state.index_state = index_state;
            state.last_report_tick = timestamp;
            state.last_report_at = Some(Instant::now());

            let update = PositionUpdate {
                device_id: self.device_id,
                position: new_position,
                velocity,
                torque,
                position_ref: pos_ref,
                index_state,
            };
            let became_absolute = !was_absolute && pos_ref == PositionReference::Absolute;
            (update, became_absolute)
        };

        self.position_callbacks.fire(&update);
        if update.position_ref == PositionReference::Absolute {
            self.absolute_callbacks.fire(&update);
        }
        if became_absolute {
            log::info!("device {} reached absolute position reference", self.device_id);
        }
    }

    fn handle_report_param(&self, param: u16, payload: &[u8]) {
        let Ok(param) = ParameterIndex::try_from(param) else {
            log::debug!("device {} reported unknown parameter {param}", self.device_id);
            return;
        };
        let mut reset_on_enter = None;
        let mut changed = false;
        {
            let mut state = self.state.lock().unwrap();
            let mut admin = self.admin.lock().unwrap();
            match param {
                ParameterIndex::FaultCode => {
                    let new = FaultCode::from(payload.first().copied().unwrap_or(0));
                    changed = new != state.fault_code;
                    state.fault_code = new;
                }
                ParameterIndex::ControlState => {
                    let new_state = ControlState::from(payload.first().copied().unwrap_or(0));
                    if matches!(new_state, ControlState::FactoryCalibrate | ControlState::LowPower | ControlState::BootLoader) {
                        reset_on_enter = Some(());
                    }
                    changed = new_state != state.control_state;
                    state.control_state = new_state;
                }
                ParameterIndex::SafetyMode => {
                    let new = payload.first().copied().unwrap_or(0);
                    changed = new != admin.safety_mode;
                    admin.safety_mode = new;
                }
                ParameterIndex::HomedState => {
                    let new = homed_state_from(payload.first().copied().unwrap_or(0));
                    changed = new != state.homed_state;
                    state.homed_state = new;
                }
                ParameterIndex::PwmMode => {
                    let new = ControlDynamic::from(payload.first().copied().unwrap_or(0));
                    changed = new != state.control_dynamic;
                    state.control_dynamic = new;
                }
                // Stored into velocity_limit, not velocity_i_gain; the report carries no such field here.
                ParameterIndex::VelocityLimit => {
                    let new = read_f32(payload);
                    changed = new != admin.velocity_limit;
                    admin.velocity_limit = new;
                }
                ParameterIndex::MaxCurrent => {
                    let new = read_f32(payload);
                    changed = new != admin.max_current;
                    admin.max_current = new;
                }
                ParameterIndex::HomeIndexPosition => {
                    let new = read_f32(payload);
                    changed = new != admin.home_offset;
                    admin.home_offset = new;
                }
                ParameterIndex::EndStopEnable => {
                    let new = payload.first().copied().unwrap_or(0) != 0;
                    changed = new != admin.end_stop_enable;
                    admin.end_stop_enable = new;
                }
                ParameterIndex::EndStopStart => {
                    let new = read_f32(payload);
                    changed = new != admin.end_stop_start;
                    admin.end_stop_start = new;
                }
                ParameterIndex::EndStopFinal => {
                    let new = read_f32(payload);
                    changed = new != admin.end_stop_final;
                    admin.end_stop_final = new;
                }
                ParameterIndex::DriveTemperature => {
                    let new = read_f32(payload);
                    changed = new != state.drive_temperature;
                    state.drive_temperature = new;
                }
                ParameterIndex::MotorTemperature => {
                    let new = read_f32(payload);
                    changed = new != state.motor_temperature;
                    state.motor_temperature = new;
                }
                ParameterIndex::SupplyVoltage => {
                    let new = u16::from_le_bytes([payload[0], payload.get(1).copied().unwrap_or(0)]) as f32 / 1000.0;
                    changed = new != state.supply_voltage;
                    state.supply_voltage = new;
                }
                _ => {}
            }
        }
        if let Some(()) = reset_on_enter {
            let mut state = self.state.lock().unwrap();
            state.homed_state = HomedState::Lost;
            state.control_dynamic = ControlDynamic::Off;
            state.position = 0.0;
            state.velocity = 0.0;
            state.torque = 0.0;
            log::info!("device {} entered a resetting control state, cleared homing/motion state", self.device_id);
        }
        if changed {
            self.param_callbacks.fire(&param);
        }
    }

    /// Advance the device's timeout and rate-limited parameter refresh.
    /// Invoked by the facade's monitor tick, at least once per second.
    pub fn update_tick(&self, now: Instant) {
        let timeout = {
            let state = self.state.lock().unwrap();
            match state.control_state {
                ControlState::Ready | ControlState::Diagnostic => self.admin.lock().unwrap().coms_timeout,
                ControlState::FactoryCalibrate => Duration::from_secs(30),
                _ => Duration::from_secs(2),
            }
        };

        let lost = {
            let state = self.state.lock().unwrap();
            match state.last_coms_at {
                Some(last) => now.saturating_duration_since(last) > timeout,
                None => false,
            }
        };
        if lost {
            let mut state = self.state.lock().unwrap();
            if state.fault_code != FaultCode::Unknown {
                log::warn!("{}", DogBotError::LostContact(self.device_id));
            }
            state.fault_code = FaultCode::Unknown;
            state.velocity = 0.0;
        } else {
            let mut state = self.state.lock().unwrap();
            let admin = self.admin.lock().unwrap();
            if state.fault_code == FaultCode::Unknown && state.refresh_cursor >= admin.update_query.len() {
                log::warn!("device {} regained contact, re-querying", self.device_id);
                state.refresh_cursor = 0;
            }
        }

        self.refresh_next_parameter();
    }

    /// Send at most one `QueryParam` per tick, advancing the cursor. The
    /// cursor stops once it reaches the end of the list rather than
    /// wrapping, so a full pass runs exactly once per `QueryRefresh`/
    /// recovery trigger, matching the original's `m_toQuery` guard.
    fn refresh_next_parameter(&self) {
        let (param, dev_id) = {
            let mut state = self.state.lock().unwrap();
            let admin = self.admin.lock().unwrap();
            if state.refresh_cursor >= admin.update_query.len() {
                return;
            }
            if state.control_state == ControlState::BootLoader && state.refresh_cursor >= admin.bootloader_query_count {
                return;
            }
            let param = admin.update_query[state.refresh_cursor];
            state.refresh_cursor += 1;
            (param, self.device_id)
        };
        let packet = Packet::QueryParam { dev_id, param: param as u16 };
        if let Err(e) = self.send(&packet) {
            log::debug!("parameter refresh send failed for device {dev_id}: {e}");
        }
    }
}

fn homed_state_from(v: u8) -> HomedState {
    match v {
        0 => HomedState::Lost,
        1 => HomedState::Homing,
        _ => HomedState::Homed,
    }
}

fn read_f32(payload: &[u8]) -> f32 {
    if payload.len() < 4 {
        return 0.0;
    }
    f32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackTransport;
    use std::sync::Arc;

    fn make_absolute_report(dev_id: u8, position_rad: f32, timestamp: u8) -> Packet {
        let raw = (position_rad * packet::POSITION_SCALE).round() as i16;
        Packet::ServoReport { dev_id, position: raw, torque: 0, mode: PositionReference::Absolute as u8, timestamp }
    }

    #[test]
    fn velocity_estimate_matches_formula() {
        let engine = ServoEngine::new(1, 21.0, 260.0);
        let (transport, _rx) = LoopbackTransport::new();
        let transport: Arc<dyn Transport> = transport;
        engine.bind_transport(Arc::downgrade(&transport));

        engine.handle_packet(&make_absolute_report(1, 0.0, 10));
        engine.handle_packet(&make_absolute_report(1, 0.01, 11));

        let (_, position, velocity, _) = engine.get_state().unwrap();
        assert!((position - 0.01).abs() < 1e-3);
        assert!((velocity - 1.0).abs() < 0.5);
    }

    #[test]
    fn not_absolute_until_homed() {
        let engine = ServoEngine::new(1, 21.0, 260.0);
        assert!(matches!(engine.get_state(), Err(DogBotError::NotAbsolute(1))));
    }

    #[test]
    fn lost_contact_sets_unknown_fault_after_timeout() {
        let engine = ServoEngine::new(1, 21.0, 260.0);
        engine.handle_packet(&make_absolute_report(1, 0.0, 0));
        let far_future = Instant::now() + Duration::from_secs(10);
        engine.update_tick(far_future);
        assert_eq!(engine.fault_code(), FaultCode::Unknown);
    }

    #[test]
    fn demand_torque_uses_servo_kt_conversion() {
        let engine = ServoEngine::new(1, 21.0, 260.0);
        let (loopback, _rx) = LoopbackTransport::new();
        let transport: Arc<dyn Transport> = loopback.clone();
        engine.bind_transport(Arc::downgrade(&transport));
        engine.demand_torque(2.5).unwrap();

        let sent = loopback.sent();
        assert_eq!(sent.len(), 1);
        assert!(matches!(sent[0], Packet::Servo { .. }));
    }
}
