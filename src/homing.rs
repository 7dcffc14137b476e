//! Homing coordinator: recovers a joint's absolute position by driving it
//! through its index-sensor transitions in both directions and combining
//! the observed transition positions into a circular-mean home offset.

use crate::device::ServoEngine;
use crate::error::{DogBotError, Result};
use crate::packet::{ControlState, ParameterIndex, PositionReference};
use std::f32::consts::PI;
use std::sync::mpsc::{sync_channel, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const INDEX_ANGLE_WIDTH: f32 = 28.0 * PI / 180.0;
const HYSTERESIS_WIDTH: f32 = 5.0 * PI / 180.0;
const HOMING_TORQUE_LIMIT: f32 = 1.5;
const HOMING_VELOCITY_LIMIT: f32 = 100.0;
const ARRIVAL_TOLERANCE: f32 = PI / 64.0;
const STALL_VELOCITY: f32 = 2.0;
const STALL_TORQUE_FRACTION: f32 = 0.95;
const STALL_GRACE: Duration = Duration::from_millis(500);
const MAX_CYCLES: u32 = 5;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(40);

/// Terminal outcome of a homing attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HomingOutcome {
    Homed { offset: f32 },
    TimedOut,
    TooManyCycles,
}

/// Terminal outcome of the lower-level [`move_until_index_change`] primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JointMoveStatus {
    Done,
    Stalled,
    TimedOut,
    IncorrectMode,
    Error,
}

/// Offsets applied to a recorded index-transition position to account for
/// the index magnet's angular width and the comparator's hysteresis,
/// indexed by `(new_index_state, velocity_was_positive)`.
fn hysteresis_offset(new_index_state: bool, velocity_positive: bool) -> f32 {
    match (new_index_state, velocity_positive) {
        (false, false) => INDEX_ANGLE_WIDTH / 2.0 - HYSTERESIS_WIDTH,
        (false, true) => -INDEX_ANGLE_WIDTH / 2.0 + HYSTERESIS_WIDTH,
        (true, false) => -INDEX_ANGLE_WIDTH / 2.0,
        (true, true) => INDEX_ANGLE_WIDTH / 2.0,
    }
}

fn bucket_index(new_index_state: bool, velocity_positive: bool) -> usize {
    (new_index_state as usize) * 2 + (velocity_positive as usize)
}

/// Combine the populated transition-position estimates into a circular mean.
fn circular_mean(estimates: &[Option<f32>; 4]) -> Option<f32> {
    let mut sin_sum = 0.0f32;
    let mut cos_sum = 0.0f32;
    let mut count = 0;
    for e in estimates.iter().flatten() {
        sin_sum += e.sin();
        cos_sum += e.cos();
        count += 1;
    }
    if count == 0 {
        None
    } else {
        Some(sin_sum.atan2(cos_sum))
    }
}

struct HomingRun {
    device: Arc<ServoEngine>,
    index_positions: Mutex<[Option<f32>; 4]>,
    min_bound: f32,
    max_bound: f32,
    cycles: Mutex<u32>,
    last_direction_change: Mutex<Instant>,
    started_at: Instant,
    timeout: Duration,
    tentative_offset: Option<f32>,
}

/// Drives `device` through its index-sensor transitions to recover an
/// absolute home offset. The caller's thread blocks until success or
/// failure; the state machine itself advances from the device's own
/// position-update callback, so it holds no device locks while blocked.
pub struct HomingCoordinator {
    device: Arc<ServoEngine>,
    timeout: Duration,
}

impl HomingCoordinator {
    pub fn new(device: Arc<ServoEngine>) -> Self {
        HomingCoordinator { device, timeout: DEFAULT_TIMEOUT }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run the homing procedure. If `restore_position` is set, re-demands
    /// the joint's original position once absolute reference is achieved.
    pub fn home(&self, restore_position: bool) -> Result<HomingOutcome> {
        if self.device.control_state() != ControlState::Ready {
            return Err(DogBotError::Config("homing requires control state Ready".into()));
        }

        self.device.send_set_param_f32(ParameterIndex::VelocityLimit, HOMING_VELOCITY_LIMIT)?;
        self.device
            .send_set_param_u8(ParameterIndex::PwmMode, crate::packet::ControlDynamic::Position as u8)?;

        let (start_position, _velocity, _torque, index_active, _pos_ref) = self.device.raw_state();

        let (min_bound, max_bound, tentative_offset) = if index_active {
            (start_position - PI, start_position + PI, None)
        } else {
            (start_position - INDEX_ANGLE_WIDTH, start_position + INDEX_ANGLE_WIDTH, Some(start_position))
        };

        let run = Arc::new(HomingRun {
            device: self.device.clone(),
            index_positions: Mutex::new([None; 4]),
            min_bound,
            max_bound,
            cycles: Mutex::new(0),
            last_direction_change: Mutex::new(Instant::now()),
            started_at: Instant::now(),
            timeout: self.timeout,
            tentative_offset,
        });

        log::info!(
            "device {} homing: bounds [{:.3}, {:.3}] index_active={}",
            self.device.device_id(),
            min_bound,
            max_bound,
            index_active
        );

        self.device.demand_position_unchecked(max_bound, HOMING_TORQUE_LIMIT, PositionReference::Relative)?;

        let (done_tx, done_rx) = sync_channel::<HomingOutcome>(1);
        let done_tx = Mutex::new(Some(done_tx));
        let run_for_cb = run.clone();
        let handle = self.device.add_position_update_callback(move |update| {
            if let Some(outcome) = run_for_cb.on_update(update.position, update.velocity, update.torque, update.index_state, update.position_ref) {
                if let Some(tx) = done_tx.lock().unwrap().take() {
                    let _ = tx.send(outcome);
                }
            }
        });

        let outcome = match done_rx.recv_timeout(self.timeout) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => HomingOutcome::TimedOut,
            Err(RecvTimeoutError::Disconnected) => HomingOutcome::TimedOut,
        };
        self.device.remove_position_update_callback(&handle);

        if let HomingOutcome::Homed { .. } = outcome {
            log::info!("device {} homed", self.device.device_id());
            if restore_position {
                let _ = self.device.demand_position(start_position, HOMING_TORQUE_LIMIT);
            }
        } else {
            log::warn!("device {} homing failed: {:?}", self.device.device_id(), outcome);
        }

        Ok(outcome)
    }
}

impl HomingRun {
    /// Returns `Some(outcome)` once the state machine has reached a terminal state.
    fn on_update(&self, position: f32, velocity: f32, torque: f32, index_state: bool, position_ref: PositionReference) -> Option<HomingOutcome> {
        if position_ref == PositionReference::Absolute {
            let offset = circular_mean(&self.index_positions.lock().unwrap())
                .or(self.tentative_offset)
                .unwrap_or(0.0);
            return Some(HomingOutcome::Homed { offset });
        }

        if self.started_at.elapsed() > self.timeout {
            return Some(HomingOutcome::TimedOut);
        }

        let velocity_positive = velocity >= 0.0;

        // A transition is recorded the first time its bucket sees a value
        // after a direction reversal clears the opposing-state buckets.
        if index_state {
            let idx = bucket_index(true, velocity_positive);
            let mut positions = self.index_positions.lock().unwrap();
            if positions[idx].is_none() {
                positions[idx] = Some(position - hysteresis_offset(true, velocity_positive));
                drop(positions);
                let mut cycles = self.cycles.lock().unwrap();
                *cycles += 1;
                if *cycles > MAX_CYCLES {
                    return Some(HomingOutcome::TooManyCycles);
                }
                *self.last_direction_change.lock().unwrap() = Instant::now();
                let target = if velocity_positive { position - INDEX_ANGLE_WIDTH } else { position + INDEX_ANGLE_WIDTH };
                let _ = self.device.demand_position_unchecked(target, HOMING_TORQUE_LIMIT, PositionReference::Relative);
                return None;
            }
        } else {
            let idx = bucket_index(false, velocity_positive);
            let mut positions = self.index_positions.lock().unwrap();
            if positions[idx].is_none() {
                positions[idx] = Some(position - hysteresis_offset(false, velocity_positive));
            }
        }

        let stalled = velocity.abs() < STALL_VELOCITY
            && torque.abs() >= STALL_TORQUE_FRACTION * HOMING_TORQUE_LIMIT
            && self.last_direction_change.lock().unwrap().elapsed() > STALL_GRACE;

        let target = if velocity_positive { self.max_bound } else { self.min_bound };
        let arrived = (position - target).abs() < ARRIVAL_TOLERANCE;

        if stalled || arrived {
            let mut cycles = self.cycles.lock().unwrap();
            *cycles += 1;
            if *cycles > MAX_CYCLES {
                return Some(HomingOutcome::TooManyCycles);
            }
            drop(cycles);
            *self.last_direction_change.lock().unwrap() = Instant::now();
            let reversed_target = if velocity_positive { self.min_bound } else { self.max_bound };
            let _ = self.device.demand_position_unchecked(reversed_target, HOMING_TORQUE_LIMIT, PositionReference::Relative);
        }

        None
    }
}

/// Standalone primitive: drive toward `target_position` until the index
/// sensor flips from `current_index_state`, or a stall/timeout/error occurs.
/// Used by diagnostic tooling that wants a single transition without
/// running the full homing state machine.
pub fn move_until_index_change(
    device: &Arc<ServoEngine>,
    target_position: f32,
    torque_limit: f32,
    current_index_state: bool,
    timeout: Duration,
) -> Result<JointMoveStatus> {
    if device.control_state() != ControlState::Ready {
        return Ok(JointMoveStatus::IncorrectMode);
    }

    device.demand_position_unchecked(target_position, torque_limit, PositionReference::Relative)?;

    let (done_tx, done_rx) = sync_channel::<JointMoveStatus>(1);
    let done_tx = Mutex::new(Some(done_tx));
    let start = Instant::now();
    let last_change = Mutex::new(Instant::now());
    let handle = device.add_position_update_callback(move |update| {
        if update.index_state != current_index_state {
            if let Some(tx) = done_tx.lock().unwrap().take() {
                let _ = tx.send(JointMoveStatus::Done);
            }
            return;
        }
        let stalled = update.velocity.abs() < STALL_VELOCITY
            && update.torque.abs() >= STALL_TORQUE_FRACTION * torque_limit
            && last_change.lock().unwrap().elapsed() > STALL_GRACE;
        if stalled {
            if let Some(tx) = done_tx.lock().unwrap().take() {
                let _ = tx.send(JointMoveStatus::Stalled);
            }
        }
        if start.elapsed() > timeout {
            if let Some(tx) = done_tx.lock().unwrap().take() {
                let _ = tx.send(JointMoveStatus::TimedOut);
            }
        }
    });

    let status = match done_rx.recv_timeout(timeout) {
        Ok(status) => status,
        Err(_) => JointMoveStatus::TimedOut,
    };
    device.remove_position_update_callback(&handle);
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hysteresis_offsets_match_geometry() {
        assert!((hysteresis_offset(true, true) - INDEX_ANGLE_WIDTH / 2.0).abs() < 1e-6);
        assert!((hysteresis_offset(true, false) + INDEX_ANGLE_WIDTH / 2.0).abs() < 1e-6);
    }

    #[test]
    fn circular_mean_of_single_point_is_itself() {
        let mut estimates = [None; 4];
        estimates[0] = Some(0.3);
        let mean = circular_mean(&estimates).unwrap();
        assert!((mean - 0.3).abs() < 1e-4);
    }

    #[test]
    fn circular_mean_of_empty_is_none() {
        let estimates: [Option<f32>; 4] = [None; 4];
        assert!(circular_mean(&estimates).is_none());
    }
}
