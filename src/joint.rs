//! Joint composition: a direct 1:1 wrapper around one device, and a
//! relative joint whose coordinates are an affine function of a drive
//! device and a reference device.

use crate::callback::{CallbackHandle, CallbackRegistry};
use crate::device::{DemandUpdate, PositionUpdate, ServoEngine};
use crate::error::{DogBotError, Result};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Shared contract for anything that can be demanded a position/torque and
/// queried for state, whether it wraps one device directly or derives its
/// coordinates from another joint.
pub trait Joint: Send + Sync {
    fn get_state(&self) -> Result<(f32, f32, f32)>;
    fn get_state_at(&self, at: Instant) -> Result<(f32, f32, f32)>;
    fn demand_position(&self, radians: f32, torque_limit_nm: f32) -> Result<()>;
    fn demand_torque(&self, torque_nm: f32) -> Result<()>;
    fn add_position_update_callback(&self, f: Box<dyn Fn(&PositionUpdate) + Send + Sync>) -> CallbackHandle;
    fn add_demand_update_callback(&self, f: Box<dyn Fn(&DemandUpdate) + Send + Sync>) -> CallbackHandle;
}

/// A joint that is a 1:1 wrapper around a single device.
pub struct DirectJoint {
    device: Arc<ServoEngine>,
}

impl DirectJoint {
    pub fn new(device: Arc<ServoEngine>) -> Self {
        DirectJoint { device }
    }

    pub fn device(&self) -> &Arc<ServoEngine> {
        &self.device
    }
}

impl Joint for DirectJoint {
    fn get_state(&self) -> Result<(f32, f32, f32)> {
        let (_, p, v, t) = self.device.get_state()?;
        Ok((p, v, t))
    }

    fn get_state_at(&self, at: Instant) -> Result<(f32, f32, f32)> {
        self.device.get_state_at(at)
    }

    fn demand_position(&self, radians: f32, torque_limit_nm: f32) -> Result<()> {
        self.device.demand_position(radians, torque_limit_nm)
    }

    fn demand_torque(&self, torque_nm: f32) -> Result<()> {
        self.device.demand_torque(torque_nm)
    }

    fn add_position_update_callback(&self, f: Box<dyn Fn(&PositionUpdate) + Send + Sync>) -> CallbackHandle {
        self.device.add_position_update_callback(move |u| f(u))
    }

    fn add_demand_update_callback(&self, f: Box<dyn Fn(&DemandUpdate) + Send + Sync>) -> CallbackHandle {
        self.device.add_demand_update_callback(move |u| f(u))
    }
}

#[derive(Default)]
struct LastForwarded {
    position: Option<f32>,
    torque_limit: Option<f32>,
}

/// A joint derived from a drive device and a reference device:
/// `raw = (simple + (refPos*refGain + refOffset)) / gain`.
///
/// `raw2simple` is built as the exact algebraic inverse of `simple2raw` so
/// that composing the two is the identity for any finite input with
/// `gain != 0`.
pub struct RelativeJoint {
    drive: Arc<ServoEngine>,
    reference: Arc<ServoEngine>,
    gain: f32,
    ref_gain: f32,
    ref_offset: f32,
    callbacks: CallbackRegistry<PositionUpdate>,
    demand_callbacks: CallbackRegistry<DemandUpdate>,
    drive_subscribed: Mutex<bool>,
    last_forwarded: Mutex<LastForwarded>,
    last_demand: Mutex<Option<(f32, f32)>>,
    self_weak: std::sync::Weak<RelativeJoint>,
}

impl RelativeJoint {
    pub fn new(drive: Arc<ServoEngine>, reference: Arc<ServoEngine>, gain: f32, ref_gain: f32, ref_offset: f32) -> Arc<Self> {
        Arc::new_cyclic(|self_weak| RelativeJoint {
            drive,
            reference,
            gain,
            ref_gain,
            ref_offset,
            callbacks: CallbackRegistry::new(),
            demand_callbacks: CallbackRegistry::new(),
            drive_subscribed: Mutex::new(false),
            last_forwarded: Mutex::new(LastForwarded::default()),
            last_demand: Mutex::new(None),
            self_weak: self_weak.clone(),
        })
    }

    fn offset(&self, ref_position: f32) -> f32 {
        ref_position * self.ref_gain + self.ref_offset
    }

    /// `simple = raw*gain - offset`.
    pub fn raw2simple(&self, raw: f32, ref_position: f32) -> f32 {
        raw * self.gain - self.offset(ref_position)
    }

    /// `raw = (simple + offset) / gain`.
    pub fn simple2raw(&self, simple: f32, ref_position: f32) -> Result<f32> {
        if self.gain == 0.0 {
            return Err(DogBotError::Config("relative joint gain is zero".into()));
        }
        Ok((simple + self.offset(ref_position)) / self.gain)
    }

    /// Subscribe to the drive device's position updates on the first call;
    /// later calls are a no-op, mirroring the original's
    /// `if(!m_driveCallback.IsActive())` guard.
    fn ensure_drive_subscribed(&self) {
        let mut subscribed = self.drive_subscribed.lock().unwrap();
        if *subscribed {
            return;
        }
        *subscribed = true;
        let weak_self = self.self_weak.clone();
        self.drive.add_position_update_callback(move |update| {
            if let Some(this) = weak_self.upgrade() {
                this.forward_drive_update(update);
            }
        });
    }

    fn forward_drive_update(&self, drive_update: &PositionUpdate) {
        let ref_position = match self.reference.get_state_at(Instant::now()) {
            Ok((p, _, _)) => p,
            Err(_) => return,
        };
        let simple_position = self.raw2simple(drive_update.position, ref_position);
        let update = PositionUpdate {
            device_id: drive_update.device_id,
            position: simple_position,
            velocity: drive_update.velocity * self.gain,
            torque: drive_update.torque,
            position_ref: drive_update.position_ref,
            index_state: drive_update.index_state,
        };
        self.callbacks.fire(&update);
    }
}

impl Joint for RelativeJoint {
    fn get_state(&self) -> Result<(f32, f32, f32)> {
        let (_, drive_pos, drive_vel, drive_torque) = self.drive.get_state()?;
        let (ref_pos, _, _) = self.reference.get_state_at(Instant::now())?;
        Ok((self.raw2simple(drive_pos, ref_pos), drive_vel * self.gain, drive_torque))
    }

    fn get_state_at(&self, at: Instant) -> Result<(f32, f32, f32)> {
        let (drive_pos, drive_vel, drive_torque) = self.drive.get_state_at(at)?;
        let (ref_pos, _, _) = self.reference.get_state_at(at)?;
        Ok((self.raw2simple(drive_pos, ref_pos), drive_vel * self.gain, drive_torque))
    }

    fn demand_position(&self, radians: f32, torque_limit_nm: f32) -> Result<()> {
        if radians.is_nan() || torque_limit_nm.is_nan() {
            return Err(DogBotError::Config("relative joint demand is NaN".into()));
        }
        let (ref_pos, ref_torque) = self
            .reference
            .demand()
            .ok_or_else(|| DogBotError::Config("reference device has no demand yet".into()))?;
        let _ = ref_torque;
        let raw = self.simple2raw(radians, ref_pos)?;

        *self.last_demand.lock().unwrap() = Some((radians, torque_limit_nm));
        self.demand_callbacks.fire(&DemandUpdate { position: radians, torque_limit: torque_limit_nm });

        let mut last = self.last_forwarded.lock().unwrap();
        if last.position == Some(raw) && last.torque_limit == Some(torque_limit_nm) {
            return Ok(());
        }
        self.drive.demand_position(raw, torque_limit_nm)?;
        last.position = Some(raw);
        last.torque_limit = Some(torque_limit_nm);
        Ok(())
    }

    fn demand_torque(&self, torque_nm: f32) -> Result<()> {
        self.drive.demand_torque(torque_nm)
    }

    fn add_position_update_callback(&self, f: Box<dyn Fn(&PositionUpdate) + Send + Sync>) -> CallbackHandle {
        self.ensure_drive_subscribed();
        self.callbacks.add(move |u| f(u))
    }

    fn add_demand_update_callback(&self, f: Box<dyn Fn(&DemandUpdate) + Send + Sync>) -> CallbackHandle {
        self.demand_callbacks.add(move |u| f(u))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn joint(gain: f32, ref_gain: f32, ref_offset: f32) -> Arc<RelativeJoint> {
        let drive = Arc::new(ServoEngine::new(1, 21.0, 260.0));
        let reference = Arc::new(ServoEngine::new(2, 21.0, 260.0));
        RelativeJoint::new(drive, reference, gain, ref_gain, ref_offset)
    }

    #[test]
    fn raw_simple_round_trip_is_identity() {
        let j = joint(2.5, 1.0, 0.1);
        for raw in [-3.0_f32, -0.5, 0.0, 0.5, 3.0] {
            for ref_pos in [-1.0_f32, 0.0, 1.0] {
                let simple = j.raw2simple(raw, ref_pos);
                let back = j.simple2raw(simple, ref_pos).unwrap();
                assert!((back - raw).abs() < 1e-4);
            }
        }
    }

    #[test]
    fn zero_gain_is_rejected() {
        let j = joint(0.0, 1.0, 0.0);
        assert!(j.simple2raw(1.0, 0.0).is_err());
    }
}
