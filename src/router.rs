//! Routes inbound frames to the owning device engine and steers outgoing
//! frames to the transport currently bound to a device id.

use crate::device::ServoEngine;
use crate::error::Result;
use crate::packet::Packet;
use crate::transport::Transport;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Maps device ids to their owning transport and engine, and resolves
/// newly-announced devices to stable ids.
pub struct Router {
    inner: Mutex<RouterState>,
}

struct RouterState {
    devices: HashMap<u8, Arc<ServoEngine>>,
    transports: HashMap<u8, Arc<dyn Transport>>,
    broadcast: Vec<Arc<dyn Transport>>,
    dropped_unknown: u64,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        Router {
            inner: Mutex::new(RouterState {
                devices: HashMap::new(),
                transports: HashMap::new(),
                broadcast: Vec::new(),
                dropped_unknown: 0,
            }),
        }
    }

    /// Register a transport as a broadcast target (e.g. for `SetDeviceId`,
    /// `Sync`, `EmergencyStop`).
    pub fn add_transport(&self, transport: Arc<dyn Transport>) {
        self.inner.lock().unwrap().broadcast.push(transport);
    }

    /// Bind `device_id` to a specific transport, overriding broadcast routing
    /// for outgoing frames that carry that device id.
    pub fn bind_device_transport(&self, device_id: u8, transport: Arc<dyn Transport>) {
        self.inner.lock().unwrap().transports.insert(device_id, transport);
    }

    pub fn register_engine(&self, device_id: u8, engine: Arc<ServoEngine>) {
        self.inner.lock().unwrap().devices.insert(device_id, engine);
    }

    pub fn engine(&self, device_id: u8) -> Option<Arc<ServoEngine>> {
        self.inner.lock().unwrap().devices.get(&device_id).cloned()
    }

    pub fn remove_engine(&self, device_id: u8) -> Option<Arc<ServoEngine>> {
        let mut state = self.inner.lock().unwrap();
        let engine = state.devices.remove(&device_id);
        state.transports.remove(&device_id);
        engine
    }

    pub fn engines(&self) -> Vec<Arc<ServoEngine>> {
        self.inner.lock().unwrap().devices.values().cloned().collect()
    }

    pub fn dropped_unknown_frames(&self) -> u64 {
        self.inner.lock().unwrap().dropped_unknown
    }

    /// Dispatch one decoded inbound frame.
    pub fn handle_inbound(&self, packet: Packet) {
        match packet {
            Packet::DeviceAnnounce { dev_id, uid0, uid1 } => self.handle_announce(dev_id, uid0, uid1),
            Packet::ServoReport { dev_id, .. } => self.dispatch_to(dev_id, &packet),
            Packet::ReportParam { dev_id, .. } => self.dispatch_to(dev_id, &packet),
            Packet::Pong { dev_id } => self.dispatch_to(dev_id, &packet),
            Packet::Error { dev_id, err_code, cause_type, err_data } => {
                log::error!("device {dev_id} reported error code={err_code} cause={cause_type} data={err_data}");
                self.dispatch_to(dev_id, &packet);
            }
            Packet::Sync => log::debug!("sync received"),
            Packet::Ping { .. } => {}
            other => log::debug!("unhandled inbound packet: {other:?}"),
        }
    }

    fn dispatch_to(&self, dev_id: u8, packet: &Packet) {
        let engine = self.inner.lock().unwrap().devices.get(&dev_id).cloned();
        match engine {
            Some(engine) => engine.handle_packet(packet),
            None => {
                self.inner.lock().unwrap().dropped_unknown += 1;
                log::debug!("dropped frame for unknown device {dev_id}");
            }
        }
    }

    fn handle_announce(&self, dev_id: u8, uid0: u32, uid1: u32) {
        let mut state = self.inner.lock().unwrap();
        if dev_id == 0 {
            let used: std::collections::HashSet<u8> = state.devices.keys().copied().collect();
            let new_id = (1..=254u8).find(|id| !used.contains(id));
            match new_id {
                Some(new_id) => {
                    log::info!("assigning device id {new_id} to uid ({uid0:#x}, {uid1:#x})");
                    drop(state);
                    self.send_broadcast(&Packet::SetDeviceId { new_id, uid0, uid1 });
                }
                None => log::error!("device id space exhausted, cannot assign uid ({uid0:#x}, {uid1:#x})"),
            }
            return;
        }
        if let Some(existing) = state.devices.get(&dev_id) {
            existing.rebind_uid(uid0, uid1);
        } else {
            log::debug!("announce for device {dev_id} with no registered engine yet");
        }
    }

    fn send_broadcast(&self, packet: &Packet) {
        let targets = self.inner.lock().unwrap().broadcast.clone();
        for t in targets {
            if let Err(e) = t.send_packet(packet) {
                log::warn!("broadcast send failed: {e}");
            }
        }
    }

    /// Send an outgoing frame, steering it to the transport bound to its
    /// device id, or broadcasting it if it carries none.
    pub fn send(&self, packet: &Packet) -> Result<()> {
        let state = self.inner.lock().unwrap();
        if let Some(dev_id) = packet.dev_id() {
            if let Some(t) = state.transports.get(&dev_id) {
                let t = t.clone();
                drop(state);
                return t.send_packet(packet);
            }
        }
        let targets = state.broadcast.clone();
        drop(state);
        for t in targets {
            t.send_packet(packet)?;
        }
        Ok(())
    }
}
