//! End-to-end seed scenarios driven entirely over the loopback transport.

use dogbot_api::config::{Config, ProcessConfig};
use dogbot_api::device::ServoEngine;
use dogbot_api::facade::{DeviceStatusKind, DogBotApi};
use dogbot_api::homing::{HomingCoordinator, HomingOutcome};
use dogbot_api::joint::{Joint, RelativeJoint};
use dogbot_api::packet::{self, Packet, PositionReference};
use dogbot_api::router::Router;
use dogbot_api::transport::{LoopbackTransport, Transport};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn absolute_report(dev_id: u8, position_rad: f32, timestamp: u8) -> Packet {
    let raw = (position_rad * packet::POSITION_SCALE).round() as i16;
    Packet::ServoReport { dev_id, position: raw, torque: 0, mode: PositionReference::Absolute as u8, timestamp }
}

fn servo_report(dev_id: u8, position_rad: f32, mode: u8, timestamp: u8) -> Packet {
    let raw = (position_rad * packet::POSITION_SCALE).round() as i16;
    Packet::ServoReport { dev_id, position: raw, torque: 0, mode, timestamp }
}

#[test]
fn cold_plug_announce_assigns_device_id() {
    let router = Router::new();
    let (loopback, _rx) = LoopbackTransport::new();
    let transport: Arc<dyn Transport> = loopback.clone();
    router.add_transport(transport);

    router.handle_inbound(Packet::DeviceAnnounce { dev_id: 0, uid0: 0x1111, uid1: 0x2222 });

    let sent = loopback.sent();
    assert_eq!(sent.len(), 1);
    match &sent[0] {
        Packet::SetDeviceId { new_id, uid0, uid1 } => {
            assert_eq!(*new_id, 1);
            assert_eq!(*uid0, 0x1111);
            assert_eq!(*uid1, 0x2222);
        }
        other => panic!("unexpected packet: {other:?}"),
    }
}

#[test]
fn report_updates_extrapolated_state() {
    let engine = Arc::new(ServoEngine::new(1, 21.0, 260.0));
    let (loopback, _rx) = LoopbackTransport::new();
    let transport: Arc<dyn Transport> = loopback;
    engine.bind_transport(Arc::downgrade(&transport));

    engine.handle_packet(&absolute_report(1, 0.0, 10));
    engine.handle_packet(&absolute_report(1, 0.01, 11));

    let (_, position, velocity, torque) = engine.get_state().unwrap();
    assert!((position - 0.01).abs() < 1e-3);
    assert!((velocity - 1.0).abs() < 0.5);
    assert_eq!(torque, 0.0);
}

#[test]
fn torque_demand_round_trip() {
    let engine = Arc::new(ServoEngine::new(1, 21.0, 260.0));
    let (loopback, _rx) = LoopbackTransport::new();
    let transport: Arc<dyn Transport> = loopback.clone();
    engine.bind_transport(Arc::downgrade(&transport));

    engine.demand_torque(2.5).unwrap();

    let sent = loopback.sent();
    assert_eq!(sent.len(), 1);
    if let Packet::Servo { torque_limit: _, position, mode, .. } = sent[0] {
        assert_eq!(mode >> 2, 2); // ControlMode::Torque
        let servo_kt = (60.0 * 21.0) / (2.0 * std::f32::consts::PI * 260.0);
        let expected_current = 2.5 / servo_kt;
        let expected_wire = (expected_current * packet::TORQUE_SCALE).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16;
        assert_eq!(position, expected_wire);
    } else {
        panic!("expected Servo packet");
    }
}

#[test]
fn quiet_device_is_marked_lost_after_timeout() {
    let engine = Arc::new(ServoEngine::new(1, 21.0, 260.0));
    engine.handle_packet(&absolute_report(1, 0.0, 0));
    engine.update_tick(std::time::Instant::now() + Duration::from_millis(600));
    assert_eq!(engine.fault_code(), packet::FaultCode::Unknown);
}

#[test]
fn relative_joint_suppresses_duplicate_demands() {
    let drive = Arc::new(ServoEngine::new(1, 21.0, 260.0));
    let reference = Arc::new(ServoEngine::new(2, 21.0, 260.0));
    let (loopback, _rx) = LoopbackTransport::new();
    let transport: Arc<dyn Transport> = loopback.clone();
    drive.bind_transport(Arc::downgrade(&transport));
    reference.bind_transport(Arc::downgrade(&transport));

    drive.handle_packet(&absolute_report(1, 0.0, 0));
    reference.handle_packet(&absolute_report(2, 0.0, 0));
    reference.demand_position(0.0, 2.0).unwrap();

    let joint = RelativeJoint::new(drive.clone(), reference.clone(), 1.0, 1.0, 0.0);
    joint.demand_position(0.5, 2.0).unwrap();
    joint.demand_position(0.5, 2.0).unwrap();

    let sent = loopback.sent();
    let servo_commands: Vec<&Packet> = sent.iter().filter(|p| matches!(p, Packet::Servo { dev_id: 1, .. })).collect();
    assert_eq!(servo_commands.len(), 1);
}

#[test]
fn config_save_round_trips_loaded_devices_and_joints() {
    let config = Config::from_json(
        r#"{
            "devices": [
                {"name": "hip", "uid1": 1, "uid2": 2, "deviceId": 1, "motorKv": 260, "gearRatio": 21,
                 "homeOffset": 0.2, "endStopStart": -1.0, "endStopFinal": 1.0, "endStopEnable": true, "safetyMode": 2,
                 "setup": {"motor_resistance": 0.8}},
                {"name": "knee", "uid1": 3, "uid2": 4, "deviceId": 2, "motorKv": 260, "gearRatio": 21}
            ],
            "joints": [
                {"name": "knee_rel", "jointDrive": "knee", "jointRef": "hip", "refGain": 1.0, "refOffset": 0.0, "gain": 1.0}
            ]
        }"#,
    )
    .unwrap();

    let api = DogBotApi::new(ProcessConfig::new());
    api.load_config(&config).unwrap();

    let saved = api.save_config();
    assert_eq!(saved.devices.len(), 2);
    assert_eq!(saved.joints.len(), 1);
    let hip = saved.devices.iter().find(|d| d.name == "hip").unwrap();
    assert_eq!((hip.uid1, hip.uid2), (1, 2));
    assert_eq!(hip.device_id, 1);
    assert!((hip.home_offset - 0.2).abs() < 1e-6);
    assert!((hip.end_stop_start + 1.0).abs() < 1e-6);
    assert!((hip.end_stop_final - 1.0).abs() < 1e-6);
    assert!(hip.end_stop_enable);
    assert_eq!(hip.safety_mode, 2);
    assert!((hip.setup.as_ref().unwrap().motor_resistance - 0.8).abs() < 1e-6);

    saved.validate().unwrap();
    api.shutdown();
}

#[test]
fn homing_converges_on_circular_mean_offset() {
    let engine = Arc::new(ServoEngine::new(1, 21.0, 260.0));
    let (loopback, _rx) = LoopbackTransport::new();
    let transport: Arc<dyn Transport> = loopback.clone();
    engine.bind_transport(Arc::downgrade(&transport));

    engine.handle_packet(&servo_report(1, 0.0, PositionReference::Relative as u8, 0));

    let coordinator = HomingCoordinator::new(engine.clone());
    let homing_engine = engine.clone();
    let handle = std::thread::spawn(move || coordinator.home(false));

    std::thread::sleep(Duration::from_millis(20));

    // Rising edge into the index window while sweeping in the positive
    // direction; recorded transition position is 0.3443 - 28deg/2 = 0.10.
    homing_engine.handle_packet(&servo_report(1, 0.3443, PositionReference::Relative as u8 | 0x08, 1));
    // Rising edge into the index window on the reversed, negative sweep;
    // recorded transition position is -0.0243 + 28deg/2 = 0.22.
    homing_engine.handle_packet(&servo_report(1, -0.0243, PositionReference::Relative as u8 | 0x08, 2));
    // Device reports it has recovered an absolute position reference.
    homing_engine.handle_packet(&servo_report(1, 0.16, PositionReference::Absolute as u8, 3));

    let outcome = handle.join().unwrap().unwrap();
    match outcome {
        HomingOutcome::Homed { offset } => assert!((offset - 0.16).abs() < 0.01, "offset={offset}"),
        other => panic!("expected Homed outcome, got {other:?}"),
    }
}

#[test]
fn attached_transport_inbound_frames_reach_the_device() {
    let api = DogBotApi::new(ProcessConfig::new());
    let (loopback, rx) = LoopbackTransport::new();
    let transport: Arc<dyn Transport> = loopback.clone();
    api.attach_transport(transport, rx);
    let engine = api.add_device(1, 21.0, 260.0);

    loopback.inject(&absolute_report(1, 0.0, 0));
    loopback.inject(&absolute_report(1, 0.02, 1));

    let deadline = std::time::Instant::now() + Duration::from_secs(1);
    loop {
        if let Ok((_, position, _, _)) = engine.get_state() {
            if (position - 0.02).abs() < 1e-3 {
                break;
            }
        }
        assert!(std::time::Instant::now() < deadline, "inbound frame never reached the device");
        std::thread::sleep(Duration::from_millis(10));
    }
    api.shutdown();
}

#[test]
fn status_callback_fires_on_add_and_remove() {
    let api = DogBotApi::new(ProcessConfig::new());
    let seen: Arc<Mutex<Vec<DeviceStatusKind>>> = Arc::new(Mutex::new(Vec::new()));
    let seen_cb = seen.clone();
    api.add_status_callback(move |event| seen_cb.lock().unwrap().push(event.kind));

    api.add_device(1, 21.0, 260.0);
    api.remove_device(1);

    let kinds = seen.lock().unwrap().clone();
    assert_eq!(kinds, vec![DeviceStatusKind::Added, DeviceStatusKind::Removed]);
    api.shutdown();
}
