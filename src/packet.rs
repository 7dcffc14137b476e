//! Wire packet codec.
//!
//! Defines the closed set of packet types and parameter indices exchanged
//! with a driver board, and the fixed-point encodings used on the wire.
//! All multi-byte fields are little-endian. A packet whose length does not
//! match its declared type is rejected with [`DogBotError::Protocol`].

use crate::error::{DogBotError, Result};
use std::f32::consts::PI;

/// Maximum size of a single wire frame.
pub const MAX_PACKET_LEN: usize = 64;

/// `int16` scale for a `Servo` command in Position mode: `65535 / (4*pi)`.
pub const POSITION_SCALE: f32 = 65535.0 / (4.0 * PI);
/// `int16` scale for a `Servo` command in Velocity mode: `32767 / (4*pi)`.
pub const VELOCITY_SCALE: f32 = 32767.0 / (4.0 * PI);
/// `int16` scale for a `Servo` command in Torque mode: `32767 / 10`.
pub const TORQUE_SCALE: f32 = 32767.0 / 10.0;
/// `uint16` scale for the `torqueLimit` field: `65535 / 10`.
pub const TORQUE_LIMIT_SCALE: f32 = 65535.0 / 10.0;

/// Nominal interval between `ServoReport` frames.
pub const TICK_DURATION_SECS: f32 = 0.01;

/// Closed-loop control mode encoded in a `Servo` command's `mode` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ControlMode {
    #[default]
    Position = 0,
    Velocity = 1,
    Torque = 2,
}

/// Position-reference bits carried in a `ServoReport`'s `mode` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum PositionReference {
    #[default]
    Relative = 0,
    Absolute = 1,
    GlobalUnknown = 2,
    LocalUnknown = 3,
}

impl From<u8> for PositionReference {
    fn from(v: u8) -> Self {
        match v & 0x3 {
            0 => PositionReference::Relative,
            1 => PositionReference::Absolute,
            2 => PositionReference::GlobalUnknown,
            _ => PositionReference::LocalUnknown,
        }
    }
}

/// Device-level operating state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ControlState {
    #[default]
    Ready = 0,
    Diagnostic = 1,
    FactoryCalibrate = 2,
    LowPower = 3,
    BootLoader = 4,
    EmergencyStop = 5,
    Unknown = 0xff,
}

impl From<u8> for ControlState {
    fn from(v: u8) -> Self {
        match v {
            0 => ControlState::Ready,
            1 => ControlState::Diagnostic,
            2 => ControlState::FactoryCalibrate,
            3 => ControlState::LowPower,
            4 => ControlState::BootLoader,
            5 => ControlState::EmergencyStop,
            _ => ControlState::Unknown,
        }
    }
}

/// Inner-loop PWM control dynamic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ControlDynamic {
    #[default]
    Off = 0,
    Position = 1,
    Velocity = 2,
    Torque = 3,
    Fault = 4,
}

impl From<u8> for ControlDynamic {
    fn from(v: u8) -> Self {
        match v {
            1 => ControlDynamic::Position,
            2 => ControlDynamic::Velocity,
            3 => ControlDynamic::Torque,
            4 => ControlDynamic::Fault,
            _ => ControlDynamic::Off,
        }
    }
}

/// Homing progress for a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum HomedState {
    #[default]
    Lost = 0,
    Homing = 1,
    Homed = 2,
}

/// Device-reported fault code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FaultCode {
    #[default]
    None,
    Unknown,
    InternalError,
    DriverFault,
    Calibration,
    Communication,
    NoSensor,
    OverTemperature,
    OverVoltage,
    UnderVoltage,
    OverCurrent,
    Other(u8),
}

impl From<u8> for FaultCode {
    fn from(v: u8) -> Self {
        match v {
            0 => FaultCode::None,
            1 => FaultCode::Unknown,
            2 => FaultCode::InternalError,
            3 => FaultCode::DriverFault,
            4 => FaultCode::Calibration,
            5 => FaultCode::Communication,
            6 => FaultCode::NoSensor,
            7 => FaultCode::OverTemperature,
            8 => FaultCode::OverVoltage,
            9 => FaultCode::UnderVoltage,
            10 => FaultCode::OverCurrent,
            other => FaultCode::Other(other),
        }
    }
}

/// Closed set of parameter indices carried by `QueryParam`/`SetParam`/`ReportParam`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ParameterIndex {
    FaultCode = 0,
    ControlState = 1,
    SafetyMode = 2,
    Indicator = 3,
    HomedState = 4,
    PositionReference = 5,
    PwmMode = 6,
    CalibrationOffset = 7,
    OtherJoint = 8,
    OtherJointOffset = 9,
    OtherJointGain = 10,
    MotorIGain = 11,
    VelocityPGain = 12,
    VelocityIGain = 13,
    VelocityLimit = 14,
    PositionGain = 15,
    HomeIndexPosition = 16,
    MaxCurrent = 17,
    EndStopEnable = 18,
    EndStopStart = 19,
    EndStopFinal = 20,
    DriveTemperature = 21,
    MotorTemperature = 22,
    SupplyVoltage = 23,
    IndexSensor = 24,
    UsbPacketDrops = 25,
    UsbPacketErrors = 26,
    FaultState = 27,
}

impl TryFrom<u16> for ParameterIndex {
    type Error = DogBotError;
    fn try_from(v: u16) -> Result<Self> {
        use ParameterIndex::*;
        Ok(match v {
            0 => FaultCode,
            1 => ControlState,
            2 => SafetyMode,
            3 => Indicator,
            4 => HomedState,
            5 => PositionReference,
            6 => PwmMode,
            7 => CalibrationOffset,
            8 => OtherJoint,
            9 => OtherJointOffset,
            10 => OtherJointGain,
            11 => MotorIGain,
            12 => VelocityPGain,
            13 => VelocityIGain,
            14 => VelocityLimit,
            15 => PositionGain,
            16 => HomeIndexPosition,
            17 => MaxCurrent,
            18 => EndStopEnable,
            19 => EndStopStart,
            20 => EndStopFinal,
            21 => DriveTemperature,
            22 => MotorTemperature,
            23 => SupplyVoltage,
            24 => IndexSensor,
            25 => UsbPacketDrops,
            26 => UsbPacketErrors,
            27 => FaultState,
            other => return Err(DogBotError::Protocol(format!("unknown parameter index {other}"))),
        })
    }
}

/// The first four parameters refreshed while a device is in `BootLoader` state.
pub const BOOTLOADER_QUERY_COUNT: usize = 4;

/// Decoded representation of a wire frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Ping { dev_id: u8 },
    Pong { dev_id: u8 },
    Sync,
    Error { dev_id: u8, err_code: u8, cause_type: u8, err_data: u8 },
    QueryParam { dev_id: u8, param: u16 },
    SetParam { dev_id: u8, param: u16, payload: Vec<u8> },
    ReportParam { dev_id: u8, param: u16, payload: Vec<u8> },
    Servo { dev_id: u8, position: i16, torque_limit: u16, mode: u8 },
    ServoReport { dev_id: u8, position: i16, torque: i16, mode: u8, timestamp: u8 },
    SetDeviceId { new_id: u8, uid0: u32, uid1: u32 },
    DeviceAnnounce { dev_id: u8, uid0: u32, uid1: u32 },
    CalZero { dev_id: u8 },
    BridgeMode { enable: bool },
    EmergencyStop,
}

#[repr(u8)]
enum Tag {
    Ping = 1,
    Pong = 2,
    Sync = 3,
    Error = 4,
    QueryParam = 5,
    SetParam = 6,
    ReportParam = 7,
    Servo = 8,
    ServoReport = 9,
    SetDeviceId = 10,
    DeviceAnnounce = 11,
    CalZero = 12,
    BridgeMode = 13,
    EmergencyStop = 14,
}

impl Packet {
    /// Device id this packet carries, if any. Used by the router to steer outgoing frames.
    pub fn dev_id(&self) -> Option<u8> {
        match self {
            Packet::Ping { dev_id }
            | Packet::Pong { dev_id }
            | Packet::Error { dev_id, .. }
            | Packet::QueryParam { dev_id, .. }
            | Packet::SetParam { dev_id, .. }
            | Packet::ReportParam { dev_id, .. }
            | Packet::Servo { dev_id, .. }
            | Packet::ServoReport { dev_id, .. }
            | Packet::DeviceAnnounce { dev_id, .. }
            | Packet::CalZero { dev_id } => Some(*dev_id),
            Packet::Sync | Packet::BridgeMode { .. } | Packet::EmergencyStop => None,
            Packet::SetDeviceId { .. } => None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(MAX_PACKET_LEN);
        match self {
            Packet::Ping { dev_id } => {
                buf.push(Tag::Ping as u8);
                buf.push(*dev_id);
            }
            Packet::Pong { dev_id } => {
                buf.push(Tag::Pong as u8);
                buf.push(*dev_id);
            }
            Packet::Sync => {
                buf.push(Tag::Sync as u8);
            }
            Packet::Error { dev_id, err_code, cause_type, err_data } => {
                buf.push(Tag::Error as u8);
                buf.push(*dev_id);
                buf.push(*err_code);
                buf.push(*cause_type);
                buf.push(*err_data);
            }
            Packet::QueryParam { dev_id, param } => {
                buf.push(Tag::QueryParam as u8);
                buf.push(*dev_id);
                buf.extend_from_slice(&param.to_le_bytes());
            }
            Packet::SetParam { dev_id, param, payload } => {
                if payload.len() > 8 {
                    return Err(DogBotError::Protocol("SetParam payload too long".into()));
                }
                buf.push(Tag::SetParam as u8);
                buf.push(*dev_id);
                buf.extend_from_slice(&param.to_le_bytes());
                buf.extend_from_slice(payload);
            }
            Packet::ReportParam { dev_id, param, payload } => {
                if payload.len() > 8 {
                    return Err(DogBotError::Protocol("ReportParam payload too long".into()));
                }
                buf.push(Tag::ReportParam as u8);
                buf.push(*dev_id);
                buf.extend_from_slice(&param.to_le_bytes());
                buf.extend_from_slice(payload);
            }
            Packet::Servo { dev_id, position, torque_limit, mode } => {
                buf.push(Tag::Servo as u8);
                buf.push(*dev_id);
                buf.extend_from_slice(&position.to_le_bytes());
                buf.extend_from_slice(&torque_limit.to_le_bytes());
                buf.push(*mode);
            }
            Packet::ServoReport { dev_id, position, torque, mode, timestamp } => {
                buf.push(Tag::ServoReport as u8);
                buf.push(*dev_id);
                buf.extend_from_slice(&position.to_le_bytes());
                buf.extend_from_slice(&torque.to_le_bytes());
                buf.push(*mode);
                buf.push(*timestamp);
            }
            Packet::SetDeviceId { new_id, uid0, uid1 } => {
                buf.push(Tag::SetDeviceId as u8);
                buf.push(*new_id);
                buf.extend_from_slice(&uid0.to_le_bytes());
                buf.extend_from_slice(&uid1.to_le_bytes());
            }
            Packet::DeviceAnnounce { dev_id, uid0, uid1 } => {
                buf.push(Tag::DeviceAnnounce as u8);
                buf.push(*dev_id);
                buf.extend_from_slice(&uid0.to_le_bytes());
                buf.extend_from_slice(&uid1.to_le_bytes());
            }
            Packet::CalZero { dev_id } => {
                buf.push(Tag::CalZero as u8);
                buf.push(*dev_id);
            }
            Packet::BridgeMode { enable } => {
                buf.push(Tag::BridgeMode as u8);
                buf.push(*enable as u8);
            }
            Packet::EmergencyStop => {
                buf.push(Tag::EmergencyStop as u8);
            }
        }
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Packet> {
        if buf.is_empty() {
            return Err(DogBotError::Protocol("empty frame".into()));
        }
        let tag = buf[0];
        let rest = &buf[1..];
        match tag {
            t if t == Tag::Ping as u8 => {
                expect_len(rest, 1, "Ping")?;
                Ok(Packet::Ping { dev_id: rest[0] })
            }
            t if t == Tag::Pong as u8 => {
                expect_len(rest, 1, "Pong")?;
                Ok(Packet::Pong { dev_id: rest[0] })
            }
            t if t == Tag::Sync as u8 => {
                expect_len(rest, 0, "Sync")?;
                Ok(Packet::Sync)
            }
            t if t == Tag::Error as u8 => {
                expect_len(rest, 4, "Error")?;
                Ok(Packet::Error { dev_id: rest[0], err_code: rest[1], cause_type: rest[2], err_data: rest[3] })
            }
            t if t == Tag::QueryParam as u8 => {
                expect_len(rest, 3, "QueryParam")?;
                Ok(Packet::QueryParam { dev_id: rest[0], param: u16::from_le_bytes([rest[1], rest[2]]) })
            }
            t if t == Tag::SetParam as u8 => {
                if rest.len() < 3 || rest.len() > 11 {
                    return Err(DogBotError::Protocol("SetParam length out of range".into()));
                }
                Ok(Packet::SetParam {
                    dev_id: rest[0],
                    param: u16::from_le_bytes([rest[1], rest[2]]),
                    payload: rest[3..].to_vec(),
                })
            }
            t if t == Tag::ReportParam as u8 => {
                if rest.len() < 3 || rest.len() > 11 {
                    return Err(DogBotError::Protocol("ReportParam length out of range".into()));
                }
                Ok(Packet::ReportParam {
                    dev_id: rest[0],
                    param: u16::from_le_bytes([rest[1], rest[2]]),
                    payload: rest[3..].to_vec(),
                })
            }
            t if t == Tag::Servo as u8 => {
                expect_len(rest, 6, "Servo")?;
                Ok(Packet::Servo {
                    dev_id: rest[0],
                    position: i16::from_le_bytes([rest[1], rest[2]]),
                    torque_limit: u16::from_le_bytes([rest[3], rest[4]]),
                    mode: rest[5],
                })
            }
            t if t == Tag::ServoReport as u8 => {
                expect_len(rest, 7, "ServoReport")?;
                Ok(Packet::ServoReport {
                    dev_id: rest[0],
                    position: i16::from_le_bytes([rest[1], rest[2]]),
                    torque: i16::from_le_bytes([rest[3], rest[4]]),
                    mode: rest[5],
                    timestamp: rest[6],
                })
            }
            t if t == Tag::SetDeviceId as u8 => {
                expect_len(rest, 9, "SetDeviceId")?;
                Ok(Packet::SetDeviceId {
                    new_id: rest[0],
                    uid0: u32::from_le_bytes([rest[1], rest[2], rest[3], rest[4]]),
                    uid1: u32::from_le_bytes([rest[5], rest[6], rest[7], rest[8]]),
                })
            }
            t if t == Tag::DeviceAnnounce as u8 => {
                expect_len(rest, 9, "DeviceAnnounce")?;
                Ok(Packet::DeviceAnnounce {
                    dev_id: rest[0],
                    uid0: u32::from_le_bytes([rest[1], rest[2], rest[3], rest[4]]),
                    uid1: u32::from_le_bytes([rest[5], rest[6], rest[7], rest[8]]),
                })
            }
            t if t == Tag::CalZero as u8 => {
                expect_len(rest, 1, "CalZero")?;
                Ok(Packet::CalZero { dev_id: rest[0] })
            }
            t if t == Tag::BridgeMode as u8 => {
                expect_len(rest, 1, "BridgeMode")?;
                Ok(Packet::BridgeMode { enable: rest[0] != 0 })
            }
            t if t == Tag::EmergencyStop as u8 => {
                expect_len(rest, 0, "EmergencyStop")?;
                Ok(Packet::EmergencyStop)
            }
            other => Err(DogBotError::Protocol(format!("unknown packet tag {other}"))),
        }
    }
}

fn expect_len(rest: &[u8], expected: usize, name: &str) -> Result<()> {
    if rest.len() != expected {
        return Err(DogBotError::Protocol(format!(
            "{name} expected {expected} payload bytes, got {}",
            rest.len()
        )));
    }
    Ok(())
}

/// Build a `Servo` command from an engineering-unit position demand.
pub fn encode_position_command(dev_id: u8, radians: f32, torque_limit_nm: f32, pos_ref: PositionReference) -> Packet {
    let position = (radians * POSITION_SCALE).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16;
    let torque_limit = (torque_limit_nm.clamp(0.0, 10.0) * TORQUE_LIMIT_SCALE).round() as u16;
    let mode = (pos_ref as u8) | ((ControlMode::Position as u8) << 2);
    Packet::Servo { dev_id, position, torque_limit, mode }
}

/// Build a `Servo` command from a velocity demand (no position-reference bits set).
pub fn encode_velocity_command(dev_id: u8, radians_per_sec: f32, torque_limit_nm: f32) -> Packet {
    let position = (radians_per_sec * VELOCITY_SCALE).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16;
    let torque_limit = (torque_limit_nm.clamp(0.0, 10.0) * TORQUE_LIMIT_SCALE).round() as u16;
    let mode = (ControlMode::Velocity as u8) << 2;
    Packet::Servo { dev_id, position, torque_limit, mode }
}

/// Build a `Servo` command from a torque demand in N*m, saturated to +-10 N*m.
pub fn encode_torque_command(dev_id: u8, torque_nm: f32) -> Packet {
    let torque = torque_nm.clamp(-10.0, 10.0);
    let position = (torque * TORQUE_SCALE).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16;
    let mode = (ControlMode::Torque as u8) << 2;
    Packet::Servo { dev_id, position, torque_limit: 0, mode }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn servo_command_round_trips() {
        for raw_pos in [-4.0_f32, -1.0, 0.0, 1.5, 4.0] {
            let pkt = encode_position_command(3, raw_pos, 5.0, PositionReference::Absolute);
            let encoded = pkt.encode().unwrap();
            let decoded = Packet::decode(&encoded).unwrap();
            if let Packet::Servo { position, torque_limit, mode, .. } = decoded {
                let back = position as f32 / POSITION_SCALE;
                assert!((back - raw_pos).abs() < 4.0 * PI / 65535.0 * 2.0);
                assert_eq!(torque_limit, (5.0_f32 * TORQUE_LIMIT_SCALE).round() as u16);
                assert_eq!(mode & 0x3, PositionReference::Absolute as u8);
            } else {
                panic!("wrong variant");
            }
        }
    }

    #[test]
    fn rejects_wrong_length() {
        let buf = vec![Tag::Ping as u8, 1, 2, 3];
        let err = Packet::decode(&buf).unwrap_err();
        assert!(matches!(err, DogBotError::Protocol(_)));
    }

    #[test]
    fn parameter_index_round_trips() {
        for raw in 0u16..=27 {
            let idx = ParameterIndex::try_from(raw).unwrap();
            assert_eq!(idx as u16, raw);
        }
        assert!(ParameterIndex::try_from(9999).is_err());
    }
}
