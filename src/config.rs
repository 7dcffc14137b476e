//! JSON configuration persistence for devices and joints.
//!
//! Loading walks the device array first, so joint records can resolve
//! `jointDrive`/`jointRef` by name against devices already constructed,
//! then walks the joint array. A joint naming a device or joint that does
//! not exist is a [`DogBotError::Config`]. This module has no wire-protocol
//! dependency and can validate a configuration file offline.

use crate::error::{DogBotError, Result};
use serde::{Deserialize, Serialize};

/// The 18x3 hall-sensor calibration table plus motor electrical parameters,
/// persisted under a device's `setup` key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MotorCalibration {
    #[serde(default = "default_encoder_cal")]
    pub encoder_cal: Vec<[u16; 3]>,
    #[serde(default)]
    pub motor_inductance: f32,
    #[serde(default)]
    pub motor_resistance: f32,
    #[serde(default)]
    pub current_limit: f32,
    #[serde(default)]
    pub motor_i_gain: f32,
    #[serde(default)]
    pub velocity_p_gain: f32,
    #[serde(default)]
    pub velocity_i_gain: f32,
    #[serde(default)]
    pub position_gain: f32,
}

fn default_encoder_cal() -> Vec<[u16; 3]> {
    vec![[0, 0, 0]; 18]
}

impl Default for MotorCalibration {
    fn default() -> Self {
        MotorCalibration {
            encoder_cal: default_encoder_cal(),
            motor_inductance: 0.0,
            motor_resistance: 0.0,
            current_limit: 20.0,
            motor_i_gain: 0.0,
            velocity_p_gain: 0.0,
            velocity_i_gain: 0.0,
            position_gain: 0.0,
        }
    }
}

/// One persisted device record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub name: String,
    pub uid1: u32,
    pub uid2: u32,
    #[serde(rename = "deviceId")]
    pub device_id: u8,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(rename = "motorKv", default = "default_motor_kv")]
    pub motor_kv: f32,
    #[serde(rename = "gearRatio", default = "default_gear_ratio")]
    pub gear_ratio: f32,
    #[serde(rename = "homeOffset", default)]
    pub home_offset: f32,
    #[serde(rename = "endStopStart", default)]
    pub end_stop_start: f32,
    #[serde(rename = "endStopFinal", default)]
    pub end_stop_final: f32,
    #[serde(rename = "endStopEnable", default)]
    pub end_stop_enable: bool,
    #[serde(rename = "safetyMode", default)]
    pub safety_mode: u8,
    #[serde(default)]
    pub setup: Option<MotorCalibration>,
}

fn default_true() -> bool {
    true
}
fn default_motor_kv() -> f32 {
    260.0
}
fn default_gear_ratio() -> f32 {
    21.0
}

/// One persisted joint record: either a direct 1:1 wrapper around a device,
/// or a relative joint derived from a drive device and a reference joint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JointRecord {
    Relative {
        name: String,
        #[serde(rename = "jointDrive")]
        joint_drive: String,
        #[serde(rename = "jointRef")]
        joint_ref: String,
        #[serde(rename = "refGain", default = "default_ref_gain")]
        ref_gain: f32,
        #[serde(rename = "refOffset", default)]
        ref_offset: f32,
        #[serde(default = "default_gain")]
        gain: f32,
    },
    Direct {
        name: String,
        device: String,
    },
}

fn default_ref_gain() -> f32 {
    1.0
}
fn default_gain() -> f32 {
    1.0
}

/// Root configuration document.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub devices: Vec<DeviceRecord>,
    #[serde(default)]
    pub joints: Vec<JointRecord>,
}

impl Config {
    pub fn from_json(text: &str) -> Result<Config> {
        let config: Config = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Checks that every joint's device/joint references resolve to a
    /// record earlier in the document, without constructing any runtime object.
    pub fn validate(&self) -> Result<()> {
        let device_names: std::collections::HashSet<&str> = self.devices.iter().map(|d| d.name.as_str()).collect();
        let mut joint_names: std::collections::HashSet<&str> = std::collections::HashSet::new();
        for joint in &self.joints {
            match joint {
                JointRecord::Direct { name, device } => {
                    if !device_names.contains(device.as_str()) {
                        return Err(DogBotError::Config(format!("joint '{name}' references unknown device '{device}'")));
                    }
                    joint_names.insert(name);
                }
                JointRecord::Relative { name, joint_drive, joint_ref, gain, .. } => {
                    if *gain == 0.0 {
                        return Err(DogBotError::Config(format!("joint '{name}' has zero gain")));
                    }
                    if !device_names.contains(joint_drive.as_str()) && !joint_names.contains(joint_drive.as_str()) {
                        return Err(DogBotError::Config(format!("joint '{name}' references unknown drive '{joint_drive}'")));
                    }
                    if !device_names.contains(joint_ref.as_str()) && !joint_names.contains(joint_ref.as_str()) {
                        return Err(DogBotError::Config(format!("joint '{name}' references unknown reference '{joint_ref}'")));
                    }
                    joint_names.insert(name);
                }
            }
        }
        Ok(())
    }
}

/// Process-level knobs independent of the per-device JSON table, mirroring
/// the teacher crate's builder-style `ServoConfig`/`CommConfig`.
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    pub monitor_tick_hz: f32,
    pub default_coms_timeout_ms: u64,
    pub bootloader_query_count: usize,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        ProcessConfig {
            monitor_tick_hz: 100.0,
            default_coms_timeout_ms: 500,
            bootloader_query_count: 4,
        }
    }
}

impl ProcessConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_monitor_tick_hz(mut self, hz: f32) -> Self {
        self.monitor_tick_hz = hz;
        self
    }

    pub fn with_default_coms_timeout_ms(mut self, ms: u64) -> Self {
        self.default_coms_timeout_ms = ms;
        self
    }

    pub fn with_bootloader_query_count(mut self, count: usize) -> Self {
        self.bootloader_query_count = count;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> &'static str {
        r#"{
            "devices": [
                {"name": "hip", "uid1": 1, "uid2": 2, "deviceId": 1, "motorKv": 260, "gearRatio": 21},
                {"name": "knee", "uid1": 3, "uid2": 4, "deviceId": 2, "motorKv": 260, "gearRatio": 21}
            ],
            "joints": [
                {"name": "knee_rel", "jointDrive": "knee", "jointRef": "hip", "refGain": 1.0, "refOffset": 0.0, "gain": 1.0}
            ]
        }"#
    }

    #[test]
    fn round_trips_through_json() {
        let config = Config::from_json(fixture()).unwrap();
        let text = config.to_json().unwrap();
        let reloaded = Config::from_json(&text).unwrap();
        assert_eq!(config.devices.len(), reloaded.devices.len());
        assert_eq!(config.joints.len(), reloaded.joints.len());
    }

    #[test]
    fn unknown_reference_is_config_error() {
        let bad = r#"{
            "devices": [{"name": "hip", "uid1": 1, "uid2": 2, "deviceId": 1}],
            "joints": [{"name": "x", "jointDrive": "missing", "jointRef": "hip", "gain": 1.0}]
        }"#;
        assert!(matches!(Config::from_json(bad), Err(DogBotError::Config(_))));
    }
}
