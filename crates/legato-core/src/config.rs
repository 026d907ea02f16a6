use crate::{
    axis::{Axis, AxisConfig, AxisLimits, AxisPatch},
    bed_compensation::BedCompensationMatrix,
    kinematics::{
        BeltKin, BeltMatrix, CartesianKin, DeltaGeometry, DeltaKin, KinematicMode,
        KinematicsError, MachineKinematics,
    },
    machine::Machine,
    step_channel::ChannelConfig,
};
use serde::{Deserialize, Serialize};
use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("axis {axis}: {field} must be a positive finite number, got {value}")]
    InvalidAxisValue {
        axis: Axis,
        field: &'static str,
        value: f64,
    },
    #[error("axis {axis}: min_speed {min} is above max_speed {max}")]
    MinAboveMax { axis: Axis, min: f64, max: f64 },
    #[error("axis {axis}: soft_min {min} is above soft_max {max}")]
    TravelInverted { axis: Axis, min: f64, max: f64 },
    #[error("failed to read config file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config as TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("failed to parse config as JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Kinematics(#[from] KinematicsError),
    #[error("{0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Complete machine description
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MachineConfig {
    #[serde(default)]
    pub axes: AxesConfig,

    #[serde(default)]
    pub kinematics: KinematicMode,

    /// Used when `kinematics = "belt_xy"`
    #[serde(default)]
    pub belt: BeltMatrix,

    /// Used when `kinematics = "delta"`
    #[serde(default)]
    pub delta: DeltaGeometry,

    /// Bed surface coefficients, see [`BedCompensationMatrix`]
    #[serde(default)]
    pub bed: BedCompensationMatrix,

    #[serde(default)]
    pub planner: PlannerConfig,

    #[serde(default)]
    pub channel: ChannelConfig,
}

/// Limits for each axis, keyed by lowercase axis letter. A table only
/// overrides the fields it names; the rest keep that axis' defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "AxesPatch")]
pub struct AxesConfig {
    pub x: AxisLimits,
    pub y: AxisLimits,
    pub z: AxisLimits,
    pub e: AxisLimits,
    pub h: AxisLimits,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct AxesPatch {
    #[serde(default)]
    x: AxisPatch,
    #[serde(default)]
    y: AxisPatch,
    #[serde(default)]
    z: AxisPatch,
    #[serde(default)]
    e: AxisPatch,
    #[serde(default)]
    h: AxisPatch,
}

impl From<AxesPatch> for AxesConfig {
    fn from(patch: AxesPatch) -> Self {
        let defaults = Self::default();
        Self {
            x: defaults.x.patched(patch.x),
            y: defaults.y.patched(patch.y),
            z: defaults.z.patched(patch.z),
            e: defaults.e.patched(patch.e),
            h: defaults.h.patched(patch.h),
        }
    }
}

impl Default for AxesConfig {
    fn default() -> Self {
        Self {
            x: AxisLimits::default(),
            y: AxisLimits::default(),
            z: AxisLimits::default_z(),
            e: AxisLimits::default_extruder(),
            h: AxisLimits::default_extruder(),
        }
    }
}

impl AxesConfig {
    pub fn to_array(&self) -> [AxisLimits; 5] {
        [self.x, self.y, self.z, self.e, self.h]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlannerConfig {
    /// Lookahead depth: paths held before `add_path` blocks
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// How long the feeder waits for a successor before planning the
    /// last queued path to a stop
    #[serde(default = "default_lookahead_timeout_ms")]
    pub lookahead_timeout_ms: u64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            lookahead_timeout_ms: default_lookahead_timeout_ms(),
        }
    }
}

impl PlannerConfig {
    pub fn lookahead_timeout(&self) -> Duration {
        Duration::from_millis(self.lookahead_timeout_ms)
    }
}

fn default_queue_capacity() -> usize {
    8
}

fn default_lookahead_timeout_ms() -> u64 {
    20
}

impl MachineConfig {
    /// Load configuration from a file, auto-detecting TOML or JSON format
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;

        match path.extension().and_then(|s| s.to_str()) {
            Some("toml") => Self::from_toml(&content),
            Some("json") => Self::from_json(&content),
            // TOML preferred, JSON as fallback
            _ => Self::from_toml(&content).or_else(|_| Self::from_json(&content)),
        }
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    pub fn validate(&self) -> Result<()> {
        AxisConfig::new(self.axes.to_array())?;
        self.build_kinematics()?;

        if !self.bed.0.iter().flatten().all(|c| c.is_finite()) {
            return Err(ConfigError::Invalid(
                "bed coefficients must be finite".into(),
            ));
        }
        if self.planner.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "planner.queue_capacity must be at least 1".into(),
            ));
        }

        let channel = &self.channel;
        if channel.ring_capacity < 2 || !channel.ring_capacity.is_power_of_two() {
            return Err(ConfigError::Invalid(format!(
                "channel.ring_capacity must be a power of two of at least 2, got {}",
                channel.ring_capacity
            )));
        }
        if !(channel.high_watermark > 0.0 && channel.high_watermark <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "channel.high_watermark must be in (0, 1], got {}",
                channel.high_watermark
            )));
        }
        if !(channel.clock_hz.is_finite() && channel.clock_hz > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "channel.clock_hz must be positive, got {}",
                channel.clock_hz
            )));
        }
        if channel.min_delay_ticks == 0 {
            return Err(ConfigError::Invalid(
                "channel.min_delay_ticks must be at least 1".into(),
            ));
        }
        Ok(())
    }

    fn build_kinematics(&self) -> Result<MachineKinematics> {
        Ok(match self.kinematics {
            KinematicMode::Cartesian => MachineKinematics::Cartesian(CartesianKin),
            KinematicMode::BeltXy => MachineKinematics::Belt(BeltKin::new(self.belt)?),
            KinematicMode::Delta => {
                let kin = DeltaKin::new(self.delta)?;
                let columns = self.delta.radius
                    - self.delta.effector_offset
                    - self.delta.carriage_offset;
                if self.delta.rod_length <= columns {
                    return Err(ConfigError::Invalid(format!(
                        "delta.rod_length {} must exceed the virtual column radius {columns}",
                        self.delta.rod_length
                    )));
                }
                MachineKinematics::Delta(kin)
            }
        })
    }

    /// Validate and assemble the machine description.
    pub fn build_machine(&self) -> Result<Machine> {
        self.validate()?;
        Ok(Machine {
            axes: AxisConfig::new(self.axes.to_array())?,
            kinematics: self.build_kinematics()?,
            bed: self.bed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_toml() {
        let toml = r#"
kinematics = "belt_xy"
belt = [[1.0, 1.0], [1.0, -1.0]]

[axes.x]
steps_per_meter = 80000.0
max_speed = 0.3

[axes.z]
jerk = 0.001
soft_min = 0.0
soft_max = 0.2

[axes.e]
backlash = 0.0001

[planner]
queue_capacity = 16

[channel]
ring_capacity = 1024
"#;

        let config = MachineConfig::from_toml(toml).unwrap();
        assert_eq!(config.kinematics, KinematicMode::BeltXy);
        assert_eq!(config.belt, BeltMatrix::COREXY);
        assert_eq!(config.axes.x.steps_per_meter, 80000.0);
        assert_eq!(config.axes.x.acceleration, 0.5);
        assert_eq!(config.axes.z.steps_per_meter, 2_133_333.0);
        assert_eq!(config.axes.z.max_speed, 0.02);
        assert_eq!(config.axes.z.jerk, 0.001);
        assert_eq!(config.axes.z.soft_min, Some(0.0));
        assert_eq!(config.axes.z.soft_max, Some(0.2));
        assert_eq!(config.axes.e.steps_per_meter, 535_000.0);
        assert_eq!(config.axes.e.backlash, 0.0001);
        assert_eq!(config.axes.h, AxisLimits::default_extruder());
        assert_eq!(config.axes.y, AxisLimits::default());
        assert_eq!(config.planner.queue_capacity, 16);
        assert_eq!(config.planner.lookahead_timeout_ms, 20);
        assert_eq!(config.channel.ring_capacity, 1024);
        assert_eq!(config.channel.high_watermark, 0.75);
        config.validate().unwrap();

        let machine = config.build_machine().unwrap();
        assert_eq!(machine.kinematics.mode(), KinematicMode::BeltXy);
    }

    #[test]
    fn test_parse_json() {
        let json = r#"{
            "kinematics": "delta",
            "delta": { "rod_length": 0.2, "radial_error": [0.001, 0.0, 0.0] },
            "bed": [[0.001, 0.0, 0.0], [0.01, 0.0, 0.0], [0.0, 0.0, 0.0]]
        }"#;

        let config = MachineConfig::from_json(json).unwrap();
        assert_eq!(config.kinematics, KinematicMode::Delta);
        assert_eq!(config.delta.rod_length, 0.2);
        assert_eq!(config.delta.radius, 0.144);
        assert_eq!(config.bed.0[1][0], 0.01);
        config.validate().unwrap();
    }

    #[test]
    fn test_from_file_detects_format() {
        let dir = tempfile::tempdir().unwrap();
        let toml_path = dir.path().join("machine.toml");
        fs::write(&toml_path, "[planner]\nqueue_capacity = 4\n").unwrap();
        assert_eq!(
            MachineConfig::from_file(&toml_path).unwrap().planner.queue_capacity,
            4
        );

        let untyped = dir.path().join("machine.conf");
        fs::write(&untyped, r#"{"planner": {"queue_capacity": 3}}"#).unwrap();
        assert_eq!(
            MachineConfig::from_file(&untyped).unwrap().planner.queue_capacity,
            3
        );

        assert!(matches!(
            MachineConfig::from_file(dir.path().join("missing.toml")),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn test_unknown_axis_field_is_rejected() {
        let toml = "[axes.x]\nsteps_per_metre = 80000.0\n";
        assert!(matches!(
            MachineConfig::from_toml(toml),
            Err(ConfigError::Toml(_))
        ));
    }

    #[test]
    fn test_serialized_config_reads_back() {
        let mut config = MachineConfig::default();
        config.axes.z.soft_max = Some(0.2);
        config.axes.y.backlash = 0.0002;
        let text = toml::to_string(&config).unwrap();
        assert_eq!(MachineConfig::from_toml(&text).unwrap(), config);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = MachineConfig::default();
        config.axes.y.max_speed = 0.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidAxisValue {
                axis: Axis::Y,
                field: "max_speed",
                ..
            })
        ));

        let mut config = MachineConfig::default();
        config.axes.x.min_speed = 1.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MinAboveMax { axis: Axis::X, .. })
        ));

        let mut config = MachineConfig::default();
        config.channel.high_watermark = 1.5;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = MachineConfig::default();
        config.channel.ring_capacity = 1000;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = MachineConfig::default();
        config.kinematics = KinematicMode::BeltXy;
        config.belt = BeltMatrix([[1.0, 2.0], [2.0, 4.0]]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Kinematics(
                KinematicsError::SingularBeltMatrix { .. }
            ))
        ));

        let mut config = MachineConfig::default();
        config.kinematics = KinematicMode::Delta;
        config.delta.rod_length = 0.05;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
