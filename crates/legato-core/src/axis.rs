// Machine axes and their physical limits

use crate::config::ConfigError;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt,
    ops::{Add, Index, IndexMut, Mul, Sub},
};

pub const NUM_AXES: usize = 5;

/// A commanded axis. The same indices name actuator slots after the
/// kinematic transform, so on a delta `X`, `Y` and `Z` stand for the
/// A, B and C columns once in actuator space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Axis {
    X,
    Y,
    Z,
    E,
    H,
}

impl Axis {
    pub const ALL: [Axis; NUM_AXES] = [Axis::X, Axis::Y, Axis::Z, Axis::E, Axis::H];

    /// Parse axis from string (case-insensitive)
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "x" => Some(Axis::X),
            "y" => Some(Axis::Y),
            "z" => Some(Axis::Z),
            "e" => Some(Axis::E),
            "h" => Some(Axis::H),
            _ => None,
        }
    }

    pub const fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub const fn letter(self) -> char {
        match self {
            Axis::X => 'X',
            Axis::Y => 'Y',
            Axis::Z => 'Z',
            Axis::E => 'E',
            Axis::H => 'H',
        }
    }

    /// Axes named by the set bits of a per-actuator bitmask.
    pub fn from_mask(mask: u32) -> Vec<Axis> {
        Self::ALL
            .into_iter()
            .filter(|axis| mask & (1 << axis.index()) != 0)
            .collect()
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}

/// Sparse per-axis values, as commands name them.
pub type AxisMap = BTreeMap<Axis, f64>;

/// Dense per-axis values in meters (or meters per second).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AxisVector(pub [f64; NUM_AXES]);

impl AxisVector {
    pub const ZERO: Self = Self([0.0; NUM_AXES]);

    pub fn norm(&self) -> f64 {
        self.0.iter().map(|v| v * v).sum::<f64>().sqrt()
    }

    pub fn scale(&self, factor: f64) -> Self {
        Self(self.0.map(|v| v * factor))
    }

    /// Overwrite the axes present in `map`, keeping the rest.
    pub fn overwrite(&self, map: &AxisMap) -> Self {
        let mut out = *self;
        for (axis, value) in map {
            out[*axis] = *value;
        }
        out
    }

    /// Dense vector with the axes of `map` set and the others zero.
    pub fn from_map(map: &AxisMap) -> Self {
        Self::ZERO.overwrite(map)
    }

    pub fn to_map(&self) -> AxisMap {
        Axis::ALL.into_iter().map(|axis| (axis, self[axis])).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Axis, f64)> + '_ {
        Axis::ALL.into_iter().map(|axis| (axis, self[axis]))
    }
}

impl Index<Axis> for AxisVector {
    type Output = f64;

    fn index(&self, axis: Axis) -> &f64 {
        &self.0[axis.index()]
    }
}

impl IndexMut<Axis> for AxisVector {
    fn index_mut(&mut self, axis: Axis) -> &mut f64 {
        &mut self.0[axis.index()]
    }
}

impl Add for AxisVector {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self(std::array::from_fn(|i| self.0[i] + rhs.0[i]))
    }
}

impl Sub for AxisVector {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self(std::array::from_fn(|i| self.0[i] - rhs.0[i]))
    }
}

impl Mul<f64> for AxisVector {
    type Output = Self;

    fn mul(self, rhs: f64) -> Self {
        self.scale(rhs)
    }
}

/// Physical limits of one axis. All values are SI (meters, seconds).
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AxisLimits {
    pub steps_per_meter: f64,
    pub max_speed: f64,
    pub min_speed: f64,
    pub acceleration: f64,
    /// Largest instantaneous velocity change allowed at a junction.
    pub jerk: f64,
    pub home_speed: f64,
    /// Distance covered searching for the endstop. Homing moves by the
    /// negated value.
    pub travel_length: f64,
    /// Position reported at the endstop is the negated offset.
    pub home_offset: f64,
    /// Soft travel limits in commanded coordinates. Unset means unbounded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub soft_min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub soft_max: Option<f64>,
    /// Slack taken up on every direction reversal of this actuator.
    pub backlash: f64,
}

impl Default for AxisLimits {
    fn default() -> Self {
        Self {
            steps_per_meter: 50_000.0,
            max_speed: 0.2,
            min_speed: 0.005,
            acceleration: 0.5,
            jerk: 0.02,
            home_speed: 0.1,
            travel_length: 0.2,
            home_offset: 0.0,
            soft_min: None,
            soft_max: None,
            backlash: 0.0,
        }
    }
}

impl AxisLimits {
    pub fn default_z() -> Self {
        Self {
            steps_per_meter: 2_133_333.0,
            max_speed: 0.02,
            min_speed: 0.001,
            acceleration: 0.1,
            jerk: 0.0003,
            home_speed: 0.01,
            ..Self::default()
        }
    }

    pub fn default_extruder() -> Self {
        Self {
            steps_per_meter: 535_000.0,
            max_speed: 0.2,
            acceleration: 3.0,
            jerk: 0.05,
            ..Self::default()
        }
    }

    /// Overlay the fields a config table names onto these limits.
    pub fn patched(self, patch: AxisPatch) -> Self {
        Self {
            steps_per_meter: patch.steps_per_meter.unwrap_or(self.steps_per_meter),
            max_speed: patch.max_speed.unwrap_or(self.max_speed),
            min_speed: patch.min_speed.unwrap_or(self.min_speed),
            acceleration: patch.acceleration.unwrap_or(self.acceleration),
            jerk: patch.jerk.unwrap_or(self.jerk),
            home_speed: patch.home_speed.unwrap_or(self.home_speed),
            travel_length: patch.travel_length.unwrap_or(self.travel_length),
            home_offset: patch.home_offset.unwrap_or(self.home_offset),
            soft_min: patch.soft_min.or(self.soft_min),
            soft_max: patch.soft_max.or(self.soft_max),
            backlash: patch.backlash.unwrap_or(self.backlash),
        }
    }

    pub fn validate(&self, axis: Axis) -> Result<(), ConfigError> {
        let positive = [
            ("steps_per_meter", self.steps_per_meter),
            ("max_speed", self.max_speed),
            ("acceleration", self.acceleration),
            ("jerk", self.jerk),
            ("home_speed", self.home_speed),
        ];
        for (field, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(ConfigError::InvalidAxisValue { axis, field, value });
            }
        }
        if !(self.min_speed.is_finite() && self.min_speed >= 0.0) {
            return Err(ConfigError::InvalidAxisValue {
                axis,
                field: "min_speed",
                value: self.min_speed,
            });
        }
        if self.min_speed > self.max_speed {
            return Err(ConfigError::MinAboveMax {
                axis,
                min: self.min_speed,
                max: self.max_speed,
            });
        }
        for (field, value) in [
            ("travel_length", self.travel_length),
            ("home_offset", self.home_offset),
        ] {
            if !value.is_finite() {
                return Err(ConfigError::InvalidAxisValue { axis, field, value });
            }
        }
        if !(self.backlash.is_finite() && self.backlash >= 0.0) {
            return Err(ConfigError::InvalidAxisValue {
                axis,
                field: "backlash",
                value: self.backlash,
            });
        }
        for (field, bound) in [("soft_min", self.soft_min), ("soft_max", self.soft_max)] {
            if let Some(value) = bound.filter(|v| !v.is_finite()) {
                return Err(ConfigError::InvalidAxisValue { axis, field, value });
            }
        }
        if let (Some(min), Some(max)) = (self.soft_min, self.soft_max) {
            if min > max {
                return Err(ConfigError::TravelInverted { axis, min, max });
            }
        }
        Ok(())
    }
}

/// The fields of [`AxisLimits`] a config table sets. Absent fields keep
/// the axis' own defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AxisPatch {
    pub steps_per_meter: Option<f64>,
    pub max_speed: Option<f64>,
    pub min_speed: Option<f64>,
    pub acceleration: Option<f64>,
    pub jerk: Option<f64>,
    pub home_speed: Option<f64>,
    pub travel_length: Option<f64>,
    pub home_offset: Option<f64>,
    pub soft_min: Option<f64>,
    pub soft_max: Option<f64>,
    pub backlash: Option<f64>,
}

/// Per-axis limits for the whole machine.
#[derive(Debug, Clone, PartialEq)]
pub struct AxisConfig {
    limits: [AxisLimits; NUM_AXES],
}

impl Default for AxisConfig {
    fn default() -> Self {
        let mut limits = [AxisLimits::default(); NUM_AXES];
        limits[Axis::Z.index()] = AxisLimits::default_z();
        limits[Axis::E.index()] = AxisLimits::default_extruder();
        limits[Axis::H.index()] = AxisLimits::default_extruder();
        Self { limits }
    }
}

impl AxisConfig {
    pub fn new(limits: [AxisLimits; NUM_AXES]) -> Result<Self, ConfigError> {
        for axis in Axis::ALL {
            limits[axis.index()].validate(axis)?;
        }
        Ok(Self { limits })
    }

    pub fn limits(&self, axis: Axis) -> &AxisLimits {
        &self.limits[axis.index()]
    }

    /// Replace one axis' limits. Invalid values leave the config untouched.
    pub fn set_limits(&mut self, axis: Axis, limits: AxisLimits) -> Result<(), ConfigError> {
        limits.validate(axis)?;
        self.limits[axis.index()] = limits;
        Ok(())
    }

    pub fn set_axis_config(
        &mut self,
        axis: Axis,
        steps_per_meter: f64,
        max_speed: f64,
        min_speed: f64,
        acceleration: f64,
        jerk: f64,
    ) -> Result<(), ConfigError> {
        let limits = AxisLimits {
            steps_per_meter,
            max_speed,
            min_speed,
            acceleration,
            jerk,
            ..self.limits[axis.index()]
        };
        self.set_limits(axis, limits)
    }

    pub fn steps_per_meter(&self) -> AxisVector {
        AxisVector(self.limits.map(|l| l.steps_per_meter))
    }

    pub fn jerk(&self) -> AxisVector {
        AxisVector(self.limits.map(|l| l.jerk))
    }

    /// Backlash per axis, in meters.
    pub fn backlash(&self) -> AxisVector {
        AxisVector(self.limits.map(|l| l.backlash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn axis_parse() {
        assert_eq!(Axis::parse("x"), Some(Axis::X));
        assert_eq!(Axis::parse("E"), Some(Axis::E));
        assert_eq!(Axis::parse("h"), Some(Axis::H));
        assert_eq!(Axis::parse("w"), None);
    }

    #[test]
    fn mask_names_axes_in_order() {
        assert_eq!(Axis::from_mask(0b10101), vec![Axis::X, Axis::Z, Axis::H]);
        assert!(Axis::from_mask(0).is_empty());
    }

    #[test]
    fn overwrite_keeps_absent_axes() {
        let start = AxisVector([1.0, 2.0, 3.0, 4.0, 5.0]);
        let map = AxisMap::from([(Axis::Y, 9.0)]);
        assert_eq!(start.overwrite(&map), AxisVector([1.0, 9.0, 3.0, 4.0, 5.0]));
    }

    #[test]
    fn rejects_invalid_limits_without_mutating() {
        let mut cfg = AxisConfig::default();
        let before = cfg.clone();
        let err = cfg
            .set_axis_config(Axis::X, 0.0, 0.2, 0.0, 1.0, 0.02)
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidAxisValue {
                field: "steps_per_meter",
                ..
            }
        ));
        assert_eq!(cfg, before);

        let err = cfg
            .set_axis_config(Axis::Y, 100.0, 0.1, 0.2, 1.0, 0.02)
            .unwrap_err();
        assert!(matches!(err, ConfigError::MinAboveMax { .. }));
    }

    #[test]
    fn patch_keeps_unnamed_fields() {
        let patch = AxisPatch {
            jerk: Some(0.001),
            soft_max: Some(0.15),
            ..AxisPatch::default()
        };
        let z = AxisLimits::default_z().patched(patch);
        assert_eq!(z.jerk, 0.001);
        assert_eq!(z.soft_max, Some(0.15));
        assert_eq!(z.steps_per_meter, 2_133_333.0);
        assert_eq!(z.max_speed, 0.02);
        assert_eq!(z.soft_min, None);
    }

    #[test]
    fn rejects_inverted_or_negative_travel_settings() {
        let mut cfg = AxisConfig::default();
        let inverted = AxisLimits {
            soft_min: Some(0.2),
            soft_max: Some(0.1),
            ..AxisLimits::default()
        };
        assert!(matches!(
            cfg.set_limits(Axis::X, inverted),
            Err(ConfigError::TravelInverted { axis: Axis::X, .. })
        ));
        let negative = AxisLimits {
            backlash: -0.001,
            ..AxisLimits::default()
        };
        assert!(matches!(
            cfg.set_limits(Axis::Y, negative),
            Err(ConfigError::InvalidAxisValue {
                field: "backlash",
                ..
            })
        ));
        let unbounded_min = AxisLimits {
            soft_min: Some(f64::NEG_INFINITY),
            ..AxisLimits::default()
        };
        assert!(cfg.set_limits(Axis::Y, unbounded_min).is_err());
        assert_eq!(cfg, AxisConfig::default());
    }

    #[test]
    fn set_axis_config_updates_one_axis() {
        let mut cfg = AxisConfig::default();
        cfg.set_axis_config(Axis::E, 1000.0, 0.3, 0.0, 2.0, 0.1)
            .unwrap();
        assert_eq!(cfg.limits(Axis::E).steps_per_meter, 1000.0);
        assert_eq!(cfg.steps_per_meter()[Axis::E], 1000.0);
        assert_eq!(cfg.limits(Axis::X), &AxisLimits::default());
    }
}
