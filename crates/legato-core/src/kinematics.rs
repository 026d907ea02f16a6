// Kinematics systems for the supported machine geometries

use crate::axis::{Axis, AxisVector};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod belt;
pub mod cartesian;
pub mod delta;

pub use belt::{BeltKin, BeltMatrix};
pub use cartesian::CartesianKin;
pub use delta::{DeltaGeometry, DeltaKin};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum KinematicsError {
    #[error("({x:.6}, {y:.6}) is out of reach of column {column}")]
    Unreachable { column: char, x: f64, y: f64 },
    #[error("belt matrix {matrix:?} is not invertible")]
    SingularBeltMatrix { matrix: [[f64; 2]; 2] },
    #[error("column heights {heights:?} do not meet at an effector position")]
    NoForwardSolution { heights: [f64; 3] },
    #[error("{field} must be positive and finite, got {value}")]
    InvalidGeometry { field: &'static str, value: f64 },
}

pub type Result<T> = std::result::Result<T, KinematicsError>;

/// Maps commanded cartesian positions to actuator positions and back.
///
/// Axes a geometry does not touch pass through unchanged.
pub trait Kinematics {
    fn to_actuator_space(&self, position: &AxisVector) -> Result<AxisVector>;

    fn to_cartesian_space(&self, actuators: &AxisVector) -> Result<AxisVector>;

    /// Whether actuator positions are a linear function of the cartesian
    /// position. Step generation can skip actuators that do not move when
    /// this holds.
    fn is_linear(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KinematicMode {
    #[default]
    Cartesian,
    /// H-belt and CoreXY machines, described by a 2x2 belt matrix.
    BeltXy,
    Delta,
}

impl KinematicMode {
    /// Belt machines couple X and Y so each is homed on its own.
    pub fn homes_axes_separately(self) -> bool {
        matches!(self, KinematicMode::BeltXy)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MachineKinematics {
    Cartesian(CartesianKin),
    Belt(BeltKin),
    Delta(DeltaKin),
}

impl MachineKinematics {
    pub fn mode(&self) -> KinematicMode {
        match self {
            MachineKinematics::Cartesian(_) => KinematicMode::Cartesian,
            MachineKinematics::Belt(_) => KinematicMode::BeltXy,
            MachineKinematics::Delta(_) => KinematicMode::Delta,
        }
    }

    /// Actuator-space velocity of a move through `at` along `direction`
    /// at `speed`, by central difference around `at`.
    pub fn actuator_velocity(
        &self,
        at: &AxisVector,
        direction: &AxisVector,
        speed: f64,
    ) -> Result<AxisVector> {
        const STEP: f64 = 1e-6;
        if self.is_linear() {
            let origin = self.to_actuator_space(&AxisVector::ZERO)?;
            let moved = self.to_actuator_space(direction)?;
            return Ok((moved - origin) * speed);
        }
        let behind = self.to_actuator_space(&(*at - *direction * STEP))?;
        let ahead = self.to_actuator_space(&(*at + *direction * STEP))?;
        Ok((ahead - behind) * (speed / (2.0 * STEP)))
    }
}

impl Kinematics for MachineKinematics {
    fn to_actuator_space(&self, position: &AxisVector) -> Result<AxisVector> {
        match self {
            MachineKinematics::Cartesian(kin) => kin.to_actuator_space(position),
            MachineKinematics::Belt(kin) => kin.to_actuator_space(position),
            MachineKinematics::Delta(kin) => kin.to_actuator_space(position),
        }
    }

    fn to_cartesian_space(&self, actuators: &AxisVector) -> Result<AxisVector> {
        match self {
            MachineKinematics::Cartesian(kin) => kin.to_cartesian_space(actuators),
            MachineKinematics::Belt(kin) => kin.to_cartesian_space(actuators),
            MachineKinematics::Delta(kin) => kin.to_cartesian_space(actuators),
        }
    }

    fn is_linear(&self) -> bool {
        match self {
            MachineKinematics::Cartesian(kin) => kin.is_linear(),
            MachineKinematics::Belt(kin) => kin.is_linear(),
            MachineKinematics::Delta(kin) => kin.is_linear(),
        }
    }
}

/// Copy the axes a geometry leaves alone.
pub(crate) fn pass_through(from: &AxisVector, into: &mut AxisVector, axes: &[Axis]) {
    for axis in axes {
        into[*axis] = from[*axis];
    }
}
