// Belt kinematics - H-belt and CoreXY machines sharing two motors across X/Y

use crate::{
    axis::{Axis, AxisVector},
    kinematics::{Kinematics, KinematicsError, Result, pass_through},
};
use serde::{Deserialize, Serialize};

/// Row-major 2x2 matrix mapping `[x, y]` to `[motor_a, motor_b]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BeltMatrix(pub [[f64; 2]; 2]);

impl BeltMatrix {
    pub const H_BELT: Self = Self([[-0.5, 0.5], [-0.5, -0.5]]);
    pub const COREXY: Self = Self([[1.0, 1.0], [1.0, -1.0]]);

    fn determinant(&self) -> f64 {
        let [[a, b], [c, d]] = self.0;
        a * d - b * c
    }

    fn inverse(&self) -> Result<Self> {
        let det = self.determinant();
        let scale = self.0.iter().flatten().fold(0.0_f64, |m, v| m.max(v.abs()));
        if !det.is_finite() || det.abs() <= f64::EPSILON * scale * scale {
            return Err(KinematicsError::SingularBeltMatrix { matrix: self.0 });
        }
        let [[a, b], [c, d]] = self.0;
        Ok(Self([[d / det, -b / det], [-c / det, a / det]]))
    }

    fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        let [[a, b], [c, d]] = self.0;
        (a * x + b * y, c * x + d * y)
    }
}

impl Default for BeltMatrix {
    fn default() -> Self {
        Self::H_BELT
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BeltKin {
    forward: BeltMatrix,
    inverse: BeltMatrix,
}

impl BeltKin {
    pub fn new(matrix: BeltMatrix) -> Result<Self> {
        Ok(Self {
            forward: matrix,
            inverse: matrix.inverse()?,
        })
    }

    pub fn matrix(&self) -> BeltMatrix {
        self.forward
    }
}

const UNTOUCHED: [Axis; 3] = [Axis::Z, Axis::E, Axis::H];

impl Kinematics for BeltKin {
    fn to_actuator_space(&self, position: &AxisVector) -> Result<AxisVector> {
        let (a, b) = self.forward.apply(position[Axis::X], position[Axis::Y]);
        let mut out = AxisVector::ZERO;
        out[Axis::X] = a;
        out[Axis::Y] = b;
        pass_through(position, &mut out, &UNTOUCHED);
        Ok(out)
    }

    fn to_cartesian_space(&self, actuators: &AxisVector) -> Result<AxisVector> {
        let (x, y) = self.inverse.apply(actuators[Axis::X], actuators[Axis::Y]);
        let mut out = AxisVector::ZERO;
        out[Axis::X] = x;
        out[Axis::Y] = y;
        pass_through(actuators, &mut out, &UNTOUCHED);
        Ok(out)
    }
}
