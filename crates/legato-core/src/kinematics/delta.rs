// Delta kinematics - three vertical columns with fixed-length rods to the effector

use crate::{
    axis::{Axis, AxisVector},
    kinematics::{Kinematics, KinematicsError, Result, pass_through},
};
use serde::{Deserialize, Serialize};

const COLUMN_ANGLES: [f64; 3] = [90.0, 210.0, 330.0];
const COLUMNS: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];
const COLUMN_NAMES: [char; 3] = ['A', 'B', 'C'];
const UNTOUCHED: [Axis; 2] = [Axis::E, Axis::H];

/// Delta dimensions in meters. Angular errors are in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeltaGeometry {
    /// Diagonal rod length.
    pub rod_length: f64,
    /// Horizontal distance from the bed center to a column.
    pub radius: f64,
    /// Horizontal distance from the effector center to a rod joint.
    pub effector_offset: f64,
    /// Horizontal distance from a carriage's column to its rod joint.
    pub carriage_offset: f64,
    /// Vertical distance from the rod joints to the nozzle tip.
    pub head_offset: f64,
    pub radial_error: [f64; 3],
    pub angular_error: [f64; 3],
}

impl Default for DeltaGeometry {
    fn default() -> Self {
        Self {
            rod_length: 0.135,
            radius: 0.144,
            effector_offset: 0.026,
            carriage_offset: 0.019,
            head_offset: 0.0,
            radial_error: [0.0; 3],
            angular_error: [0.0; 3],
        }
    }
}

impl DeltaGeometry {
    fn validate(&self) -> Result<()> {
        if !(self.rod_length.is_finite() && self.rod_length > 0.0) {
            return Err(KinematicsError::InvalidGeometry {
                field: "rod_length",
                value: self.rod_length,
            });
        }
        let effective = self.radius - self.effector_offset - self.carriage_offset;
        if !(effective.is_finite() && effective > 0.0) {
            return Err(KinematicsError::InvalidGeometry {
                field: "radius",
                value: effective,
            });
        }
        Ok(())
    }

    /// Column positions relative to the effector center.
    fn virtual_columns(&self) -> [(f64, f64); 3] {
        let base = self.radius - self.effector_offset - self.carriage_offset;
        std::array::from_fn(|i| {
            let theta = (COLUMN_ANGLES[i] + self.angular_error[i]).to_radians();
            let r = base + self.radial_error[i];
            (r * theta.cos(), r * theta.sin())
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeltaKin {
    geometry: DeltaGeometry,
    columns: [(f64, f64); 3],
}

impl DeltaKin {
    pub fn new(geometry: DeltaGeometry) -> Result<Self> {
        geometry.validate()?;
        Ok(Self {
            geometry,
            columns: geometry.virtual_columns(),
        })
    }

    pub fn geometry(&self) -> &DeltaGeometry {
        &self.geometry
    }
}

type Vec3 = [f64; 3];

fn sub(a: Vec3, b: Vec3) -> Vec3 {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

fn dot(a: Vec3, b: Vec3) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn cross(a: Vec3, b: Vec3) -> Vec3 {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

fn scale(a: Vec3, s: f64) -> Vec3 {
    [a[0] * s, a[1] * s, a[2] * s]
}

fn norm(a: Vec3) -> f64 {
    dot(a, a).sqrt()
}

impl Kinematics for DeltaKin {
    fn to_actuator_space(&self, position: &AxisVector) -> Result<AxisVector> {
        let (x, y, z) = (position[Axis::X], position[Axis::Y], position[Axis::Z]);
        let l2 = self.geometry.rod_length * self.geometry.rod_length;
        let mut out = AxisVector::ZERO;
        for (i, (vx, vy)) in self.columns.into_iter().enumerate() {
            let dx = x - vx;
            let dy = y - vy;
            let rise = l2 - dx * dx - dy * dy;
            if !(rise >= 0.0) {
                return Err(KinematicsError::Unreachable {
                    column: COLUMN_NAMES[i],
                    x,
                    y,
                });
            }
            out[COLUMNS[i]] = z + rise.sqrt() + self.geometry.head_offset;
        }
        pass_through(position, &mut out, &UNTOUCHED);
        Ok(out)
    }

    fn to_cartesian_space(&self, actuators: &AxisVector) -> Result<AxisVector> {
        let heights = COLUMNS.map(|c| actuators[c]);
        let no_solution = KinematicsError::NoForwardSolution { heights };
        let [p1, p2, p3]: [Vec3; 3] = std::array::from_fn(|i| {
            let (vx, vy) = self.columns[i];
            [vx, vy, heights[i] - self.geometry.head_offset]
        });

        // Trilaterate the three rod spheres in a frame built on the carriages.
        let p12 = sub(p2, p1);
        let d = norm(p12);
        let ex = scale(p12, 1.0 / d);
        let p13 = sub(p3, p1);
        let i = dot(ex, p13);
        let ey_raw = sub(p13, scale(ex, i));
        let ey = scale(ey_raw, 1.0 / norm(ey_raw));
        let ez = cross(ex, ey);
        let j = dot(ey, p13);

        let x = d / 2.0;
        let y = ((i * i + j * j) / 2.0 - i * x) / j;
        let l = self.geometry.rod_length;
        let z2 = l * l - x * x - y * y;
        if !(z2 >= 0.0) || !d.is_finite() || j == 0.0 {
            return Err(no_solution);
        }
        let z = z2.sqrt();

        let mut out = AxisVector::ZERO;
        for k in 0..3 {
            out[COLUMNS[k]] = p1[k] + x * ex[k] + y * ey[k] - z * ez[k];
        }
        if out.0.iter().any(|v| !v.is_finite()) {
            return Err(no_solution);
        }
        pass_through(actuators, &mut out, &UNTOUCHED);
        Ok(out)
    }

    fn is_linear(&self) -> bool {
        false
    }
}
