// Machine description shared by the planner and the step generator

use crate::{
    axis::{Axis, AxisConfig, AxisVector},
    bed_compensation::BedCompensationMatrix,
    kinematics::{CartesianKin, Kinematics, MachineKinematics, Result},
};

/// Everything needed to turn a commanded position into actuator steps.
/// The planner hands each move a snapshot, so values are read-only for
/// the duration of that move.
#[derive(Debug, Clone, PartialEq)]
pub struct Machine {
    pub axes: AxisConfig,
    pub kinematics: MachineKinematics,
    pub bed: BedCompensationMatrix,
}

impl Default for Machine {
    fn default() -> Self {
        Self {
            axes: AxisConfig::default(),
            kinematics: MachineKinematics::Cartesian(CartesianKin),
            bed: BedCompensationMatrix::FLAT,
        }
    }
}

impl Machine {
    /// Commanded position to actuator positions, bed offset included.
    pub fn to_actuators(&self, position: &AxisVector) -> Result<AxisVector> {
        let mut compensated = *position;
        compensated[Axis::Z] = self.bed.apply(position[Axis::X], position[Axis::Y], position[Axis::Z]);
        self.kinematics.to_actuator_space(&compensated)
    }

    /// Actuator positions back to the commanded position.
    pub fn from_actuators(&self, actuators: &AxisVector) -> Result<AxisVector> {
        let mut position = self.kinematics.to_cartesian_space(actuators)?;
        position[Axis::Z] = self.bed.remove(position[Axis::X], position[Axis::Y], position[Axis::Z]);
        Ok(position)
    }

    pub fn to_steps(&self, position: &AxisVector) -> Result<[i64; crate::axis::NUM_AXES]> {
        let actuators = self.to_actuators(position)?;
        let spm = self.axes.steps_per_meter();
        Ok(std::array::from_fn(|i| (actuators.0[i] * spm.0[i]).round() as i64))
    }

    pub fn from_steps(&self, steps: &[i64; crate::axis::NUM_AXES]) -> Result<AxisVector> {
        let spm = self.axes.steps_per_meter();
        let actuators = AxisVector(std::array::from_fn(|i| steps[i] as f64 / spm.0[i]));
        self.from_actuators(&actuators)
    }
}
