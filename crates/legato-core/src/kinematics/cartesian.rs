// Cartesian kinematics - each actuator drives one axis directly

use crate::{
    axis::AxisVector,
    kinematics::{Kinematics, Result},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CartesianKin;

impl Kinematics for CartesianKin {
    fn to_actuator_space(&self, position: &AxisVector) -> Result<AxisVector> {
        Ok(*position)
    }

    fn to_cartesian_space(&self, actuators: &AxisVector) -> Result<AxisVector> {
        Ok(*actuators)
    }
}
