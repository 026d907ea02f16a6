//! Motion core for Legato: path planning, kinematics, bed compensation
//! and step streaming to a real-time coprocessor.
//!
//! Everything is in SI units (meters, seconds). Conversion to and from
//! millimeters happens at the caller's boundary.

pub mod alarm;
pub mod axis;
pub mod bed_compensation;
pub mod config;
pub mod kinematics;
pub mod machine;
pub mod path;
pub mod path_queue;
pub mod planner;
pub mod pru;
pub mod shared_mem;
pub mod step_channel;
pub mod step_gen;
pub mod step_table;
pub mod trapezoid;

pub use planner::{PathPlanner, PlannerError};
