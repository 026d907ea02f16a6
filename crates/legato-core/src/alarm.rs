// Alarms raised by the feeder thread

use crate::axis::Axis;
use std::fmt;
use thiserror::Error;

/// A runtime fault observed while streaming steps. Alarms are delivered
/// to the callbacks registered with the planner, not returned as errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Alarm {
    /// An endstop tripped during a cancellable move. The queue has been
    /// truncated and the steppers disabled.
    #[error("endstop hit on {} during path {path}", AxisList(.axes))]
    EndstopHit { axes: Vec<Axis>, path: u64 },
    /// A queued path could not be turned into steps, for instance a delta
    /// move whose middle leaves the reachable envelope. Motion stopped and
    /// later paths were dropped.
    #[error("path {path} cannot be executed: {reason}")]
    PathUnreachable { path: u64, reason: String },
    /// The coprocessor ran dry while motion was still owed. Steppers stay
    /// disabled until the planner is restarted.
    #[error("step ring underrun while feeding path {path}")]
    RingBufferUnderrun { path: u64 },
}

impl Alarm {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::RingBufferUnderrun { .. })
    }
}

struct AxisList<'a>(&'a [Axis]);

impl fmt::Display for AxisList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, axis) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{axis}")?;
        }
        Ok(())
    }
}

pub type AlarmCallback = Box<dyn Fn(&Alarm) + Send + Sync>;
