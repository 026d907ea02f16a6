//! Bounded lookahead queue of linked paths.
//!
//! A path's end speed stays provisional until the path leaves the queue.
//! At that point its successor (if any) is known, so the junction speed
//! can be capped by what both segments can reach and stop from, and the
//! successor's start speed is fixed to match.

use crate::{
    axis::{Axis, AxisVector},
    kinematics::KinematicsError,
    machine::Machine,
    path::Path,
    trapezoid::{VelocityProfile, junction_speed, limit_segment, reachable_speed},
};
use std::collections::VecDeque;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PathError {
    #[error("path does not move any axis")]
    ZeroLength,
    #[error("{field} must be positive and finite, got {value}")]
    InvalidMotion { field: &'static str, value: f64 },
    #[error("target is unreachable: {0}")]
    Unreachable(#[from] KinematicsError),
    #[error("queue is full ({capacity} paths)")]
    Full { capacity: usize },
    #[error("path {seq} is not queued")]
    NotQueued { seq: u64 },
    #[error("path {seq} is already being entered at speed")]
    Committed { seq: u64 },
    #[error("axis {axis} target {position} is outside its travel [{min}, {max}]")]
    OutsideTravel {
        axis: Axis,
        position: f64,
        min: f64,
        max: f64,
    },
}

#[derive(Debug)]
pub struct PathQueue {
    paths: VecDeque<Path>,
    capacity: usize,
    next_seq: u64,
    /// End position of the last path accepted, queued or not.
    last_end: AxisVector,
}

impl PathQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            paths: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            next_seq: 0,
            last_end: AxisVector::ZERO,
        }
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.paths.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Where the commanded motion ends once every accepted path has run.
    pub fn last_position(&self) -> AxisVector {
        self.last_end
    }

    /// Rebase the chain after motion was cut short.
    pub fn reset_position(&mut self, position: AxisVector) {
        self.last_end = position;
    }

    pub fn front(&self) -> Option<&Path> {
        self.paths.front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Path> {
        self.paths.iter()
    }

    /// Link, validate and plan `path` against the queue tail. A rejected
    /// path leaves the queue untouched.
    pub fn push(&mut self, mut path: Path, machine: &Machine) -> Result<u64, PathError> {
        if self.is_full() {
            return Err(PathError::Full {
                capacity: self.capacity,
            });
        }

        let seq = self.next_seq;
        path.set_seq(seq);
        let start = self.paths.back().map_or(self.last_end, |p| *p.end_pos());
        path.link_from(start);

        if !path.is_set_position() {
            for (field, value) in [
                ("speed", path.requested_speed()),
                ("acceleration", path.requested_acceleration()),
            ] {
                if !(value.is_finite() && value > 0.0) {
                    return Err(PathError::InvalidMotion { field, value });
                }
            }
            if path.magnitude() == 0.0 {
                return Err(PathError::ZeroLength);
            }
            if path.has_soft_limits() {
                check_travel(&path, machine)?;
            }
            machine.to_actuators(path.end_pos())?;
            limit_segment(&mut path, &machine.axes);
        }

        match self.paths.back_mut() {
            Some(prev) => {
                path.link(Some(&mut *prev));
                let speed = Self::junction(prev, &path, machine);
                prev.end_speed = speed;
                path.start_speed = speed;
            }
            None => path.start_speed = 0.0,
        }

        debug!(
            seq,
            movement = ?path.movement(),
            magnitude = path.magnitude(),
            cruise = path.cruise_speed(),
            start_speed = path.start_speed(),
            "queued path"
        );

        self.last_end = *path.end_pos();
        self.paths.push_back(path);
        self.next_seq += 1;
        Ok(seq)
    }

    fn junction(prev: &Path, next: &Path, machine: &Machine) -> f64 {
        if prev.is_cancellable()
            || next.is_cancellable()
            || prev.is_set_position()
            || next.is_set_position()
        {
            return 0.0;
        }
        let at = next.start_pos();
        let kin = &machine.kinematics;
        let velocities = kin
            .actuator_velocity(at, &prev.direction(), prev.cruise_speed())
            .and_then(|v_prev| {
                kin.actuator_velocity(at, &next.direction(), next.cruise_speed())
                    .map(|v_next| (v_prev, v_next))
            });
        match velocities {
            Ok((v_prev, v_next)) => {
                junction_speed(
                    &v_prev,
                    &v_next,
                    prev.cruise_speed(),
                    next.cruise_speed(),
                    &machine.axes,
                )
                .speed
            }
            Err(_) => 0.0,
        }
    }

    /// Take the front path with its speeds finalised.
    ///
    /// A lone path is held back for a possible successor unless `flush`
    /// is set, in which case it is planned to a stop.
    pub fn pop_ready(&mut self, flush: bool) -> Option<Path> {
        if self.paths.len() == 1 && !flush {
            return None;
        }
        let mut front = self.paths.pop_front()?;
        front.unlink_next();

        let end = match self.paths.front_mut() {
            Some(next) => {
                next.unlink_prev();
                let mut end = front.end_speed;
                if !front.is_set_position() {
                    end = end.min(reachable_speed(
                        front.start_speed,
                        front.acceleration,
                        front.magnitude(),
                    ));
                }
                if next.is_set_position() {
                    end = 0.0;
                } else {
                    end = end.min(reachable_speed(0.0, next.acceleration, next.magnitude()));
                }
                next.start_speed = end;
                end
            }
            None => 0.0,
        };
        front.end_speed = end;

        if !front.is_set_position() {
            front.switch_distance = VelocityProfile::for_path(&front).decel_start;
        }
        Some(front)
    }

    /// Drop every queued path. Returns how many were removed.
    pub fn clear(&mut self) -> usize {
        let count = self.paths.len();
        for mut path in self.paths.drain(..) {
            path.unlink();
        }
        count
    }

    /// Remove a still-queued path. The paths behind it are re-resolved
    /// from where the removed path started and linked to its predecessor.
    ///
    /// The front path cannot be removed once a path already handed out
    /// runs into it at speed, since that speed is committed.
    pub fn cancel(&mut self, seq: u64, machine: &Machine) -> Result<Path, PathError> {
        let index = self
            .paths
            .iter()
            .position(|p| p.seq() == seq)
            .ok_or(PathError::NotQueued { seq })?;
        if index == 0 && self.paths[0].start_speed > 0.0 {
            return Err(PathError::Committed { seq });
        }
        let mut path = self.paths.remove(index).ok_or(PathError::NotQueued { seq })?;
        path.unlink();

        let mut start = *path.start_pos();
        for next in self.paths.iter_mut().skip(index) {
            next.link_from(start);
            if !next.is_set_position() {
                limit_segment(next, &machine.axes);
            }
            start = *next.end_pos();
        }

        let paths = self.paths.make_contiguous();
        match (index.checked_sub(1), paths.len() > index) {
            (Some(before), true) => {
                let (head, tail) = paths.split_at_mut(index);
                tail[0].link(Some(&mut head[before]));
            }
            (Some(before), false) => {
                paths[before].unlink_next();
                paths[before].end_speed = 0.0;
            }
            (None, true) => {
                paths[0].unlink_prev();
                paths[0].start_speed = 0.0;
            }
            (None, false) => {}
        }
        for k in index.max(1)..paths.len() {
            let speed = Self::junction(&paths[k - 1], &paths[k], machine);
            paths[k - 1].end_speed = speed;
            paths[k].start_speed = speed;
        }
        self.last_end = start;
        Ok(path)
    }
}

/// Reject targets outside the soft travel of any axis the path moves.
fn check_travel(path: &Path, machine: &Machine) -> Result<(), PathError> {
    for (axis, position) in path.end_pos().iter() {
        if path.vec()[axis] == 0.0 {
            continue;
        }
        let limits = machine.axes.limits(axis);
        let min = limits.soft_min.unwrap_or(f64::NEG_INFINITY);
        let max = limits.soft_max.unwrap_or(f64::INFINITY);
        if position < min || position > max {
            return Err(PathError::OutsideTravel {
                axis,
                position,
                min,
                max,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::axis::{Axis, AxisMap};

    fn x(value: f64) -> AxisMap {
        AxisMap::from([(Axis::X, value)])
    }

    fn xy(x: f64, y: f64) -> AxisMap {
        AxisMap::from([(Axis::X, x), (Axis::Y, y)])
    }

    fn drain(queue: &mut PathQueue) -> Vec<Path> {
        std::iter::from_fn(|| queue.pop_ready(true)).collect()
    }

    #[test]
    fn segments_are_continuous() {
        let machine = Machine::default();
        let mut queue = PathQueue::new(8);
        for (i, (px, py)) in [(0.01, 0.0), (0.02, 0.005), (0.03, 0.0), (0.03, 0.02)]
            .into_iter()
            .enumerate()
        {
            assert_eq!(queue.push(Path::absolute(xy(px, py), 0.1, 0.5), &machine), Ok(i as u64));
        }
        let paths = drain(&mut queue);
        assert_eq!(paths.len(), 4);
        assert_eq!(paths[0].start_speed(), 0.0);
        assert_eq!(paths[3].end_speed(), 0.0);
        for pair in paths.windows(2) {
            assert_eq!(pair[0].end_pos(), pair[1].start_pos());
            assert_eq!(pair[0].end_speed(), pair[1].start_speed());
        }
        for path in &paths {
            assert!(path.start_speed() >= 0.0);
            assert!(path.end_speed() <= path.cruise_speed());
            assert!(path.start_speed() <= path.cruise_speed());
        }
    }

    #[test]
    fn collinear_moves_keep_speed_through_junction() {
        let machine = Machine::default();
        let mut queue = PathQueue::new(8);
        queue.push(Path::absolute(x(0.05), 0.05, 0.5), &machine).unwrap();
        queue.push(Path::absolute(x(0.10), 0.05, 0.5), &machine).unwrap();
        let first = queue.pop_ready(false).unwrap();
        assert_eq!(first.end_speed(), 0.05);
        assert!(queue.pop_ready(false).is_none());
        assert_eq!(queue.pop_ready(true).unwrap().start_speed(), 0.05);
    }

    #[test]
    fn junction_capped_by_reachable_speed() {
        let machine = Machine::default();
        let mut queue = PathQueue::new(8);
        queue.push(Path::absolute(x(0.0001), 0.2, 0.5), &machine).unwrap();
        queue.push(Path::absolute(x(0.2), 0.2, 0.5), &machine).unwrap();
        let first = queue.pop_ready(false).unwrap();
        let reach = reachable_speed(0.0, 0.5, 0.0001);
        assert!((first.end_speed() - reach).abs() < 1e-15);
    }

    #[test]
    fn cancellable_and_set_position_stop_at_boundaries() {
        let machine = Machine::default();
        let mut queue = PathQueue::new(8);
        queue.push(Path::absolute(x(0.05), 0.05, 0.5), &machine).unwrap();
        queue
            .push(Path::absolute(x(0.10), 0.05, 0.5).cancellable(true), &machine)
            .unwrap();
        queue.push(Path::set_position(x(0.0)), &machine).unwrap();
        queue.push(Path::absolute(x(0.05), 0.05, 0.5), &machine).unwrap();
        let paths = drain(&mut queue);
        for path in &paths {
            assert_eq!(path.start_speed(), 0.0);
            assert_eq!(path.end_speed(), 0.0);
        }
        assert_eq!(paths[3].start_pos()[Axis::X], 0.0);
    }

    #[test]
    fn rejected_paths_leave_queue_untouched() {
        let machine = Machine::default();
        let mut queue = PathQueue::new(2);
        queue.push(Path::absolute(x(0.05), 0.05, 0.5), &machine).unwrap();
        assert_eq!(
            queue.push(Path::absolute(x(0.05), 0.05, 0.5), &machine),
            Err(PathError::ZeroLength)
        );
        assert!(matches!(
            queue.push(Path::absolute(x(0.06), 0.0, 0.5), &machine),
            Err(PathError::InvalidMotion { field: "speed", .. })
        ));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.front().unwrap().next(), None);
        queue.push(Path::absolute(x(0.06), 0.05, 0.5), &machine).unwrap();
        assert_eq!(
            queue.push(Path::absolute(x(0.07), 0.05, 0.5), &machine),
            Err(PathError::Full { capacity: 2 })
        );
    }

    #[test]
    fn links_to_a_consumed_predecessor() {
        let machine = Machine::default();
        let mut queue = PathQueue::new(4);
        queue.push(Path::absolute(x(0.05), 0.05, 0.5), &machine).unwrap();
        let first = queue.pop_ready(true).unwrap();
        queue.push(Path::relative(x(0.01), 0.05, 0.5), &machine).unwrap();
        let second = queue.pop_ready(true).unwrap();
        assert_eq!(second.start_pos(), first.end_pos());
        assert_eq!(second.prev(), None);
        assert_eq!(second.start_speed(), 0.0);
    }

    #[test]
    fn cancel_relinks_neighbours() {
        let machine = Machine::default();
        let mut queue = PathQueue::new(4);
        for target in [0.01, 0.02, 0.03] {
            queue.push(Path::absolute(x(target), 0.05, 0.5), &machine).unwrap();
        }
        queue.push(Path::relative(x(0.01), 0.05, 0.5), &machine).unwrap();
        let removed = queue.cancel(1, &machine).unwrap();
        assert_eq!(removed.seq(), 1);
        assert_eq!(removed.prev(), None);
        assert_eq!(removed.next(), None);

        let paths: Vec<_> = queue.iter().collect();
        assert_eq!(paths[0].next(), Some(paths[1].seq()));
        assert_eq!(paths[1].prev(), Some(paths[0].seq()));
        assert!(paths[1].start_speed() > 0.0);
        assert_eq!(paths[0].end_speed(), paths[1].start_speed());
        assert_eq!(paths[1].end_speed(), paths[2].start_speed());
        assert_eq!(paths[1].start_pos(), paths[0].end_pos());
        assert!((paths[1].magnitude() - 0.02).abs() < 1e-15);
        assert_eq!(paths[2].start_pos(), paths[1].end_pos());
        assert!((queue.last_position()[Axis::X] - 0.04).abs() < 1e-15);

        assert_eq!(
            queue.cancel(1, &machine).unwrap_err(),
            PathError::NotQueued { seq: 1 }
        );
        assert_eq!(queue.clear(), 3);
        assert!(queue.is_empty());
    }

    #[test]
    fn cancel_last_path_plans_predecessor_to_stop() {
        let machine = Machine::default();
        let mut queue = PathQueue::new(4);
        queue.push(Path::absolute(x(0.01), 0.05, 0.5), &machine).unwrap();
        queue.push(Path::absolute(x(0.02), 0.05, 0.5), &machine).unwrap();
        assert!(queue.front().unwrap().end_speed() > 0.0);

        queue.cancel(1, &machine).unwrap();
        let front = queue.front().unwrap();
        assert_eq!(front.next(), None);
        assert_eq!(front.end_speed(), 0.0);
        assert!((queue.last_position()[Axis::X] - 0.01).abs() < 1e-15);
    }

    #[test]
    fn committed_front_path_is_not_cancelled() {
        let machine = Machine::default();
        let mut queue = PathQueue::new(4);
        for target in [0.01, 0.02, 0.03] {
            queue.push(Path::absolute(x(target), 0.05, 0.5), &machine).unwrap();
        }
        let first = queue.pop_ready(false).unwrap();
        assert!(first.end_speed() > 0.0);

        assert_eq!(
            queue.cancel(1, &machine).unwrap_err(),
            PathError::Committed { seq: 1 }
        );
        let paths: Vec<_> = queue.iter().collect();
        assert_eq!(paths.len(), 2);
        assert_eq!(paths[0].start_speed(), first.end_speed());
        assert_eq!(paths[0].next(), Some(2));

        // Behind the committed front, cancelling is still allowed.
        queue.cancel(2, &machine).unwrap();
        let front = queue.pop_ready(true).unwrap();
        assert_eq!(front.start_speed(), first.end_speed());
        assert_eq!(front.end_speed(), 0.0);
    }

    #[test]
    fn rejects_targets_outside_soft_travel() {
        let mut machine = Machine::default();
        let limits = crate::axis::AxisLimits {
            soft_min: Some(0.0),
            soft_max: Some(0.1),
            ..*machine.axes.limits(Axis::X)
        };
        machine.axes.set_limits(Axis::X, limits).unwrap();

        let mut queue = PathQueue::new(4);
        queue.push(Path::absolute(x(0.1), 0.05, 0.5), &machine).unwrap();
        assert!(matches!(
            queue.push(Path::relative(x(0.01), 0.05, 0.5), &machine),
            Err(PathError::OutsideTravel {
                axis: Axis::X,
                min: 0.0,
                max: 0.1,
                ..
            })
        ));
        assert_eq!(queue.len(), 1);

        // Axes that do not move are not checked, and homing moves skip the limits.
        queue.push(Path::set_position(x(0.2)), &machine).unwrap();
        queue.push(Path::relative(xy(0.0, 0.05), 0.05, 0.5), &machine).unwrap();
        queue
            .push(
                Path::relative(x(-0.3), 0.05, 0.5).soft_limits(false),
                &machine,
            )
            .unwrap();
        assert!((queue.last_position()[Axis::X] + 0.1).abs() < 1e-12);
    }
}
