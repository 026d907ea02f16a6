// Speed limits, junction speeds and trapezoidal velocity profiles

use crate::{
    axis::{AxisConfig, AxisVector, NUM_AXES},
    path::Path,
};

/// Cap a path's cruise speed and acceleration by every moving axis.
///
/// An axis moving at ratio `r` of the path speed limits the path to
/// `max_speed / r`. The cruise speed is raised to the slowest moving
/// axis' scaled `min_speed` unless that would break a maximum.
pub fn limit_segment(path: &mut Path, axes: &AxisConfig) {
    let direction = path.direction();
    let mut cruise = path.requested_speed();
    let mut acceleration = path.requested_acceleration();
    let mut ceiling = f64::INFINITY;
    let mut floor = f64::INFINITY;

    for (axis, component) in direction.iter() {
        let ratio = component.abs();
        if ratio == 0.0 {
            continue;
        }
        let limits = axes.limits(axis);
        ceiling = ceiling.min(limits.max_speed / ratio);
        floor = floor.min(limits.min_speed / ratio);
        acceleration = acceleration.min(limits.acceleration / ratio);
    }

    if floor.is_finite() {
        cruise = cruise.max(floor);
    }
    cruise = cruise.min(ceiling);

    path.cruise_speed = cruise;
    path.acceleration = acceleration;
}

/// Junction speed between two segments.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Junction {
    /// Magnitude of the actuator-space velocity change at full cruise.
    pub delta_v: f64,
    /// Fraction of the previous cruise speed that keeps every axis within jerk.
    pub factor: f64,
    pub speed: f64,
}

/// Largest speed at which the corner between two segments can be taken.
///
/// `prev_velocity` and `next_velocity` are the actuator-space velocities
/// at each segment's cruise speed. The jerk limit is the smallest over
/// the actuators whose velocity changes.
pub fn junction_speed(
    prev_velocity: &AxisVector,
    next_velocity: &AxisVector,
    prev_cruise: f64,
    next_cruise: f64,
    axes: &AxisConfig,
) -> Junction {
    let dv = *next_velocity - *prev_velocity;
    let delta_v = dv.norm();
    let jerk = axes.jerk();
    let limit = (0..NUM_AXES)
        .filter(|i| dv.0[*i] != 0.0)
        .map(|i| jerk.0[i])
        .fold(f64::INFINITY, f64::min);

    let factor = if delta_v > limit { limit / delta_v } else { 1.0 };
    Junction {
        delta_v,
        factor,
        speed: (prev_cruise * factor).min(next_cruise),
    }
}

/// Fastest speed reachable from `start` over `distance` at `acceleration`.
pub fn reachable_speed(start: f64, acceleration: f64, distance: f64) -> f64 {
    (start * start + 2.0 * acceleration * distance).sqrt()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileKind {
    /// Accelerate, cruise, decelerate.
    Trapezoid,
    /// Cruise speed is never reached.
    Triangle,
}

/// Speed as a function of time along one segment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VelocityProfile {
    pub distance: f64,
    pub start_speed: f64,
    pub peak_speed: f64,
    pub end_speed: f64,
    pub acceleration: f64,
    pub accel_distance: f64,
    /// Distance where deceleration begins.
    pub decel_start: f64,
    pub accel_time: f64,
    pub cruise_time: f64,
    pub decel_time: f64,
}

impl VelocityProfile {
    /// Plan a profile over `distance` that starts at `start`, ends at
    /// `end` and never exceeds `cruise`. Infeasible boundary speeds are
    /// clamped to what the distance allows.
    pub fn plan(distance: f64, start: f64, cruise: f64, end: f64, acceleration: f64) -> Self {
        let start = start.min(cruise).max(0.0);
        let end = end
            .min(cruise)
            .min(reachable_speed(start, acceleration, distance))
            .max(0.0);

        // Point where accelerating from start meets decelerating to end.
        let meet = ((2.0 * acceleration * distance - start * start + end * end)
            / (4.0 * acceleration))
            .clamp(0.0, distance);
        let meet_speed = reachable_speed(start, acceleration, meet);

        let (peak, accel_distance, decel_start) = if meet_speed > cruise {
            let accel = (cruise * cruise - start * start) / (2.0 * acceleration);
            let decel = (cruise * cruise - end * end) / (2.0 * acceleration);
            (cruise, accel, distance - decel)
        } else {
            (meet_speed.max(start), meet, meet)
        };

        let accel_time = (peak - start) / acceleration;
        let cruise_time = if peak > 0.0 {
            (decel_start - accel_distance) / peak
        } else {
            0.0
        };
        let decel_time = (peak - end) / acceleration;

        Self {
            distance,
            start_speed: start,
            peak_speed: peak,
            end_speed: end,
            acceleration,
            accel_distance,
            decel_start,
            accel_time,
            cruise_time,
            decel_time,
        }
    }

    pub fn for_path(path: &Path) -> Self {
        Self::plan(
            path.magnitude(),
            path.start_speed(),
            path.cruise_speed(),
            path.end_speed(),
            path.acceleration(),
        )
    }

    pub fn kind(&self) -> ProfileKind {
        if self.decel_start - self.accel_distance > f64::EPSILON * self.distance {
            ProfileKind::Trapezoid
        } else {
            ProfileKind::Triangle
        }
    }

    pub fn total_time(&self) -> f64 {
        self.accel_time + self.cruise_time + self.decel_time
    }

    /// Distance covered `t` seconds into the segment.
    pub fn distance_at(&self, t: f64) -> f64 {
        let a = self.acceleration;
        if t <= 0.0 {
            return 0.0;
        }
        if t < self.accel_time {
            return self.start_speed * t + 0.5 * a * t * t;
        }
        let t = t - self.accel_time;
        if t < self.cruise_time {
            return self.accel_distance + self.peak_speed * t;
        }
        let t = (t - self.cruise_time).min(self.decel_time);
        let d = self.decel_start + self.peak_speed * t - 0.5 * a * t * t;
        d.min(self.distance)
    }

    pub fn speed_at(&self, t: f64) -> f64 {
        let a = self.acceleration;
        if t <= 0.0 {
            return self.start_speed;
        }
        if t < self.accel_time {
            return self.start_speed + a * t;
        }
        let t = t - self.accel_time;
        if t < self.cruise_time {
            return self.peak_speed;
        }
        let t = (t - self.cruise_time).min(self.decel_time);
        self.peak_speed - a * t
    }
}
