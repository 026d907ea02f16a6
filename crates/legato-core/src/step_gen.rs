// Iterative solver turning a planned segment into per-actuator step times

use crate::{
    axis::{AxisVector, NUM_AXES},
    kinematics::{Kinematics, KinematicsError},
    machine::Machine,
    path::Path,
    trapezoid::VelocityProfile,
};

// Scan window for geometries whose actuators may reverse mid-segment
const SEEK_TIME: f64 = 0.002;
const TIME_TOLERANCE: f64 = 0.000_000_001;
const POSITION_TOLERANCE: f64 = 0.000_000_001;
const MAX_ITERATIONS: usize = 100;
// Smallest actuator travel, in steps, that counts as a direction change
const REVERSAL_THRESHOLD: f64 = 0.000_001;

// Active flags for actuator filtering
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActiveFlags(u8);

impl ActiveFlags {
    pub const fn new() -> Self {
        Self(0)
    }

    pub const fn all() -> Self {
        Self((1 << NUM_AXES) - 1)
    }

    pub const fn with(mut self, actuator: usize) -> Self {
        self.0 |= 1 << actuator;
        self
    }

    pub const fn has(&self, actuator: usize) -> bool {
        self.0 & (1 << actuator) != 0
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

// Position callback trait - actuator positions at a given time in a segment
pub trait CalcPositionCallback {
    fn calc_position(&self, move_time: f64) -> Result<AxisVector, KinematicsError>;

    fn duration(&self) -> f64;

    fn active_flags(&self) -> ActiveFlags {
        ActiveFlags::all()
    }

    /// Whether each actuator moves monotonically over the segment.
    fn is_monotonic(&self) -> bool {
        false
    }
}

/// One path's motion through the machine's kinematics.
pub struct SegmentMotion<'a> {
    machine: &'a Machine,
    start: AxisVector,
    direction: AxisVector,
    profile: VelocityProfile,
    active: ActiveFlags,
    monotonic: bool,
}

impl<'a> SegmentMotion<'a> {
    pub fn new(machine: &'a Machine, path: &Path) -> Result<Self, KinematicsError> {
        let profile = VelocityProfile::for_path(path);
        let monotonic = machine.kinematics.is_linear() && is_affine(&machine.bed.coefficients());

        let active = if monotonic {
            let from = machine.to_actuators(path.start_pos())?;
            let to = machine.to_actuators(path.end_pos())?;
            (0..NUM_AXES)
                .filter(|i| from.0[*i] != to.0[*i])
                .fold(ActiveFlags::new(), ActiveFlags::with)
        } else {
            ActiveFlags::all()
        };

        Ok(Self {
            machine,
            start: *path.start_pos(),
            direction: path.direction(),
            profile,
            active,
            monotonic,
        })
    }

    pub fn profile(&self) -> &VelocityProfile {
        &self.profile
    }
}

fn is_affine(m: &[[f64; 3]; 3]) -> bool {
    (0..3).all(|i| (0..3).all(|j| i + j < 2 || m[i][j] == 0.0))
}

impl CalcPositionCallback for SegmentMotion<'_> {
    fn calc_position(&self, move_time: f64) -> Result<AxisVector, KinematicsError> {
        let distance = self.profile.distance_at(move_time);
        self.machine
            .to_actuators(&(self.start + self.direction * distance))
    }

    fn duration(&self) -> f64 {
        self.profile.total_time()
    }

    fn active_flags(&self) -> ActiveFlags {
        self.active
    }

    fn is_monotonic(&self) -> bool {
        self.monotonic
    }
}

/// A single step pulse on one actuator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepEvent {
    /// Seconds from the start of the segment.
    pub time: f64,
    pub actuator: usize,
    pub forward: bool,
}

// Timepos helper struct for secant method
#[derive(Debug, Clone, Copy)]
struct TimePos {
    time: f64,
    position: f64,
}

/// Tracks the commanded step position of every actuator and emits the
/// step times that carry it along a segment.
///
/// A step is due when the actuator position, in steps, crosses the
/// half-step boundary between the current and the next integer position.
///
/// Backlash is modelled as slack per actuator: while an actuator last
/// moved forward its step count runs ahead of the ideal position by the
/// backlash, otherwise it matches. A reversal takes the slack up or gives
/// it back spread over the interval in which it happens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IterativeSolver {
    steps_per_meter: AxisVector,
    backlash: AxisVector,
    commanded: [i64; NUM_AXES],
    taken_up: [bool; NUM_AXES],
}

impl IterativeSolver {
    pub fn new(steps_per_meter: AxisVector) -> Self {
        Self {
            steps_per_meter,
            backlash: AxisVector::ZERO,
            commanded: [0; NUM_AXES],
            taken_up: [false; NUM_AXES],
        }
    }

    /// Backlash per actuator, in meters.
    pub fn with_backlash(mut self, backlash: AxisVector) -> Self {
        self.backlash = backlash;
        self
    }

    pub fn set_backlash(&mut self, backlash: AxisVector) {
        self.backlash = backlash;
    }

    /// Steps each actuator currently runs ahead of its ideal position.
    pub fn slack_steps(&self) -> [i64; NUM_AXES] {
        std::array::from_fn(|a| self.slack(a).round() as i64)
    }

    /// Ideal step position for a raw step count.
    pub fn without_slack(&self, steps: &[i64; NUM_AXES]) -> [i64; NUM_AXES] {
        let slack = self.slack_steps();
        std::array::from_fn(|a| steps[a] - slack[a])
    }

    /// Raw step count for an ideal step position.
    pub fn with_slack(&self, steps: &[i64; NUM_AXES]) -> [i64; NUM_AXES] {
        let slack = self.slack_steps();
        std::array::from_fn(|a| steps[a] + slack[a])
    }

    fn slack(&self, actuator: usize) -> f64 {
        if self.taken_up[actuator] {
            (self.backlash.0[actuator] * self.steps_per_meter.0[actuator]).round()
        } else {
            0.0
        }
    }

    pub fn commanded_steps(&self) -> [i64; NUM_AXES] {
        self.commanded
    }

    pub fn set_commanded_steps(&mut self, steps: [i64; NUM_AXES]) {
        self.commanded = steps;
    }

    pub fn steps_per_meter(&self) -> &AxisVector {
        &self.steps_per_meter
    }

    pub fn set_steps_per_meter(&mut self, steps_per_meter: AxisVector) {
        self.steps_per_meter = steps_per_meter;
    }

    /// Step events for the whole segment, ordered by time.
    pub fn generate_steps<C: CalcPositionCallback>(
        &mut self,
        cb: &C,
    ) -> Result<Vec<StepEvent>, KinematicsError> {
        let duration = cb.duration();
        let active = cb.active_flags();
        let mut events = Vec::new();
        if active.is_empty() || !(duration > 0.0) {
            return Ok(events);
        }

        let intervals = if cb.is_monotonic() {
            1
        } else {
            ((duration / SEEK_TIME).ceil() as usize).max(1)
        };

        let start = cb.calc_position(0.0)?;
        let mut lows: [TimePos; NUM_AXES] = std::array::from_fn(|a| TimePos {
            time: 0.0,
            position: start.0[a] * self.steps_per_meter.0[a],
        });

        for k in 1..=intervals {
            let t_hi = if k == intervals {
                duration
            } else {
                duration * k as f64 / intervals as f64
            };
            let at_hi = cb.calc_position(t_hi)?;

            for a in (0..NUM_AXES).filter(|a| active.has(*a)) {
                let spm = self.steps_per_meter.0[a];
                let raw_lo = lows[a];
                let raw_hi = TimePos {
                    time: t_hi,
                    position: at_hi.0[a] * spm,
                };
                let travel = raw_hi.position - raw_lo.position;
                let slack_before = self.slack(a);
                if travel.abs() > REVERSAL_THRESHOLD {
                    self.taken_up[a] = travel > 0.0;
                }
                let slack_after = self.slack(a);
                let span = raw_hi.time - raw_lo.time;
                let at = |time: f64| -> Result<f64, KinematicsError> {
                    let ramp = (time - raw_lo.time) / span;
                    Ok(cb.calc_position(time)?.0[a] * spm
                        + slack_before
                        + (slack_after - slack_before) * ramp)
                };

                let hi = TimePos {
                    time: t_hi,
                    position: raw_hi.position + slack_after,
                };
                let mut lo = TimePos {
                    time: raw_lo.time,
                    position: raw_lo.position + slack_before,
                };
                loop {
                    let target = hi.position.round() as i64;
                    let current = self.commanded[a];
                    if target == current {
                        break;
                    }
                    let forward = target > current;
                    let boundary = current as f64 + if forward { 0.5 } else { -0.5 };
                    let crossing = find_crossing(&at, boundary, forward, lo, hi)?;
                    events.push(StepEvent {
                        time: crossing.time,
                        actuator: a,
                        forward,
                    });
                    self.commanded[a] += if forward { 1 } else { -1 };
                    lo = crossing;
                }
                lows[a] = raw_hi;
            }
        }

        events.sort_by(|x, y| x.time.total_cmp(&y.time).then(x.actuator.cmp(&y.actuator)));
        Ok(events)
    }
}

// Find when `at` crosses `boundary` between `low` and `high`, using the
// secant method on the bracket. A guess outside the bracket, or a second
// consecutive guess landing on the same side, forces a bisection.
fn find_crossing<F>(
    at: &F,
    boundary: f64,
    forward: bool,
    mut low: TimePos,
    mut high: TimePos,
) -> Result<TimePos, KinematicsError>
where
    F: Fn(f64) -> Result<f64, KinematicsError>,
{
    let past = |position: f64| {
        let rel = position - boundary;
        if forward { rel >= 0.0 } else { rel <= 0.0 }
    };
    if past(low.position) {
        return Ok(low);
    }

    let mut last_moved_high = None;
    let mut force_bisect = false;
    for _ in 0..MAX_ITERATIONS {
        if high.time - low.time <= TIME_TOLERANCE {
            break;
        }
        let low_dist = low.position - boundary;
        let high_dist = high.position - boundary;
        let mut next_time =
            (low.time * high_dist - high.time * low_dist) / (high_dist - low_dist);
        if force_bisect || !(next_time > low.time && next_time < high.time) {
            next_time = (low.time + high.time) * 0.5;
        }

        let guess = TimePos {
            time: next_time,
            position: at(next_time)?,
        };
        if (guess.position - boundary).abs() <= POSITION_TOLERANCE {
            return Ok(guess);
        }
        let moved_high = past(guess.position);
        if moved_high {
            high = guess;
        } else {
            low = guess;
        }
        force_bisect = !force_bisect && last_moved_high == Some(moved_high);
        last_moved_high = Some(moved_high);
    }
    Ok(interpolate(low, high, boundary))
}

// Secant estimate of the crossing inside a converged bracket.
fn interpolate(low: TimePos, high: TimePos, boundary: f64) -> TimePos {
    let span = high.position - low.position;
    if span == 0.0 {
        return high;
    }
    let fraction = ((boundary - low.position) / span).clamp(0.0, 1.0);
    TimePos {
        time: low.time + (high.time - low.time) * fraction,
        position: boundary,
    }
}
