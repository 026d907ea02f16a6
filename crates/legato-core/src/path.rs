// A single commanded move and its planned speeds

use crate::axis::{AxisMap, AxisVector};

/// How a path's axis values are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Movement {
    /// Axis values are target coordinates.
    Absolute,
    /// Axis values are displacements from the previous end position.
    Relative,
    /// Redefine the current position without moving.
    SetPosition,
}

/// One segment of commanded motion.
///
/// Paths are created unlinked. Linking resolves the start and end
/// positions from the predecessor; the queue then fills in the speeds.
#[derive(Debug, Clone, PartialEq)]
pub struct Path {
    seq: u64,
    movement: Movement,
    axes: AxisMap,
    requested_speed: f64,
    requested_acceleration: f64,
    cancellable: bool,
    soft_limits: bool,
    prev: Option<u64>,
    next: Option<u64>,
    linked: bool,
    start_pos: AxisVector,
    end_pos: AxisVector,
    vec: AxisVector,
    magnitude: f64,
    pub(crate) start_speed: f64,
    pub(crate) end_speed: f64,
    pub(crate) cruise_speed: f64,
    pub(crate) acceleration: f64,
    pub(crate) switch_distance: f64,
}

impl Path {
    pub fn new(
        movement: Movement,
        axes: AxisMap,
        speed: f64,
        acceleration: f64,
        cancellable: bool,
    ) -> Self {
        Self {
            seq: 0,
            movement,
            axes,
            requested_speed: speed,
            requested_acceleration: acceleration,
            cancellable,
            soft_limits: true,
            prev: None,
            next: None,
            linked: false,
            start_pos: AxisVector::ZERO,
            end_pos: AxisVector::ZERO,
            vec: AxisVector::ZERO,
            magnitude: 0.0,
            start_speed: 0.0,
            end_speed: 0.0,
            cruise_speed: 0.0,
            acceleration: 0.0,
            switch_distance: 0.0,
        }
    }

    pub fn absolute(axes: AxisMap, speed: f64, acceleration: f64) -> Self {
        Self::new(Movement::Absolute, axes, speed, acceleration, false)
    }

    pub fn relative(axes: AxisMap, speed: f64, acceleration: f64) -> Self {
        Self::new(Movement::Relative, axes, speed, acceleration, false)
    }

    pub fn set_position(axes: AxisMap) -> Self {
        Self::new(Movement::SetPosition, axes, 0.0, 0.0, false)
    }

    pub fn cancellable(mut self, cancellable: bool) -> Self {
        self.cancellable = cancellable;
        self
    }

    /// Whether the target is checked against each axis' soft travel
    /// limits. Homing moves run without them.
    pub fn soft_limits(mut self, enabled: bool) -> Self {
        self.soft_limits = enabled;
        self
    }

    /// Resolve this path's positions after `prev`, setting both chain links.
    /// Without a predecessor the path starts at the origin.
    pub fn link(&mut self, prev: Option<&mut Path>) {
        let start = match prev {
            Some(prev) => {
                prev.next = Some(self.seq);
                self.prev = Some(prev.seq);
                prev.end_pos
            }
            None => {
                self.prev = None;
                AxisVector::ZERO
            }
        };
        self.resolve(start);
    }

    /// Resolve positions from `start` without touching the chain links.
    pub(crate) fn link_from(&mut self, start: AxisVector) {
        self.resolve(start);
    }

    fn resolve(&mut self, start: AxisVector) {
        self.start_pos = start;
        match self.movement {
            Movement::Absolute => {
                self.end_pos = start.overwrite(&self.axes);
                self.vec = self.end_pos - start;
            }
            Movement::Relative => {
                self.vec = AxisVector::from_map(&self.axes);
                self.end_pos = start + self.vec;
            }
            Movement::SetPosition => {
                self.end_pos = start.overwrite(&self.axes);
                self.vec = AxisVector::ZERO;
            }
        }
        self.magnitude = self.vec.norm();
        self.linked = true;
    }

    /// Drop both chain links.
    pub fn unlink(&mut self) {
        self.prev = None;
        self.next = None;
    }

    pub(crate) fn unlink_next(&mut self) {
        self.next = None;
    }

    pub(crate) fn unlink_prev(&mut self) {
        self.prev = None;
    }

    pub(crate) fn set_seq(&mut self, seq: u64) {
        self.seq = seq;
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn movement(&self) -> Movement {
        self.movement
    }

    pub fn axes(&self) -> &AxisMap {
        &self.axes
    }

    pub fn is_set_position(&self) -> bool {
        self.movement == Movement::SetPosition
    }

    pub fn has_soft_limits(&self) -> bool {
        self.soft_limits
    }

    pub fn is_cancellable(&self) -> bool {
        self.cancellable
    }

    pub fn is_linked(&self) -> bool {
        self.linked
    }

    pub fn prev(&self) -> Option<u64> {
        self.prev
    }

    pub fn next(&self) -> Option<u64> {
        self.next
    }

    pub fn requested_speed(&self) -> f64 {
        self.requested_speed
    }

    pub fn requested_acceleration(&self) -> f64 {
        self.requested_acceleration
    }

    pub fn start_pos(&self) -> &AxisVector {
        &self.start_pos
    }

    pub fn end_pos(&self) -> &AxisVector {
        &self.end_pos
    }

    pub fn vec(&self) -> &AxisVector {
        &self.vec
    }

    pub fn magnitude(&self) -> f64 {
        self.magnitude
    }

    /// Unit vector along the path. Zero for paths that do not move.
    pub fn direction(&self) -> AxisVector {
        if self.magnitude > 0.0 {
            self.vec * (1.0 / self.magnitude)
        } else {
            AxisVector::ZERO
        }
    }

    pub fn start_speed(&self) -> f64 {
        self.start_speed
    }

    pub fn end_speed(&self) -> f64 {
        self.end_speed
    }

    pub fn cruise_speed(&self) -> f64 {
        self.cruise_speed
    }

    /// Acceleration after per-axis limits.
    pub fn acceleration(&self) -> f64 {
        self.acceleration
    }

    /// Distance into the path where deceleration begins.
    pub fn switch_distance(&self) -> f64 {
        self.switch_distance
    }
}
