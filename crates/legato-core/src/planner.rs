//! The motion core's public face.
//!
//! [`PathPlanner`] owns the lookahead queue, the machine description and
//! the step channel. Callers submit paths from any thread; a dedicated
//! feeder thread pops finalised paths, turns them into step records and
//! streams them into the coprocessor ring.
//!
//! Locks are always taken in the order `state`, `machine`, `backend`.
//! Nothing takes `state` or `machine` while holding `backend`.

use crate::{
    alarm::{Alarm, AlarmCallback},
    axis::{Axis, AxisMap, AxisVector, NUM_AXES},
    bed_compensation::BedCompensationMatrix,
    config::{ConfigError, MachineConfig, PlannerConfig},
    kinematics::KinematicsError,
    machine::Machine,
    path::Path,
    path_queue::{PathError, PathQueue},
    pru::Coprocessor,
    shared_mem::SharedRing,
    step_channel::{ChannelError, StepChannel},
    step_gen::IterativeSolver,
};
use parking_lot::{Condvar, Mutex, RwLock};
use std::{
    io,
    path::Path as FsPath,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
};
use thiserror::Error;
use tracing::{debug, error, info, warn};

mod feeder;

#[derive(Debug, Error)]
pub enum PlannerError {
    #[error(transparent)]
    Path(#[from] PathError),
    #[error(transparent)]
    Kinematics(#[from] KinematicsError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("planner halted by alarm: {0}")]
    Faulted(Alarm),
    #[error("paths are still queued or feeding")]
    Busy,
    #[error("planner is shutting down")]
    ShutDown,
    #[error("failed to spawn feeder thread: {0}")]
    Spawn(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, PlannerError>;

struct PlannerState {
    queue: PathQueue,
    /// Callers blocked in `wait_until_done`. While non-zero the feeder
    /// does not hold the last path back for a successor.
    flush_waiters: usize,
    suspended: bool,
    steppers_enabled: bool,
    fault: Option<Alarm>,
    feeding: bool,
}

struct Backend<C> {
    channel: StepChannel<C>,
    solver: IterativeSolver,
    last_endstops: u32,
    /// End speed of the last path fully streamed.
    last_end_speed: f64,
}

impl<C: Coprocessor> Backend<C> {
    /// Align the solver with what the coprocessor has executed.
    fn sync_to_settled(&mut self) -> [i64; NUM_AXES] {
        let settled = self.channel.settled_steps();
        self.solver.set_commanded_steps(settled);
        self.last_end_speed = 0.0;
        settled
    }

    /// Position implied by the executed steps, less the backlash slack.
    fn settled_position(&mut self, machine: &Machine) -> std::result::Result<AxisVector, KinematicsError> {
        let settled = self.channel.settled_steps();
        machine.from_steps(&self.solver.without_slack(&settled))
    }
}

struct Shared<C> {
    state: Mutex<PlannerState>,
    not_full: Condvar,
    changed: Condvar,
    /// Bumped whenever queued or in-flight motion is thrown away.
    epoch: AtomicU64,
    shutdown: AtomicBool,
    machine: RwLock<Machine>,
    config: PlannerConfig,
    backend: Mutex<Backend<C>>,
    alarms: Mutex<Vec<AlarmCallback>>,
}

impl<C: Coprocessor> Shared<C> {
    fn bump_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn raise(&self, alarm: &Alarm) {
        if alarm.is_fatal() {
            error!(%alarm, "fatal alarm");
        } else {
            warn!(%alarm, "alarm");
        }
        for callback in self.alarms.lock().iter() {
            callback(alarm);
        }
    }

    /// Position reconstructed from executed steps.
    fn actual_position(machine: &Machine, backend: &mut Backend<C>) -> Option<AxisVector> {
        match backend.settled_position(machine) {
            Ok(position) => Some(position),
            Err(err) => {
                warn!(%err, "executed steps do not map back to a position");
                None
            }
        }
    }

    /// Throw away queued and in-flight motion and restart the chain from
    /// where the machine actually stopped. Callers hold `state`.
    fn flush_motion(&self, state: &mut PlannerState) -> Result<usize> {
        let dropped = state.queue.clear();
        self.bump_epoch();
        let machine = self.machine.read();
        let mut backend = self.backend.lock();
        backend.channel.emergency_interrupt()?;
        backend.sync_to_settled();
        backend.last_endstops = backend.channel.active_endstops();
        if let Some(position) = Self::actual_position(&machine, &mut backend) {
            state.queue.reset_position(position);
        }
        self.not_full.notify_all();
        self.changed.notify_all();
        Ok(dropped)
    }
}

/// Plans paths and streams their steps to a coprocessor.
pub struct PathPlanner<C: Coprocessor + 'static> {
    shared: Arc<Shared<C>>,
    feeder: Option<JoinHandle<()>>,
}

impl<C: Coprocessor + 'static> PathPlanner<C> {
    /// Start planning for `machine`, streaming through `channel`.
    /// The current actuator position is taken as the origin.
    pub fn new(machine: Machine, config: PlannerConfig, mut channel: StepChannel<C>) -> Result<Self> {
        let mut solver = IterativeSolver::new(machine.axes.steps_per_meter())
            .with_backlash(machine.axes.backlash());
        solver.set_commanded_steps(channel.settled_steps());
        let last_endstops = channel.active_endstops();

        let shared = Arc::new(Shared {
            state: Mutex::new(PlannerState {
                queue: PathQueue::new(config.queue_capacity),
                flush_waiters: 0,
                suspended: false,
                steppers_enabled: true,
                fault: None,
                feeding: false,
            }),
            not_full: Condvar::new(),
            changed: Condvar::new(),
            epoch: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            machine: RwLock::new(machine),
            config,
            backend: Mutex::new(Backend {
                channel,
                solver,
                last_endstops,
                last_end_speed: 0.0,
            }),
            alarms: Mutex::new(Vec::new()),
        });

        let feeder = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("legato-feeder".into())
                .spawn(move || feeder::Feeder::new(shared).run())
                .map_err(PlannerError::Spawn)?
        };

        Ok(Self {
            shared,
            feeder: Some(feeder),
        })
    }

    /// Build the machine and channel described by `config` on `ring`.
    pub fn from_config(config: &MachineConfig, ring: SharedRing, coprocessor: C) -> Result<Self> {
        let machine = config.build_machine()?;
        let channel = StepChannel::new(ring, coprocessor, config.channel)?;
        Self::new(machine, config.planner, channel)
    }

    /// Register a callback for alarms raised while feeding.
    pub fn on_alarm<F>(&self, callback: F)
    where
        F: Fn(&Alarm) + Send + Sync + 'static,
    {
        self.shared.alarms.lock().push(Box::new(callback));
    }

    /// Queue `path` behind everything already accepted, blocking while
    /// the queue is full. Returns the path's sequence number.
    pub fn add_path(&self, path: Path) -> Result<u64> {
        let mut state = self.shared.state.lock();
        loop {
            if self.shared.shutdown.load(Ordering::Acquire) {
                return Err(PlannerError::ShutDown);
            }
            if let Some(alarm) = &state.fault {
                return Err(PlannerError::Faulted(alarm.clone()));
            }
            if !state.queue.is_full() {
                break;
            }
            self.shared.not_full.wait(&mut state);
        }

        let seq = {
            let machine = self.shared.machine.read();
            state.queue.push(path, &machine)?
        };
        if !state.steppers_enabled {
            info!("enabling steppers");
            state.steppers_enabled = true;
        }
        self.shared.changed.notify_all();
        Ok(seq)
    }

    /// Remove a path that has not started feeding yet. The front path is
    /// refused once the path feeding ahead of it runs into it at speed.
    pub fn cancel_path(&self, seq: u64) -> Result<()> {
        let mut state = self.shared.state.lock();
        let machine = self.shared.machine.read();
        state.queue.cancel(seq, &machine)?;
        debug!(seq, "path cancelled");
        self.shared.not_full.notify_all();
        self.shared.changed.notify_all();
        Ok(())
    }

    /// Block until every accepted path has been fed and executed.
    pub fn wait_until_done(&self) -> Result<()> {
        let poll = self.shared.backend.lock().channel.config().poll_interval();
        let mut state = self.shared.state.lock();
        state.flush_waiters += 1;
        self.shared.changed.notify_all();

        let outcome = loop {
            if self.shared.shutdown.load(Ordering::Acquire) {
                break Err(PlannerError::ShutDown);
            }
            if let Some(alarm) = &state.fault {
                break Err(PlannerError::Faulted(alarm.clone()));
            }
            if state.queue.is_empty() && !state.feeding {
                let mut backend = self.shared.backend.lock();
                if backend.channel.is_drained() {
                    backend.channel.reconcile();
                    break Ok(());
                }
            }
            self.shared.changed.wait_for(&mut state, poll);
        };

        state.flush_waiters -= 1;
        outcome
    }

    /// Home `axes`: run each toward its endstop, take the endstop as
    /// `-home_offset` and move back to zero. Belt machines home one axis
    /// at a time.
    pub fn home(&self, axes: &[Axis]) -> Result<()> {
        let separately = self.shared.machine.read().kinematics.mode().homes_axes_separately();
        if separately {
            for axis in axes {
                self.home_together(std::slice::from_ref(axis))?;
            }
            Ok(())
        } else {
            self.home_together(axes)
        }
    }

    fn home_together(&self, axes: &[Axis]) -> Result<()> {
        if axes.is_empty() {
            return Ok(());
        }
        let machine = self.shared.machine.read().clone();
        let mut travel = AxisMap::new();
        let mut found = AxisMap::new();
        let mut center = AxisMap::new();
        let mut speed = f64::INFINITY;
        let mut acceleration = f64::INFINITY;
        for &axis in axes {
            let limits = machine.axes.limits(axis);
            if limits.travel_length != 0.0 {
                travel.insert(axis, -limits.travel_length);
            }
            found.insert(axis, -limits.home_offset);
            if limits.home_offset != 0.0 {
                center.insert(axis, 0.0);
            }
            speed = speed.min(limits.home_speed);
            acceleration = acceleration.min(limits.acceleration);
        }

        info!(axes = ?axes, "homing");
        if !travel.is_empty() {
            self.add_path(Path::relative(travel, speed, acceleration).soft_limits(false))?;
        }
        self.add_path(Path::set_position(found))?;
        if !center.is_empty() {
            self.add_path(Path::absolute(center, speed, acceleration).soft_limits(false))?;
        }
        self.wait_until_done()?;
        info!(axes = ?axes, "homing done");
        Ok(())
    }

    /// Drop every queued path and every record the coprocessor has not
    /// reached yet. Motion stops at the current record boundary and the
    /// steppers are disabled.
    pub fn emergency_interrupt(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        let dropped = self.shared.flush_motion(&mut state)?;
        state.steppers_enabled = false;
        warn!(dropped, "emergency interrupt");
        Ok(())
    }

    /// Hold the coprocessor at the next record boundary and stop feeding.
    pub fn suspend(&self) {
        let mut state = self.shared.state.lock();
        state.suspended = true;
        self.shared.backend.lock().channel.suspend();
        self.shared.changed.notify_all();
        info!("motion suspended");
    }

    pub fn resume(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        if let Some(alarm) = &state.fault {
            return Err(PlannerError::Faulted(alarm.clone()));
        }
        state.suspended = false;
        state.steppers_enabled = true;
        self.shared.backend.lock().channel.resume();
        self.shared.changed.notify_all();
        info!("motion resumed");
        Ok(())
    }

    /// Current position per axis.
    ///
    /// `ideal` reports where the accepted paths end; otherwise the
    /// position is rebuilt from the steps the coprocessor has executed.
    pub fn get_current_pos(&self, in_millimeters: bool, ideal: bool) -> Result<AxisMap> {
        let position = {
            let state = self.shared.state.lock();
            if ideal {
                state.queue.last_position()
            } else {
                let machine = self.shared.machine.read();
                self.shared.backend.lock().settled_position(&machine)?
            }
        };
        let scale = if in_millimeters { 1000.0 } else { 1.0 };
        Ok(position.scale(scale).to_map())
    }

    /// Change one axis' limits once the machine is idle. The physical
    /// position is kept across a steps-per-meter change.
    pub fn set_axis_config(
        &self,
        axis: Axis,
        steps_per_meter: f64,
        max_speed: f64,
        min_speed: f64,
        acceleration: f64,
        jerk: f64,
    ) -> Result<()> {
        self.wait_until_done()?;
        let _state = self.shared.state.lock();
        let mut machine = self.shared.machine.write();
        let mut backend = self.shared.backend.lock();

        let position = backend.settled_position(&machine)?;
        let mut updated = machine.clone();
        updated
            .axes
            .set_axis_config(axis, steps_per_meter, max_speed, min_speed, acceleration, jerk)?;
        let ideal = updated.to_steps(&position)?;
        *machine = updated;

        backend.solver.set_steps_per_meter(machine.axes.steps_per_meter());
        backend.solver.set_backlash(machine.axes.backlash());
        let steps = backend.solver.with_slack(&ideal);
        backend.solver.set_commanded_steps(steps);
        backend.channel.rebase(steps);
        info!(%axis, steps_per_meter, max_speed, min_speed, acceleration, jerk, "axis config updated");
        Ok(())
    }

    /// Replace the bed surface. Later paths are compensated with it.
    pub fn set_bed_compensation_matrix(&self, matrix: BedCompensationMatrix) {
        let _state = self.shared.state.lock();
        self.shared.machine.write().bed = matrix;
        info!(coefficients = ?matrix.coefficients(), "bed compensation updated");
    }

    pub fn machine(&self) -> Machine {
        self.shared.machine.read().clone()
    }

    /// Drain, then reload the coprocessor from the image at `path`.
    pub fn load_firmware(&self, path: &FsPath) -> Result<()> {
        self.wait_until_done()?;
        let state = self.shared.state.lock();
        if !state.queue.is_empty() || state.feeding {
            return Err(PlannerError::Busy);
        }
        let mut backend = self.shared.backend.lock();
        if !backend.channel.is_drained() {
            return Err(PlannerError::Busy);
        }
        backend.channel.load_firmware(path)?;
        backend.last_end_speed = 0.0;
        backend.last_endstops = backend.channel.active_endstops();
        Ok(())
    }

    /// Same as [`Self::load_firmware`] with the image in memory.
    pub fn load_firmware_image(&self, image: Vec<u8>) -> Result<()> {
        self.wait_until_done()?;
        let state = self.shared.state.lock();
        if !state.queue.is_empty() || state.feeding {
            return Err(PlannerError::Busy);
        }
        let mut backend = self.shared.backend.lock();
        if !backend.channel.is_drained() {
            return Err(PlannerError::Busy);
        }
        backend.channel.load_firmware_image(image)?;
        backend.last_end_speed = 0.0;
        backend.last_endstops = backend.channel.active_endstops();
        info!("coprocessor firmware loaded");
        Ok(())
    }

    /// Reload the last firmware, drop all motion and clear any fault.
    pub fn restart(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        let dropped = state.queue.clear();
        self.shared.bump_epoch();
        {
            let machine = self.shared.machine.read();
            let mut backend = self.shared.backend.lock();
            backend.channel.restart()?;
            backend.sync_to_settled();
            backend.last_endstops = backend.channel.active_endstops();
            if let Some(position) = Shared::actual_position(&machine, &mut backend) {
                state.queue.reset_position(position);
            }
        }
        state.fault = None;
        state.suspended = false;
        state.steppers_enabled = true;
        self.shared.not_full.notify_all();
        self.shared.changed.notify_all();
        info!(dropped, "planner restarted");
        Ok(())
    }

    pub fn queued_len(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    pub fn steppers_enabled(&self) -> bool {
        self.shared.state.lock().steppers_enabled
    }

    pub fn is_suspended(&self) -> bool {
        self.shared.state.lock().suspended
    }

    pub fn fault(&self) -> Option<Alarm> {
        self.shared.state.lock().fault.clone()
    }

    pub fn steps_remaining(&self) -> u32 {
        self.shared.backend.lock().channel.steps_remaining()
    }
}

impl<C: Coprocessor + 'static> Drop for PathPlanner<C> {
    fn drop(&mut self) {
        {
            let _state = self.shared.state.lock();
            self.shared.shutdown.store(true, Ordering::Release);
            self.shared.bump_epoch();
            self.shared.not_full.notify_all();
            self.shared.changed.notify_all();
        }
        if let Some(feeder) = self.feeder.take()
            && feeder.join().is_err()
        {
            error!("feeder thread panicked");
        }
    }
}
