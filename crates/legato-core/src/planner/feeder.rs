// Feeder thread - turns finalised paths into step records and streams them

use super::{Backend, PlannerState, Shared};
use crate::{
    alarm::Alarm,
    axis::Axis,
    path::Path,
    pru::Coprocessor,
    step_gen::{CalcPositionCallback, IterativeSolver, SegmentMotion},
    step_table::{StepRecord, build_step_table},
};
use parking_lot::MutexGuard;
use std::{
    sync::{Arc, atomic::Ordering},
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, error, info, warn};

const IDLE_WAIT: Duration = Duration::from_millis(50);

/// How streaming a path ended.
enum Fed {
    Done,
    /// Motion was thrown away underneath the feeder.
    Aborted,
    EndstopHit { mask: u32 },
    Underrun,
    Unplannable { reason: String },
}

/// The last path streamed, while its tail may still be executing.
struct Tail {
    seq: u64,
    cancellable: bool,
}

pub(super) struct Feeder<C> {
    shared: Arc<Shared<C>>,
    tail: Option<Tail>,
}

impl<C: Coprocessor> Feeder<C> {
    pub(super) fn new(shared: Arc<Shared<C>>) -> Self {
        Self { shared, tail: None }
    }

    pub(super) fn run(mut self) {
        debug!("feeder started");
        while let Some((path, epoch)) = self.next_path() {
            let seq = path.seq();
            let cancellable = path.is_cancellable();
            let fed = self.feed(&path, epoch);
            self.shared.state.lock().feeding = false;

            match fed {
                Fed::Done => {
                    self.tail = Some(Tail { seq, cancellable });
                }
                Fed::Aborted => {
                    debug!(seq, "path abandoned");
                    self.tail = None;
                }
                Fed::EndstopHit { mask } if cancellable => {
                    self.tail = None;
                    self.truncate(seq, mask);
                }
                Fed::EndstopHit { mask } => {
                    self.tail = None;
                    info!(seq, axes = ?Axis::from_mask(mask), "endstop reached");
                    // Steps toward the endstop are dropped by the coprocessor,
                    // so pick up from what actually ran.
                    if self.wait_drained(epoch) {
                        self.shared.backend.lock().sync_to_settled();
                    }
                }
                Fed::Underrun => {
                    self.tail = None;
                    self.underrun(seq);
                }
                Fed::Unplannable { reason } => {
                    self.tail = None;
                    self.unplannable(seq, reason);
                }
            }
            self.shared.changed.notify_all();
        }
        debug!("feeder stopped");
    }

    /// Wait for the next path that is ready to feed. While the queue holds
    /// a single path it is kept back for one lookahead period in case a
    /// successor arrives, then planned to a stop. It is not kept back while
    /// the previous path is still running into it at speed.
    fn next_path(&mut self) -> Option<(Path, u64)> {
        let shared = self.shared.clone();
        let lookahead = shared.config.lookahead_timeout();
        let mut state = shared.state.lock();
        let mut waited = Duration::ZERO;
        loop {
            if shared.shutdown.load(Ordering::Acquire) {
                return None;
            }
            let runnable = !state.suspended && state.fault.is_none();
            if runnable {
                // A path entered at speed cannot wait for a successor.
                let flush = waited >= lookahead
                    || state.flush_waiters > 0
                    || shared.backend.lock().last_end_speed > 0.0;
                if let Some(path) = state.queue.pop_ready(flush) {
                    state.feeding = true;
                    shared.not_full.notify_all();
                    return Some((path, shared.epoch.load(Ordering::Acquire)));
                }
            }

            let waiting_on_successor = runnable && state.queue.len() == 1;
            let mut timeout = if waiting_on_successor {
                lookahead.saturating_sub(waited)
            } else {
                IDLE_WAIT
            };
            if self.tail.is_some() {
                timeout = timeout.min(shared.backend.lock().channel.config().poll_interval());
            }
            let started = Instant::now();
            shared.changed.wait_for(&mut state, timeout);
            if waiting_on_successor && state.queue.len() == 1 {
                waited += started.elapsed();
            } else {
                waited = Duration::ZERO;
            }

            if let Some(alarm) = self.watch_tail(&mut state) {
                drop(state);
                shared.raise(&alarm);
                state = shared.state.lock();
            }
        }
    }

    /// Watch the endstops while the last path's records drain.
    fn watch_tail(&mut self, state: &mut MutexGuard<'_, PlannerState>) -> Option<Alarm> {
        let tail = self.tail.as_ref()?;
        let seq = tail.seq;
        let cancellable = tail.cancellable;
        let hits = {
            let mut backend = self.shared.backend.lock();
            let hits = new_endstops(&mut backend);
            if backend.channel.is_drained() {
                self.tail = None;
            }
            hits
        };
        if hits == 0 {
            return None;
        }
        self.tail = None;
        if !cancellable {
            info!(seq, axes = ?Axis::from_mask(hits), "endstop reached");
            return None;
        }
        Some(self.truncate_locked(state, seq, hits))
    }

    fn feed(&mut self, path: &Path, epoch: u64) -> Fed {
        if path.is_set_position() {
            return self.set_position(path, epoch);
        }

        let machine = self.shared.machine.read().clone();
        let mut solver = self.shared.backend.lock().solver;
        let (records, duration) = match SegmentMotion::new(&machine, path)
            .and_then(|motion| solver.generate_steps(&motion).map(|e| (e, motion.duration())))
        {
            Ok((events, duration)) => {
                let timing = self.shared.backend.lock().channel.timing();
                (build_step_table(&events, duration, timing), duration)
            }
            Err(err) => {
                error!(seq = path.seq(), %err, "step generation failed");
                return Fed::Unplannable {
                    reason: err.to_string(),
                };
            }
        };
        debug!(
            seq = path.seq(),
            records = records.len(),
            duration,
            start_speed = path.start_speed(),
            end_speed = path.end_speed(),
            "feeding path"
        );

        self.stream(&records, epoch, path, solver)
    }

    fn stream(
        &mut self,
        records: &[StepRecord],
        epoch: u64,
        path: &Path,
        solver: IterativeSolver,
    ) -> Fed {
        let mut written = 0;
        loop {
            let mut backend = self.shared.backend.lock();
            if self.shared.epoch.load(Ordering::Acquire) != epoch {
                return Fed::Aborted;
            }

            let hits = new_endstops(&mut backend);
            if hits != 0 {
                return Fed::EndstopHit { mask: hits };
            }

            let running = !backend.channel.is_suspended();
            if running
                && backend.channel.in_flight() == 0
                && (written > 0 || backend.last_end_speed > 0.0)
            {
                return Fed::Underrun;
            }

            written += backend.channel.try_enqueue(&records[written..]);
            if written == records.len() {
                backend.solver = solver;
                backend.last_end_speed = path.end_speed();
                return Fed::Done;
            }

            let poll = backend.channel.config().poll_interval();
            if !backend.channel.coprocessor().is_running() {
                warn!(seq = path.seq(), "coprocessor stopped while feeding");
                backend.last_end_speed = 0.0;
                return Fed::Aborted;
            }
            drop(backend);
            thread::sleep(poll);
        }
    }

    /// Poll until every published record has executed. False if motion
    /// was thrown away meanwhile.
    fn wait_drained(&self, epoch: u64) -> bool {
        loop {
            let backend = self.shared.backend.lock();
            if self.shared.epoch.load(Ordering::Acquire) != epoch {
                return false;
            }
            if backend.channel.is_drained() {
                return true;
            }
            let poll = backend.channel.config().poll_interval();
            drop(backend);
            thread::sleep(poll);
        }
    }

    /// Wait for everything before a position reset to execute, then
    /// redefine the actuator position.
    fn set_position(&mut self, path: &Path, epoch: u64) -> Fed {
        if !self.wait_drained(epoch) {
            return Fed::Aborted;
        }

        let ideal = match self.shared.machine.read().to_steps(path.end_pos()) {
            Ok(steps) => steps,
            Err(err) => {
                error!(seq = path.seq(), %err, "position reset is unreachable");
                return Fed::Unplannable {
                    reason: err.to_string(),
                };
            }
        };
        let mut backend = self.shared.backend.lock();
        if self.shared.epoch.load(Ordering::Acquire) != epoch {
            return Fed::Aborted;
        }
        let steps = backend.solver.with_slack(&ideal);
        backend.channel.rebase(steps);
        backend.solver.set_commanded_steps(steps);
        backend.last_end_speed = 0.0;
        backend.last_endstops = backend.channel.active_endstops();
        debug!(seq = path.seq(), ?steps, "actuator position redefined");
        Fed::Done
    }

    fn truncate(&mut self, seq: u64, mask: u32) {
        let alarm = {
            let mut state = self.shared.state.lock();
            self.truncate_locked(&mut state, seq, mask)
        };
        self.shared.raise(&alarm);
    }

    /// Endstop hit on a cancellable path: drop the rest of the queue and
    /// everything in flight, and disable the steppers.
    fn truncate_locked(&self, state: &mut PlannerState, seq: u64, mask: u32) -> Alarm {
        if let Err(err) = self.shared.flush_motion(state) {
            error!(%err, "failed to flush the step ring");
        }
        state.steppers_enabled = false;
        Alarm::EndstopHit {
            axes: Axis::from_mask(mask),
            path: seq,
        }
    }

    /// A path that cannot be turned into steps: stop where the machine is
    /// and drop everything planned after it.
    fn unplannable(&mut self, seq: u64, reason: String) {
        let alarm = {
            let mut state = self.shared.state.lock();
            if let Err(err) = self.shared.flush_motion(&mut state) {
                error!(%err, "failed to flush the step ring");
            }
            state.steppers_enabled = false;
            Alarm::PathUnreachable { path: seq, reason }
        };
        self.shared.raise(&alarm);
    }

    fn underrun(&mut self, seq: u64) {
        let alarm = Alarm::RingBufferUnderrun { path: seq };
        {
            let mut state = self.shared.state.lock();
            state.queue.clear();
            state.fault = Some(alarm.clone());
            state.suspended = true;
            state.steppers_enabled = false;
            self.shared.bump_epoch();
            let mut backend = self.shared.backend.lock();
            backend.channel.suspend();
            let commanded = backend.channel.commanded_steps();
            backend.solver.set_commanded_steps(commanded);
            backend.last_end_speed = 0.0;
            self.shared.not_full.notify_all();
        }
        self.shared.raise(&alarm);
    }
}

/// Endstop bits that were clear on the previous read.
fn new_endstops<C: Coprocessor>(backend: &mut Backend<C>) -> u32 {
    let endstops = backend.channel.active_endstops();
    let hits = endstops & !backend.last_endstops;
    backend.last_endstops = endstops;
    hits
}
