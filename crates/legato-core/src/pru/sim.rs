// Simulated coprocessor - consumes the step ring on a host thread

use crate::{
    axis::{Axis, NUM_AXES},
    pru::Coprocessor,
    shared_mem::{CONTROL_SUSPEND, SharedRing},
    step_channel::ChannelError,
    step_table::PruTiming,
};
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use tracing::debug;

const IDLE_POLL: Duration = Duration::from_micros(100);
const SLEEP_SLICE: Duration = Duration::from_millis(2);

/// Image accepted by the simulator when no real firmware is at hand.
pub const SIMULATOR_IMAGE: &[u8] = b"legato-simulated-pru";

#[derive(Default)]
struct SimState {
    endstops: AtomicU32,
    executed: [AtomicI64; NUM_AXES],
    records: AtomicU64,
}

/// Executes ring records the way the stepper firmware does.
///
/// Each record's steps are pulsed, the record is counted as consumed and
/// then its delay (plus the per-record overhead) elapses, scaled by
/// `time_scale`. Steps toward an active endstop, meaning negative steps
/// on an actuator whose endstop bit is set, are suppressed. Endstops are
/// sampled at every record boundary and during delays. While the suspend
/// word is set the simulator holds at a record boundary.
pub struct SimulatedPru {
    ring: SharedRing,
    timing: PruTiming,
    time_scale: f64,
    state: Arc<SimState>,
    image: Option<Vec<u8>>,
    worker: Option<(Arc<AtomicBool>, JoinHandle<()>)>,
}

impl SimulatedPru {
    pub fn new(ring: SharedRing, timing: PruTiming) -> Self {
        Self {
            ring,
            timing,
            time_scale: 1.0,
            state: Arc::default(),
            image: None,
            worker: None,
        }
    }

    /// Run `time_scale` times slower than real time; `0.0` runs flat out.
    pub fn with_time_scale(mut self, time_scale: f64) -> Self {
        self.time_scale = time_scale.max(0.0);
        self
    }

    pub fn handle(&self) -> SimHandle {
        SimHandle {
            state: self.state.clone(),
        }
    }

    pub fn image(&self) -> Option<&[u8]> {
        self.image.as_deref()
    }
}

impl Coprocessor for SimulatedPru {
    fn halt(&mut self) -> Result<(), ChannelError> {
        if let Some((stop, worker)) = self.worker.take() {
            stop.store(true, Ordering::Release);
            worker
                .join()
                .map_err(|_| ChannelError::Coprocessor("simulator thread panicked".into()))?;
            debug!("simulated coprocessor halted");
        }
        Ok(())
    }

    fn load(&mut self, image: &[u8]) -> Result<(), ChannelError> {
        if self.is_running() {
            return Err(ChannelError::CoprocessorRunning);
        }
        self.image = Some(image.to_vec());
        Ok(())
    }

    fn start(&mut self) -> Result<(), ChannelError> {
        if self.image.is_none() {
            return Err(ChannelError::NoFirmware);
        }
        if self.worker.is_some() {
            return Ok(());
        }
        let stop = Arc::new(AtomicBool::new(false));
        let worker = {
            let stop = stop.clone();
            let ring = self.ring.clone();
            let state = self.state.clone();
            let timing = self.timing;
            let time_scale = self.time_scale;
            thread::Builder::new()
                .name("legato-sim-pru".into())
                .spawn(move || run(&ring, timing, time_scale, &state, &stop))
                .map_err(|err| ChannelError::Coprocessor(err.to_string()))?
        };
        self.worker = Some((stop, worker));
        debug!("simulated coprocessor started");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.worker.is_some()
    }
}

impl Drop for SimulatedPru {
    fn drop(&mut self) {
        let _ = self.halt();
    }
}

fn run(ring: &SharedRing, timing: PruTiming, time_scale: f64, state: &SimState, stop: &AtomicBool) {
    let mut consumed = ring.consumed();
    let mut endstops = None;
    let mut deadline = Instant::now();

    while !stop.load(Ordering::Acquire) {
        let active = sample_endstops(ring, state, consumed, &mut endstops);

        let published = ring.published();
        ring.set_steps_remaining(published.wrapping_sub(consumed));
        if published == consumed || ring.control() == CONTROL_SUSPEND {
            thread::sleep(IDLE_POLL);
            deadline = Instant::now();
            continue;
        }

        let record = ring.record(consumed);
        for (a, executed) in state.executed.iter().enumerate() {
            let delta = record.executed_delta(a, active);
            if delta != 0 {
                executed.fetch_add(delta, Ordering::AcqRel);
            }
        }
        consumed = consumed.wrapping_add(1);
        ring.set_consumed(consumed);
        ring.set_steps_remaining(ring.published().wrapping_sub(consumed));
        state.records.fetch_add(1, Ordering::AcqRel);

        deadline += Duration::from_secs_f64(timing.record_seconds(&record) * time_scale);
        loop {
            let now = Instant::now();
            if now >= deadline || stop.load(Ordering::Acquire) {
                break;
            }
            thread::sleep((deadline - now).min(SLEEP_SLICE));
            sample_endstops(ring, state, consumed, &mut endstops);
        }
    }
}

// Publish the endstop inputs. On a change the latch is written first so
// a host that sees the new mask also sees where it took effect.
fn sample_endstops(ring: &SharedRing, state: &SimState, consumed: u32, seen: &mut Option<u32>) -> u32 {
    let active = state.endstops.load(Ordering::Acquire);
    if *seen != Some(active) {
        ring.set_endstop_latch(consumed);
        ring.set_active_endstops(active);
        *seen = Some(active);
    }
    active
}

/// Observes and pokes a simulator from other threads. Endstop changes
/// reach the ring at the simulator's next sample.
#[derive(Clone)]
pub struct SimHandle {
    state: Arc<SimState>,
}

impl SimHandle {
    pub fn press_endstop(&self, axis: Axis) {
        self.state
            .endstops
            .fetch_or(1 << axis.index(), Ordering::AcqRel);
    }

    pub fn release_endstop(&self, axis: Axis) {
        self.state
            .endstops
            .fetch_and(!(1 << axis.index()), Ordering::AcqRel);
    }

    /// Net steps executed per actuator, with suppressed steps left out.
    pub fn executed_steps(&self) -> [i64; NUM_AXES] {
        std::array::from_fn(|a| self.state.executed[a].load(Ordering::Acquire))
    }

    pub fn records_executed(&self) -> u64 {
        self.state.records.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step_table::StepRecord;

    fn wait_for(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(Instant::now() < deadline, "timed out");
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn publish(ring: &SharedRing, records: &[StepRecord]) {
        let start = ring.published();
        for (i, record) in records.iter().enumerate() {
            ring.set_record(start.wrapping_add(i as u32), *record);
        }
        ring.set_published(start.wrapping_add(records.len() as u32));
    }

    const FORWARD_X: StepRecord = StepRecord {
        step_bitmask: 0b1 | 1 << 8,
        delay: 10,
    };
    const BACKWARD_X: StepRecord = StepRecord {
        step_bitmask: 0b1,
        delay: 10,
    };

    #[test]
    fn consumes_published_records() {
        let ring = SharedRing::anonymous(8).unwrap();
        let mut pru = SimulatedPru::new(ring.clone(), PruTiming::default()).with_time_scale(0.0);
        let handle = pru.handle();
        assert!(matches!(pru.start(), Err(ChannelError::NoFirmware)));
        pru.load(SIMULATOR_IMAGE).unwrap();
        pru.start().unwrap();

        publish(&ring, &[FORWARD_X, FORWARD_X, BACKWARD_X]);
        wait_for(|| ring.consumed() == 3);
        assert_eq!(handle.executed_steps()[0], 1);
        wait_for(|| ring.steps_remaining() == 0);
        pru.halt().unwrap();
        assert!(!pru.is_running());
    }

    #[test]
    fn endstop_masks_negative_steps() {
        let ring = SharedRing::anonymous(8).unwrap();
        let mut pru = SimulatedPru::new(ring.clone(), PruTiming::default()).with_time_scale(0.0);
        let handle = pru.handle();
        pru.load(SIMULATOR_IMAGE).unwrap();
        pru.start().unwrap();

        publish(&ring, &[BACKWARD_X, BACKWARD_X]);
        wait_for(|| ring.consumed() == 2);
        handle.press_endstop(Axis::X);
        wait_for(|| ring.active_endstops() == 0b1);
        assert_eq!(ring.endstop_latch(), 2);

        publish(&ring, &[BACKWARD_X, BACKWARD_X, FORWARD_X]);
        wait_for(|| ring.consumed() == 5);
        assert_eq!(handle.executed_steps()[0], -1);
        handle.release_endstop(Axis::X);
        wait_for(|| ring.active_endstops() == 0);
        assert_eq!(ring.endstop_latch(), 5);
    }

    #[test]
    fn suspend_holds_at_record_boundary() {
        let ring = SharedRing::anonymous(8).unwrap();
        let mut pru = SimulatedPru::new(ring.clone(), PruTiming::default()).with_time_scale(0.0);
        pru.load(SIMULATOR_IMAGE).unwrap();
        pru.start().unwrap();

        ring.set_control(CONTROL_SUSPEND);
        thread::sleep(Duration::from_millis(5));
        publish(&ring, &[FORWARD_X, FORWARD_X]);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(ring.consumed(), 0);
        assert_eq!(ring.steps_remaining(), 2);

        ring.set_control(crate::shared_mem::CONTROL_RUN);
        wait_for(|| ring.consumed() == 2);
    }
}
