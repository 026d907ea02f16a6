// Step table construction: merging step events into coprocessor records

use crate::step_gen::StepEvent;
use serde::{Deserialize, Serialize};

/// Direction bits sit this far above the step bits.
pub const DIRECTION_SHIFT: u32 = 8;

/// One `(step_bitmask, delay)` pair as the coprocessor reads it.
///
/// Bit `i` pulses actuator `i`; bit `8 + i` sets its direction
/// (1 = positive). A record with no step bits is a pure delay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(C)]
pub struct StepRecord {
    pub step_bitmask: u32,
    pub delay: u32,
}

impl StepRecord {
    pub const fn delay(ticks: u32) -> Self {
        Self {
            step_bitmask: 0,
            delay: ticks,
        }
    }

    pub fn steps(&self) -> u32 {
        self.step_bitmask & ((1 << DIRECTION_SHIFT) - 1)
    }

    pub fn is_forward(&self, actuator: usize) -> bool {
        self.step_bitmask & (1 << (DIRECTION_SHIFT as usize + actuator)) != 0
    }

    /// Signed step count this record applies to `actuator`.
    pub fn step_delta(&self, actuator: usize) -> i64 {
        if self.steps() & (1 << actuator) == 0 {
            0
        } else if self.is_forward(actuator) {
            1
        } else {
            -1
        }
    }

    /// Step delta the coprocessor applies while the `endstops` bits are
    /// active. Negative steps on an actuator whose endstop is triggered
    /// are suppressed.
    pub fn executed_delta(&self, actuator: usize, endstops: u32) -> i64 {
        match self.step_delta(actuator) {
            delta if delta < 0 && endstops & (1 << actuator) != 0 => 0,
            delta => delta,
        }
    }
}

/// Coprocessor clock parameters used to turn seconds into delay ticks.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PruTiming {
    pub clock_hz: f64,
    /// Ticks the coprocessor spends per record on top of its delay.
    pub step_overhead_ticks: u32,
    pub min_delay_ticks: u32,
}

impl Default for PruTiming {
    fn default() -> Self {
        Self {
            clock_hz: 200_000_000.0,
            step_overhead_ticks: 42,
            min_delay_ticks: 1,
        }
    }
}

impl PruTiming {
    pub fn delay_ticks(&self, seconds: f64) -> u32 {
        let ticks = (seconds * self.clock_hz).floor();
        let ticks = if ticks.is_finite() && ticks > 0.0 {
            ticks.min(u32::MAX as f64) as u32
        } else {
            0
        };
        ticks
            .saturating_sub(self.step_overhead_ticks)
            .max(self.min_delay_ticks)
    }

    /// Wall time the coprocessor takes to execute a record.
    pub fn record_seconds(&self, record: &StepRecord) -> f64 {
        (record.delay as f64 + self.step_overhead_ticks as f64) / self.clock_hz
    }
}

pub trait RecordSink {
    fn push(&mut self, record: StepRecord);
}

impl RecordSink for Vec<StepRecord> {
    fn push(&mut self, record: StepRecord) {
        Vec::push(self, record);
    }
}

/// Merges time-ordered step events into records.
///
/// Events that fall into the same clock tick share a record unless they
/// pulse the same actuator twice. Each record's delay runs until the next
/// record; the last one runs until the end of the segment.
pub struct StepTableBuilder<S: RecordSink> {
    timing: PruTiming,
    pending: Option<(f64, u32)>,
    last_time: f64,
    sink: S,
}

impl<S: RecordSink> StepTableBuilder<S> {
    pub fn new(timing: PruTiming, sink: S) -> Self {
        Self {
            timing,
            pending: None,
            last_time: 0.0,
            sink,
        }
    }

    fn tick(&self, time: f64) -> u64 {
        (time * self.timing.clock_hz).floor() as u64
    }

    pub fn append(&mut self, event: &StepEvent) {
        let bit = 1 << event.actuator;
        let dir = if event.forward {
            1 << (DIRECTION_SHIFT as usize + event.actuator)
        } else {
            0
        };
        let time = event.time.max(self.last_time);

        match self.pending {
            Some((pending_time, mask))
                if self.tick(pending_time) == self.tick(time) && mask & bit == 0 =>
            {
                self.pending = Some((pending_time, mask | bit | dir));
            }
            Some((pending_time, mask)) => {
                self.emit(mask, time - pending_time);
                self.pending = Some((time, bit | dir));
            }
            None => {
                if time > 0.0 && self.tick(time) > 0 {
                    self.sink.push(StepRecord::delay(self.timing.delay_ticks(time)));
                }
                self.pending = Some((time, bit | dir));
            }
        }
        self.last_time = time;
    }

    fn emit(&mut self, mask: u32, seconds: f64) {
        self.sink.push(StepRecord {
            step_bitmask: mask,
            delay: self.timing.delay_ticks(seconds),
        });
    }

    /// Close the table at `duration` seconds.
    pub fn finish(mut self, duration: f64) -> S {
        match self.pending.take() {
            Some((time, mask)) => self.emit(mask, (duration - time).max(0.0)),
            None if duration > 0.0 => self.emit(0, duration),
            None => {}
        }
        self.sink
    }
}

/// Records for one segment's events.
pub fn build_step_table(events: &[StepEvent], duration: f64, timing: PruTiming) -> Vec<StepRecord> {
    let mut builder = StepTableBuilder::new(timing, Vec::with_capacity(events.len() + 2));
    for event in events {
        builder.append(event);
    }
    builder.finish(duration)
}
