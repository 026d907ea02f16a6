//! Host side of the coprocessor step ring.
//!
//! The channel is the only writer of the ring and the host-owned words.
//! It keeps the ring below a high watermark, reloads firmware, relays the
//! endstop and suspend handshake, and keeps a ledger of in-flight records
//! so the executed actuator position is known at any time.

use crate::{
    axis::NUM_AXES,
    pru::Coprocessor,
    shared_mem::{CONTROL_RUN, CONTROL_SUSPEND, SharedRing},
    step_table::{PruTiming, StepRecord},
};
use serde::{Deserialize, Serialize};
use std::{
    collections::VecDeque,
    fs, io,
    path::{Path, PathBuf},
    thread,
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("failed to {action} {}: {source}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("firmware image {} is empty", path.display())]
    EmptyFirmware { path: PathBuf },
    #[error("coprocessor must be halted first")]
    CoprocessorRunning,
    #[error("coprocessor is not running")]
    NotRunning,
    #[error("no firmware has been loaded")]
    NoFirmware,
    #[error("ring holds {ring} records but the channel is configured for {configured}")]
    CapacityMismatch { ring: u32, configured: u32 },
    #[error("coprocessor failure: {0}")]
    Coprocessor(String),
}

impl ChannelError {
    pub fn io(action: &'static str, path: &Path, source: io::Error) -> Self {
        Self::Io {
            action,
            path: path.to_owned(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, ChannelError>;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub clock_hz: f64,
    pub step_overhead_ticks: u32,
    pub min_delay_ticks: u32,
    /// Records in the ring. Must be a power of two.
    pub ring_capacity: u32,
    /// Fraction of the ring the host keeps filled at most.
    pub high_watermark: f64,
    pub poll_interval_us: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        let timing = PruTiming::default();
        Self {
            clock_hz: timing.clock_hz,
            step_overhead_ticks: timing.step_overhead_ticks,
            min_delay_ticks: timing.min_delay_ticks,
            ring_capacity: 4096,
            high_watermark: 0.75,
            poll_interval_us: 200,
        }
    }
}

impl ChannelConfig {
    pub fn timing(&self) -> PruTiming {
        PruTiming {
            clock_hz: self.clock_hz,
            step_overhead_ticks: self.step_overhead_ticks,
            min_delay_ticks: self.min_delay_ticks,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.poll_interval_us.max(1))
    }

    /// Most records allowed in flight at once.
    pub fn watermark_records(&self) -> u32 {
        let records = (self.ring_capacity as f64 * self.high_watermark).floor() as u32;
        records.clamp(1, self.ring_capacity)
    }
}

/// Actuator step counts split into executed and still-queued records.
///
/// Steps the coprocessor suppressed toward an active endstop are left
/// out. Records from `latch` on ran under `endstops`, earlier ones under
/// `previous`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PositionLedger {
    settled: [i64; NUM_AXES],
    pending: VecDeque<u32>,
    settled_count: u32,
    endstops: u32,
    previous: u32,
    latch: u32,
}

impl PositionLedger {
    fn push(&mut self, step_bitmask: u32) {
        self.pending.push_back(step_bitmask);
    }

    /// Take in the coprocessor's endstop mask and the record count it
    /// took effect at.
    fn observe_endstops(&mut self, endstops: u32, latch: u32) {
        if endstops != self.endstops || latch != self.latch {
            self.previous = self.endstops;
            self.endstops = endstops;
            self.latch = latch;
        }
    }

    /// Fold records up to the coprocessor's consumed count into the
    /// settled position.
    fn settle(&mut self, consumed: u32) {
        let count = (consumed.wrapping_sub(self.settled_count) as usize).min(self.pending.len());
        for (index, mask) in self.pending.drain(..count).enumerate() {
            let record_index = self.settled_count.wrapping_add(index as u32);
            // Wrapping comparison against the latch
            let blocked = if (record_index.wrapping_sub(self.latch) as i32) >= 0 {
                self.endstops
            } else {
                self.previous
            };
            apply(&mut self.settled, mask, blocked);
        }
        self.settled_count = self.settled_count.wrapping_add(count as u32);
    }

    fn discard_pending(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }

    fn restart_count(&mut self) {
        self.settled_count = 0;
        self.endstops = 0;
        self.previous = 0;
        self.latch = 0;
    }

    pub fn settled(&self) -> [i64; NUM_AXES] {
        self.settled
    }

    /// Position once every published record has run, assuming the
    /// current endstops stay as they are.
    pub fn commanded(&self) -> [i64; NUM_AXES] {
        let mut steps = self.settled;
        for mask in &self.pending {
            apply(&mut steps, *mask, self.endstops);
        }
        steps
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

fn apply(steps: &mut [i64; NUM_AXES], step_bitmask: u32, endstops: u32) {
    let record = StepRecord {
        step_bitmask,
        delay: 0,
    };
    for (a, s) in steps.iter_mut().enumerate() {
        *s += record.executed_delta(a, endstops);
    }
}

pub struct StepChannel<C> {
    ring: SharedRing,
    coprocessor: C,
    config: ChannelConfig,
    published: u32,
    ledger: PositionLedger,
    firmware: Option<Vec<u8>>,
}

impl<C: Coprocessor> StepChannel<C> {
    pub fn new(ring: SharedRing, coprocessor: C, config: ChannelConfig) -> Result<Self> {
        if ring.capacity() != config.ring_capacity {
            return Err(ChannelError::CapacityMismatch {
                ring: ring.capacity(),
                configured: config.ring_capacity,
            });
        }
        let published = ring.published();
        Ok(Self {
            ring,
            coprocessor,
            config,
            published,
            ledger: PositionLedger::default(),
            firmware: None,
        })
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn timing(&self) -> PruTiming {
        self.config.timing()
    }

    pub fn coprocessor(&self) -> &C {
        &self.coprocessor
    }

    pub fn coprocessor_mut(&mut self) -> &mut C {
        &mut self.coprocessor
    }

    /// Halt the coprocessor, reset the ring and handshake words, install
    /// the image at `path` and restart.
    ///
    /// # Panics
    ///
    /// If records are still in flight. Callers drain the channel first.
    pub fn load_firmware(&mut self, path: &Path) -> Result<()> {
        let image = fs::read(path).map_err(|source| ChannelError::io("read", path, source))?;
        if image.is_empty() {
            return Err(ChannelError::EmptyFirmware {
                path: path.to_owned(),
            });
        }
        self.load_firmware_image(image)?;
        info!(firmware = %path.display(), "coprocessor firmware loaded");
        Ok(())
    }

    /// Same as [`Self::load_firmware`] with the image already in memory.
    pub fn load_firmware_image(&mut self, image: Vec<u8>) -> Result<()> {
        assert!(
            self.is_drained(),
            "firmware reload with {} records in flight",
            self.in_flight()
        );
        if image.is_empty() {
            return Err(ChannelError::EmptyFirmware {
                path: PathBuf::from("<memory>"),
            });
        }
        self.coprocessor.halt()?;
        self.reset_ring();
        self.coprocessor.load(&image)?;
        self.coprocessor.start()?;
        self.firmware = Some(image);
        Ok(())
    }

    /// Reload the last firmware image, discarding anything in flight.
    pub fn restart(&mut self) -> Result<()> {
        let image = self.firmware.clone().ok_or(ChannelError::NoFirmware)?;
        self.coprocessor.halt()?;
        self.reconcile();
        let dropped = self.ledger.discard_pending();
        self.reset_ring();
        self.coprocessor.load(&image)?;
        self.coprocessor.start()?;
        info!(dropped, "coprocessor restarted");
        Ok(())
    }

    /// Stop at the current record boundary and discard every record the
    /// coprocessor has not consumed. Records already consumed still count.
    pub fn emergency_interrupt(&mut self) -> Result<usize> {
        self.ring.set_control(CONTROL_SUSPEND);
        self.coprocessor.halt()?;
        self.reconcile();
        let dropped = self.ledger.discard_pending();
        self.reset_ring();
        if self.firmware.is_some() {
            self.coprocessor.start()?;
        }
        warn!(dropped, "step ring flushed");
        Ok(dropped)
    }

    fn reset_ring(&mut self) {
        self.ring.reset();
        self.published = 0;
        self.ledger.restart_count();
    }

    /// Write as many records as fit below the watermark and publish them.
    /// Returns how many were written.
    pub fn try_enqueue(&mut self, records: &[StepRecord]) -> usize {
        let free = self
            .config
            .watermark_records()
            .saturating_sub(self.in_flight()) as usize;
        let count = free.min(records.len());
        if count == 0 {
            return 0;
        }
        for (i, record) in records[..count].iter().enumerate() {
            self.ring
                .set_record(self.published.wrapping_add(i as u32), *record);
            self.ledger.push(record.step_bitmask);
        }
        self.published = self.published.wrapping_add(count as u32);
        self.ring.set_published(self.published);
        count
    }

    /// Append every record, waiting for room below the watermark.
    pub fn enqueue(&mut self, records: &[StepRecord]) -> Result<()> {
        let mut written = 0;
        while written < records.len() {
            written += self.try_enqueue(&records[written..]);
            if written < records.len() {
                if !self.coprocessor.is_running() {
                    return Err(ChannelError::NotRunning);
                }
                thread::sleep(self.config.poll_interval());
            }
        }
        debug!(records = records.len(), "records enqueued");
        Ok(())
    }

    /// The coprocessor's count of unconsumed records.
    pub fn steps_remaining(&self) -> u32 {
        self.ring.steps_remaining()
    }

    /// Published records the coprocessor has not consumed yet.
    pub fn in_flight(&self) -> u32 {
        self.published.wrapping_sub(self.ring.consumed())
    }

    pub fn is_drained(&self) -> bool {
        self.in_flight() == 0 && self.steps_remaining() == 0
    }

    pub fn active_endstops(&self) -> u32 {
        self.ring.active_endstops()
    }

    pub fn suspend(&self) {
        self.ring.set_control(CONTROL_SUSPEND);
    }

    pub fn resume(&self) {
        self.ring.set_control(CONTROL_RUN);
    }

    pub fn is_suspended(&self) -> bool {
        self.ring.control() == CONTROL_SUSPEND
    }

    /// Fold everything the coprocessor has consumed into the ledger.
    pub fn reconcile(&mut self) {
        // Consumed before endstops before latch, the reverse of the order
        // the coprocessor writes them.
        let consumed = self.ring.consumed();
        let endstops = self.ring.active_endstops();
        let latch = self.ring.endstop_latch();
        self.ledger.observe_endstops(endstops, latch);
        self.ledger.settle(consumed);
    }

    /// Actuator steps the coprocessor has executed.
    pub fn settled_steps(&mut self) -> [i64; NUM_AXES] {
        self.reconcile();
        self.ledger.settled()
    }

    /// Actuator steps once everything published has executed.
    pub fn commanded_steps(&mut self) -> [i64; NUM_AXES] {
        self.reconcile();
        self.ledger.commanded()
    }

    /// Redefine the current actuator position. Anything still in flight
    /// is folded in first.
    pub fn rebase(&mut self, steps: [i64; NUM_AXES]) {
        self.reconcile();
        if self.ledger.pending() > 0 {
            warn!(
                pending = self.ledger.pending(),
                "rebasing with records in flight"
            );
            self.ledger.discard_pending();
            self.ledger.settled_count = self.ring.consumed();
            self.published = self.ring.consumed();
        }
        self.ledger.settled = steps;
    }
}
