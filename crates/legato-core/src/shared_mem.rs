//! Memory shared with the coprocessor.
//!
//! This is the only module that touches the shared region. Every access is
//! one aligned 32-bit load or store; there are no read-modify-write
//! operations and no cached copies, so callers re-read a word each time
//! they need it. Locks cannot span the hardware boundary. Ordering comes
//! from each side owning the words it writes:
//!
//! | offset         | word                     | writer      |
//! |----------------|--------------------------|-------------|
//! | `0`            | published record count   | host        |
//! | `4 + 8k`       | record `k` mask, delay   | host        |
//! | `A`            | active endstops          | coprocessor |
//! | `A + 4`        | suspend control          | host        |
//! | `A + 8`        | steps remaining          | coprocessor |
//! | `A + 12`       | consumed record count    | coprocessor |
//! | `A + 16`       | endstop latch            | coprocessor |
//!
//! where `A = 4 + 8 * capacity`. The coprocessor stores the consumed count
//! into the endstop latch just before it publishes a new endstop mask, so
//! records from the latch on ran under the current mask. Counts wrap at
//! `u32::MAX`; record `n` lives in slot `n % capacity`, so the capacity is
//! a power of two.

use crate::step_table::StepRecord;
use std::{
    io,
    path::Path,
    ptr::NonNull,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
};

pub const CONTROL_RUN: u32 = 0;
pub const CONTROL_SUSPEND: u32 = 1;

/// Byte offsets of the ring and handshake words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingLayout {
    capacity: u32,
}

impl RingLayout {
    pub const HEADER: usize = 0;
    pub const RECORDS: usize = 4;
    const RECORD_SIZE: usize = 8;

    pub fn new(capacity: u32) -> Self {
        Self { capacity }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn record(&self, slot: u32) -> usize {
        Self::RECORDS + slot as usize * Self::RECORD_SIZE
    }

    pub fn endstops(&self) -> usize {
        Self::RECORDS + self.capacity as usize * Self::RECORD_SIZE
    }

    pub fn control(&self) -> usize {
        self.endstops() + 4
    }

    pub fn steps_remaining(&self) -> usize {
        self.endstops() + 8
    }

    pub fn consumed(&self) -> usize {
        self.endstops() + 12
    }

    pub fn endstop_latch(&self) -> usize {
        self.endstops() + 16
    }

    pub fn len(&self) -> usize {
        self.endstops() + 20
    }
}

enum Backing {
    Owned { _words: Box<[AtomicU32]> },
    #[cfg(target_os = "linux")]
    Mapped { _mapping: mapped::Mapping },
}

/// A region of 32-bit words, either host memory or a physical mapping.
pub struct SharedRegion {
    base: NonNull<AtomicU32>,
    words: usize,
    _backing: Backing,
}

// SAFETY: the region is only accessed through `AtomicU32` references and
// the backing outlives every access through `base`.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Zeroed host memory, for the simulated coprocessor and tests.
    pub fn anonymous(bytes: usize) -> Self {
        let words = bytes.div_ceil(4);
        let owned: Box<[AtomicU32]> = (0..words).map(|_| AtomicU32::new(0)).collect();
        let base = NonNull::from(&owned[..]).cast::<AtomicU32>();
        Self {
            base,
            words,
            _backing: Backing::Owned { _words: owned },
        }
    }

    /// Map `bytes` of physical memory at `address` through `/dev/mem`.
    #[cfg(target_os = "linux")]
    pub fn map_physical(address: u64, bytes: usize) -> io::Result<Self> {
        let mapping = mapped::Mapping::new(Path::new("/dev/mem"), address, bytes)?;
        let base = mapping.base();
        Ok(Self {
            base,
            words: bytes / 4,
            _backing: Backing::Mapped { _mapping: mapping },
        })
    }

    pub fn len(&self) -> usize {
        self.words * 4
    }

    pub fn is_empty(&self) -> bool {
        self.words == 0
    }

    fn word(&self, offset: usize) -> &AtomicU32 {
        assert!(
            offset % 4 == 0 && offset / 4 < self.words,
            "shared word {offset:#x} outside region of {} bytes",
            self.len()
        );
        // SAFETY: bounds and alignment checked above; the backing is alive.
        unsafe { &*self.base.as_ptr().add(offset / 4) }
    }

    pub fn load(&self, offset: usize) -> u32 {
        self.word(offset).load(Ordering::Acquire)
    }

    pub fn store(&self, offset: usize, value: u32) {
        self.word(offset).store(value, Ordering::Release)
    }
}

/// Typed access to the ring and handshake words.
#[derive(Clone)]
pub struct SharedRing {
    region: Arc<SharedRegion>,
    layout: RingLayout,
}

impl SharedRing {
    pub fn new(region: Arc<SharedRegion>, layout: RingLayout) -> io::Result<Self> {
        if layout.capacity() < 2 || !layout.capacity().is_power_of_two() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "ring capacity must be a power of two of at least 2, got {}",
                    layout.capacity()
                ),
            ));
        }
        if region.len() < layout.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "shared region of {} bytes cannot hold a ring of {} records",
                    region.len(),
                    layout.capacity()
                ),
            ));
        }
        Ok(Self { region, layout })
    }

    /// A ring in zeroed host memory.
    pub fn anonymous(capacity: u32) -> io::Result<Self> {
        let layout = RingLayout::new(capacity);
        Self::new(Arc::new(SharedRegion::anonymous(layout.len())), layout)
    }

    /// Map the ring at the physical address published by a UIO map.
    #[cfg(target_os = "linux")]
    pub fn map_uio(map_dir: &Path, capacity: u32) -> io::Result<Self> {
        let map = UioMap::read(map_dir)?;
        let region = SharedRegion::map_physical(map.address, map.size)?;
        Self::new(Arc::new(region), RingLayout::new(capacity))
    }

    pub fn layout(&self) -> RingLayout {
        self.layout
    }

    pub fn capacity(&self) -> u32 {
        self.layout.capacity()
    }

    pub fn published(&self) -> u32 {
        self.region.load(RingLayout::HEADER)
    }

    pub fn set_published(&self, count: u32) {
        self.region.store(RingLayout::HEADER, count)
    }

    pub fn record(&self, index: u32) -> StepRecord {
        let offset = self.layout.record(index % self.capacity());
        StepRecord {
            step_bitmask: self.region.load(offset),
            delay: self.region.load(offset + 4),
        }
    }

    pub fn set_record(&self, index: u32, record: StepRecord) {
        let offset = self.layout.record(index % self.capacity());
        self.region.store(offset, record.step_bitmask);
        self.region.store(offset + 4, record.delay);
    }

    pub fn active_endstops(&self) -> u32 {
        self.region.load(self.layout.endstops())
    }

    pub fn set_active_endstops(&self, mask: u32) {
        self.region.store(self.layout.endstops(), mask)
    }

    pub fn control(&self) -> u32 {
        self.region.load(self.layout.control())
    }

    pub fn set_control(&self, value: u32) {
        self.region.store(self.layout.control(), value)
    }

    pub fn steps_remaining(&self) -> u32 {
        self.region.load(self.layout.steps_remaining())
    }

    pub fn set_steps_remaining(&self, count: u32) {
        self.region.store(self.layout.steps_remaining(), count)
    }

    pub fn consumed(&self) -> u32 {
        self.region.load(self.layout.consumed())
    }

    pub fn set_consumed(&self, count: u32) {
        self.region.store(self.layout.consumed(), count)
    }

    pub fn endstop_latch(&self) -> u32 {
        self.region.load(self.layout.endstop_latch())
    }

    pub fn set_endstop_latch(&self, count: u32) {
        self.region.store(self.layout.endstop_latch(), count)
    }

    /// Zero every handshake word. Only valid while the coprocessor is halted.
    pub fn reset(&self) {
        self.set_published(0);
        self.set_active_endstops(0);
        self.set_control(CONTROL_RUN);
        self.set_steps_remaining(0);
        self.set_consumed(0);
        self.set_endstop_latch(0);
    }
}

/// Physical address and size of a UIO memory map, as published under
/// `/sys/class/uio/uioN/maps/mapM/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UioMap {
    pub address: u64,
    pub size: usize,
}

impl UioMap {
    pub fn read(map_dir: &Path) -> io::Result<Self> {
        let address = read_hex(&map_dir.join("addr"))?;
        let size = read_hex(&map_dir.join("size"))?;
        Ok(Self {
            address,
            size: size as usize,
        })
    }
}

fn read_hex(path: &Path) -> io::Result<u64> {
    let text = std::fs::read_to_string(path)?;
    let text = text.trim();
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    u64::from_str_radix(digits, 16).map_err(|err| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{}: {err}", path.display()),
        )
    })
}

#[cfg(target_os = "linux")]
mod mapped {
    use std::{
        fs::{File, OpenOptions},
        io,
        os::{fd::AsRawFd, unix::fs::OpenOptionsExt},
        path::Path,
        ptr::NonNull,
        sync::atomic::AtomicU32,
    };

    pub struct Mapping {
        ptr: NonNull<libc::c_void>,
        len: usize,
        offset: usize,
        _file: File,
    }

    impl Mapping {
        pub fn new(device: &Path, address: u64, bytes: usize) -> io::Result<Self> {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .custom_flags(libc::O_SYNC)
                .open(device)?;

            // SAFETY: sysconf has no preconditions.
            let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as u64;
            let aligned = address - address % page;
            let offset = (address - aligned) as usize;
            let len = bytes + offset;

            // SAFETY: a fresh shared mapping of an open descriptor; the
            // result is checked before use.
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED,
                    file.as_raw_fd(),
                    aligned as libc::off_t,
                )
            };
            if ptr == libc::MAP_FAILED {
                return Err(io::Error::last_os_error());
            }
            let ptr = NonNull::new(ptr)
                .ok_or_else(|| io::Error::other("mmap returned a null mapping"))?;
            Ok(Self {
                ptr,
                len,
                offset,
                _file: file,
            })
        }

        pub fn base(&self) -> NonNull<AtomicU32> {
            // SAFETY: `offset` is within the mapping and keeps 4-byte
            // alignment because physical ring addresses are word aligned.
            unsafe { self.ptr.cast::<u8>().add(self.offset).cast() }
        }
    }

    impl Drop for Mapping {
        fn drop(&mut self) {
            // SAFETY: unmapping exactly what `new` mapped.
            unsafe {
                libc::munmap(self.ptr.as_ptr(), self.len);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_offsets() {
        let layout = RingLayout::new(4);
        assert_eq!(layout.record(0), 4);
        assert_eq!(layout.record(3), 28);
        assert_eq!(layout.endstops(), 36);
        assert_eq!(layout.control(), 40);
        assert_eq!(layout.steps_remaining(), 44);
        assert_eq!(layout.consumed(), 48);
        assert_eq!(layout.endstop_latch(), 52);
        assert_eq!(layout.len(), 56);
    }

    #[test]
    fn records_wrap_around_slots() {
        let ring = SharedRing::anonymous(4).unwrap();
        let record = StepRecord {
            step_bitmask: 0x101,
            delay: 77,
        };
        ring.set_record(5, record);
        assert_eq!(ring.record(1), record);
        assert_eq!(ring.record(u32::MAX - 2), record);
    }

    #[test]
    fn reset_clears_handshake_words() {
        let ring = SharedRing::anonymous(8).unwrap();
        ring.set_published(3);
        ring.set_active_endstops(0b1);
        ring.set_control(CONTROL_SUSPEND);
        ring.set_steps_remaining(2);
        ring.set_consumed(1);
        ring.set_endstop_latch(1);
        ring.reset();
        assert_eq!(ring.published(), 0);
        assert_eq!(ring.active_endstops(), 0);
        assert_eq!(ring.control(), CONTROL_RUN);
        assert_eq!(ring.steps_remaining(), 0);
        assert_eq!(ring.consumed(), 0);
        assert_eq!(ring.endstop_latch(), 0);
    }

    #[test]
    fn region_too_small_for_ring_is_rejected() {
        let region = Arc::new(SharedRegion::anonymous(16));
        assert!(SharedRing::new(region, RingLayout::new(8)).is_err());
        assert!(SharedRing::anonymous(1).is_err());
        assert!(SharedRing::anonymous(6).is_err());
    }

    #[test]
    fn reads_uio_map() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("addr"), "0x4a310000\n").unwrap();
        std::fs::write(dir.path().join("size"), "0x00003000\n").unwrap();
        let map = UioMap::read(dir.path()).unwrap();
        assert_eq!(map.address, 0x4a31_0000);
        assert_eq!(map.size, 0x3000);
    }
}
