//! Wall-clock service with unique-monotone timestamps.
//!
//! The node boots with no believable wall clock (like a device without a
//! battery-backed RTC): `now()` starts near zero and [`ClockService::is_desynced`]
//! holds until an external source jams the clock forward. Scheduler
//! deadlines use the underlying millisecond counter directly, which never
//! jumps.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Instant;

use super::MIN_VALID_TIMESTAMP;

/// Millisecond counter backing both the scheduler and the wall clock.
pub trait TimeSource {
    fn millis(&self) -> u64;
}

/// Process-uptime time source used by the binary.
pub struct SystemTimeSource {
    started: Instant,
}

impl SystemTimeSource {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Default for SystemTimeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for SystemTimeSource {
    fn millis(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

/// Hand-cranked time source for tests: clone the handle, advance at will.
#[derive(Clone, Default)]
pub struct ManualTime {
    now_ms: Rc<Cell<u64>>,
}

impl ManualTime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance_ms(&self, delta: u64) {
        self.now_ms.set(self.now_ms.get() + delta);
    }

    pub fn advance_secs(&self, delta: u64) {
        self.advance_ms(delta * 1000);
    }

    pub fn set_ms(&self, value: u64) {
        self.now_ms.set(value);
    }
}

impl TimeSource for ManualTime {
    fn millis(&self) -> u64 {
        self.now_ms.get()
    }
}

/// Monotonic-unique timestamp source over a settable wall-clock offset.
pub struct ClockService {
    source: Box<dyn TimeSource>,
    offset_secs: i64,
    last_unique: u32,
}

impl ClockService {
    pub fn new(source: Box<dyn TimeSource>) -> Self {
        Self {
            source,
            offset_secs: 0,
            last_unique: 0,
        }
    }

    /// Raw millisecond counter for scheduler deadlines.
    pub fn millis(&self) -> u64 {
        self.source.millis()
    }

    /// Current wall-clock time in UNIX seconds.
    pub fn now(&self) -> u32 {
        let secs = (self.source.millis() / 1000) as i64 + self.offset_secs;
        secs.clamp(0, u32::MAX as i64) as u32
    }

    /// Strictly-increasing timestamp: when the clock has not advanced since
    /// the last call, returns `previous + 1`.
    pub fn now_unique(&mut self) -> u32 {
        let mut t = self.now();
        if t <= self.last_unique {
            t = self.last_unique + 1;
        }
        self.last_unique = t;
        t
    }

    /// Jam the wall clock to `timestamp`.
    pub fn set(&mut self, timestamp: u32) {
        self.offset_secs = timestamp as i64 - (self.source.millis() / 1000) as i64;
    }

    /// True while no external source has set a believable time.
    pub fn is_desynced(&self) -> bool {
        self.now() < MIN_VALID_TIMESTAMP
    }
}
