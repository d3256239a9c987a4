//! Injectable time source.
//!
//! Every component of the engine reads "now" through a [`ClockHandle`] instead
//! of the system clock, so that schedules and attempt bookkeeping can be driven
//! deterministically in tests.

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;

use std::sync::{Arc, Mutex};

/// Shared handle to a [`Clock`].
pub type ClockHandle = Arc<dyn Clock>;

/// Source of the current instant and the zone used to interpret it.
pub trait Clock: Send + Sync + std::fmt::Debug + 'static {
    fn now(&self) -> DateTime<Utc>;

    /// Zone calendar rules are evaluated in. Never the host default.
    fn timezone(&self) -> Tz;

    fn local_now(&self) -> DateTime<Tz> {
        self.now().with_timezone(&self.timezone())
    }
}

/// Wall clock reporting real time in a fixed zone.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    timezone: Tz,
}

impl SystemClock {
    pub fn new(timezone: Tz) -> Self {
        Self { timezone }
    }

    pub fn handle(timezone: Tz) -> ClockHandle {
        Arc::new(Self::new(timezone))
    }

    pub fn utc_handle() -> ClockHandle {
        Self::handle(chrono_tz::UTC)
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn timezone(&self) -> Tz {
        self.timezone
    }
}

/// Manually driven clock. Time only moves when told to.
#[derive(Debug)]
pub struct ArtificialClock {
    now: Mutex<DateTime<Utc>>,
    timezone: Tz,
}

impl ArtificialClock {
    pub fn new(now: DateTime<Utc>, timezone: Tz) -> Self {
        Self {
            now: Mutex::new(now),
            timezone,
        }
    }

    pub fn handle(now: DateTime<Utc>, timezone: Tz) -> Arc<Self> {
        Arc::new(Self::new(now, timezone))
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().expect("Couldn't lock clock Mutex") = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().expect("Couldn't lock clock Mutex");
        *now += by;
    }
}

impl Clock for ArtificialClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("Couldn't lock clock Mutex")
    }

    fn timezone(&self) -> Tz {
        self.timezone
    }
}
