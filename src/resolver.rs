//! Calendar rules that compute when a scheduled job is next due.

use chrono::{
    DateTime, Datelike, Days, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc,
    Weekday,
};
use chrono_tz::Tz;

use crate::clock::Clock;

/// Computes the next execution instant of a scheduled job.
///
/// Implementations must be pure with respect to the supplied clock: the same
/// instant and zone always yield the same result, and the result lies strictly
/// after `clock.now()`. Calendar rules are evaluated in `clock.timezone()`.
pub trait ExecutionTimeResolver: Send + Sync + 'static {
    fn resolve_execution_time(&self, clock: &dyn Clock) -> DateTime<Utc>;
}

impl<F> ExecutionTimeResolver for F
where
    F: Fn(&dyn Clock) -> DateTime<Utc> + Send + Sync + 'static,
{
    fn resolve_execution_time(&self, clock: &dyn Clock) -> DateTime<Utc> {
        self(clock)
    }
}

/// On the next given weekday (never today) at `hour`:00 local time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeeklyAt {
    pub weekday: Weekday,
    pub hour: u32,
}

impl WeeklyAt {
    pub const fn every_sunday_at_2am() -> Self {
        Self {
            weekday: Weekday::Sun,
            hour: 2,
        }
    }
}

impl ExecutionTimeResolver for WeeklyAt {
    fn resolve_execution_time(&self, clock: &dyn Clock) -> DateTime<Utc> {
        let today = clock.local_now().date_naive();
        let current = today.weekday().num_days_from_monday();
        let target = self.weekday.num_days_from_monday();
        let days_ahead = match (target + 7 - current) % 7 {
            0 => 7,
            n => n,
        };
        let date = today + Days::new(u64::from(days_ahead));
        at_local_hour(clock.timezone(), date, self.hour)
    }
}

/// On `day` of the following month at `hour`:00 local time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonthlyAt {
    /// Clamped to 1..=28 so that every month has the day.
    pub day: u32,
    pub hour: u32,
}

impl MonthlyAt {
    pub const fn first_of_month_at_2am() -> Self {
        Self { day: 1, hour: 2 }
    }

    pub const fn second_of_month_at_2am() -> Self {
        Self { day: 2, hour: 2 }
    }

    pub const fn third_of_month_at_2am() -> Self {
        Self { day: 3, hour: 2 }
    }
}

impl ExecutionTimeResolver for MonthlyAt {
    fn resolve_execution_time(&self, clock: &dyn Clock) -> DateTime<Utc> {
        let today = clock.local_now().date_naive();
        let (year, month) = if today.month() == 12 {
            (today.year() + 1, 1)
        } else {
            (today.year(), today.month() + 1)
        };
        let day = self.day.clamp(1, 28);
        let date = NaiveDate::from_ymd_opt(year, month, day)
            .unwrap_or_else(|| today + Days::new(28));
        at_local_hour(clock.timezone(), date, self.hour)
    }
}

/// Tomorrow at `hour`:00 local time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DailyAt {
    pub hour: u32,
}

impl DailyAt {
    pub const fn nightly_at_3am() -> Self {
        Self { hour: 3 }
    }
}

impl ExecutionTimeResolver for DailyAt {
    fn resolve_execution_time(&self, clock: &dyn Clock) -> DateTime<Utc> {
        let tomorrow = clock.local_now().date_naive() + Days::new(1);
        at_local_hour(clock.timezone(), tomorrow, self.hour)
    }
}

/// A fixed instant, e.g. the cutover time of a one-off data migration.
///
/// Only recurring runners compare execution times with the clock. A
/// [`RunOnce`](crate::JobType::RunOnce) or
/// [`RunOnEachStartup`](crate::JobType::RunOnEachStartup) record booked with
/// `AtInstant` still runs on the next startup pass, even when the instant lies
/// in the future.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtInstant(pub DateTime<Utc>);

impl ExecutionTimeResolver for AtInstant {
    fn resolve_execution_time(&self, _clock: &dyn Clock) -> DateTime<Utc> {
        self.0
    }
}

// Wall-clock times inside a DST gap move forward by the size of the gap (one hour).
fn at_local_hour(timezone: Tz, date: NaiveDate, hour: u32) -> DateTime<Utc> {
    let naive = date
        .and_hms_opt(hour.min(23), 0, 0)
        .unwrap_or_else(|| date.and_time(NaiveTime::MIN));
    local_to_utc(timezone, naive)
}

fn local_to_utc(timezone: Tz, naive: NaiveDateTime) -> DateTime<Utc> {
    timezone
        .from_local_datetime(&naive)
        .earliest()
        .or_else(|| {
            timezone
                .from_local_datetime(&(naive + Duration::hours(1)))
                .earliest()
        })
        .map(|local| local.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&naive))
}
