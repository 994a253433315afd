//! Schedule specifications and next-fire computation.
//!
//! Three kinds of schedule:
//! - `Cron`: 5-field (minute precision) or 6-field (leading seconds)
//!   expressions, evaluated in an IANA timezone
//! - `FixedInterval`: every N, aligned to the registration instant
//! - `OneShot`: a single instant
//!
//! Every way a schedule can be invalid is detected when it is built or
//! registered; nothing here fails once a job is in the registry.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use croner::Cron;

use crate::ScheduleParseError;

/// A parsed cron expression bound to a timezone.
#[derive(Clone)]
pub struct CronSchedule {
    expr: String,
    timezone: Tz,
    cron: Arc<Cron>,
}

impl fmt::Debug for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CronSchedule")
            .field("expr", &self.expr)
            .field("timezone", &self.timezone.name())
            .finish()
    }
}

impl PartialEq for CronSchedule {
    fn eq(&self, other: &Self) -> bool {
        self.expr == other.expr && self.timezone == other.timezone
    }
}

impl CronSchedule {
    /// Parse `expr` to be evaluated in `timezone`.
    ///
    /// Accepts `minute hour day-of-month month day-of-week`, the same with a
    /// leading seconds field, or an `@` nickname (`@hourly`, `@daily`, ...).
    ///
    /// # Errors
    ///
    /// - `FieldCount` for anything other than 5 or 6 fields
    /// - `InvalidCron` when a field does not parse
    /// - `NoUpcomingFire` for expressions that can never match, such as
    ///   `0 0 31 2 *`
    pub fn parse(expr: &str, timezone: Tz) -> Result<Self, ScheduleParseError> {
        let expr = expr.trim();

        if !expr.starts_with('@') {
            let found = expr.split_whitespace().count();
            if !(5..=6).contains(&found) {
                return Err(ScheduleParseError::FieldCount {
                    expr: expr.to_string(),
                    found,
                });
            }
        }

        let cron = Cron::new(expr)
            .with_seconds_optional()
            .parse()
            .map_err(|e| ScheduleParseError::InvalidCron {
                expr: expr.to_string(),
                reason: e.to_string(),
            })?;

        let schedule = Self {
            expr: expr.to_string(),
            timezone,
            cron: Arc::new(cron),
        };

        if schedule.next_after(Utc::now()).is_none() {
            return Err(ScheduleParseError::NoUpcomingFire(expr.to_string()));
        }

        Ok(schedule)
    }

    /// Parse `expr` evaluated in UTC.
    pub fn utc(expr: &str) -> Result<Self, ScheduleParseError> {
        Self::parse(expr, Tz::UTC)
    }

    /// The expression as given (trimmed).
    pub fn expression(&self) -> &str {
        &self.expr
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// Smallest matching instant strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let local = after.with_timezone(&self.timezone);
        self.cron
            .find_next_occurrence(&local, false)
            .ok()
            .map(|next| next.with_timezone(&Utc))
    }

    /// The next `count` fire times after `after`.
    pub fn upcoming(&self, after: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        let mut times = Vec::with_capacity(count);
        let mut cursor = after;
        while times.len() < count {
            match self.next_after(cursor) {
                Some(next) => {
                    times.push(next);
                    cursor = next;
                }
                None => break,
            }
        }
        times
    }
}

/// When a job fires.
#[derive(Debug, Clone, PartialEq)]
pub enum ScheduleSpec {
    /// Calendar-based recurrence
    Cron(CronSchedule),
    /// Every `Duration`, starting one interval after registration
    FixedInterval(Duration),
    /// Once, at the given instant
    OneShot(DateTime<Utc>),
}

impl ScheduleSpec {
    /// Cron schedule evaluated in UTC.
    pub fn cron(expr: &str) -> Result<Self, ScheduleParseError> {
        CronSchedule::utc(expr).map(Self::Cron)
    }

    /// Cron schedule evaluated in `timezone`.
    pub fn cron_in(expr: &str, timezone: Tz) -> Result<Self, ScheduleParseError> {
        CronSchedule::parse(expr, timezone).map(Self::Cron)
    }

    /// Fixed interval; must be non-zero.
    pub fn every(interval: Duration) -> Result<Self, ScheduleParseError> {
        if interval.is_zero() {
            return Err(ScheduleParseError::ZeroDuration);
        }
        Ok(Self::FixedInterval(interval))
    }

    /// Fire once at `fire_at`.
    pub fn at(fire_at: DateTime<Utc>) -> Self {
        Self::OneShot(fire_at)
    }

    /// Fire once, `delay` from now; the delay must be non-zero.
    pub fn delay(delay: Duration) -> Result<Self, ScheduleParseError> {
        if delay.is_zero() {
            return Err(ScheduleParseError::ZeroDuration);
        }
        let delay = chrono::Duration::from_std(delay).map_err(|_| ScheduleParseError::ZeroDuration)?;
        Ok(Self::OneShot(Utc::now() + delay))
    }

    pub fn is_one_shot(&self) -> bool {
        matches!(self, Self::OneShot(_))
    }

    /// The next fire time strictly after `after`.
    ///
    /// - Cron: the smallest matching instant after `after`
    /// - FixedInterval: `after + interval`
    /// - OneShot: the fire instant while it is still ahead, then `None`
    pub fn next_fire_time(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Cron(cron) => cron.next_after(after),
            Self::FixedInterval(interval) => {
                let step = chrono::Duration::from_std(*interval).ok()?;
                after.checked_add_signed(step)
            }
            Self::OneShot(fire_at) => (*fire_at > after).then_some(*fire_at),
        }
    }

    /// Next fire time once the tick due at `previous_due` has been handed
    /// out, observed at `now`.
    ///
    /// Fixed intervals stay on the grid `previous_due + k * interval` and
    /// skip every grid point at or before `now`: a late wake-up produces one
    /// firing, never a backlog, and does not shift later ticks.
    pub fn next_after_tick(
        &self,
        previous_due: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        match self {
            Self::Cron(cron) => cron.next_after(now.max(previous_due)),
            Self::FixedInterval(interval) => {
                let step_ns = chrono::Duration::from_std(*interval)
                    .ok()?
                    .num_nanoseconds()?
                    .max(1);
                let behind_ns = (now - previous_due).num_nanoseconds()?.max(0);
                let ticks = behind_ns / step_ns + 1;
                let offset = chrono::Duration::nanoseconds(step_ns.checked_mul(ticks)?);
                previous_due.checked_add_signed(offset)
            }
            Self::OneShot(_) => None,
        }
    }

    /// First fire time for a job registered at `now`.
    ///
    /// # Errors
    ///
    /// Returns the reason a schedule can never fire: a zero interval, a
    /// one-shot instant already in the past, or a cron expression with no
    /// upcoming match.
    pub fn first_fire_time(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleParseError> {
        match self {
            Self::Cron(cron) => cron
                .next_after(now)
                .ok_or_else(|| ScheduleParseError::NoUpcomingFire(cron.expression().to_string())),
            Self::FixedInterval(interval) if interval.is_zero() => {
                Err(ScheduleParseError::ZeroDuration)
            }
            Self::FixedInterval(_) => self
                .next_fire_time(now)
                .ok_or(ScheduleParseError::ZeroDuration),
            Self::OneShot(fire_at) => self
                .next_fire_time(now)
                .ok_or(ScheduleParseError::OneShotInPast(*fire_at)),
        }
    }
}

impl fmt::Display for ScheduleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cron(cron) if cron.timezone == Tz::UTC => write!(f, "cron({})", cron.expr),
            Self::Cron(cron) => write!(f, "cron({}, {})", cron.expr, cron.timezone.name()),
            Self::FixedInterval(interval) => write!(f, "every {}ms", interval.as_millis()),
            Self::OneShot(fire_at) => write!(f, "once at {}", fire_at.to_rfc3339()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn test_cron_five_fields() {
        let spec = ScheduleSpec::cron("*/15 * * * *").unwrap();
        let next = spec.next_fire_time(utc(2026, 1, 1, 0, 7, 30)).unwrap();
        assert_eq!(next, utc(2026, 1, 1, 0, 15, 0));
    }

    #[test]
    fn test_cron_six_fields_with_seconds() {
        let spec = ScheduleSpec::cron("30 * * * * *").unwrap();
        let next = spec.next_fire_time(utc(2026, 1, 1, 0, 0, 0)).unwrap();
        assert_eq!(next, utc(2026, 1, 1, 0, 0, 30));
    }

    #[test]
    fn test_cron_strictly_after_reference() {
        let spec = ScheduleSpec::cron("*/15 * * * *").unwrap();
        let on_match = utc(2026, 1, 1, 0, 15, 0);
        let next = spec.next_fire_time(on_match).unwrap();
        assert_eq!(next, utc(2026, 1, 1, 0, 30, 0));
    }

    #[test]
    fn test_cron_is_deterministic_and_increasing() {
        let spec = ScheduleSpec::cron("0 9 * * MON-FRI").unwrap();
        let references = [
            utc(2026, 1, 3, 10, 0, 0),
            utc(2026, 2, 28, 23, 59, 59),
            utc(2026, 12, 31, 9, 0, 0),
        ];
        for reference in references {
            let first = spec.next_fire_time(reference).unwrap();
            let second = spec.next_fire_time(reference).unwrap();
            assert_eq!(first, second);
            assert!(first > reference);
        }
        // Saturday 2026-01-03 -> Monday 2026-01-05
        assert_eq!(
            spec.next_fire_time(utc(2026, 1, 3, 10, 0, 0)).unwrap(),
            utc(2026, 1, 5, 9, 0, 0)
        );
    }

    #[test]
    fn test_cron_in_timezone() {
        let spec = ScheduleSpec::cron_in("0 9 * * *", chrono_tz::America::New_York).unwrap();
        let next = spec.next_fire_time(utc(2026, 1, 1, 0, 0, 0)).unwrap();
        assert_eq!(next, utc(2026, 1, 1, 14, 0, 0));
    }

    #[test]
    fn test_cron_field_count() {
        assert!(matches!(
            ScheduleSpec::cron("* * *"),
            Err(ScheduleParseError::FieldCount { found: 3, .. })
        ));
        assert!(matches!(
            ScheduleSpec::cron("0 0 0 * * * 2026"),
            Err(ScheduleParseError::FieldCount { found: 7, .. })
        ));
        assert!(matches!(
            ScheduleSpec::cron(""),
            Err(ScheduleParseError::FieldCount { found: 0, .. })
        ));
    }

    #[test]
    fn test_cron_malformed_field() {
        assert!(matches!(
            ScheduleSpec::cron("61 * * * *"),
            Err(ScheduleParseError::InvalidCron { .. })
        ));
        assert!(matches!(
            ScheduleSpec::cron("invalid cron expression here now"),
            Err(ScheduleParseError::InvalidCron { .. })
        ));
    }

    #[test]
    fn test_cron_impossible_date_rejected() {
        let result = ScheduleSpec::cron("0 0 31 2 *");
        assert!(
            matches!(
                result,
                Err(ScheduleParseError::NoUpcomingFire(_)) | Err(ScheduleParseError::InvalidCron { .. })
            ),
            "31 February must be rejected, got {:?}",
            result
        );
    }

    #[test]
    fn test_cron_upcoming() {
        let cron = CronSchedule::utc("0 0 * * *").unwrap();
        let times = cron.upcoming(utc(2026, 3, 1, 12, 0, 0), 3);
        assert_eq!(
            times,
            vec![
                utc(2026, 3, 2, 0, 0, 0),
                utc(2026, 3, 3, 0, 0, 0),
                utc(2026, 3, 4, 0, 0, 0)
            ]
        );
    }

    #[test]
    fn test_interval_must_be_positive() {
        assert_eq!(
            ScheduleSpec::every(Duration::ZERO),
            Err(ScheduleParseError::ZeroDuration)
        );
        assert_eq!(
            ScheduleSpec::delay(Duration::ZERO),
            Err(ScheduleParseError::ZeroDuration)
        );
    }

    #[test]
    fn test_interval_next_fire_time() {
        let spec = ScheduleSpec::every(Duration::from_secs(30)).unwrap();
        let t0 = utc(2026, 1, 1, 0, 0, 0);
        assert_eq!(spec.next_fire_time(t0), Some(t0 + chrono::Duration::seconds(30)));
    }

    #[test]
    fn test_interval_ticks_without_drift() {
        let spec = ScheduleSpec::every(Duration::from_secs(30)).unwrap();
        let t0 = utc(2026, 1, 1, 0, 0, 0);
        let at = |secs: i64| t0 + chrono::Duration::seconds(secs);

        let first = spec.first_fire_time(t0).unwrap();
        assert_eq!(first, at(30));
        assert_eq!(spec.next_after_tick(at(30), at(30)), Some(at(60)));
        assert_eq!(spec.next_after_tick(at(60), at(60)), Some(at(90)));

        // Loop woke late at 95s for the 90s tick: next target stays on the grid
        assert_eq!(spec.next_after_tick(at(90), at(95)), Some(at(120)));

        // Several ticks missed: only the next future grid point remains
        assert_eq!(spec.next_after_tick(at(30), at(125)), Some(at(150)));
    }

    #[test]
    fn test_one_shot() {
        let now = utc(2026, 1, 1, 0, 0, 0);
        let fire_at = now + chrono::Duration::minutes(5);
        let spec = ScheduleSpec::at(fire_at);

        assert!(spec.is_one_shot());
        assert_eq!(spec.next_fire_time(now), Some(fire_at));
        assert_eq!(spec.next_fire_time(fire_at), None);
        assert_eq!(spec.next_after_tick(fire_at, fire_at), None);
        assert_eq!(spec.first_fire_time(now), Ok(fire_at));
        assert_eq!(
            spec.first_fire_time(fire_at + chrono::Duration::seconds(1)),
            Err(ScheduleParseError::OneShotInPast(fire_at))
        );
    }

    #[test]
    fn test_delay_is_in_future() {
        let before = Utc::now();
        let spec = ScheduleSpec::delay(Duration::from_secs(10)).unwrap();
        match spec {
            ScheduleSpec::OneShot(fire_at) => assert!(fire_at > before),
            other => panic!("expected one-shot, got {:?}", other),
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(
            ScheduleSpec::cron("0 * * * *").unwrap().to_string(),
            "cron(0 * * * *)"
        );
        assert_eq!(
            ScheduleSpec::cron_in("0 * * * *", chrono_tz::Europe::London)
                .unwrap()
                .to_string(),
            "cron(0 * * * *, Europe/London)"
        );
        assert_eq!(
            ScheduleSpec::every(Duration::from_secs(30)).unwrap().to_string(),
            "every 30000ms"
        );
    }
}
