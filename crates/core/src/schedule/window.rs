//! Publish windows, local day bounds and plan slots.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::catalog::{PublishSettings, DAY_KEYS};

/// Resolve a project timezone. Unknown names fall back to UTC; the returned
/// name is the one actually used.
pub fn resolve_timezone(name: &str) -> (Tz, String) {
    match name.parse::<Tz>() {
        Ok(tz) => (tz, name.to_string()),
        Err(_) => (Tz::UTC, "UTC".to_string()),
    }
}

/// Weekday key (`mon`..`sun`) of a date.
pub fn day_key(date: NaiveDate) -> &'static str {
    DAY_KEYS[date.weekday().num_days_from_monday() as usize]
}

/// Windows configured for the weekday of `date`.
pub fn day_windows(settings: &PublishSettings, date: NaiveDate) -> Vec<[String; 2]> {
    settings
        .windows
        .get(day_key(date))
        .cloned()
        .unwrap_or_default()
}

fn parse_hhmm(value: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M").ok()
}

/// Whether `now` falls inside one of today's windows, in the project's
/// timezone. Both ends are inclusive at minute resolution.
pub fn in_window(settings: &PublishSettings, now: DateTime<Utc>) -> bool {
    let (tz, _) = resolve_timezone(&settings.timezone);
    let local = now.with_timezone(&tz);
    let current = local.format("%H:%M").to_string();

    day_windows(settings, local.date_naive())
        .iter()
        .any(|[start, end]| start.as_str() <= current.as_str() && current.as_str() <= end.as_str())
}

/// Local midnight of `date` in `tz`, as UTC. DST gaps at midnight resolve to
/// the first valid instant of the day.
pub fn local_midnight(tz: Tz, date: NaiveDate) -> DateTime<Utc> {
    let mut time = NaiveTime::MIN;
    for _ in 0..4 {
        if let Some(dt) = tz.from_local_datetime(&date.and_time(time)).earliest() {
            return dt.with_timezone(&Utc);
        }
        time += Duration::minutes(30);
    }
    date.and_time(NaiveTime::MIN).and_utc()
}

/// UTC bounds `[start, end)` of the local calendar day `date`.
pub fn local_day_bounds(tz: Tz, date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = local_midnight(tz, date);
    let end = date
        .succ_opt()
        .map(|next| local_midnight(tz, next))
        .unwrap_or(start + Duration::days(1));
    (start, end)
}

/// `now` minus `hours`, saturating at the earliest representable instant.
pub fn hours_before(now: DateTime<Utc>, hours: i64) -> DateTime<Utc> {
    Duration::try_hours(hours.max(0))
        .and_then(|span| now.checked_sub_signed(span))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Publish slots for one destination on `date`.
///
/// Each window is walked from its start in `min_gap_minutes` steps (at least
/// one minute) while the slot is not past the window end; a gap too large
/// for the calendar yields only the window start. At most
/// `daily_limit - already_published` slots are produced. Malformed windows
/// and local times that do not exist are skipped.
pub fn compute_slots(
    windows: &[[String; 2]],
    min_gap_minutes: i64,
    daily_limit: i64,
    already_published: i64,
    tz: Tz,
    date: NaiveDate,
) -> Vec<DateTime<Tz>> {
    let remaining = daily_limit - already_published;
    if remaining <= 0 {
        return Vec::new();
    }
    let remaining = remaining as usize;
    let gap = Duration::try_minutes(min_gap_minutes.max(1));

    let mut slots = Vec::new();
    for [start, end] in windows {
        let (Some(start), Some(end)) = (parse_hhmm(start), parse_hhmm(end)) else {
            continue;
        };
        let end = date.and_time(end);
        let mut current = date.and_time(start);
        while current <= end && slots.len() < remaining {
            if let Some(slot) = tz.from_local_datetime(&current).earliest() {
                slots.push(slot);
            }
            match gap.and_then(|gap| current.checked_add_signed(gap)) {
                Some(next) => current = next,
                None => break,
            }
        }
    }
    slots.truncate(remaining);
    slots
}
