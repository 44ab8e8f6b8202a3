//! Open-interval statistics from the persisted raw state log
//!
//! Normalizes the chronological log of raw state rows into continuous
//! publicly-open intervals, then bins every interval into per-day
//! `[offset, duration]` slot tables, one table per year. The output feeds
//! the dashboard's year charts.

use crate::domain::OpenValue;
use chrono::{DateTime, Datelike, Utc};
use serde::Serialize;
use tracing::warn;

pub const DAY_SECONDS: i64 = 60 * 60 * 24;

/// One raw state observation as read back from the store.
#[derive(Debug, Clone)]
pub struct StateRow {
    pub value: OpenValue,
    pub time: DateTime<Utc>,
}

/// One continuous publicly-open period. The final interval of the log may
/// still be open-ended.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenInterval {
    pub begin: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
}

/// Slots for one calendar day: `[offset into the day, duration]`, seconds.
pub type DaySlots = Vec<[i64; 2]>;

/// All days of one year, index 0 = Jan 1.
#[derive(Debug, Clone, Serialize)]
pub struct YearSlots {
    pub year: i32,
    pub entries: Vec<DaySlots>,
}

/// Collapse the raw log into open intervals: a new interval begins on every
/// non-public -> public transition and closes on the next public -> non-public
/// one. Consecutive rows with the same publicness are ignored.
///
/// Older logs persisted `closing` as its own row; it never marks an interval
/// boundary and is read back as `open`.
pub fn normalize_rows(rows: &[StateRow]) -> Vec<OpenInterval> {
    let mut intervals: Vec<OpenInterval> = Vec::with_capacity(rows.len() / 2);
    let mut last_public = false;

    for row in rows {
        let value =
            if row.value == OpenValue::Closing { OpenValue::Open } else { row.value };
        let is_public = value.is_public_open();
        if is_public == last_public {
            // e.g. open -> open+
            continue;
        }

        if is_public {
            intervals.push(OpenInterval { begin: row.time, end: None });
        } else if let Some(last) = intervals.last_mut() {
            last.end = Some(row.time);
        }

        last_public = is_public;
    }

    intervals
}

/// Rolling per-year accumulator for the slot builder.
struct YearAccumulator {
    year: i32,
    /// Epoch seconds of Jan 1, 00:00:00 of `year`.
    year_start: i64,
    days: Vec<DaySlots>,
    finished: Vec<YearSlots>,
}

impl YearAccumulator {
    fn new() -> Self {
        Self { year: 0, year_start: 0, days: Vec::new(), finished: Vec::new() }
    }

    fn ensure_year(&mut self, year: i32) {
        if year == self.year && !self.days.is_empty() {
            return;
        }
        self.flush();
        self.year = year;
        self.year_start = year_start_secs(year);
        self.days = vec![Vec::new(); days_in_year(year)];
    }

    fn flush(&mut self) {
        if !self.days.is_empty() {
            self.finished
                .push(YearSlots { year: self.year, entries: std::mem::take(&mut self.days) });
        }
    }
}

/// Bin the intervals into per-day slots, one table per touched year.
///
/// The walk is iterative: each loop iteration covers the remainder of one
/// calendar day, so an interval spanning many days costs one iteration per
/// day. A chunk landing past a year boundary rolls the accumulator first,
/// which attributes Jan 1 tails of dangling prior-year intervals to
/// day-index 0 of the new year with offset 0.
///
/// Only the table matching `year_now` is trimmed of trailing empty days;
/// fully past years keep their complete day array.
pub fn build_year_slots(intervals: &[OpenInterval], year_now: i32) -> Vec<YearSlots> {
    let mut acc = YearAccumulator::new();

    for interval in intervals {
        let Some(end) = interval.end else {
            warn!(begin = %interval.begin, "interval_without_end");
            continue;
        };
        if interval.begin > end {
            warn!(begin = %interval.begin, end = %end, "interval_begins_after_end");
            continue;
        }

        let mut cur_ts = interval.begin.timestamp();
        let end_ts = end.timestamp();

        while let Some(cur) = DateTime::<Utc>::from_timestamp(cur_ts, 0) {
            acc.ensure_year(cur.year());

            let day_idx = cur.ordinal0() as usize;
            let day_start = acc.year_start + day_idx as i64 * DAY_SECONDS;
            // last second of the current day, 23:59:59
            let day_end = day_start + DAY_SECONDS - 1;

            if end_ts <= day_end {
                // the space closed on the same day
                acc.days[day_idx].push([cur_ts - day_start, end_ts - cur_ts]);
                break;
            }

            // fill up the current day, continue at the next day's first second
            acc.days[day_idx].push([cur_ts - day_start, day_end - cur_ts]);
            cur_ts = day_end + 1;
        }
    }

    acc.flush();
    let mut tables = acc.finished;
    trim_current_year(&mut tables, year_now);
    tables
}

/// Normalize and bin in one step.
pub fn open_statistics(rows: &[StateRow], year_now: i32) -> Vec<YearSlots> {
    build_year_slots(&normalize_rows(rows), year_now)
}

/// A year still in progress would otherwise report hundreds of known-empty
/// future days; strip them back to the most recent day with an entry.
fn trim_current_year(tables: &mut [YearSlots], year_now: i32) {
    let Some(table) = tables.iter_mut().find(|t| t.year == year_now) else {
        return;
    };
    while table.entries.last().is_some_and(|day| day.is_empty()) {
        table.entries.pop();
    }
}

fn days_in_year(year: i32) -> usize {
    if is_leap(year) {
        366
    } else {
        365
    }
}

fn is_leap(year: i32) -> bool {
    year % 4 == 0 && (year % 100 != 0 || year % 400 == 0)
}

/// Epoch seconds of Jan 1, 00:00:00 UTC, via the days-from-civil formula.
fn year_start_secs(year: i32) -> i64 {
    let y = i64::from(year) - 1;
    let days = y * 365 + y / 4 - y / 100 + y / 400;
    // day count is relative to year 1; epoch day 0 is 1970-01-01 = day 719162
    (days - 719_162) * DAY_SECONDS
}
