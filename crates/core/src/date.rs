//! Precision-aware calendar dates.
//!
//! A [`FlexDate`] is a date known only to year, month, or day granularity.
//! "March 1961" and "1961" are both representable, still orderable, and
//! still usable in interval logic once *expanded* to concrete bounds:
//! the lower bound of `1961` is 1961-01-01, the upper bound 1961-12-31.
//!
//! Component hierarchy is an invariant, not a convention: a day may only be
//! set when the month is, a month only when the year is. [`FlexDate::validate`]
//! enforces the hierarchy together with calendar validity (Feb 30 is rejected,
//! Feb 29 only accepted in leap years; `chrono` is the calendar oracle).

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Granularity at which a [`FlexDate`] is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    /// Only the year is known.
    Year,
    /// Year and month are known.
    Month,
    /// Year, month, and day are known.
    Day,
}

/// Which end of an interval a partial date is expanded toward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    /// Missing month/day default to the earliest possible (January 1st).
    Lower,
    /// Missing month defaults to December, missing day to the last day of
    /// the resolved month.
    Upper,
}

/// A fully-specified `(year, month, day)` triple produced by
/// [`FlexDate::expand`]. Tuples compare lexicographically, which is exactly
/// calendar order for this representation.
pub type DateBound = (i32, u32, u32);

/// An invalid combination of date components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DateError {
    #[error("day {0} set without a month")]
    DayWithoutMonth(u32),
    #[error("month {0} set without a year")]
    MonthWithoutYear(u32),
    #[error("month {0} out of range 1-12")]
    MonthOutOfRange(u32),
    #[error("day {day} is not a valid day of {year}-{month:02}")]
    DayOutOfRange { year: i32, month: u32, day: u32 },
    #[error("year {0} outside the supported calendar range")]
    YearOutOfRange(i32),
    #[error("a start year is required")]
    MissingStartYear,
    #[error("end date precedes start date")]
    EndBeforeStart,
}

/// A date known to year, month, or day precision.
///
/// All components optional; `Default` is the fully unknown date. The
/// precision is derived from which components are present
/// ([`FlexDate::precision`]) rather than stored, so it cannot drift from
/// the components.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlexDate {
    pub year: Option<i32>,
    pub month: Option<u32>,
    pub day: Option<u32>,
}

impl FlexDate {
    /// A date with no known components.
    pub fn unknown() -> Self {
        Self::default()
    }

    /// A year-precision date.
    pub fn year(year: i32) -> Self {
        Self {
            year: Some(year),
            month: None,
            day: None,
        }
    }

    /// A month-precision date.
    pub fn month(year: i32, month: u32) -> Self {
        Self {
            year: Some(year),
            month: Some(month),
            day: None,
        }
    }

    /// A day-precision date.
    pub fn day(year: i32, month: u32, day: u32) -> Self {
        Self {
            year: Some(year),
            month: Some(month),
            day: Some(day),
        }
    }

    /// Is every component unknown?
    pub fn is_unknown(&self) -> bool {
        self.year.is_none()
    }

    /// The granularity this date is known to.
    ///
    /// `Day` iff all three components are present, `Month` iff year and
    /// month are, `Year` otherwise. Deterministic and pure.
    pub fn precision(&self) -> Precision {
        match (self.year, self.month, self.day) {
            (Some(_), Some(_), Some(_)) => Precision::Day,
            (Some(_), Some(_), None) => Precision::Month,
            _ => Precision::Year,
        }
    }

    /// Check the component hierarchy (day ⇒ month ⇒ year), component
    /// ranges, and calendar validity of the fully-specified case.
    pub fn validate(&self) -> Result<(), DateError> {
        if let Some(d) = self.day {
            if self.month.is_none() {
                return Err(DateError::DayWithoutMonth(d));
            }
        }
        if let Some(m) = self.month {
            if self.year.is_none() {
                return Err(DateError::MonthWithoutYear(m));
            }
            if !(1..=12).contains(&m) {
                return Err(DateError::MonthOutOfRange(m));
            }
        }
        if let Some(y) = self.year {
            if NaiveDate::from_ymd_opt(y, 1, 1).is_none() {
                return Err(DateError::YearOutOfRange(y));
            }
        }
        if let (Some(y), Some(m), Some(d)) = (self.year, self.month, self.day) {
            if NaiveDate::from_ymd_opt(y, m, d).is_none() {
                return Err(DateError::DayOutOfRange {
                    year: y,
                    month: m,
                    day: d,
                });
            }
        }
        Ok(())
    }

    /// Expand to a fully-specified bound, or `None` when the year is
    /// unknown (no interval can be formed from an unknown date).
    ///
    /// The upper bound resolves the missing day to the last day of the
    /// resolved month *for the resolved year*, so `{2024, 2}` expands to
    /// 2024-02-29 and `{2023, 2}` to 2023-02-28.
    pub fn expand(&self, edge: Edge) -> Option<DateBound> {
        let year = self.year?;
        match edge {
            Edge::Lower => Some((year, self.month.unwrap_or(1), self.day.unwrap_or(1))),
            Edge::Upper => {
                let month = self.month.unwrap_or(12);
                let day = self.day.unwrap_or_else(|| days_in_month(year, month));
                Some((year, month, day))
            }
        }
    }
}

impl std::fmt::Display for FlexDate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.year, self.month, self.day) {
            (Some(y), Some(m), Some(d)) => write!(f, "{y:04}-{m:02}-{d:02}"),
            (Some(y), Some(m), None) => write!(f, "{y:04}-{m:02}"),
            (Some(y), None, _) => write!(f, "{y:04}"),
            _ => write!(f, "unknown"),
        }
    }
}

/// Compare two dates at the finest precision both specify.
///
/// Years are compared first; months and days only participate when both
/// operands carry them. Returns `None` when either year is unknown: there
/// is no shared component to compare on. This is the comparison behind the
/// "end must not precede start" invariant; interval logic compares
/// [`FlexDate::expand`]ed bounds instead.
pub fn cmp_shared_precision(a: &FlexDate, b: &FlexDate) -> Option<Ordering> {
    let (ya, yb) = (a.year?, b.year?);
    let by_year = ya.cmp(&yb);
    if by_year != Ordering::Equal {
        return Some(by_year);
    }
    let (Some(ma), Some(mb)) = (a.month, b.month) else {
        return Some(Ordering::Equal);
    };
    let by_month = ma.cmp(&mb);
    if by_month != Ordering::Equal {
        return Some(by_month);
    }
    let (Some(da), Some(db)) = (a.day, b.day) else {
        return Some(Ordering::Equal);
    };
    Some(da.cmp(&db))
}

fn is_leap_year(year: i32) -> bool {
    year % 4 == 0 && (year % 100 != 0 || year % 400 == 0)
}

fn days_in_month(year: i32, month: u32) -> u32 {
    match month {
        4 | 6 | 9 | 11 => 30,
        2 => {
            if is_leap_year(year) {
                29
            } else {
                28
            }
        }
        _ => 31,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
