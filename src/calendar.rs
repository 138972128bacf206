use chrono::{Datelike, Days, NaiveDate, Weekday};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum CalendarError {
    #[error("business days can only be adjusted by whole days, got {0}")]
    FractionalDays(f64),
}

#[derive(Debug, Clone, Copy)]
enum HolidayRule {
    /// Every year on this month/day.
    Fixed { month: u32, day: u32 },
    /// This month/day only when it falls on `weekday` (weekend observance shift).
    Observed { month: u32, day: u32, weekday: Weekday },
    /// The `nth` `weekday` of the month, counting from the 1st.
    NthWeekday { month: u32, nth: u32, weekday: Weekday },
    /// The last `weekday` of the month.
    LastWeekday { month: u32, weekday: Weekday },
}

impl HolidayRule {
    fn matches(&self, date: NaiveDate) -> bool {
        let (month, day, weekday) = (date.month(), date.day(), date.weekday());
        match *self {
            HolidayRule::Fixed { month: m, day: d } => month == m && day == d,
            HolidayRule::Observed {
                month: m,
                day: d,
                weekday: w,
            } => month == m && day == d && weekday == w,
            HolidayRule::NthWeekday {
                month: m,
                nth,
                weekday: w,
            } => month == m && weekday == w && (day - 1) / 7 + 1 == nth,
            HolidayRule::LastWeekday { month: m, weekday: w } => {
                month == m && weekday == w && (last_day_of_month(date) - day) / 7 == 0
            }
        }
    }
}

use HolidayRule::{Fixed, LastWeekday, NthWeekday, Observed};

const HOLIDAYS: [(HolidayRule, &str); 18] = [
    (Observed { month: 12, day: 31, weekday: Weekday::Fri }, "New Year's Day (observed)"),
    (Fixed { month: 1, day: 1 }, "New Year's Day"),
    (Observed { month: 1, day: 2, weekday: Weekday::Mon }, "New Year's Day (observed)"),
    (NthWeekday { month: 1, nth: 3, weekday: Weekday::Mon }, "Birthday of Martin Luther King, Jr."),
    (NthWeekday { month: 2, nth: 3, weekday: Weekday::Mon }, "Washington's Birthday"),
    (LastWeekday { month: 5, weekday: Weekday::Mon }, "Memorial Day"),
    (Observed { month: 7, day: 3, weekday: Weekday::Fri }, "Independence Day (observed)"),
    (Fixed { month: 7, day: 4 }, "Independence Day"),
    (Observed { month: 7, day: 5, weekday: Weekday::Mon }, "Independence Day (observed)"),
    (NthWeekday { month: 9, nth: 1, weekday: Weekday::Mon }, "Labor Day"),
    (NthWeekday { month: 10, nth: 2, weekday: Weekday::Mon }, "Columbus Day"),
    (Observed { month: 11, day: 10, weekday: Weekday::Fri }, "Veterans Day (observed)"),
    (Fixed { month: 11, day: 11 }, "Veterans Day"),
    (Observed { month: 11, day: 12, weekday: Weekday::Mon }, "Veterans Day (observed)"),
    (NthWeekday { month: 11, nth: 4, weekday: Weekday::Thu }, "Thanksgiving Day"),
    (Observed { month: 12, day: 24, weekday: Weekday::Fri }, "Christmas Day (observed)"),
    (Fixed { month: 12, day: 25 }, "Christmas Day"),
    (Observed { month: 12, day: 26, weekday: Weekday::Mon }, "Christmas Day (observed)"),
];

fn last_day_of_month(date: NaiveDate) -> u32 {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|first| first.pred_opt())
        .map_or(31, |last| last.day())
}

/// Name of the holiday observed on `date`, if any.
pub fn holiday(date: NaiveDate) -> Option<&'static str> {
    HOLIDAYS
        .iter()
        .find(|(rule, _)| rule.matches(date))
        .map(|(_, name)| *name)
}

pub fn is_business_day(date: NaiveDate) -> bool {
    !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) && holiday(date).is_none()
}

/// Offset `date` by `days` business days; negative counts go backwards.
///
/// Steps one calendar day at a time and only counts days that land on a
/// business day, so the result is always a business day unless `days == 0`.
pub fn add_business_days(date: NaiveDate, days: i64) -> NaiveDate {
    if days == 0 {
        return date;
    }
    let forward = days > 0;
    let mut remaining = days.unsigned_abs();
    let mut current = date;
    while remaining > 0 {
        let next = if forward {
            current.checked_add_days(Days::new(1))
        } else {
            current.checked_sub_days(Days::new(1))
        };
        let Some(next) = next else {
            tracing::warn!(%date, days, "business-day offset ran off the calendar");
            break;
        };
        current = next;
        if is_business_day(current) {
            remaining -= 1;
        }
    }
    tracing::debug!(%date, days, result = %current, "added business days");
    current
}

/// Reject fractional day counts read from a sheet.
pub fn whole_days(days: f64) -> Result<i64, CalendarError> {
    if !days.is_finite() || days.fract() != 0.0 {
        return Err(CalendarError::FractionalDays(days));
    }
    Ok(days as i64)
}

/// [`add_business_days`] for day counts stored as sheet numbers.
pub fn offset_by(date: NaiveDate, days: f64) -> Result<NaiveDate, CalendarError> {
    Ok(add_business_days(date, whole_days(days)?))
}
