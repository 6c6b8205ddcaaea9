//! Business-day calendar
//!
//! Collection value dates must fall on bank business days: weekends and
//! configured holidays shift the date forward, never backward.

use chrono::{Datelike, NaiveDate, Weekday};

/// Whether the date is a bank business day
pub fn is_business_day(date: NaiveDate, holidays: &[NaiveDate]) -> bool {
    !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) && !holidays.contains(&date)
}

/// Next business day on or after `date`
pub fn next_business_day(mut date: NaiveDate, holidays: &[NaiveDate]) -> NaiveDate {
    while !is_business_day(date, holidays) {
        date = date.succ_opt().unwrap_or(date);
    }
    date
}

/// Collection date at least `lead_days` business days after `from`,
/// shifted forward over weekends and holidays
pub fn collection_date(from: NaiveDate, lead_days: u32, holidays: &[NaiveDate]) -> NaiveDate {
    let mut date = from;
    let mut remaining = lead_days;
    while remaining > 0 {
        date = date.succ_opt().unwrap_or(date);
        if is_business_day(date, holidays) {
            remaining -= 1;
        }
    }
    next_business_day(date, holidays)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn test_weekends_are_not_business_days() {
        // 2025-01-04 is a Saturday
        assert!(!is_business_day(d(2025, 1, 4), &[]));
        assert!(!is_business_day(d(2025, 1, 5), &[]));
        assert!(is_business_day(d(2025, 1, 6), &[]));
    }

    #[test]
    fn test_lead_days_skip_weekend() {
        // Friday + 2 business days = Tuesday
        let date = collection_date(d(2025, 1, 3), 2, &[]);
        assert_eq!(date, d(2025, 1, 7));
    }

    #[test]
    fn test_holiday_shifts_forward() {
        // Friday + 2 business days would be Tuesday, but Tuesday is a holiday
        let holidays = vec![d(2025, 1, 7)];
        let date = collection_date(d(2025, 1, 3), 2, &holidays);
        assert_eq!(date, d(2025, 1, 8));
    }

    #[test]
    fn test_zero_lead_lands_on_business_day() {
        // Saturday with zero lead shifts to Monday
        let date = collection_date(d(2025, 1, 4), 0, &[]);
        assert_eq!(date, d(2025, 1, 6));
    }
}
