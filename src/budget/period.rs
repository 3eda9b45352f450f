//! Calendar period boundaries for budget windows.

use chrono::{DateTime, Datelike, Days, Months, NaiveTime, Utc};

/// Key fragment for the current UTC day, e.g. `20260829`.
pub fn day_key_part(now: DateTime<Utc>) -> String {
    now.format("%Y%m%d").to_string()
}

/// Key fragment for the current month, e.g. `202608`.
pub fn month_key_part(now: DateTime<Utc>) -> String {
    now.format("%Y%m").to_string()
}

/// Next midnight UTC after `now`.
pub fn next_daily_reset(now: DateTime<Utc>) -> DateTime<Utc> {
    let next_day = now
        .date_naive()
        .checked_add_days(Days::new(1))
        .unwrap_or(now.date_naive());
    next_day
        .and_time(NaiveTime::MIN)
        .and_utc()
}

/// First instant of the month after `now`.
pub fn next_monthly_reset(now: DateTime<Utc>) -> DateTime<Utc> {
    let first_of_month = now.date_naive().with_day(1).unwrap_or(now.date_naive());
    let next_month = first_of_month
        .checked_add_months(Months::new(1))
        .unwrap_or(first_of_month);
    next_month.and_time(NaiveTime::MIN).and_utc()
}
