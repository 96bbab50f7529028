use chrono::{DateTime, Datelike, Days, FixedOffset, Months, NaiveDate, Utc};

use super::types::Bucketing;

/// Calendar date of `at` in the reporting timezone.
pub fn local_date(at: DateTime<Utc>, offset: FixedOffset) -> NaiveDate {
    at.with_timezone(&offset).date_naive()
}

/// First day of the bucket containing `date`.
pub fn bucket_start(date: NaiveDate, bucketing: Bucketing) -> NaiveDate {
    match bucketing {
        Bucketing::Day => date,
        Bucketing::Week => date
            .checked_sub_days(Days::new(u64::from(date.weekday().num_days_from_monday())))
            .unwrap_or(date),
        Bucketing::Month => date.with_day(1).unwrap_or(date),
        Bucketing::Quarter => NaiveDate::from_ymd_opt(date.year(), date.month0() / 3 * 3 + 1, 1).unwrap_or(date),
    }
}

/// Start of the bucket after the one starting at `start`.
pub fn next_bucket(start: NaiveDate, bucketing: Bucketing) -> Option<NaiveDate> {
    match bucketing {
        Bucketing::Day => start.checked_add_days(Days::new(1)),
        Bucketing::Week => start.checked_add_days(Days::new(7)),
        Bucketing::Month => start.checked_add_months(Months::new(1)),
        Bucketing::Quarter => start.checked_add_months(Months::new(3)),
    }
}

pub fn label(start: NaiveDate, bucketing: Bucketing) -> String {
    match bucketing {
        Bucketing::Day | Bucketing::Week => start.format("%Y-%m-%d").to_string(),
        Bucketing::Month => start.format("%Y-%m").to_string(),
        Bucketing::Quarter => format!("{}-Q{}", start.year(), start.month0() / 3 + 1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_weeks_start_on_monday() {
        // 2024-03-10 is a Sunday.
        assert_eq!(bucket_start(date(2024, 3, 10), Bucketing::Week), date(2024, 3, 4));
        assert_eq!(bucket_start(date(2024, 3, 11), Bucketing::Week), date(2024, 3, 11));
    }

    #[test]
    fn test_month_and_quarter_starts() {
        assert_eq!(bucket_start(date(2024, 2, 29), Bucketing::Month), date(2024, 2, 1));
        assert_eq!(bucket_start(date(2024, 6, 30), Bucketing::Quarter), date(2024, 4, 1));
        assert_eq!(next_bucket(date(2024, 10, 1), Bucketing::Quarter), Some(date(2025, 1, 1)));
        assert_eq!(label(date(2024, 4, 1), Bucketing::Quarter), "2024-Q2");
        assert_eq!(label(date(2024, 4, 1), Bucketing::Month), "2024-04");
    }

    #[test]
    fn test_local_date_uses_offset() {
        let at = Utc.with_ymd_and_hms(2024, 3, 10, 23, 30, 0).unwrap();
        let cet = FixedOffset::east_opt(3600).unwrap();
        let pst = FixedOffset::west_opt(8 * 3600).unwrap();
        assert_eq!(local_date(at, cet), date(2024, 3, 11));
        assert_eq!(local_date(at, pst), date(2024, 3, 10));
        // The same instant lands in different weeks depending on the timezone.
        assert_eq!(bucket_start(local_date(at, cet), Bucketing::Week), date(2024, 3, 11));
        assert_eq!(bucket_start(local_date(at, pst), Bucketing::Week), date(2024, 3, 4));
    }
}
