use chrono::{DateTime, Datelike, FixedOffset, Utc};
use contracts::system::sys_numbering::ResetFrequency;

/// Пересекли ли мы границу периода с момента последнего сброса.
///
/// Календарные даты сравниваются в часовом поясе `offset`.
/// Без `last_reset_at` сбрасывать нечего. Часы, ушедшие назад, сброса не вызывают.
pub fn should_reset(
    frequency: ResetFrequency,
    last_reset_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    offset: FixedOffset,
) -> bool {
    let Some(last) = last_reset_at else {
        return false;
    };
    let last = last.with_timezone(&offset).date_naive();
    let now = now.with_timezone(&offset).date_naive();

    match frequency {
        ResetFrequency::Never => false,
        ResetFrequency::Daily => now > last,
        ResetFrequency::Monthly => (now.year(), now.month()) > (last.year(), last.month()),
        ResetFrequency::Yearly => now.year() > last.year(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    fn offset(hours: i32) -> FixedOffset {
        FixedOffset::east_opt(hours * 3600).unwrap()
    }

    #[test]
    fn test_never_does_not_reset() {
        assert!(!should_reset(
            ResetFrequency::Never,
            Some(utc(2020, 1, 1, 0)),
            utc(2025, 1, 1, 0),
            offset(0)
        ));
    }

    #[test]
    fn test_missing_last_reset_does_not_reset() {
        for frequency in ResetFrequency::all() {
            assert!(!should_reset(frequency, None, utc(2025, 1, 1, 0), offset(0)));
        }
    }

    #[test]
    fn test_daily_boundary() {
        let last = Some(utc(2025, 1, 15, 8));
        assert!(!should_reset(ResetFrequency::Daily, last, utc(2025, 1, 15, 23), offset(0)));
        assert!(should_reset(ResetFrequency::Daily, last, utc(2025, 1, 16, 0), offset(0)));
    }

    #[test]
    fn test_monthly_boundary() {
        let last = Some(utc(2025, 1, 1, 0));
        assert!(!should_reset(ResetFrequency::Monthly, last, utc(2025, 1, 31, 12), offset(0)));
        assert!(should_reset(ResetFrequency::Monthly, last, utc(2025, 2, 1, 0), offset(0)));
        // тот же месяц другого года
        assert!(should_reset(ResetFrequency::Monthly, last, utc(2026, 1, 10, 0), offset(0)));
    }

    #[test]
    fn test_yearly_boundary() {
        let last = Some(utc(2024, 12, 31, 12));
        assert!(should_reset(ResetFrequency::Yearly, last, utc(2025, 1, 1, 0), offset(0)));
        assert!(!should_reset(ResetFrequency::Yearly, last, utc(2024, 12, 31, 23), offset(0)));
    }

    #[test]
    fn test_clock_going_back_does_not_reset() {
        let last = Some(utc(2025, 3, 1, 0));
        for frequency in ResetFrequency::all() {
            assert!(!should_reset(frequency, last, utc(2024, 2, 28, 0), offset(0)));
        }
    }

    #[test]
    fn test_business_offset_moves_midnight() {
        // 21:30 UTC уже следующий день по МСК (UTC+3)
        let last = Some(utc(2025, 1, 15, 12));
        let now = Utc.with_ymd_and_hms(2025, 1, 15, 21, 30, 0).unwrap();
        assert!(!should_reset(ResetFrequency::Daily, last, now, offset(0)));
        assert!(should_reset(ResetFrequency::Daily, last, now, offset(3)));
    }
}
