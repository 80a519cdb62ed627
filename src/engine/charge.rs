use rust_decimal::Decimal;

use crate::model::*;

/// A trailing partial hour of at least this long is billed as a full hour.
const ROUND_UP_THRESHOLD_MS: Ms = 30 * MINUTE_MS;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// The charge for a stay does not fit in a `Decimal`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeOverflow {
    pub hours: u32,
    pub hourly_rate: Decimal,
}

impl std::fmt::Display for ChargeOverflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "charge overflows: {} hours at {}/h", self.hours, self.hourly_rate)
    }
}

impl std::error::Error for ChargeOverflow {}

/// Billed hours and total charge for a stay from `entry` to `exit`.
///
/// Fee-exempt rates (zero) bill the ceiling of the stay in hours. Paid rates
/// bill whole hours plus one more when the remainder reaches 30 minutes.
/// Either way at least one hour is billed, including for zero or negative
/// durations caused by clock skew.
pub fn calculate_charge(entry: Ms, exit: Ms, hourly_rate: Decimal) -> Result<(u32, Decimal), ChargeOverflow> {
    let elapsed = exit.saturating_sub(entry);

    if hourly_rate.is_zero() {
        let hours = if elapsed > 0 { elapsed / HOUR_MS + Ms::from(elapsed % HOUR_MS != 0) } else { 0 };
        return Ok((to_billed_hours(hours), Decimal::ZERO));
    }

    if elapsed <= 0 {
        return Ok((1, hourly_rate));
    }

    let full_hours = elapsed / HOUR_MS;
    let remainder = elapsed % HOUR_MS;
    let hours = if remainder >= ROUND_UP_THRESHOLD_MS { full_hours + 1 } else { full_hours };
    let hours = to_billed_hours(hours);

    Decimal::from(hours)
        .checked_mul(hourly_rate)
        .map(|charge| (hours, charge))
        .ok_or(ChargeOverflow { hours, hourly_rate })
}

fn to_billed_hours(hours: Ms) -> u32 {
    u32::try_from(hours.max(1)).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENTRY: Ms = 1_700_000_000_000;

    fn rate(cents: i64) -> Decimal {
        Decimal::new(cents, 2)
    }

    fn charge(entry: Ms, exit: Ms, hourly_rate: Decimal) -> (u32, Decimal) {
        calculate_charge(entry, exit, hourly_rate).unwrap()
    }

    #[test]
    fn zero_duration_bills_one_hour() {
        assert_eq!(charge(ENTRY, ENTRY, rate(500)), (1, rate(500)));
    }

    #[test]
    fn negative_duration_bills_one_hour() {
        assert_eq!(charge(ENTRY, ENTRY - 5 * MINUTE_MS, rate(1500)), (1, rate(1500)));
        assert_eq!(charge(ENTRY, ENTRY - 5 * MINUTE_MS, Decimal::ZERO), (1, Decimal::ZERO));
    }

    #[test]
    fn thirty_minute_remainder_rounds_up() {
        let (hours, total) = charge(ENTRY, ENTRY + 90 * MINUTE_MS, rate(500));
        assert_eq!(hours, 2);
        assert_eq!(total, rate(1000));
        assert_eq!(total.to_string(), "10.00");
    }

    #[test]
    fn twenty_nine_minute_remainder_rounds_down() {
        assert_eq!(charge(ENTRY, ENTRY + 89 * MINUTE_MS, rate(1500)), (1, rate(1500)));
    }

    #[test]
    fn threshold_is_exact_to_the_millisecond() {
        let just_under = ENTRY + HOUR_MS + ROUND_UP_THRESHOLD_MS - 1;
        assert_eq!(charge(ENTRY, just_under, rate(100)).0, 1);
        let exactly = ENTRY + HOUR_MS + ROUND_UP_THRESHOLD_MS;
        assert_eq!(charge(ENTRY, exactly, rate(100)).0, 2);
    }

    #[test]
    fn short_paid_stay_bills_minimum_hour() {
        assert_eq!(charge(ENTRY, ENTRY + 10 * MINUTE_MS, rate(1500)), (1, rate(1500)));
        assert_eq!(charge(ENTRY, ENTRY + 30 * MINUTE_MS, rate(1500)), (1, rate(1500)));
    }

    #[test]
    fn whole_hours_bill_exactly() {
        assert_eq!(charge(ENTRY, ENTRY + 3 * HOUR_MS, rate(250)), (3, rate(750)));
    }

    #[test]
    fn fee_exempt_uses_ceiling() {
        assert_eq!(
            charge(ENTRY, ENTRY + 225 * MINUTE_MS, Decimal::ZERO),
            (4, Decimal::ZERO)
        );
        assert_eq!(charge(ENTRY, ENTRY + 1, Decimal::ZERO), (1, Decimal::ZERO));
        assert_eq!(charge(ENTRY, ENTRY + 2 * HOUR_MS, Decimal::ZERO), (2, Decimal::ZERO));
    }

    #[test]
    fn fee_exempt_zero_duration_bills_one_hour() {
        assert_eq!(charge(ENTRY, ENTRY, Decimal::ZERO), (1, Decimal::ZERO));
    }

    #[test]
    fn billed_hours_never_below_one() {
        for minutes in 0..600 {
            let (hours, _) = charge(ENTRY, ENTRY + minutes * MINUTE_MS, rate(100));
            assert!(hours >= 1, "{minutes} minutes billed {hours} hours");
            let expected = ((minutes / 60) + if minutes % 60 >= 30 { 1 } else { 0 }).max(1);
            assert_eq!(i64::from(hours), expected, "{minutes} minutes");
        }
    }

    #[test]
    fn overflowing_charge_is_an_error() {
        assert_eq!(
            calculate_charge(ENTRY, ENTRY + 2 * HOUR_MS, Decimal::MAX),
            Err(ChargeOverflow {
                hours: 2,
                hourly_rate: Decimal::MAX
            })
        );
        // One hour of the largest rate still fits.
        assert_eq!(charge(ENTRY, ENTRY + HOUR_MS, Decimal::MAX), (1, Decimal::MAX));
    }

    #[test]
    fn extreme_timestamps_do_not_overflow() {
        assert_eq!(charge(Ms::MIN, Ms::MAX, Decimal::ZERO).0, u32::MAX);
        assert_eq!(charge(Ms::MAX, Ms::MIN, rate(100)), (1, rate(100)));
    }

    #[test]
    fn now_is_after_2020() {
        assert!(now_ms() > 1_577_836_800_000);
    }
}
