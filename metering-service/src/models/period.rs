//! Billing period value object.

use chrono::{DateTime, Days, Duration, FixedOffset, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Billing cycle dates, inclusive on both ends in the billing calendar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingPeriod {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

/// Half-open timestamp window `[start, end)` covering a [`BillingPeriod`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodBounds {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl BillingPeriod {
    pub fn new(start_date: NaiveDate, end_date: NaiveDate) -> Self {
        Self {
            start_date,
            end_date,
        }
    }

    /// Timestamp bounds in the billing timezone: midnight of the start date up
    /// to, but excluding, midnight after the end date.
    pub fn bounds(&self, tz: FixedOffset) -> PeriodBounds {
        let day_after_end = self
            .end_date
            .checked_add_days(Days::new(1))
            .unwrap_or(NaiveDate::MAX);

        PeriodBounds {
            start: local_midnight(self.start_date, tz),
            end: local_midnight(day_after_end, tz),
        }
    }

    /// The period has closed once the billing-calendar date reaches its end date.
    pub fn has_closed(&self, today: NaiveDate) -> bool {
        today >= self.end_date
    }
}

impl PeriodBounds {
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts < self.end
    }
}

fn local_midnight(date: NaiveDate, tz: FixedOffset) -> DateTime<Utc> {
    let local = date.and_time(NaiveTime::MIN);
    let utc = local - Duration::seconds(i64::from(tz.local_minus_utc()));
    Utc.from_utc_datetime(&utc)
}
