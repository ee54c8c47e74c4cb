use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc};
use serde::Deserialize;

/// Time window resolution, finest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    /// `yyyyMMddHHmm`
    Minute,
    /// `yyyyMMddHH`
    Hour,
    /// `yyyyMMdd`
    Day,
    /// `yyyyMM`
    Month,
}

impl Granularity {
    pub const ALL: [Granularity; 4] = [Self::Minute, Self::Hour, Self::Day, Self::Month];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Month => "month",
        }
    }

    fn digits(self) -> u32 {
        match self {
            Self::Minute => 12,
            Self::Hour => 10,
            Self::Day => 8,
            Self::Month => 6,
        }
    }

    fn rank(self) -> u32 {
        match self {
            Self::Minute => 0,
            Self::Hour => 1,
            Self::Day => 2,
            Self::Month => 3,
        }
    }

    /// Infers the granularity of a bucket from its digit width.
    pub fn of(bucket: i64) -> Option<Self> {
        if bucket <= 0 {
            return None;
        }
        let digits = bucket.ilog10() + 1;
        Self::ALL.into_iter().find(|g| g.digits() == digits)
    }
}

/// Converts a Unix millisecond timestamp (UTC) to a time bucket.
pub fn time_bucket(timestamp_ms: i64, granularity: Granularity) -> Option<i64> {
    let dt = DateTime::<Utc>::from_timestamp_millis(timestamp_ms)?;
    let month = i64::from(dt.year()) * 100 + i64::from(dt.month());
    let bucket = match granularity {
        Granularity::Month => month,
        Granularity::Day => month * 100 + i64::from(dt.day()),
        Granularity::Hour => (month * 100 + i64::from(dt.day())) * 100 + i64::from(dt.hour()),
        Granularity::Minute => {
            ((month * 100 + i64::from(dt.day())) * 100 + i64::from(dt.hour())) * 100
                + i64::from(dt.minute())
        }
    };
    Some(bucket)
}

/// Truncates a bucket to a coarser granularity.
///
/// Returns `None` for malformed buckets or when `target` is finer than the
/// bucket's own granularity.
pub fn down_sample(bucket: i64, target: Granularity) -> Option<i64> {
    let source = Granularity::of(bucket)?;
    if target < source {
        return None;
    }
    let steps = target.rank() - source.rank();
    Some(bucket / 100i64.pow(steps))
}

/// Start of the window a bucket covers, as Unix milliseconds (UTC).
pub fn bucket_start_millis(bucket: i64) -> Option<i64> {
    let granularity = Granularity::of(bucket)?;
    let minute_bucket = bucket * 100i64.pow(granularity.rank());
    // Month and day buckets expand with zero day/hour/minute fields.
    let mut minute = minute_bucket % 100;
    let mut hour = (minute_bucket / 100) % 100;
    let mut day = (minute_bucket / 10_000) % 100;
    let month = (minute_bucket / 1_000_000) % 100;
    let year = minute_bucket / 100_000_000;
    if granularity >= Granularity::Hour {
        minute = 0;
    }
    if granularity >= Granularity::Day {
        hour = 0;
    }
    if granularity == Granularity::Month {
        day = 1;
    }

    let date = NaiveDate::from_ymd_opt(
        i32::try_from(year).ok()?,
        u32::try_from(month).ok()?,
        u32::try_from(day).ok()?,
    )?;
    let dt = date.and_hms_opt(u32::try_from(hour).ok()?, u32::try_from(minute).ok()?, 0)?;
    Some(dt.and_utc().timestamp_millis())
}
