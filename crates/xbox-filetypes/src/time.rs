use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Datelike, Local, NaiveDate, NaiveDateTime, Timelike};

const YEAR_BASE: i32 = 1980;
const YEAR_MAX: i32 = YEAR_BASE + 0x7F;

/// FAT style date and time packed into one 32 bit word: the date occupies the
/// high half (year since 1980, month, day) and the time the low half (hours,
/// minutes, seconds / 2).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PackedTimestamp(pub u32);

impl PackedTimestamp {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Packs `value`, clamping it into the representable 1980..=2107 range.
    /// Odd seconds round down.
    pub fn from_datetime(value: NaiveDateTime) -> Self {
        if value.year() < YEAR_BASE {
            return Self(pack(YEAR_BASE, 1, 1, 0, 0, 0));
        }
        if value.year() > YEAR_MAX {
            return Self(pack(YEAR_MAX, 12, 31, 23, 59, 58));
        }
        Self(pack(
            value.year(),
            value.month(),
            value.day(),
            value.hour(),
            value.minute(),
            value.second(),
        ))
    }

    pub fn from_system_time(time: SystemTime) -> Self {
        let Ok(duration) = time.duration_since(UNIX_EPOCH) else {
            return Self::from_datetime(NaiveDateTime::default());
        };
        let local = DateTime::from_timestamp(duration.as_secs() as i64, duration.subsec_nanos())
            .map(|utc| utc.with_timezone(&Local).naive_local())
            .unwrap_or_default();
        Self::from_datetime(local)
    }

    pub fn now() -> Self {
        Self::from_datetime(Local::now().naive_local())
    }

    /// Returns `None` when the packed fields do not form a real date.
    pub fn to_datetime(self) -> Option<NaiveDateTime> {
        let date = (self.0 >> 16) as u16;
        let time = self.0 as u16;

        let year = YEAR_BASE + i32::from((date >> 9) & 0x7F);
        let month = u32::from((date >> 5) & 0x0F);
        let day = u32::from(date & 0x1F);
        let hour = u32::from((time >> 11) & 0x1F);
        let minute = u32::from((time >> 5) & 0x3F);
        let second = u32::from(time & 0x1F) * 2;

        NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(hour, minute, second)
    }
}

fn pack(year: i32, month: u32, day: u32, hour: u32, minute: u32, second: u32) -> u32 {
    let date = (((year - YEAR_BASE) as u32) << 9) | (month << 5) | day;
    let time = (hour << 11) | (minute << 5) | (second / 2);
    (date << 16) | time
}

impl std::fmt::Display for PackedTimestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self.to_datetime() {
            Some(value) => write!(f, "{}", value.format("%Y-%m-%d %H:%M:%S")),
            None => write!(f, "{:#010x}", self.0),
        }
    }
}
