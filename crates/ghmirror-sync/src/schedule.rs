//! Next-run computation for daily local-time schedules.

use chrono::{DateTime, LocalResult, NaiveDate, NaiveTime, Offset, TimeDelta, TimeZone, Utc};
use chrono_tz::Tz;

/// Next UTC instant strictly after `now` at which local time in `tz` reads
/// `hour:minute`. Today's and tomorrow's candidates are resolved independently
/// so each uses the offset in force on its own date.
pub fn compute_next_run(hour: u8, minute: u8, tz: Tz, now: DateTime<Utc>) -> DateTime<Utc> {
    let local_date = now.with_timezone(&tz).date_naive();
    let today = local_instant(tz, local_date, hour, minute);
    if today > now {
        return today;
    }
    let tomorrow = local_date.succ_opt().unwrap_or(local_date);
    local_instant(tz, tomorrow, hour, minute)
}

fn local_instant(tz: Tz, date: NaiveDate, hour: u8, minute: u8) -> DateTime<Utc> {
    let time = NaiveTime::from_hms_opt(u32::from(hour), u32::from(minute), 0).unwrap_or(NaiveTime::MIN);
    let naive = date.and_time(time);
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(at) => at.with_timezone(&Utc),
        // fall-back transition: the wall time happens twice, fire on the first
        LocalResult::Ambiguous(first, _) => first.with_timezone(&Utc),
        // spring-forward gap: shift by the offset in force before the gap
        LocalResult::None => {
            let offset = tz.offset_from_utc_datetime(&naive).fix().local_minus_utc();
            Utc.from_utc_datetime(&(naive - TimeDelta::seconds(i64::from(offset))))
        }
    }
}

/// Delay until `next_run`, zero when it is already due.
pub fn delay_until(next_run: DateTime<Utc>, now: DateTime<Utc>) -> std::time::Duration {
    (next_run - now).to_std().unwrap_or(std::time::Duration::ZERO)
}
