use chrono::{DateTime, Days, NaiveDate, NaiveTime, TimeZone, Utc};

use crate::types::Slot;

/// Previous synoptic slot: 18 -> 12 -> 06 -> 00 -> prior day's 18.
pub fn previous_slot(date: NaiveDate, slot: Slot) -> (NaiveDate, Slot) {
    match slot {
        Slot::H18 => (date, Slot::H12),
        Slot::H12 => (date, Slot::H06),
        Slot::H06 => (date, Slot::H00),
        Slot::H00 => (
            date.checked_sub_days(Days::new(1)).unwrap_or(date),
            Slot::H18,
        ),
    }
}

/// Forward step in forecast-hour space.
#[cfg(test)]
pub fn next_forecast_hour(current_hour: u32) -> u32 {
    current_hour.saturating_add(1)
}

/// True iff `date` is strictly after `today`.
pub fn is_future(date: NaiveDate, today: NaiveDate) -> bool {
    date > today
}

/// Date and slot whose window contains `now`.
pub fn current_slot(now: DateTime<Utc>) -> (NaiveDate, Slot) {
    use chrono::Timelike;
    (now.date_naive(), Slot::containing_hour(now.hour()))
}

pub fn slot_timestamp(date: NaiveDate, slot: Slot) -> DateTime<Utc> {
    let time = NaiveTime::from_hms_opt(slot.hour(), 0, 0).unwrap_or(NaiveTime::MIN);
    Utc.from_utc_datetime(&date.and_time(time))
}

/// Whole hours between two slot timestamps, rounded to the nearest hour.
pub fn hour_offset(requested: DateTime<Utc>, base: DateTime<Utc>) -> u32 {
    let seconds = (requested - base).num_seconds().unsigned_abs();
    ((seconds as f64) / 3600.0).round() as u32
}
