//! UTC millisecond-precision timestamp formatting shared by the sidecar
//! codec (`%Y-%m-%dT%H:%M:%S.%fZ`) and the catalog (`%Y-%m-%d %H:%M:%S.fff`).
//!
//! `time`'s `format_description!` macro does not have a direct strftime
//! `%f` equivalent with a fixed 3-digit width, so both forms are built by
//! hand from `OffsetDateTime` components rather than coaxing a format
//! description into matching the spec's literal strings.

use crate::{ImgcatError, Result};
use time::OffsetDateTime;

/// `%Y-%m-%dT%H:%M:%S.%fZ` (sidecar XML form).
pub fn to_sidecar_string(dt: OffsetDateTime) -> String {
    let utc = dt.to_offset(time::UtcOffset::UTC);
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}.{:03}Z",
        utc.year(),
        utc.month() as u8,
        utc.day(),
        utc.hour(),
        utc.minute(),
        utc.second(),
        utc.millisecond()
    )
}

/// Parses the sidecar form back into an `OffsetDateTime`.
pub fn from_sidecar_string(s: &str) -> Result<OffsetDateTime> {
    let s = s.strip_suffix('Z').ok_or_else(|| ImgcatError::ValidationError {
        message: format!("timestamp '{s}' missing trailing Z"),
    })?;
    let (date_part, time_part) = s.split_once('T').ok_or_else(|| ImgcatError::ValidationError {
        message: format!("timestamp '{s}' missing T separator"),
    })?;
    parse_components(date_part, time_part)
}

/// `%Y-%m-%d %H:%M:%S.fff` (catalog text column form).
pub fn to_catalog_string(dt: OffsetDateTime) -> String {
    let utc = dt.to_offset(time::UtcOffset::UTC);
    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}.{:03}",
        utc.year(),
        utc.month() as u8,
        utc.day(),
        utc.hour(),
        utc.minute(),
        utc.second(),
        utc.millisecond()
    )
}

pub fn from_catalog_string(s: &str) -> Result<OffsetDateTime> {
    let (date_part, time_part) = s.split_once(' ').ok_or_else(|| ImgcatError::ValidationError {
        message: format!("timestamp '{s}' missing date/time separator"),
    })?;
    parse_components(date_part, time_part)
}

fn parse_components(date_part: &str, time_part: &str) -> Result<OffsetDateTime> {
    let bad = |field: &str| ImgcatError::ValidationError {
        message: format!("malformed timestamp field '{field}' in '{date_part} {time_part}'"),
    };
    let mut d = date_part.splitn(3, '-');
    let year: i32 = d.next().ok_or_else(|| bad(date_part))?.parse().map_err(|_| bad(date_part))?;
    let month: u8 = d.next().ok_or_else(|| bad(date_part))?.parse().map_err(|_| bad(date_part))?;
    let day: u8 = d.next().ok_or_else(|| bad(date_part))?.parse().map_err(|_| bad(date_part))?;

    let (hms, millis) = time_part.split_once('.').unwrap_or((time_part, "0"));
    let millis: u16 = format!("{millis:0<3}")[..3].parse().map_err(|_| bad(time_part))?;
    let mut t = hms.splitn(3, ':');
    let hour: u8 = t.next().ok_or_else(|| bad(time_part))?.parse().map_err(|_| bad(time_part))?;
    let minute: u8 = t.next().ok_or_else(|| bad(time_part))?.parse().map_err(|_| bad(time_part))?;
    let second: u8 = t.next().ok_or_else(|| bad(time_part))?.parse().map_err(|_| bad(time_part))?;

    let month = time::Month::try_from(month).map_err(|_| bad(date_part))?;
    let date = time::Date::from_calendar_date(year, month, day).map_err(|_| bad(date_part))?;
    let time = time::Time::from_hms_milli(hour, minute, second, millis).map_err(|_| bad(time_part))?;
    Ok(time::PrimitiveDateTime::new(date, time).assume_utc())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sidecar_round_trip() {
        let s = "2017-05-29T00:00:59.412Z";
        let dt = from_sidecar_string(s).unwrap();
        assert_eq!(to_sidecar_string(dt), s);
    }

    #[test]
    fn catalog_round_trip() {
        let s = "2017-05-29 00:00:59.412";
        let dt = from_catalog_string(s).unwrap();
        assert_eq!(to_catalog_string(dt), s);
    }

    #[test]
    fn sidecar_pads_missing_millis() {
        let dt = from_sidecar_string("2020-01-01T00:00:00.1Z").unwrap();
        assert_eq!(to_sidecar_string(dt), "2020-01-01T00:00:00.100Z");
    }
}
