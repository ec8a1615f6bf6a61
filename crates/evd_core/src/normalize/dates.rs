use std::sync::OnceLock;
use std::time::SystemTime;

use regex_lite::Regex;
use time::format_description::well_known::{Rfc2822, Rfc3339};
use time::macros::format_description;
use time::{Date, Month, OffsetDateTime, UtcOffset};

use crate::error::AppError;

/// `DCN: 2023-0415-0007`, `Document Control Number 20230415-A`, ...
const CONTROL_NUMBER_PATTERN: &str =
    r"(?i)\b(?:dcn|document\s+control\s+(?:number|no\.?|#))\s*[:#]?\s*([0-9][0-9_./-]{7,})";

const FILENAME_DATE_PATTERN: &str = r"(19|20)(\d{2})[-_.]?(\d{2})[-_.]?(\d{2})";

fn control_number_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(CONTROL_NUMBER_PATTERN).ok())
        .as_ref()
}

fn filename_date_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(FILENAME_DATE_PATTERN).ok())
        .as_ref()
}

/// Canonical `YYYY-MM-DD`.
pub fn format_date(d: Date) -> String {
    format!("{:04}-{:02}-{:02}", d.year(), u8::from(d.month()), d.day())
}

pub fn parse_date(raw: &str) -> Option<Date> {
    Date::parse(raw.trim(), format_description!("[year]-[month]-[day]")).ok()
}

/// Parse a user-supplied `YYYY-MM-DD`, rejecting anything else as a validation error.
pub fn parse_date_strict(field: &str, raw: &str) -> Result<Date, AppError> {
    parse_date(raw).ok_or_else(|| {
        AppError::validation("VALIDATION_DATE_INVALID", format!("{field} must be YYYY-MM-DD"))
            .with_details(format!("{field}={raw}"))
    })
}

pub fn date_from_ymd(year: i32, month: u8, day: u8) -> Option<Date> {
    let month = Month::try_from(month).ok()?;
    Date::from_calendar_date(year, month, day).ok()
}

fn date_from_digits(digits: &str) -> Option<Date> {
    if digits.len() < 8 {
        return None;
    }
    let year: i32 = digits[0..4].parse().ok()?;
    let month: u8 = digits[4..6].parse().ok()?;
    let day: u8 = digits[6..8].parse().ok()?;
    if !(1900..=2100).contains(&year) {
        return None;
    }
    date_from_ymd(year, month, day)
}

/// PDF date strings look like `D:20230415093000-05'00'`. Only the calendar part is used.
pub fn parse_pdf_date(raw: &str) -> Option<Date> {
    let t = raw.trim();
    let t = t.strip_prefix("D:").unwrap_or(t);
    let digits: String = t.chars().take_while(|c| c.is_ascii_digit()).collect();
    date_from_digits(&digits)
}

/// RFC 2822 header dates (`Sat, 15 Apr 2023 10:00:00 +0000 (UTC)`), normalized to UTC.
pub fn parse_rfc2822_date(raw: &str) -> Option<Date> {
    let t = raw.split('(').next().unwrap_or("").trim();
    OffsetDateTime::parse(t, &Rfc2822)
        .ok()
        .map(|dt| dt.to_offset(UtcOffset::UTC).date())
}

/// Date embedded in a document-control number inside the text, if any.
pub fn find_control_number_date(text: &str) -> Option<Date> {
    let re = control_number_re()?;
    for caps in re.captures_iter(text) {
        let Some(m) = caps.get(1) else { continue };
        let digits: String = m.as_str().chars().filter(|c| c.is_ascii_digit()).collect();
        if let Some(d) = date_from_digits(&digits) {
            return Some(d);
        }
    }
    None
}

/// First valid calendar date embedded in a file name (`20230415_letter.pdf`, `memo-2023-04-15.txt`).
pub fn find_filename_date(name: &str) -> Option<Date> {
    let re = filename_date_re()?;
    for caps in re.captures_iter(name) {
        let (Some(c), Some(y), Some(m), Some(d)) = (caps.get(1), caps.get(2), caps.get(3), caps.get(4))
        else {
            continue;
        };
        let digits = format!("{}{}{}{}", c.as_str(), y.as_str(), m.as_str(), d.as_str());
        if let Some(date) = date_from_digits(&digits) {
            return Some(date);
        }
    }
    None
}

pub fn date_from_system_time(t: SystemTime) -> Date {
    OffsetDateTime::from(t).to_offset(UtcOffset::UTC).date()
}

pub fn now_rfc3339_utc() -> String {
    // Formatting a UTC OffsetDateTime as RFC3339 only fails for years outside 0..=9999.
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}
