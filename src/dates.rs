use chrono::{DateTime, NaiveDate};

const DATE_FORMATS: [&str; 4] = ["%Y%m%d", "%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y"];

/// Parses the date encodings seen in adverse-event exports. Returns `None`
/// for blanks, the literal `null`, and anything unparsable.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() || raw.eq_ignore_ascii_case("null") {
        return None;
    }

    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(raw, format) {
            return Some(date);
        }
    }

    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|timestamp| timestamp.date_naive())
}
