//! Small helpers shared across the crate.

use chrono::NaiveDateTime;

const ARCHIVE_DATE_FORMAT: &str = "%Y%m%d%H";

/// Extract the timestamp embedded in an archive name.
///
/// Archive names look like `notification_Adygeja_Resp_2019013100_001.zip`:
/// the first `_`-separated component that consists only of digits and parses
/// as `%Y%m%d%H` is taken as the archive timestamp. Returns `None` when no
/// component qualifies.
pub fn archive_date(name: &str) -> Option<NaiveDateTime> {
    let stem = name.strip_suffix(".zip").unwrap_or(name);
    for part in stem.split('_') {
        if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }
        if let Ok(date) = NaiveDateTime::parse_from_str(part, ARCHIVE_DATE_FORMAT) {
            return Some(date);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn extracts_date_component() {
        let date = archive_date("notification_Adygeja_Resp_2019013100_001.zip").unwrap();
        let expected = NaiveDate::from_ymd_opt(2019, 1, 31)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        assert_eq!(date, expected);
    }

    #[test]
    fn skips_numeric_parts_that_are_not_dates() {
        // "001" is all digits but does not parse as %Y%m%d%H.
        let date = archive_date("protocol_001_2020120623.zip").unwrap();
        let expected = NaiveDate::from_ymd_opt(2020, 12, 6)
            .unwrap()
            .and_hms_opt(23, 0, 0)
            .unwrap();
        assert_eq!(date, expected);
    }

    #[test]
    fn name_without_date_yields_none() {
        assert_eq!(archive_date("notification_Moscow.zip"), None);
        assert_eq!(archive_date(""), None);
    }
}
