use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone};
use snackngo_types::models::{Field, FieldValue, ValueKind};

use crate::prompt::DISPLAY_FORMAT;

/// Turn a typed reply into a value of the field's kind.
///
/// Timing fields accept epoch seconds, `YYYY-MM-DD HH:MM` in `offset`, or
/// RFC 3339.
pub fn parse_field_value(field: Field, raw: &str, offset: FixedOffset) -> Result<FieldValue, String> {
    let raw = raw.trim();
    match field.kind() {
        ValueKind::Text => Ok(FieldValue::Text(raw.to_string())),
        ValueKind::Timestamp => parse_timestamp(raw, offset)
            .map(FieldValue::Timestamp)
            .ok_or_else(|| format!("expected YYYY-MM-DD HH:MM, got {:?}", raw)),
    }
}

fn parse_timestamp(raw: &str, offset: FixedOffset) -> Option<i64> {
    if !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit()) {
        return raw.parse().ok();
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, DISPLAY_FORMAT) {
        return offset
            .from_local_datetime(&naive)
            .single()
            .map(|dt| dt.timestamp());
    }
    DateTime::parse_from_rfc3339(raw).ok().map(|dt| dt.timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    #[test]
    fn manual_time_format() {
        let value = parse_field_value(Field::OrderPlacementTime, "2023-11-14 22:13", utc()).unwrap();
        assert_eq!(value, FieldValue::Timestamp(1_699_999_980));

        let est = FixedOffset::west_opt(5 * 3600).unwrap();
        let value = parse_field_value(Field::OrderPlacementTime, "2023-11-14 17:13", est).unwrap();
        assert_eq!(value, FieldValue::Timestamp(1_699_999_980));
    }

    #[test]
    fn epoch_and_rfc3339() {
        assert_eq!(
            parse_field_value(Field::OrderCompletionTime, "1700000000", utc()).unwrap(),
            FieldValue::Timestamp(1_700_000_000)
        );
        assert_eq!(
            parse_field_value(Field::OrderCompletionTime, "2023-11-14T22:13:20Z", utc()).unwrap(),
            FieldValue::Timestamp(1_700_000_000)
        );
    }

    #[test]
    fn garbage_time_is_refused() {
        assert!(parse_field_value(Field::LatestEstimatedArrivalTime, "soon", utc()).is_err());
        assert!(parse_field_value(Field::LatestEstimatedArrivalTime, "", utc()).is_err());
    }

    #[test]
    fn text_is_trimmed() {
        assert_eq!(
            parse_field_value(Field::RestaurantName, "  Cafe A ", utc()).unwrap(),
            FieldValue::Text("Cafe A".into())
        );
    }
}
