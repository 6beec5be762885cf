//! Parsing of the model's free-text replies into field values.
//!
//! Times without a date take the date of `reference` (the upload time in the
//! operator's offset).

use chrono::{DateTime, FixedOffset, NaiveDateTime, NaiveTime, TimeZone};

/// Clock-only layouts, tried in order.
const TIME_FORMATS: [&str; 3] = ["%I:%M %p", "%I:%M%p", "%H:%M"];

/// Full date-and-time layouts, tried in order.
const DATETIME_FORMATS: [&str; 4] = [
    "%d %b %Y %I:%M %p",
    "%d %B %Y %I:%M %p",
    "%B %d, %Y at %I:%M %p",
    "%b %d, %Y at %I:%M %p",
];

/// Placeholder answers the model gives when a value is not on screen.
const NOT_SHOWN: [&str; 6] = ["n/a", "na", "none", "not shown", "unknown", "not available"];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestaurantInfo {
    pub name: Option<String>,
    pub address: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitialTimes {
    pub placement: Option<i64>,
    pub earliest_arrival: Option<i64>,
    pub latest_arrival: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Meridiem {
    Am,
    Pm,
}

impl Meridiem {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Am => "AM",
            Self::Pm => "PM",
        }
    }
}

/// A clock time found in free text, e.g. `8:17`, `08:17:30` or `8:17 PM`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClockMatch {
    pub clock: String,
    pub meridiem: Option<Meridiem>,
}

fn clean(value: &str) -> &str {
    value.trim_matches(|c: char| {
        c.is_whitespace() || matches!(c, '*' | '[' | ']' | '"' | '\'' | '`' | '.')
    })
}

fn present(value: &str) -> Option<String> {
    let value = clean(value);
    if value.is_empty() || NOT_SHOWN.contains(&value.to_ascii_lowercase().as_str()) {
        None
    } else {
        Some(value.to_string())
    }
}

/// Parse a `Name: x, Address: y` reply. A reply without labels that still
/// contains a comma is taken as a bare address.
pub fn restaurant_info(text: &str) -> RestaurantInfo {
    let lower = text.to_ascii_lowercase();
    let name_at = lower.find("name:");
    let address_at = lower.find("address:");

    let mut info = RestaurantInfo::default();
    let mut name_rest = None;

    if let Some(at) = name_at {
        let rest = &text[at + "name:".len()..];
        let end = rest.find([',', '\n']).unwrap_or(rest.len());
        info.name = present(&rest[..end]);
        name_rest = rest.get(end + 1..);
    }

    if let Some(at) = address_at {
        info.address = present(&text[at + "address:".len()..]);
    } else if let Some(rest) = name_rest {
        info.address = present(rest);
    } else if name_at.is_none() && text.contains(',') {
        info.address = present(text);
    }

    info
}

/// Text after `label` on the first line containing it (case-insensitive).
fn labelled<'a>(text: &'a str, label: &str) -> Option<&'a str> {
    text.lines().find_map(|line| {
        line.to_ascii_lowercase()
            .find(label)
            .map(|at| &line[at + label.len()..])
    })
}

/// Parse the `Order placement time:` / `Delivery window: a - b` reply.
pub fn initial_times(text: &str, reference: DateTime<FixedOffset>) -> InitialTimes {
    let mut times = InitialTimes::default();

    if let Some(value) = labelled(text, "order placement time:") {
        times.placement = parse_time(value, reference);
    }

    if let Some(value) = labelled(text, "delivery window:") {
        if let Some((earliest, latest)) = value.split_once(['-', '\u{2013}']) {
            times.earliest_arrival = parse_time(earliest, reference);
            times.latest_arrival = parse_time(latest, reference);
        }
    }

    times
}

/// Parse one time string using the known layouts.
pub fn parse_time(raw: &str, reference: DateTime<FixedOffset>) -> Option<i64> {
    let value = clean(raw);

    for format in DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return localize(naive, reference.offset());
        }
    }
    for format in TIME_FORMATS {
        if let Ok(time) = NaiveTime::parse_from_str(value, format) {
            return localize(reference.date_naive().and_time(time), reference.offset());
        }
    }
    None
}

fn localize(naive: NaiveDateTime, offset: &FixedOffset) -> Option<i64> {
    offset
        .from_local_datetime(&naive)
        .single()
        .map(|dt| dt.timestamp())
}

/// Every clock time in `text`, in order of appearance.
pub fn scan_clock_times(text: &str) -> Vec<ClockMatch> {
    let bytes = text.as_bytes();
    let digits_at = |i: usize, n: usize| {
        i + n <= bytes.len() && bytes[i..i + n].iter().all(u8::is_ascii_digit)
    };

    let mut found = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        if !bytes[i].is_ascii_digit() {
            i += 1;
            continue;
        }

        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        let hour_len = i - start;
        if hour_len > 2 || bytes.get(i) != Some(&b':') || !digits_at(i + 1, 2) {
            continue;
        }

        let mut end = i + 3;
        if bytes.get(end) == Some(&b':') && digits_at(end + 1, 2) {
            end += 3;
        }
        if bytes.get(end).is_some_and(u8::is_ascii_digit) {
            i = end;
            continue;
        }

        let clock = text[start..end].to_string();
        let mut cursor = end;
        while bytes.get(cursor) == Some(&b' ') {
            cursor += 1;
        }
        let meridiem = match bytes.get(cursor..cursor + 2) {
            Some(pair) if !bytes.get(cursor + 2).is_some_and(u8::is_ascii_alphabetic) => {
                match pair.to_ascii_lowercase().as_slice() {
                    b"am" => Some(Meridiem::Am),
                    b"pm" => Some(Meridiem::Pm),
                    _ => None,
                }
            }
            _ => None,
        };
        if meridiem.is_some() {
            end = cursor + 2;
        }

        found.push(ClockMatch { clock, meridiem });
        i = end;
    }
    found
}

/// Clock times converted to timestamps, labelled times first, duplicates
/// dropped. A bare time that reads as a 12-hour clock takes the AM/PM that
/// dominates the labelled times, if one does.
pub fn scan_times(text: &str, reference: DateTime<FixedOffset>) -> Vec<i64> {
    let matches = scan_clock_times(text);
    let (labelled, bare): (Vec<_>, Vec<_>) = matches.into_iter().partition(|m| m.meridiem.is_some());

    let mut seen: Vec<String> = Vec::new();
    let mut unique = Vec::new();
    for m in labelled.into_iter().chain(bare) {
        let key = m.clock.trim_start_matches('0').to_string();
        if !seen.contains(&key) {
            seen.push(key);
            unique.push(m);
        }
    }

    let am = unique.iter().filter(|m| m.meridiem == Some(Meridiem::Am)).count();
    let pm = unique.iter().filter(|m| m.meridiem == Some(Meridiem::Pm)).count();
    let dominant = match am.cmp(&pm) {
        std::cmp::Ordering::Greater => Some(Meridiem::Am),
        std::cmp::Ordering::Less => Some(Meridiem::Pm),
        std::cmp::Ordering::Equal => None,
    };

    unique
        .iter()
        .filter_map(|m| clock_to_timestamp(m, dominant, reference))
        .collect()
}

fn clock_to_timestamp(
    m: &ClockMatch,
    dominant: Option<Meridiem>,
    reference: DateTime<FixedOffset>,
) -> Option<i64> {
    let hour: u32 = m.clock.split(':').next()?.parse().ok()?;
    let meridiem = m.meridiem.or(if (1..=12).contains(&hour) { dominant } else { None });

    let time = match meridiem {
        Some(meridiem) => {
            let value = format!("{} {}", m.clock, meridiem.as_str());
            NaiveTime::parse_from_str(&value, "%I:%M %p")
                .or_else(|_| NaiveTime::parse_from_str(&value, "%I:%M:%S %p"))
                .ok()?
        }
        None => NaiveTime::parse_from_str(&m.clock, "%H:%M")
            .or_else(|_| NaiveTime::parse_from_str(&m.clock, "%H:%M:%S"))
            .ok()?,
    };
    localize(reference.date_naive().and_time(time), reference.offset())
}

/// The delivery time from a free-form completion reply: a full date-time if
/// the whole reply is one, otherwise the first clock time found.
pub fn completion_time(text: &str, reference: DateTime<FixedOffset>) -> Option<i64> {
    parse_time(text, reference).or_else(|| scan_times(text, reference).first().copied())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 2023-11-14 00:00 UTC.
    const MIDNIGHT: i64 = 1_699_920_000;

    fn reference() -> DateTime<FixedOffset> {
        DateTime::from_timestamp(MIDNIGHT + 12 * 3600, 0)
            .unwrap()
            .fixed_offset()
    }

    fn at(hour: i64, minute: i64) -> i64 {
        MIDNIGHT + hour * 3600 + minute * 60
    }

    #[test]
    fn name_and_address() {
        let info = restaurant_info("Name: Cafe A, Address: 1 Main St, Springfield");
        assert_eq!(info.name.as_deref(), Some("Cafe A"));
        assert_eq!(info.address.as_deref(), Some("1 Main St, Springfield"));
    }

    #[test]
    fn name_only_and_placeholders() {
        let info = restaurant_info("Name: **Taco Town**");
        assert_eq!(info.name.as_deref(), Some("Taco Town"));
        assert_eq!(info.address, None);

        let info = restaurant_info("Name: Taco Town\nAddress: N/A");
        assert_eq!(info.name.as_deref(), Some("Taco Town"));
        assert_eq!(info.address, None);
    }

    #[test]
    fn unlabelled_reply_with_comma_is_an_address() {
        let info = restaurant_info("12 Elm Rd, Boston, MA");
        assert_eq!(info.name, None);
        assert_eq!(info.address.as_deref(), Some("12 Elm Rd, Boston, MA"));
    }

    #[test]
    fn initial_times_reply() {
        let reply = "Order placement time: 8:17 PM\nDelivery window: 8:45 PM - 9:05 PM";
        let times = initial_times(reply, reference());
        assert_eq!(times.placement, Some(at(20, 17)));
        assert_eq!(times.earliest_arrival, Some(at(20, 45)));
        assert_eq!(times.latest_arrival, Some(at(21, 5)));
    }

    #[test]
    fn initial_times_with_missing_window() {
        let reply = "order placement time: [20:45]\nDelivery window: unknown";
        let times = initial_times(reply, reference());
        assert_eq!(times.placement, Some(at(20, 45)));
        assert_eq!(times.earliest_arrival, None);
        assert_eq!(times.latest_arrival, None);
    }

    #[test]
    fn full_date_layouts() {
        assert_eq!(
            parse_time("March 15, 2024 at 02:30 PM", reference()),
            Some(1_710_513_000)
        );
        assert_eq!(parse_time("15 Mar 2024 02:30 PM", reference()), Some(1_710_513_000));
        assert_eq!(parse_time("later tonight", reference()), None);
    }

    #[test]
    fn times_follow_the_reference_offset() {
        let eastern = reference().with_timezone(&FixedOffset::west_opt(5 * 3600).unwrap());
        // Reference is 07:00 on the 14th in UTC-5, so "8:17 PM" is 01:17 UTC on the 15th.
        assert_eq!(parse_time("8:17 PM", eastern), Some(at(25, 17)));
    }

    #[test]
    fn completion_prefers_labelled_time() {
        let reply = "Screenshot taken 9:41, delivered at 9:32 PM";
        assert_eq!(completion_time(reply, reference()), Some(at(21, 32)));
    }

    #[test]
    fn bare_times_take_dominant_meridiem() {
        let reply = "Ordered 7:58 PM, picked up 8:20 PM, arrived 8:41";
        let times = scan_times(reply, reference());
        assert_eq!(times, vec![at(19, 58), at(20, 20), at(20, 41)]);

        // 24-hour values keep their hour.
        let times = scan_times("Delivered 20:41 (ordered 8:02 PM)", reference());
        assert_eq!(times, vec![at(20, 2), at(20, 41)]);
    }

    #[test]
    fn scanner_ignores_non_times() {
        assert!(scan_clock_times("order #12345, total $23.50, ratio 123:45").is_empty());
        let found = scan_clock_times("at 10:05am sharp");
        assert_eq!(
            found,
            vec![ClockMatch {
                clock: "10:05".into(),
                meridiem: Some(Meridiem::Am)
            }]
        );
    }

    #[test]
    fn nothing_readable() {
        assert_eq!(completion_time("I can't see a time here", reference()), None);
    }
}
