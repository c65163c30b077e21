//! Core ranking model, text-field normalization and week alignment for the dojang tracker.

use std::fmt;

use chrono::{DateTime, Datelike, Duration, FixedOffset, Utc, Weekday};
use serde::{de, Deserialize, Deserializer, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "dojang-core";

/// Storage unit for one (world, ranking type) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionKey {
    pub world: i32,
    pub type_id: i32,
}

impl PartitionKey {
    pub fn new(world: i32, type_id: i32) -> Self {
        Self { world, type_id }
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.world, self.type_id)
    }
}

/// Which upstream leaderboard a crawl reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WeekSelector {
    ThisWeek,
    LastWeek,
}

/// One player's observation, in the upstream JSON shape plus the derived fields.
///
/// Upstream sends several numeric fields as strings; those are decoded leniently.
/// `minute`, `second`, `floor`, `world`, `type_id` and `checked_time` are never
/// trusted from upstream and are overwritten before the record is stored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankRecord {
    #[serde(default, deserialize_with = "lenient_i64")]
    pub rank: i64,
    #[serde(rename = "move", default, deserialize_with = "lenient_i64")]
    pub rank_move: i64,
    #[serde(rename = "icon", default)]
    pub icon_url: String,
    #[serde(rename = "nick", default)]
    pub name: String,
    #[serde(default)]
    pub job: String,
    #[serde(default)]
    pub detail_job: String,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub level: i64,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub exp: i64,
    #[serde(rename = "popular", default, deserialize_with = "lenient_i64")]
    pub popularity: i64,
    #[serde(rename = "floor", default)]
    pub floor_text: String,
    #[serde(rename = "duration", default)]
    pub duration_text: String,
    #[serde(rename = "guild_worldid", default, deserialize_with = "lenient_i64")]
    pub guild_id: i64,

    #[serde(default)]
    pub minute: u32,
    #[serde(default)]
    pub second: u32,
    #[serde(default)]
    pub world: i32,
    #[serde(rename = "rawfloor", default)]
    pub floor: u32,
    #[serde(rename = "type", default)]
    pub type_id: i32,
    #[serde(rename = "checkedtime", default)]
    pub checked_time: i64,
}

impl RankRecord {
    /// Case-folded identity used for every store key.
    pub fn player_key(&self) -> String {
        player_key(&self.name)
    }

    pub fn total_seconds(&self) -> u64 {
        u64::from(self.minute) * 60 + u64::from(self.second)
    }

    /// Fill `minute`, `second` and `floor` from the upstream text fields.
    pub fn normalize(&mut self) -> Result<(), ParseError> {
        let elapsed = parse_duration(&self.duration_text)?;
        self.floor = parse_floor(&self.floor_text)?;
        self.minute = elapsed.minutes;
        self.second = elapsed.seconds;
        Ok(())
    }

    /// True when `self` beats `other`: a higher floor, or the same floor in less time.
    pub fn improves_on(&self, other: &RankRecord) -> bool {
        self.floor > other.floor
            || (self.floor == other.floor && self.total_seconds() < other.total_seconds())
    }

    pub fn same_result_as(&self, other: &RankRecord) -> bool {
        self.floor == other.floor && self.total_seconds() == other.total_seconds()
    }
}

pub fn player_key(name: &str) -> String {
    name.to_lowercase()
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("{field} text {input:?} has no leading digits")]
    MissingDigits { field: &'static str, input: String },
    #[error("duration text {input:?} has no seconds after the minutes")]
    MissingSeconds { input: String },
    #[error("{field} text {input:?} holds a number out of range")]
    OutOfRange { field: &'static str, input: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElapsedTime {
    pub minutes: u32,
    pub seconds: u32,
}

impl ElapsedTime {
    pub fn total_seconds(&self) -> u64 {
        u64::from(self.minutes) * 60 + u64::from(self.seconds)
    }
}

/// Split `input` into its leading ASCII digit run and the remainder.
fn leading_digits(input: &str) -> (&str, &str) {
    let end = input
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(input.len());
    input.split_at(end)
}

fn digit_run(field: &'static str, run: &str, input: &str) -> Result<u32, ParseError> {
    if run.is_empty() {
        return Err(ParseError::MissingDigits {
            field,
            input: input.to_string(),
        });
    }
    run.parse().map_err(|_| ParseError::OutOfRange {
        field,
        input: input.to_string(),
    })
}

/// Parse `<digits><separator><digits><suffix>`, e.g. `"3분 20초"`, into minutes and seconds.
///
/// Whitespace is not trimmed: a leading space is a format change and must fail.
pub fn parse_duration(input: &str) -> Result<ElapsedTime, ParseError> {
    let (minutes_run, rest) = leading_digits(input);
    let minutes = digit_run("duration", minutes_run, input)?;

    let rest = rest.trim_start_matches(|c: char| !c.is_ascii_digit());
    let (seconds_run, _suffix) = leading_digits(rest);
    if seconds_run.is_empty() {
        return Err(ParseError::MissingSeconds {
            input: input.to_string(),
        });
    }
    let seconds = digit_run("duration", seconds_run, input)?;

    Ok(ElapsedTime { minutes, seconds })
}

/// Parse `<digits><suffix>`, e.g. `"15층"`, into the floor number.
pub fn parse_floor(input: &str) -> Result<u32, ParseError> {
    let (run, _suffix) = leading_digits(input);
    digit_run("floor", run, input)
}

/// How a run timestamp becomes the `checked_time` stamped on records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeAlignment {
    /// Use the run timestamp as-is.
    RunTime,
    /// Step back to the Sunday closing the previous Monday-first week.
    PreviousWeek,
}

impl TimeAlignment {
    pub fn checked_time(self, run_at: DateTime<Utc>, offset: FixedOffset) -> i64 {
        match self {
            TimeAlignment::RunTime => run_at.timestamp(),
            TimeAlignment::PreviousWeek => {
                previous_week_anchor(run_at.with_timezone(&offset)).timestamp()
            }
        }
    }
}

/// Sunday of the last completed Monday-first week; time of day is kept.
///
/// A Sunday input steps back a full week, every other day steps back to the
/// Sunday just before it.
pub fn previous_week_anchor(local: DateTime<FixedOffset>) -> DateTime<FixedOffset> {
    let days_back = match local.weekday() {
        Weekday::Sun => 7,
        other => other.num_days_from_sunday(),
    };
    local - Duration::days(i64::from(days_back))
}

/// ISO (year, week) of a unix timestamp viewed at `offset`.
pub fn iso_week(timestamp: i64, offset: FixedOffset) -> Option<(i32, u32)> {
    let at = DateTime::from_timestamp(timestamp, 0)?.with_timezone(&offset);
    let week = at.iso_week();
    Some((week.year(), week.week()))
}

/// Accept a JSON number, a numeric string, an empty string or null.
fn lenient_i64<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrText {
        Number(i64),
        Text(String),
        Null(()),
    }

    match NumberOrText::deserialize(deserializer)? {
        NumberOrText::Number(n) => Ok(n),
        NumberOrText::Text(text) => {
            let text = text.trim();
            if text.is_empty() {
                Ok(0)
            } else {
                text.parse().map_err(de::Error::custom)
            }
        }
        NumberOrText::Null(()) => Ok(0),
    }
}

/// Public form of the lenient decoder for upstream envelopes outside this crate.
pub fn deserialize_lenient_i64<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    lenient_i64(deserializer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn kst() -> FixedOffset {
        FixedOffset::east_opt(9 * 3600).unwrap()
    }

    #[test]
    fn parses_korean_duration_and_floor() {
        let elapsed = parse_duration("3분 20초").unwrap();
        assert_eq!(elapsed, ElapsedTime { minutes: 3, seconds: 20 });
        assert_eq!(elapsed.total_seconds(), 200);
        assert_eq!(parse_floor("15층").unwrap(), 15);
    }

    #[test]
    fn duration_without_separator_fails_loudly() {
        assert_eq!(
            parse_duration("320초"),
            Err(ParseError::MissingSeconds { input: "320초".into() })
        );
        assert!(matches!(parse_duration("3"), Err(ParseError::MissingSeconds { .. })));
    }

    #[test]
    fn missing_leading_digits_is_rejected() {
        assert!(matches!(
            parse_duration("분 20초"),
            Err(ParseError::MissingDigits { field: "duration", .. })
        ));
        assert!(matches!(
            parse_floor(" 15층"),
            Err(ParseError::MissingDigits { field: "floor", .. })
        ));
        assert!(matches!(parse_floor(""), Err(ParseError::MissingDigits { .. })));
    }

    #[test]
    fn oversized_digit_run_is_out_of_range() {
        assert!(matches!(
            parse_floor("99999999999999층"),
            Err(ParseError::OutOfRange { field: "floor", .. })
        ));
    }

    #[test]
    fn normalize_fills_derived_fields() {
        let mut record = RankRecord {
            name: "Alice".into(),
            duration_text: "2분 50초".into(),
            floor_text: "15층".into(),
            ..Default::default()
        };
        record.normalize().unwrap();
        assert_eq!((record.floor, record.minute, record.second), (15, 2, 50));
        assert_eq!(record.total_seconds(), 170);
        assert_eq!(record.player_key(), "alice");
    }

    #[test]
    fn improvement_is_strict() {
        let base = RankRecord { floor: 15, minute: 3, second: 20, ..Default::default() };
        let faster = RankRecord { floor: 15, minute: 2, second: 50, ..Default::default() };
        let higher = RankRecord { floor: 16, minute: 9, second: 0, ..Default::default() };
        assert!(faster.improves_on(&base));
        assert!(higher.improves_on(&base));
        assert!(!base.improves_on(&base.clone()));
        assert!(!base.improves_on(&faster));
    }

    #[test]
    fn huge_minute_count_compares_without_overflow() {
        let mut slow = RankRecord {
            duration_text: "71582789분 00초".into(),
            floor_text: "15층".into(),
            ..Default::default()
        };
        slow.normalize().unwrap();
        assert_eq!(slow.total_seconds(), 71_582_789 * 60);

        let mut slower = RankRecord {
            duration_text: format!("{}분 59초", u32::MAX),
            floor_text: "15층".into(),
            ..Default::default()
        };
        slower.normalize().unwrap();

        assert!(slow.improves_on(&slower));
        assert!(!slower.improves_on(&slow));
        assert!(!slow.same_result_as(&slower));
    }

    #[test]
    fn previous_week_anchor_lands_on_prior_sunday() {
        // 2024-06-12 is a Wednesday.
        let wed = kst().with_ymd_and_hms(2024, 6, 12, 6, 0, 0).unwrap();
        let anchor = previous_week_anchor(wed);
        assert_eq!(anchor, kst().with_ymd_and_hms(2024, 6, 9, 6, 0, 0).unwrap());
        assert_eq!(anchor.weekday(), Weekday::Sun);

        let mon = kst().with_ymd_and_hms(2024, 6, 10, 6, 0, 0).unwrap();
        assert_eq!(
            previous_week_anchor(mon),
            kst().with_ymd_and_hms(2024, 6, 9, 6, 0, 0).unwrap()
        );

        let sun = kst().with_ymd_and_hms(2024, 6, 16, 6, 0, 0).unwrap();
        assert_eq!(
            previous_week_anchor(sun),
            kst().with_ymd_and_hms(2024, 6, 9, 6, 0, 0).unwrap()
        );
    }

    #[test]
    fn run_time_alignment_does_not_shift() {
        let run_at = Utc.with_ymd_and_hms(2024, 6, 11, 21, 30, 0).unwrap();
        assert_eq!(TimeAlignment::RunTime.checked_time(run_at, kst()), run_at.timestamp());
    }

    #[test]
    fn iso_week_respects_offset() {
        // Sunday 20:00 UTC is already Monday in +09:00.
        let ts = Utc.with_ymd_and_hms(2024, 6, 9, 20, 0, 0).unwrap().timestamp();
        assert_eq!(iso_week(ts, FixedOffset::east_opt(0).unwrap()), Some((2024, 23)));
        assert_eq!(iso_week(ts, kst()), Some((2024, 24)));
    }

    #[test]
    fn upstream_item_decodes_string_numbers() {
        let json = r#"{
            "rank": "1", "move": "-2", "icon": "http://x/icon.png", "nick": "Alice",
            "job": "Mage", "detail_job": "Bishop", "level": 250, "exp": 12345,
            "popular": 10, "floor": "15층", "duration": "3분 20초", "guild_worldid": ""
        }"#;
        let record: RankRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.rank, 1);
        assert_eq!(record.rank_move, -2);
        assert_eq!(record.guild_id, 0);
        assert_eq!(record.name, "Alice");
        assert_eq!(record.floor, 0);
        assert_eq!(record.checked_time, 0);
    }
}
