use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::PayloadError;

/// Separator between scene segments in a completion payload.
pub const SEGMENT_DELIMITER: &str = "----";
const SKIP_SENTINEL: &str = "skipped";

/// Payload text scraped from a completion marker line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawPayload(String);

impl RawPayload {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    /// Sentinel recorded when every attempt for a cycle timed out.
    pub fn skipped(cycle: u32, attempts: u32) -> Self {
        Self(format!("Test #{} Skipped after {attempts} attempts", cycle + 1))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this payload means "no usable result".
    pub fn is_skip_sentinel(&self) -> bool {
        self.0.to_ascii_lowercase().contains(SKIP_SENTINEL)
    }

    /// Split into `(scene_name, value)` pairs, failing on the first malformed segment.
    ///
    /// Segments before the malformed one are returned alongside the error so callers can
    /// process them independently.
    pub fn segments(&self) -> (Vec<ParsedSegment>, Option<PayloadError>) {
        let mut parsed = Vec::new();
        let pieces = self
            .0
            .split(SEGMENT_DELIMITER)
            .map(str::trim)
            .filter(|piece| !piece.is_empty());
        for (index, piece) in pieces.enumerate() {
            match parse_segment(index, piece) {
                Ok(segment) => parsed.push(segment),
                Err(err) => return (parsed, Some(err)),
            }
        }
        (parsed, None)
    }
}

impl fmt::Display for RawPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One `scene_name:<name>|data:<value>` segment.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedSegment {
    pub scene_name: String,
    pub value: SampleValue,
}

/// A measurement, or the error string the app reported instead.
#[derive(Debug, Clone, PartialEq)]
pub enum SampleValue {
    Numeric(f64),
    Error(String),
}

impl SampleValue {
    /// Finite numbers take the numeric path; anything else is logged as an error.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        match trimmed.parse::<f64>() {
            Ok(number) if number.is_finite() => SampleValue::Numeric(number),
            _ => SampleValue::Error(trimmed.to_string()),
        }
    }

    #[cfg(test)]
    pub fn is_numeric(&self) -> bool {
        matches!(self, SampleValue::Numeric(_))
    }
}

impl fmt::Display for SampleValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleValue::Numeric(value) => write!(f, "{value}"),
            SampleValue::Error(message) => f.write_str(message),
        }
    }
}

/// A segment bound to the build and run it was measured in.
#[derive(Debug, Clone, PartialEq)]
pub struct SceneSample {
    pub scene_name: String,
    pub apk_name: String,
    pub date_of_test: String,
    pub value: SampleValue,
}

impl SceneSample {
    pub fn from_segment(segment: ParsedSegment, apk_name: &str, date_of_test: &str) -> Self {
        Self {
            scene_name: segment.scene_name,
            apk_name: apk_name.to_string(),
            date_of_test: date_of_test.to_string(),
            value: segment.value,
        }
    }

    pub fn key(&self) -> RemoteRecordKey<'_> {
        RemoteRecordKey {
            scene_name: &self.scene_name,
            date_of_test: &self.date_of_test,
            apk_name: &self.apk_name,
        }
    }
}

/// Identity of the single remote record a sample belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RemoteRecordKey<'a> {
    pub scene_name: &'a str,
    pub date_of_test: &'a str,
    pub apk_name: &'a str,
}

impl fmt::Display for RemoteRecordKey<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{} ({})",
            self.scene_name, self.date_of_test, self.apk_name
        )
    }
}

fn parse_segment(index: usize, segment: &str) -> Result<ParsedSegment, PayloadError> {
    let malformed = |reason| PayloadError {
        index,
        segment: segment.to_string(),
        reason,
    };
    let mut fields = segment.split('|');
    let (Some(scene_field), Some(data_field), None) = (fields.next(), fields.next(), fields.next())
    else {
        return Err(malformed("expected exactly two `|` separated fields"));
    };
    let scene_name = field_value(scene_field, "scene_name")
        .ok_or_else(|| malformed("missing `scene_name:` field"))?;
    if scene_name.is_empty() {
        return Err(malformed("empty scene name"));
    }
    let data = field_value(data_field, "data").ok_or_else(|| malformed("missing `data:` field"))?;
    Ok(ParsedSegment {
        scene_name: scene_name.to_string(),
        value: SampleValue::parse(data),
    })
}

fn field_value<'a>(field: &'a str, key: &str) -> Option<&'a str> {
    let (name, value) = field.split_once(':')?;
    (name.trim() == key).then(|| value.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_segment_parses() {
        let payload = RawPayload::new("scene_name:Foo|data:12.5");
        let (segments, error) = payload.segments();
        assert!(error.is_none());
        assert_eq!(
            segments,
            vec![ParsedSegment {
                scene_name: "Foo".into(),
                value: SampleValue::Numeric(12.5),
            }]
        );
    }

    #[test]
    fn non_numeric_value_is_an_error_sample() {
        let (segments, _) = RawPayload::new("scene_name:Foo|data:ErrorX").segments();
        assert_eq!(segments[0].value, SampleValue::Error("ErrorX".into()));
        assert!(!segments[0].value.is_numeric());
    }

    #[test]
    fn error_values_keep_embedded_colons() {
        let (segments, _) =
            RawPayload::new("scene_name:Forest|data:Exception: shader missing").segments();
        assert_eq!(
            segments[0].value,
            SampleValue::Error("Exception: shader missing".into())
        );
    }

    #[test]
    fn multiple_segments_split_on_delimiter() {
        let payload = RawPayload::new(
            "scene_name:Forest|data:58.2 ---- scene_name:City|data:31 ----",
        );
        let (segments, error) = payload.segments();
        assert!(error.is_none());
        let names: Vec<_> = segments.iter().map(|s| s.scene_name.as_str()).collect();
        assert_eq!(names, vec!["Forest", "City"]);
        assert_eq!(segments[1].value, SampleValue::Numeric(31.0));
    }

    #[test]
    fn malformed_segment_stops_after_valid_prefix() {
        let payload =
            RawPayload::new("scene_name:Forest|data:58.2----garbage----scene_name:City|data:31");
        let (segments, error) = payload.segments();
        assert_eq!(segments.len(), 1);
        let error = error.unwrap();
        assert_eq!(error.index, 1);
        assert_eq!(error.segment, "garbage");
    }

    #[test]
    fn extra_pipe_field_is_malformed() {
        let (segments, error) = RawPayload::new("scene_name:A|data:1|fps:60").segments();
        assert!(segments.is_empty());
        assert!(error.is_some());
    }

    #[test]
    fn wrong_keys_are_malformed() {
        let (_, error) = RawPayload::new("scene:A|value:1").segments();
        assert_eq!(error.unwrap().reason, "missing `scene_name:` field");
    }

    #[test]
    fn skip_sentinel_matches_any_case() {
        assert!(RawPayload::new("Test skipped after 3 attempts").is_skip_sentinel());
        assert!(RawPayload::skipped(0, 3).is_skip_sentinel());
        assert_eq!(
            RawPayload::skipped(1, 3).as_str(),
            "Test #2 Skipped after 3 attempts"
        );
        assert!(!RawPayload::new("scene_name:Foo|data:1").is_skip_sentinel());
    }

    #[test]
    fn non_finite_numbers_are_errors() {
        assert_eq!(SampleValue::parse("NaN"), SampleValue::Error("NaN".into()));
        assert_eq!(SampleValue::parse(" 7 "), SampleValue::Numeric(7.0));
    }
}
