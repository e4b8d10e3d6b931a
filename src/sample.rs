//! Sample model and its two serialized forms.
//!
//! A [`Sample`] is one reading bundle produced per sampling tick. It has
//! exactly two external representations: the local log line (CSV, appended
//! to the active log file) and the collector wire payload (JSON, posted
//! over HTTP). Both live here so the formats cannot drift apart from the
//! model.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Number of ADC channels on the sensor board.
pub const CHANNEL_COUNT: usize = 4;

/// Header record written once at the start of every log file rotation.
pub const LOG_HEADER: &str = "STT,Temperature,Humidity,Sensor1,Sensor2,Sensor3,Sensor4";

/// One timestamped sensor reading bundle.
///
/// Immutable after creation: the acquisition worker builds it once per tick
/// and the persistence and delivery workers consume copies.
#[derive(Debug, Clone, Copy)]
pub struct Sample {
    /// Monotonic within a session; never reset across session boundaries
    pub sequence: u32,

    /// Wall-clock time of the tick that produced this sample
    pub timestamp: DateTime<Utc>,

    /// Degrees Celsius; NaN if the read failed
    pub temperature: f32,

    /// Relative humidity percent; NaN if the read failed
    pub humidity: f32,

    /// Raw ADC readings; 0 if the channel read failed
    pub channels: [i16; CHANNEL_COUNT],
}

impl Sample {
    /// Serialize to the local log line format (no trailing newline):
    /// `sequence,temperature,humidity,ch0,ch1,ch2,ch3` with two-decimal
    /// floats. A failed environmental read serializes as `NaN` and parses
    /// back to NaN.
    pub fn to_log_line(&self) -> String {
        format!(
            "{},{:.2},{:.2},{},{},{},{}",
            self.sequence,
            self.temperature,
            self.humidity,
            self.channels[0],
            self.channels[1],
            self.channels[2],
            self.channels[3],
        )
    }

    /// Parse a log line back into a sample (the inverse of
    /// [`to_log_line`](Self::to_log_line)). The timestamp is not part of the
    /// log format, so the parsed sample carries the Unix epoch.
    pub fn parse_log_line(line: &str) -> Result<Self, LogFormatError> {
        let fields: Vec<&str> = line.trim_end().split(',').collect();
        if fields.len() != 7 {
            return Err(LogFormatError::FieldCount(fields.len()));
        }

        fn field<T: std::str::FromStr>(fields: &[&str], index: usize) -> Result<T, LogFormatError> {
            fields[index].parse().map_err(|_| LogFormatError::Field {
                index,
                value: fields[index].to_string(),
            })
        }

        Ok(Self {
            sequence: field(&fields, 0)?,
            timestamp: DateTime::<Utc>::UNIX_EPOCH,
            temperature: field(&fields, 1)?,
            humidity: field(&fields, 2)?,
            channels: [
                field(&fields, 3)?,
                field(&fields, 4)?,
                field(&fields, 5)?,
                field(&fields, 6)?,
            ],
        })
    }
}

/// Errors produced when parsing a log line.
#[derive(Debug)]
pub enum LogFormatError {
    /// The line did not have exactly 7 comma-separated fields
    FieldCount(usize),

    /// A field could not be parsed as its expected numeric type
    Field { index: usize, value: String },
}

impl std::fmt::Display for LogFormatError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormatError::FieldCount(n) => {
                write!(f, "expected 7 fields in log line, found {}", n)
            }
            LogFormatError::Field { index, value } => {
                write!(f, "invalid value '{}' in log field {}", value, index)
            }
        }
    }
}

impl std::error::Error for LogFormatError {}

/// JSON body posted to the collector for each delivered sample.
///
/// Field names match the collector's schema; `Pressure` is always 0 on this
/// hardware revision but stays in the payload for schema compatibility.
#[derive(Debug, Clone, Serialize)]
pub struct WirePayload {
    #[serde(rename = "Time")]
    pub time: String,

    #[serde(rename = "Temperature")]
    pub temperature: f32,

    #[serde(rename = "Humidity")]
    pub humidity: f32,

    #[serde(rename = "Pressure")]
    pub pressure: i32,

    #[serde(rename = "EtOH1")]
    pub etoh1: i16,

    #[serde(rename = "EtOH2")]
    pub etoh2: i16,

    #[serde(rename = "EtOH3")]
    pub etoh3: i16,

    #[serde(rename = "EtOH4")]
    pub etoh4: i16,

    /// Device address in dotted-quad form
    pub ip: String,
}

impl WirePayload {
    /// Build the wire payload for one sample from the given device address.
    ///
    /// JSON has no NaN, so a failed environmental read goes out as 0.0; the
    /// local log keeps the NaN sentinel.
    pub fn new(sample: &Sample, ip: impl Into<String>) -> Self {
        fn finite_or_zero(v: f32) -> f32 {
            if v.is_finite() {
                v
            } else {
                0.0
            }
        }

        Self {
            time: sample.timestamp.to_rfc3339(),
            temperature: finite_or_zero(sample.temperature),
            humidity: finite_or_zero(sample.humidity),
            pressure: 0,
            etoh1: sample.channels[0],
            etoh2: sample.channels[1],
            etoh3: sample.channels[2],
            etoh4: sample.channels[3],
            ip: ip.into(),
        }
    }
}

/// JSON body that announces the device's current address to the collector.
#[derive(Debug, Clone, Serialize)]
pub struct Registration {
    pub ip: String,
}

impl Registration {
    pub fn new(ip: impl Into<String>) -> Self {
        Self { ip: ip.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn test_sample() -> Sample {
        Sample {
            sequence: 42,
            timestamp: Utc.with_ymd_and_hms(2024, 12, 5, 22, 15, 0).unwrap(),
            temperature: 27.348,
            humidity: 61.904,
            channels: [120, -340, 0, 17_500],
        }
    }

    #[test]
    fn test_log_line_format() {
        let line = test_sample().to_log_line();
        assert_eq!(line, "42,27.35,61.90,120,-340,0,17500");
    }

    #[test]
    fn test_log_line_round_trip() {
        let sample = test_sample();
        let parsed = Sample::parse_log_line(&sample.to_log_line()).unwrap();

        assert_eq!(parsed.sequence, sample.sequence);
        assert!((parsed.temperature - sample.temperature).abs() <= 0.01);
        assert!((parsed.humidity - sample.humidity).abs() <= 0.01);
        assert_eq!(parsed.channels, sample.channels);
    }

    #[test]
    fn test_log_line_round_trip_with_sentinels() {
        let sample = Sample {
            temperature: f32::NAN,
            humidity: f32::NAN,
            channels: [0, 0, 0, 0],
            ..test_sample()
        };
        let line = sample.to_log_line();
        let parsed = Sample::parse_log_line(&line).unwrap();

        assert!(parsed.temperature.is_nan());
        assert!(parsed.humidity.is_nan());
        assert_eq!(parsed.channels, [0, 0, 0, 0]);
    }

    #[test]
    fn test_parse_rejects_wrong_field_count() {
        let result = Sample::parse_log_line("1,2.0,3.0,4,5,6");
        assert!(matches!(result, Err(LogFormatError::FieldCount(6))));
    }

    #[test]
    fn test_parse_rejects_bad_field() {
        let result = Sample::parse_log_line("1,2.0,3.0,4,5,six,7");
        match result {
            Err(LogFormatError::Field { index, value }) => {
                assert_eq!(index, 5);
                assert_eq!(value, "six");
            }
            other => panic!("expected field error, got {:?}", other),
        }
    }

    #[test]
    fn test_header_matches_line_shape() {
        let header_fields = LOG_HEADER.split(',').count();
        let line_fields = test_sample().to_log_line().split(',').count();
        assert_eq!(header_fields, line_fields);
    }

    #[test]
    fn test_wire_payload_field_names() {
        let payload = WirePayload::new(&test_sample(), "192.168.1.50");
        let json: serde_json::Value = serde_json::to_value(&payload).unwrap();

        assert_eq!(json["Time"], "2024-12-05T22:15:00+00:00");
        assert_eq!(json["Pressure"], 0);
        assert_eq!(json["EtOH1"], 120);
        assert_eq!(json["EtOH2"], -340);
        assert_eq!(json["EtOH4"], 17_500);
        assert_eq!(json["ip"], "192.168.1.50");
        assert!((json["Temperature"].as_f64().unwrap() - 27.348).abs() < 1e-3);
    }

    #[test]
    fn test_wire_payload_sanitizes_nan() {
        let sample = Sample {
            temperature: f32::NAN,
            ..test_sample()
        };
        let payload = WirePayload::new(&sample, "10.0.0.7");
        assert_eq!(payload.temperature, 0.0);
        // Must stay serializable; serde_json rejects NaN outright
        serde_json::to_string(&payload).unwrap();
    }

    #[test]
    fn test_registration_body() {
        let reg = Registration {
            ip: "10.0.0.7".to_string(),
        };
        let json = serde_json::to_string(&reg).unwrap();
        assert_eq!(json, r#"{"ip":"10.0.0.7"}"#);
    }
}
