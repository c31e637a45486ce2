//! Push-channel envelope types and decoder.
//!
//! Every `data:` payload on the push channel is a JSON object of the shape
//! `{"job_id": "...", "type": "<kind>", ...payload fields}`. Some server
//! paths serialize the object twice, so the decoder unwraps one extra layer
//! of string-encoded JSON before interpreting it.

use chrono::Utc;
use quire_core::types::{JobId, Timestamp};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// The closed set of event kinds the push channel carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    JobStarted,
    JobProgress,
    JobCompleted,
    JobFailed,
    CompilationProgress,
    CompilationCompleted,
    CompilationFailed,
}

impl EventType {
    /// Wire name of the event type, as it appears in the `type` field.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::JobStarted => "job_started",
            Self::JobProgress => "job_progress",
            Self::JobCompleted => "job_completed",
            Self::JobFailed => "job_failed",
            Self::CompilationProgress => "compilation_progress",
            Self::CompilationCompleted => "compilation_completed",
            Self::CompilationFailed => "compilation_failed",
        }
    }

    pub fn is_job(self) -> bool {
        matches!(
            self,
            Self::JobStarted | Self::JobProgress | Self::JobCompleted | Self::JobFailed
        )
    }

    pub fn is_compilation(self) -> bool {
        matches!(
            self,
            Self::CompilationProgress | Self::CompilationCompleted | Self::CompilationFailed
        )
    }

    /// Completed or failed, for either family.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::JobCompleted
                | Self::JobFailed
                | Self::CompilationCompleted
                | Self::CompilationFailed
        )
    }
}

/// A single decoded push-channel message.
///
/// Envelopes are immutable once decoded and are shared between subscribers
/// behind an `Arc`.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    pub job_id: JobId,
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Every wire field other than `job_id`, `type` and `timestamp`.
    pub payload: Map<String, Value>,
    /// Server timestamp when present, otherwise the time of decoding.
    pub timestamp: Timestamp,
}

/// Errors produced while decoding a push-channel payload.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Envelope is not a JSON object")]
    NotAnObject,

    #[error("Envelope is missing field '{0}'")]
    MissingField(&'static str),

    #[error("Unknown event type '{0}'")]
    UnknownType(String),
}

/// Step-level progress carried by `*_progress` envelopes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub stage: Option<String>,
    /// Completion percentage, clamped to `0..=100`.
    pub percent: Option<u8>,
    pub message: Option<String>,
}

/// A compiler diagnostic. The server sends either a bare string or an
/// object with an optional line number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawDiagnostic")]
pub struct Diagnostic {
    pub message: String,
    pub line: Option<u32>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDiagnostic {
    Text(String),
    Detailed {
        #[serde(alias = "error", alias = "text")]
        message: String,
        #[serde(default, deserialize_with = "lenient_line")]
        line: Option<u32>,
    },
}

/// Line numbers arrive as numbers or numeric strings. Anything else
/// (negative, fractional, garbage) is treated as unknown.
fn lenient_line<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Number(n)) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

impl From<RawDiagnostic> for Diagnostic {
    fn from(raw: RawDiagnostic) -> Self {
        match raw {
            RawDiagnostic::Text(message) => Self {
                message,
                line: None,
            },
            RawDiagnostic::Detailed { message, line } => Self { message, line },
        }
    }
}

/// The `result` object of a compilation envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileResult {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub errors: Vec<Diagnostic>,
    #[serde(default)]
    pub warnings: Vec<Diagnostic>,
    #[serde(default)]
    pub log: Option<String>,
}

impl Envelope {
    /// Whether this envelope belongs to the given job (or document).
    pub fn is_for(&self, job_id: &str) -> bool {
        self.job_id == job_id
    }

    fn str_field(&self, key: &str) -> Option<String> {
        self.payload.get(key).and_then(Value::as_str).map(str::to_string)
    }

    /// Human-readable `message` field, if any.
    pub fn message(&self) -> Option<String> {
        self.str_field("message")
    }

    /// Progress view of the payload. Reads `percent`, falling back to
    /// `progress_percent`.
    pub fn progress(&self) -> Progress {
        let percent = self
            .payload
            .get("percent")
            .or_else(|| self.payload.get("progress_percent"))
            .and_then(Value::as_f64)
            .map(|p| p.clamp(0.0, 100.0).round() as u8);

        Progress {
            stage: self.str_field("stage"),
            percent,
            message: self.message(),
        }
    }

    /// The nested `result` object of a compilation envelope.
    ///
    /// Returns `None` when the payload has no `result` object. Fields are
    /// read one by one, so a single malformed diagnostic is dropped without
    /// losing the rest of the result.
    pub fn compile_result(&self) -> Option<CompileResult> {
        let raw = match self.payload.get("result")? {
            Value::Object(raw) => raw,
            other => {
                tracing::warn!(job_id = %self.job_id, result = %other, "Unparseable compilation result");
                return None;
            }
        };

        Some(CompileResult {
            success: raw.get("success").and_then(Value::as_bool).unwrap_or(false),
            errors: self.diagnostics(raw.get("errors")),
            warnings: self.diagnostics(raw.get("warnings")),
            log: raw.get("log").and_then(Value::as_str).map(str::to_string),
        })
    }

    fn diagnostics(&self, list: Option<&Value>) -> Vec<Diagnostic> {
        let Some(Value::Array(items)) = list else {
            return Vec::new();
        };
        items
            .iter()
            .filter_map(|item| match Diagnostic::deserialize(item) {
                Ok(diagnostic) => Some(diagnostic),
                Err(e) => {
                    tracing::warn!(job_id = %self.job_id, error = %e, "Dropping malformed diagnostic");
                    None
                }
            })
            .collect()
    }

    /// Whether a terminal compilation envelope reports a failure: either
    /// `compilation_failed`, or a result that says `success: false`. A
    /// completed envelope without a result counts as success.
    pub fn reports_failure(&self) -> bool {
        self.event_type == EventType::CompilationFailed
            || self
                .payload
                .get("result")
                .and_then(|result| result.get("success"))
                .and_then(Value::as_bool)
                == Some(false)
    }
}

/// Decode a push-channel `data` payload into an [`Envelope`].
///
/// Accepts single- or double-encoded JSON. Numeric `job_id`s are
/// stringified. Returns `Err` for malformed JSON, non-object payloads,
/// missing fields and unknown `type` values; callers drop and log those.
pub fn decode_envelope(data: &str) -> Result<Envelope, DecodeError> {
    let mut value: Value = serde_json::from_str(data)?;
    if let Value::String(inner) = value {
        value = serde_json::from_str(&inner)?;
    }

    let Value::Object(mut fields) = value else {
        return Err(DecodeError::NotAnObject);
    };

    let job_id = match fields.remove("job_id") {
        Some(Value::String(id)) => id,
        Some(Value::Number(n)) => n.to_string(),
        _ => return Err(DecodeError::MissingField("job_id")),
    };

    let event_type = match fields.remove("type") {
        Some(Value::String(kind)) => {
            serde_json::from_value(Value::String(kind.clone()))
                .map_err(|_| DecodeError::UnknownType(kind))?
        }
        _ => return Err(DecodeError::MissingField("type")),
    };

    let timestamp = fields
        .remove("timestamp")
        .and_then(|v| v.as_str().map(str::to_string))
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    Ok(Envelope {
        job_id,
        event_type,
        payload: fields,
        timestamp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_plain_progress_envelope() {
        let json = r#"{"job_id":"doc-1","type":"compilation_progress","stage":"bibtex","percent":40,"message":"running"}"#;
        let env = decode_envelope(json).unwrap();
        assert_eq!(env.job_id, "doc-1");
        assert_eq!(env.event_type, EventType::CompilationProgress);
        assert_eq!(
            env.progress(),
            Progress {
                stage: Some("bibtex".into()),
                percent: Some(40),
                message: Some("running".into()),
            }
        );
        assert!(!env.payload.contains_key("job_id"));
    }

    #[test]
    fn decode_double_encoded_payload() {
        let inner = r#"{"job_id":"7","type":"job_started"}"#;
        let outer = serde_json::to_string(inner).unwrap();
        let env = decode_envelope(&outer).unwrap();
        assert_eq!(env.job_id, "7");
        assert_eq!(env.event_type, EventType::JobStarted);
    }

    #[test]
    fn only_one_extra_layer_is_unwrapped() {
        let inner = r#"{"job_id":"7","type":"job_started"}"#;
        let twice = serde_json::to_string(&serde_json::to_string(inner).unwrap()).unwrap();
        assert!(matches!(
            decode_envelope(&twice),
            Err(DecodeError::NotAnObject)
        ));
    }

    #[test]
    fn numeric_job_id_is_stringified() {
        let env = decode_envelope(r#"{"job_id":42,"type":"job_progress"}"#).unwrap();
        assert_eq!(env.job_id, "42");
    }

    #[test]
    fn progress_percent_fallback_and_clamp() {
        let env =
            decode_envelope(r#"{"job_id":"1","type":"job_progress","progress_percent":140.2}"#)
                .unwrap();
        assert_eq!(env.progress().percent, Some(100));
    }

    #[test]
    fn server_timestamp_is_preserved() {
        let env = decode_envelope(
            r#"{"job_id":"1","type":"job_started","timestamp":"2026-01-02T03:04:05Z"}"#,
        )
        .unwrap();
        assert_eq!(env.timestamp.to_rfc3339(), "2026-01-02T03:04:05+00:00");
        assert!(!env.payload.contains_key("timestamp"));
    }

    #[test]
    fn compile_result_with_mixed_diagnostics() {
        let json = r#"{
            "job_id":"doc-1","type":"compilation_failed",
            "result":{
                "success":false,
                "errors":["Undefined control sequence",{"message":"Missing $","line":12}],
                "warnings":[{"text":"Overfull hbox"}],
                "log":"This is pdfTeX"
            }
        }"#;
        let env = decode_envelope(json).unwrap();
        let result = env.compile_result().unwrap();
        assert!(!result.success);
        assert_eq!(result.errors.len(), 2);
        assert_eq!(result.errors[0].line, None);
        assert_eq!(result.errors[1].message, "Missing $");
        assert_eq!(result.errors[1].line, Some(12));
        assert_eq!(result.warnings[0].message, "Overfull hbox");
        assert_eq!(result.log.as_deref(), Some("This is pdfTeX"));
    }

    #[test]
    fn malformed_diagnostic_keeps_the_rest_of_the_result() {
        let json = r#"{
            "job_id":"doc-1","type":"compilation_failed",
            "result":{
                "errors":[{"message":"Quoted line","line":"12"},{"message":"Negative","line":-3},{"line":4},"Plain"],
                "log":"! Emergency stop."
            }
        }"#;
        let result = decode_envelope(json).unwrap().compile_result().unwrap();
        assert_eq!(result.errors.len(), 3);
        assert_eq!(result.errors[0].line, Some(12));
        assert_eq!(result.errors[1].line, None);
        assert_eq!(result.errors[2].message, "Plain");
        assert_eq!(result.log.as_deref(), Some("! Emergency stop."));
    }

    #[test]
    fn failure_is_reported_by_type_or_result() {
        let failed = decode_envelope(r#"{"job_id":"1","type":"compilation_failed"}"#).unwrap();
        let bare = decode_envelope(r#"{"job_id":"1","type":"compilation_completed"}"#).unwrap();
        let unsuccessful = decode_envelope(
            r#"{"job_id":"1","type":"compilation_completed","result":{"success":false}}"#,
        )
        .unwrap();
        assert!(failed.reports_failure());
        assert!(!bare.reports_failure());
        assert!(unsuccessful.reports_failure());
    }

    #[test]
    fn unknown_type_is_rejected() {
        let err = decode_envelope(r#"{"job_id":"1","type":"job_exploded"}"#).unwrap_err();
        match err {
            DecodeError::UnknownType(kind) => assert_eq!(kind, "job_exploded"),
            other => panic!("Expected UnknownType, got {other:?}"),
        }
    }

    #[test]
    fn missing_job_id_is_rejected() {
        assert!(matches!(
            decode_envelope(r#"{"type":"job_started"}"#),
            Err(DecodeError::MissingField("job_id"))
        ));
    }

    #[test]
    fn invalid_json_is_rejected() {
        assert!(matches!(
            decode_envelope("not json at all"),
            Err(DecodeError::Json(_))
        ));
    }

    #[test]
    fn event_type_classification() {
        assert!(EventType::JobFailed.is_job());
        assert!(EventType::JobFailed.is_terminal());
        assert!(EventType::CompilationProgress.is_compilation());
        assert!(!EventType::CompilationProgress.is_terminal());
        assert_eq!(EventType::CompilationCompleted.as_str(), "compilation_completed");
    }
}
