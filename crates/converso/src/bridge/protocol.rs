//! Wire protocol types for CLI-module communication.
//!
//! One JSON object per line, two directions:
//! - **stdin** (CLI → module): exactly one `ModuleRequest`, then the pipe is closed
//! - **stdout** (module → CLI): any number of `ProgressEvent`s, then one `ModuleResponse`

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::auth::Credentials;

/// Timeout applied when a request carries a non-positive one.
pub const DEFAULT_TIMEOUT_SECS: i64 = 300;

/// Free-form argument/data map. Values are the JSON union
/// (string, number, bool, array, object, null).
pub type Args = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("invalid progress event: {0}")]
    InvalidProgress(String),
    #[error("malformed message: {0}")]
    MalformedMessage(String),
}

impl ProtocolError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::InvalidResponse(_) => "INVALID_RESPONSE",
            Self::InvalidProgress(_) => "INVALID_PROGRESS",
            Self::MalformedMessage(_) => "MALFORMED_MESSAGE",
        }
    }
}

/// Treat an explicit JSON `null` the same as a missing field.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Request sent to a module on stdin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleRequest {
    pub command: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub args: Args,
    #[serde(default, deserialize_with = "null_as_default")]
    pub auth_token: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub device_token: String,
    /// Seconds. Modules read this field as `timeout`.
    #[serde(rename = "timeout", default)]
    pub timeout_seconds: i64,
}

impl ModuleRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Args::new(),
            auth_token: String::new(),
            device_token: String::new(),
            timeout_seconds: DEFAULT_TIMEOUT_SECS,
        }
    }

    pub fn with_args(mut self, args: Args) -> Self {
        self.args = args;
        self
    }

    pub fn with_arg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.args.insert(key.into(), value.into());
        self
    }

    pub fn with_credentials(mut self, credentials: &Credentials) -> Self {
        self.auth_token = credentials.access_token.clone();
        self.device_token = credentials.device_token.clone();
        self
    }

    pub fn with_timeout_seconds(mut self, seconds: i64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    /// Effective deadline, falling back to the default for non-positive values.
    pub fn timeout(&self) -> Duration {
        let secs = if self.timeout_seconds > 0 {
            self.timeout_seconds
        } else {
            DEFAULT_TIMEOUT_SECS
        };
        Duration::from_secs(secs as u64)
    }

    /// Check the request and fill in defaults. Consumes the request so the
    /// validated copy is the one that gets sent.
    pub fn validated(mut self) -> Result<Self, ProtocolError> {
        if self.command.trim().is_empty() {
            return Err(ProtocolError::InvalidRequest(
                "command is required".to_string(),
            ));
        }
        if self.timeout_seconds <= 0 {
            self.timeout_seconds = DEFAULT_TIMEOUT_SECS;
        }
        Ok(self)
    }
}

/// Final response written by a module on stdout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleResponse {
    pub success: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    pub data: Args,
    #[serde(default, deserialize_with = "null_as_default")]
    pub error: String,
    /// Set on interim envelopes emitted by the module helper library.
    /// A response carrying progress is never final.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<ProgressEvent>,
}

impl ModuleResponse {
    pub fn success(data: Args) -> Self {
        Self {
            success: true,
            data,
            error: String::new(),
            progress: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: Args::new(),
            error: error.into(),
            progress: None,
        }
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        if !self.success && self.error.trim().is_empty() {
            return Err(ProtocolError::InvalidResponse(
                "error message required for failed response".to_string(),
            ));
        }
        Ok(())
    }
}

/// Interim status emitted while a command is in flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub stage: String,
    pub current: i64,
    pub total: i64,
    pub percentage: f64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub message: String,
    /// Overwritten with the receipt time by the bridge.
    #[serde(default, with = "lenient_timestamp")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl ProgressEvent {
    pub fn new(stage: impl Into<String>, current: i64, total: i64) -> Self {
        let percentage = if total > 0 {
            (current as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
        } else {
            0.0
        };
        Self {
            stage: stage.into(),
            current,
            total,
            percentage,
            message: String::new(),
            timestamp: Some(Utc::now()),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.stage.trim().is_empty() {
            return Err(ProtocolError::InvalidProgress("stage is required".to_string()));
        }
        if self.total < 0 {
            return Err(ProtocolError::InvalidProgress(
                "total must be non-negative".to_string(),
            ));
        }
        if self.current < 0 {
            return Err(ProtocolError::InvalidProgress(
                "current must be non-negative".to_string(),
            ));
        }
        if self.current > self.total {
            return Err(ProtocolError::InvalidProgress(
                "current cannot exceed total".to_string(),
            ));
        }
        // NaN fails the range check too.
        if !(0.0..=100.0).contains(&self.percentage) {
            return Err(ProtocolError::InvalidProgress(
                "percentage must be between 0 and 100".to_string(),
            ));
        }
        Ok(())
    }
}

/// A decoded line from a module's output stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ModuleMessage {
    Progress(ProgressEvent),
    Response(ModuleResponse),
}

/// Static descriptor shipped alongside every module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleManifest {
    pub name: String,
    pub version: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub description: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub commands: BTreeSet<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub dependencies: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub author: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub license: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ManifestError {
    #[error("module name is required")]
    MissingName,
    #[error("module version is required")]
    MissingVersion,
    #[error("invalid version format '{0}', expected semantic versioning")]
    InvalidVersion(String),
    #[error("module must define at least one command")]
    NoCommands,
    #[error("command names must be non-empty")]
    EmptyCommand,
}

impl ModuleManifest {
    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.name.trim().is_empty() {
            return Err(ManifestError::MissingName);
        }
        if self.version.trim().is_empty() {
            return Err(ManifestError::MissingVersion);
        }
        if !self.version.contains('.') {
            return Err(ManifestError::InvalidVersion(self.version.clone()));
        }
        if self.commands.is_empty() {
            return Err(ManifestError::NoCommands);
        }
        if self.commands.iter().any(|c| c.trim().is_empty()) {
            return Err(ManifestError::EmptyCommand);
        }
        Ok(())
    }

    pub fn has_command(&self, command: &str) -> bool {
        self.commands.contains(command)
    }
}

/// Typed accessors over an [`Args`] map.
pub trait ArgsExt {
    fn get_str(&self, key: &str) -> Option<&str>;
    fn get_bool(&self, key: &str) -> Option<bool>;
    fn get_i64(&self, key: &str) -> Option<i64>;
    fn get_f64(&self, key: &str) -> Option<f64>;
    fn get_list(&self, key: &str) -> Option<&[Value]>;
    fn get_map(&self, key: &str) -> Option<&Map<String, Value>>;
}

impl ArgsExt for Args {
    fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Value::as_bool)
    }

    fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(Value::as_i64)
    }

    fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(Value::as_f64)
    }

    fn get_list(&self, key: &str) -> Option<&[Value]> {
        self.get(key).and_then(Value::as_array).map(Vec::as_slice)
    }

    fn get_map(&self, key: &str) -> Option<&Map<String, Value>> {
        self.get(key).and_then(Value::as_object)
    }
}

/// Timestamps arrive as RFC 3339 strings or Unix epoch seconds depending on
/// the module runtime. Always written back as RFC 3339.
mod lenient_timestamp {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};
    use serde_json::Value;

    pub fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(ts) => serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<Value>::deserialize(deserializer)? {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => DateTime::parse_from_rfc3339(&s)
                .map(|ts| Some(ts.with_timezone(&Utc)))
                .map_err(D::Error::custom),
            Some(Value::Number(n)) => {
                let secs = n
                    .as_f64()
                    .ok_or_else(|| D::Error::custom("timestamp out of range"))?;
                if !secs.is_finite() || secs < 0.0 {
                    return Err(D::Error::custom("timestamp out of range"));
                }
                let whole = secs.trunc() as i64;
                let nanos = ((secs - secs.trunc()) * 1e9) as u32;
                DateTime::from_timestamp(whole, nanos)
                    .map(Some)
                    .ok_or_else(|| D::Error::custom("timestamp out of range"))
            }
            Some(other) => Err(D::Error::custom(format!(
                "expected RFC 3339 string or epoch seconds, got {other}"
            ))),
        }
    }
}
