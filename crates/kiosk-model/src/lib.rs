use std::time::Duration;

use anyhow::{Result, ensure};
use chrono::{DateTime, Utc};
use serde::de::Deserializer;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub use text::{extract_subtitle, message_body};

/// Content sync period used when `setup.json` carries no usable `sync_interval`.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(300);

/// Shortest content sync period; smaller positive values are raised to it.
pub const MIN_SYNC_INTERVAL: Duration = Duration::from_millis(1);

/// Display settings mirrored from the remote account into `setup.json`.
///
/// The document is written by the setup sync script, so field types are read
/// leniently: a value of an unexpected type reads as absent instead of
/// rejecting the whole document. Fields this service does not know about are
/// kept in `extra` and written back untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SetupConfig {
    #[serde(
        default,
        deserialize_with = "lenient::number",
        skip_serializing_if = "Option::is_none"
    )]
    pub sync_interval: Option<f64>,
    #[serde(
        default,
        deserialize_with = "lenient::number",
        skip_serializing_if = "Option::is_none"
    )]
    pub delay_seconds: Option<f64>,
    #[serde(
        default,
        deserialize_with = "lenient::text",
        skip_serializing_if = "Option::is_none"
    )]
    pub transition_effect: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient::number",
        skip_serializing_if = "Option::is_none"
    )]
    pub transition_duration: Option<f64>,
    #[serde(
        default,
        deserialize_with = "lenient::text",
        skip_serializing_if = "Option::is_none"
    )]
    pub orientation: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient::text",
        skip_serializing_if = "Option::is_none"
    )]
    pub language: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SetupConfig {
    /// Period of the content sync loop; non-positive or non-finite values fall back.
    ///
    /// The result is never zero: positive values below [`MIN_SYNC_INTERVAL`]
    /// are raised to it.
    pub fn sync_period(&self) -> Duration {
        match self.sync_interval {
            Some(secs) if secs.is_finite() && secs > 0.0 => Duration::try_from_secs_f64(secs)
                .map(|period| period.max(MIN_SYNC_INTERVAL))
                .unwrap_or(DEFAULT_SYNC_INTERVAL),
            _ => DEFAULT_SYNC_INTERVAL,
        }
    }
}

/// OAuth client credentials for the remote account. `{}` means "not linked yet".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
}

impl Credentials {
    pub fn is_complete(&self) -> bool {
        let filled = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());
        filled(&self.client_id) && filled(&self.client_secret)
    }
}

/// Identity of this installation, generated once and never rewritten.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub device_id: Uuid,
    pub hostname: String,
    pub created_at: DateTime<Utc>,
}

impl DeviceIdentity {
    pub fn generate(hostname: impl Into<String>) -> Self {
        Self {
            device_id: Uuid::new_v4(),
            hostname: hostname.into(),
            created_at: Utc::now(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(!self.device_id.is_nil(), "device_id must not be the nil UUID");
        ensure!(
            !self.hostname.trim().is_empty(),
            "hostname must not be empty"
        );
        Ok(())
    }
}

mod lenient {
    use super::*;

    pub fn number<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match Value::deserialize(deserializer)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
    }

    pub fn text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match Value::deserialize(deserializer)? {
            Value::String(s) => Some(s),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        })
    }
}

mod text {
    const TEXT_MARKER: &str = "[Text]";

    /// Pulls the subtitle block out of a media sidecar file.
    ///
    /// The block starts after a line equal to `[Text]` and runs until the next
    /// line starting with `[` or the end of the file. Returns `None` when the
    /// marker is absent.
    pub fn extract_subtitle(raw: &str) -> Option<String> {
        let mut lines = raw.lines();
        lines.by_ref().find(|line| *line == TEXT_MARKER)?;
        let block: Vec<&str> = lines.take_while(|line| !line.starts_with('[')).collect();
        Some(block.join("\n").trim().to_string())
    }

    /// Body of a standalone message file, minus a leading `[Text]` line.
    pub fn message_body(raw: &str) -> String {
        let mut lines: Vec<&str> = raw.lines().collect();
        if lines.first().is_some_and(|line| line.trim() == TEXT_MARKER) {
            lines.remove(0);
        }
        lines.join("\n").trim().to_string()
    }
}
