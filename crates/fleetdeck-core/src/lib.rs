use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;
use url::Url;

pub mod log_wire;

pub const CREDENTIAL_MASK_PREFIX_CHARS: usize = 4;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunnerInstance {
    #[serde(rename = "instance_id")]
    pub id: u64,
    #[serde(default, rename = "runner_name")]
    pub name: String,
    #[serde(rename = "github_url")]
    pub source_repo: String,
    #[serde(default, rename = "token", skip_serializing_if = "Option::is_none")]
    pub credential_masked: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<String>,
    #[serde(default, deserialize_with = "deserialize_status")]
    pub status: RunnerStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl RunnerInstance {
    pub fn label_list(&self) -> Vec<String> {
        self.labels
            .as_deref()
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|label| !label.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunnerStatus {
    Starting,
    Online,
    Stopping,
    Offline,
    Error,
}

impl Default for RunnerStatus {
    fn default() -> Self {
        Self::Offline
    }
}

impl RunnerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunnerStatus::Starting => "starting",
            RunnerStatus::Online => "online",
            RunnerStatus::Stopping => "stopping",
            RunnerStatus::Offline => "offline",
            RunnerStatus::Error => "error",
        }
    }

    pub fn is_transitional(&self) -> bool {
        matches!(self, RunnerStatus::Starting | RunnerStatus::Stopping)
    }

    /// Boundary normalization: unknown remote spellings collapse to `Offline`
    /// instead of failing the whole payload.
    pub fn normalized(input: &str) -> Self {
        input.parse().unwrap_or(RunnerStatus::Offline)
    }
}

impl fmt::Display for RunnerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunnerStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "starting" | "restarting" => Ok(RunnerStatus::Starting),
            "online" | "running" => Ok(RunnerStatus::Online),
            "stopping" => Ok(RunnerStatus::Stopping),
            "offline" | "stopped" => Ok(RunnerStatus::Offline),
            "error" | "errored" | "failed" => Ok(RunnerStatus::Error),
            other => Err(format!("Unknown status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RunnerSpec {
    #[serde(rename = "runner_name", skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "github_url")]
    pub source_repo: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<String>,
}

impl RunnerSpec {
    pub fn new(source_repo: impl Into<String>) -> Self {
        Self {
            name: None,
            source_repo: source_repo.into(),
            labels: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FleetSnapshot {
    pub instances: Vec<RunnerInstance>,
    pub last_synced: Option<DateTime<Utc>>,
}

/// Outbound-only credential. Holds the secret behind `SecretString` so it
/// cannot leak through `Debug` or serialization; the HTTP layer is the only
/// place that calls `expose`.
pub struct WriteCredential(SecretString);

impl WriteCredential {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(SecretString::from(raw.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }

    pub fn is_blank(&self) -> bool {
        self.0.expose_secret().trim().is_empty()
    }

    pub fn masked(&self) -> String {
        mask_credential(self.0.expose_secret())
    }
}

impl fmt::Debug for WriteCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WriteCredential(****)")
    }
}

pub fn mask_credential(raw: &str) -> String {
    let prefix: String = raw.chars().take(CREDENTIAL_MASK_PREFIX_CHARS).collect();
    format!("{prefix}****")
}

pub fn parse_credential(input: &str) -> Result<WriteCredential, &'static str> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err("credential is empty");
    }
    Ok(WriteCredential::new(trimmed))
}

pub fn parse_source_repo(input: &str) -> Result<String, &'static str> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err("source repository URL is empty");
    }
    let parsed = Url::parse(trimmed).map_err(|_| "source repository URL is not a valid URL")?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err("source repository URL must use http or https");
    }
    if parsed.host_str().is_none() {
        return Err("source repository URL has no host");
    }
    Ok(trimmed.to_string())
}

pub fn parse_labels(input: &str) -> Option<String> {
    let labels: Vec<&str> = input
        .split(',')
        .map(str::trim)
        .filter(|label| !label.is_empty())
        .collect();
    if labels.is_empty() {
        None
    } else {
        Some(labels.join(","))
    }
}

/// Deserialize a status that may arrive in any casing, or as null/unknown
/// text from older servers, without failing the surrounding payload.
fn deserialize_status<'de, D>(deserializer: D) -> Result<RunnerStatus, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw {
        Some(value) => Ok(RunnerStatus::normalized(&value)),
        None => Ok(RunnerStatus::Offline),
    }
}
