use std::collections::{BTreeMap, BTreeSet};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use mailsignal_proto::{EventType, FIELD_RCPT_TO};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub sink: SinkConfig,
    #[serde(default)]
    pub events: EventsConfig,
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = parse_config_path_arg(env::args().skip(1))?
            .or_else(resolve_server_config_path)
            .context(
                "server config path not found (MAILSIGNAL_CONFIG_PATH or mailsignal.yaml/mailsignal.yml)",
            )?;

        let mut config = load_config_yaml(&config_path)?;
        config.normalize()?;
        config.validate()?;
        Ok(config)
    }

    fn normalize(&mut self) -> Result<()> {
        self.listen = trim_owned(self.listen.clone());
        if self.listen.is_empty() {
            self.listen = default_listen();
        }
        if self.max_payload_bytes == 0 {
            bail!("server config `max_payload_bytes` must be positive");
        }

        self.cache.normalize();
        self.sink.normalize();
        self.events.normalize();
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        self.sink.validate()?;
        self.events.validate()
    }
}

fn parse_config_path_arg<I>(mut args: I) -> Result<Option<PathBuf>>
where
    I: Iterator<Item = String>,
{
    let first = args.next();
    let second = args.next();

    if let Some(arg) = second {
        bail!(
            "too many arguments: {arg} (usage: mailsignal-server [config-path])"
        );
    }

    if matches!(first.as_deref(), Some("-h" | "--help")) {
        bail!("usage: mailsignal-server [config-path]");
    }

    Ok(first.map(PathBuf::from))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    #[serde(
        default = "default_cache_ttl",
        deserialize_with = "mailsignal_helpers::de::deserialize_duration"
    )]
    pub ttl: Duration,
    #[serde(
        default = "default_cache_prune_interval",
        deserialize_with = "mailsignal_helpers::de::deserialize_duration"
    )]
    pub prune_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: default_cache_ttl(),
            prune_interval: default_cache_prune_interval(),
        }
    }
}

impl CacheConfig {
    fn normalize(&mut self) {
        self.ttl = self.ttl.max(Duration::from_secs(60));
        self.prune_interval = self.prune_interval.max(Duration::from_secs(1));
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SinkConfig {
    #[serde(default)]
    pub write_key: Option<String>,
    #[serde(default = "default_sink_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_sink_flush_at")]
    pub flush_at: usize,
    #[serde(
        default = "default_sink_flush_interval",
        deserialize_with = "mailsignal_helpers::de::deserialize_duration"
    )]
    pub flush_interval: Duration,
    #[serde(
        default = "default_sink_timeout",
        deserialize_with = "mailsignal_helpers::de::deserialize_duration"
    )]
    pub timeout: Duration,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            write_key: None,
            endpoint: default_sink_endpoint(),
            flush_at: default_sink_flush_at(),
            flush_interval: default_sink_flush_interval(),
            timeout: default_sink_timeout(),
        }
    }
}

impl SinkConfig {
    pub fn enabled(&self) -> bool {
        self.write_key.is_some()
    }

    fn normalize(&mut self) {
        self.write_key = normalize_opt(self.write_key.clone());
        self.endpoint = trim_owned(self.endpoint.clone())
            .trim_end_matches('/')
            .to_string();
        if self.endpoint.is_empty() {
            self.endpoint = default_sink_endpoint();
        }

        self.flush_at = self.flush_at.max(1);
        self.flush_interval = self.flush_interval.max(Duration::from_secs(1));
        self.timeout = self.timeout.max(Duration::from_secs(1));
    }

    fn validate(&self) -> Result<()> {
        if !self.enabled() {
            return Ok(());
        }

        if !self.endpoint.starts_with("http://")
            && !self.endpoint.starts_with("https://")
        {
            bail!(
                "server config `sink.endpoint` must be an http(s) url: {}",
                self.endpoint
            );
        }

        Ok(())
    }
}

/// Which provider events are interesting and how they map to outbound
/// analytics event names.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EventsConfig {
    #[serde(default = "default_envelope_root")]
    pub envelope_root: Option<String>,
    #[serde(default = "default_event_classes")]
    pub event_classes: Vec<String>,
    #[serde(default = "default_event_types")]
    pub event_types: BTreeSet<EventType>,
    #[serde(default = "default_complaint_event_type")]
    pub complaint_event_type: EventType,
    #[serde(default = "default_complaint_subtypes")]
    pub complaint_subtypes: BTreeSet<String>,
    #[serde(default = "default_important_fields")]
    pub important_fields: Vec<String>,
    #[serde(default = "default_track_event_names")]
    pub track_event_names: BTreeMap<EventType, String>,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            envelope_root: default_envelope_root(),
            event_classes: default_event_classes(),
            event_types: default_event_types(),
            complaint_event_type: default_complaint_event_type(),
            complaint_subtypes: default_complaint_subtypes(),
            important_fields: default_important_fields(),
            track_event_names: default_track_event_names(),
        }
    }
}

impl EventsConfig {
    fn normalize(&mut self) {
        self.envelope_root = normalize_opt(self.envelope_root.clone());
        self.event_classes = normalize_list(&self.event_classes);
        self.important_fields = normalize_list(&self.important_fields);
        self.complaint_subtypes = self
            .complaint_subtypes
            .iter()
            .filter_map(|value| normalize_opt(Some(value.clone())))
            .collect();
        for name in self.track_event_names.values_mut() {
            *name = trim_owned(name.clone());
        }
    }

    /// Checks the event tables agree with each other.
    ///
    /// Every mapped type must be interesting, and every interesting type
    /// that is tracked at all must have an outbound name.
    pub fn validate(&self) -> Result<()> {
        if self.event_classes.is_empty() {
            bail!("server config `events.event_classes` must not be empty");
        }
        if self.event_types.is_empty() {
            bail!("server config `events.event_types` must not be empty");
        }
        if !self.important_fields.iter().any(|field| field == FIELD_RCPT_TO) {
            bail!(
                "server config `events.important_fields` must contain `{FIELD_RCPT_TO}`"
            );
        }

        let unexpected: Vec<&str> = self
            .track_event_names
            .keys()
            .filter(|kind| !self.event_types.contains(*kind))
            .map(EventType::as_str)
            .collect();
        if !unexpected.is_empty() {
            bail!(
                "server config `events.track_event_names` maps types missing from `events.event_types`: {}",
                unexpected.join(",")
            );
        }

        let structural: Vec<&str> = self
            .track_event_names
            .keys()
            .filter(|kind| kind.is_structural())
            .map(EventType::as_str)
            .collect();
        if !structural.is_empty() {
            bail!(
                "server config `events.track_event_names` maps structural types that are never tracked: {}",
                structural.join(",")
            );
        }

        let unmapped: Vec<&str> = self
            .event_types
            .iter()
            .filter(|kind| !kind.is_structural())
            .filter(|kind| !self.track_event_names.contains_key(*kind))
            .map(EventType::as_str)
            .collect();
        if !unmapped.is_empty() {
            bail!(
                "server config `events.event_types` has types without a `events.track_event_names` entry: {}",
                unmapped.join(",")
            );
        }

        if let Some((kind, _)) =
            self.track_event_names.iter().find(|(_, name)| name.is_empty())
        {
            bail!("server config `events.track_event_names.{kind}` is empty");
        }

        if self.event_types.contains(&self.complaint_event_type)
            && self.complaint_subtypes.is_empty()
        {
            bail!(
                "server config `events.complaint_subtypes` is empty, every `{}` event would be dropped",
                self.complaint_event_type
            );
        }

        Ok(())
    }
}

fn load_config_yaml(path: &Path) -> Result<Config> {
    let raw = std::fs::read(path).with_context(|| {
        format!("failed to read config file {}", path.display())
    })?;
    serde_yaml::from_slice(&raw).with_context(|| {
        format!("failed to parse YAML config {}", path.display())
    })
}

fn resolve_server_config_path() -> Option<PathBuf> {
    if let Some(path) = non_empty_env("MAILSIGNAL_CONFIG_PATH") {
        return Some(PathBuf::from(path));
    }

    let mut dirs = Vec::with_capacity(2);
    if let Some(home) = non_empty_env("HOME") {
        dirs.push(PathBuf::from(home));
    }
    dirs.push(env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    dirs.into_iter()
        .flat_map(|dir| {
            [dir.join("mailsignal.yaml"), dir.join("mailsignal.yml")]
        })
        .find(|candidate| candidate.exists())
}

fn default_listen() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_max_payload_bytes() -> usize {
    1024 * 1024
}

fn default_cache_ttl() -> Duration {
    Duration::from_secs(7 * 86_400)
}

fn default_cache_prune_interval() -> Duration {
    Duration::from_secs(300)
}

fn default_sink_endpoint() -> String {
    "https://api.segment.io".to_string()
}

fn default_sink_flush_at() -> usize {
    20
}

fn default_sink_flush_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_sink_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_envelope_root() -> Option<String> {
    Some("msys".to_string())
}

fn default_event_classes() -> Vec<String> {
    ["message_event", "track_event", "gen_event"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

fn default_event_types() -> BTreeSet<EventType> {
    BTreeSet::from([
        EventType::Reception,
        EventType::Injection,
        EventType::Delivery,
        EventType::Inband,
        EventType::OutOfBand,
        EventType::Bounce,
        EventType::Feedback,
        EventType::SpamComplaint,
        EventType::Open,
        EventType::Click,
    ])
}

fn default_complaint_event_type() -> EventType {
    EventType::Feedback
}

fn default_complaint_subtypes() -> BTreeSet<String> {
    BTreeSet::from(["abuse".to_string()])
}

fn default_important_fields() -> Vec<String> {
    ["rcpt_to", "rcpt_meta", "tags"].into_iter().map(str::to_string).collect()
}

fn default_track_event_names() -> BTreeMap<EventType, String> {
    [
        (EventType::Delivery, "Email Delivered"),
        (EventType::Inband, "Email Bounced"),
        (EventType::OutOfBand, "Email Bounced"),
        (EventType::Bounce, "Email Bounced"),
        (EventType::Feedback, "Email Marked as Spam"),
        (EventType::SpamComplaint, "Email Marked as Spam"),
        (EventType::Open, "Email Opened"),
        (EventType::Click, "Email Link Clicked"),
    ]
    .into_iter()
    .map(|(kind, name)| (kind, name.to_string()))
    .collect()
}

fn normalize_list(values: &[String]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    values
        .iter()
        .filter_map(|value| normalize_opt(Some(value.clone())))
        .filter(|value| seen.insert(value.clone()))
        .collect()
}

fn normalize_opt(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() { None } else { Some(trimmed.to_string()) }
    })
}

fn trim_owned(value: String) -> String {
    value.trim().to_string()
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() { None } else { Some(trimmed.to_string()) }
    })
}
