use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use chat_core::{FallbackPolicy, ListenerConfig, ReconcilerConfig};
use serde::Deserialize;
use shared::domain::{GroupId, PersonId};

pub const DEFAULT_CONFIG_FILE: &str = "peer.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub peer_id: String,
    pub database_url: String,
    pub peer_debounce_ms: u64,
    pub ai_debounce_ms: u64,
    pub race_backoff_ms: u64,
    pub max_message_age_secs: u64,
    pub sync_interval_ms: u64,
    pub federation_groups: Vec<String>,
    pub automated_agents: Vec<String>,
    pub welcome_message: Option<String>,
    pub strict_fallback: bool,
    pub log_filter: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            peer_id: "local".into(),
            database_url: "sqlite://./data/peer.db".into(),
            peer_debounce_ms: 100,
            ai_debounce_ms: 800,
            race_backoff_ms: 500,
            max_message_age_secs: 5 * 60,
            sync_interval_ms: 1000,
            federation_groups: Vec::new(),
            automated_agents: Vec::new(),
            welcome_message: None,
            strict_fallback: false,
            log_filter: "info".into(),
        }
    }
}

/// Keys accepted in the TOML file. Everything is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileSettings {
    peer_id: Option<String>,
    database_url: Option<String>,
    peer_debounce_ms: Option<u64>,
    ai_debounce_ms: Option<u64>,
    race_backoff_ms: Option<u64>,
    max_message_age_secs: Option<u64>,
    sync_interval_ms: Option<u64>,
    federation_groups: Option<Vec<String>>,
    automated_agents: Option<Vec<String>>,
    welcome_message: Option<String>,
    strict_fallback: Option<bool>,
    log_filter: Option<String>,
}

impl Settings {
    pub fn local_id(&self) -> PersonId {
        PersonId::new(self.peer_id.clone())
    }

    pub fn reconciler_config(&self) -> ReconcilerConfig {
        let mut config = ReconcilerConfig::new(self.local_id());
        config.race_backoff = Duration::from_millis(self.race_backoff_ms);
        config.policy = if self.strict_fallback {
            FallbackPolicy::Strict
        } else {
            FallbackPolicy::Permissive
        };
        config.welcome_message = self.welcome_message.clone();
        config
    }

    pub fn peer_listener(&self) -> ListenerConfig {
        self.with_age(
            ListenerConfig::peer_notifications()
                .with_quiescence(Duration::from_millis(self.peer_debounce_ms)),
        )
    }

    pub fn ai_listener(&self) -> ListenerConfig {
        self.with_age(
            ListenerConfig::ai_responder()
                .with_quiescence(Duration::from_millis(self.ai_debounce_ms)),
        )
    }

    pub fn federation_groups(&self) -> Vec<GroupId> {
        self.federation_groups.iter().map(GroupId::new).collect()
    }

    pub fn automated_agents(&self) -> Vec<PersonId> {
        self.automated_agents.iter().map(PersonId::new).collect()
    }

    fn with_age(&self, mut config: ListenerConfig) -> ListenerConfig {
        config.max_message_age = Some(Duration::from_secs(self.max_message_age_secs));
        config
    }
}

/// Defaults, then the config file, then environment overrides. An explicit
/// `config_path` must exist; the default `peer.toml` is optional.
pub fn load_settings(config_path: Option<&Path>) -> anyhow::Result<Settings> {
    let mut settings = Settings::default();

    let (path, required) = match config_path {
        Some(path) => (path.to_path_buf(), true),
        None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
    };
    match fs::read_to_string(&path) {
        Ok(raw) => apply_file(&mut settings, &raw)
            .with_context(|| format!("invalid config file '{}'", path.display()))?,
        Err(err) if required => {
            return Err(err).with_context(|| format!("failed to read '{}'", path.display()));
        }
        Err(_) => {}
    }

    apply_env(&mut settings, |key| std::env::var(key).ok());
    Ok(settings)
}

fn apply_file(settings: &mut Settings, raw: &str) -> anyhow::Result<()> {
    let file: FileSettings = toml::from_str(raw)?;
    if let Some(v) = file.peer_id {
        settings.peer_id = v;
    }
    if let Some(v) = file.database_url {
        settings.database_url = v;
    }
    if let Some(v) = file.peer_debounce_ms {
        settings.peer_debounce_ms = v;
    }
    if let Some(v) = file.ai_debounce_ms {
        settings.ai_debounce_ms = v;
    }
    if let Some(v) = file.race_backoff_ms {
        settings.race_backoff_ms = v;
    }
    if let Some(v) = file.max_message_age_secs {
        settings.max_message_age_secs = v;
    }
    if let Some(v) = file.sync_interval_ms {
        settings.sync_interval_ms = v;
    }
    if let Some(v) = file.federation_groups {
        settings.federation_groups = v;
    }
    if let Some(v) = file.automated_agents {
        settings.automated_agents = v;
    }
    if let Some(v) = file.welcome_message {
        settings.welcome_message = Some(v);
    }
    if let Some(v) = file.strict_fallback {
        settings.strict_fallback = v;
    }
    if let Some(v) = file.log_filter {
        settings.log_filter = v;
    }
    Ok(())
}

fn apply_env(settings: &mut Settings, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("PEER_ID") {
        settings.peer_id = v;
    }
    if let Some(v) = var("APP__PEER_ID") {
        settings.peer_id = v;
    }

    if let Some(v) = var("DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(v) = var("APP__DATABASE_URL") {
        settings.database_url = v;
    }

    if let Some(v) = var("APP__PEER_DEBOUNCE_MS").and_then(|v| v.parse().ok()) {
        settings.peer_debounce_ms = v;
    }
    if let Some(v) = var("APP__AI_DEBOUNCE_MS").and_then(|v| v.parse().ok()) {
        settings.ai_debounce_ms = v;
    }
    if let Some(v) = var("APP__RACE_BACKOFF_MS").and_then(|v| v.parse().ok()) {
        settings.race_backoff_ms = v;
    }
    if let Some(v) = var("APP__SYNC_INTERVAL_MS").and_then(|v| v.parse().ok()) {
        settings.sync_interval_ms = v;
    }

    if let Some(v) = var("APP__FEDERATION_GROUPS") {
        settings.federation_groups = split_list(&v);
    }
    if let Some(v) = var("APP__AUTOMATED_AGENTS") {
        settings.automated_agents = split_list(&v);
    }
    if let Some(v) = var("APP__WELCOME_MESSAGE") {
        settings.welcome_message = Some(v).filter(|v| !v.is_empty());
    }
    if let Some(v) = var("APP__STRICT_FALLBACK") {
        settings.strict_fallback = matches!(v.trim(), "1" | "true" | "yes");
    }
    if let Some(v) = var("APP__LOG_FILTER") {
        settings.log_filter = v;
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

/// Turns plain paths into `sqlite://` URLs; URLs pass through unchanged.
pub fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:") || raw_database_url.contains("://") {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        return format!("sqlite://{}", path.replace('\\', "/"));
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
