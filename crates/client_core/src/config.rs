use std::{fs, path::Path, time::Duration};

use anyhow::Context;
use rand::Rng;
use serde::Deserialize;

pub const DEFAULT_SETTINGS_FILE: &str = "client.toml";

#[derive(Debug, Clone, PartialEq)]
pub struct ClientSettings {
    pub server_url: String,
    pub ws_path: String,
    /// How long before expiry a credential is treated as expired.
    pub refresh_margin: Duration,
    pub reconnect: ReconnectConfig,
    pub event_buffer_capacity: usize,
    pub presence_staleness: Duration,
    pub ring_timeout: Duration,
    pub cache_stale_time: Duration,
    /// Upper bound on one refresh request.
    pub request_timeout: Duration,
    /// How long an opened socket may wait for the auth ack.
    pub auth_ack_timeout: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8443".into(),
            ws_path: "/ws".into(),
            refresh_margin: Duration::from_secs(10),
            reconnect: ReconnectConfig::default(),
            event_buffer_capacity: 256,
            presence_staleness: Duration::from_secs(30),
            ring_timeout: Duration::from_secs(45),
            cache_stale_time: Duration::from_secs(30),
            request_timeout: Duration::from_secs(10),
            auth_ack_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Fraction of the computed delay added as uniform random jitter.
    pub jitter: f64,
    /// 0 retries forever.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.2,
            max_attempts: 0,
        }
    }
}

impl ReconnectConfig {
    /// Backoff for a zero-based attempt number, before jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let millis = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        if capped.is_finite() && capped > 0.0 {
            Duration::from_millis(capped as u64)
        } else {
            self.max_delay
        }
    }

    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let base = self.delay_for_attempt(attempt);
        if self.jitter <= 0.0 {
            return base;
        }
        let spread = base.mul_f64(self.jitter.min(1.0));
        let extra = rand::thread_rng().gen_range(0.0..=1.0);
        base + spread.mul_f64(extra)
    }

    pub fn attempts_exhausted(&self, attempt: u32) -> bool {
        self.max_attempts > 0 && attempt >= self.max_attempts
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileSettings {
    server_url: Option<String>,
    ws_path: Option<String>,
    refresh_margin_secs: Option<u64>,
    reconnect_initial_delay_ms: Option<u64>,
    reconnect_max_delay_ms: Option<u64>,
    reconnect_multiplier: Option<f64>,
    reconnect_jitter: Option<f64>,
    reconnect_max_attempts: Option<u32>,
    event_buffer_capacity: Option<usize>,
    presence_staleness_secs: Option<u64>,
    ring_timeout_secs: Option<u64>,
    cache_stale_time_secs: Option<u64>,
    request_timeout_secs: Option<u64>,
    auth_ack_timeout_secs: Option<u64>,
}

/// Defaults, then `client.toml` if present, then `APP__*` environment overrides.
pub fn load_settings() -> ClientSettings {
    let mut settings = ClientSettings::default();

    match load_settings_file(Path::new(DEFAULT_SETTINGS_FILE)) {
        Ok(Some(file_cfg)) => apply_file_settings(&mut settings, file_cfg),
        Ok(None) => {}
        Err(err) => tracing::warn!("config: ignoring {DEFAULT_SETTINGS_FILE}: {err:#}"),
    }

    apply_env_overrides(&mut settings, |name| std::env::var(name).ok());
    settings
}

pub fn load_settings_from(path: &Path) -> anyhow::Result<ClientSettings> {
    let mut settings = ClientSettings::default();
    let file_cfg = load_settings_file(path)?
        .with_context(|| format!("settings file '{}' does not exist", path.display()))?;
    apply_file_settings(&mut settings, file_cfg);
    Ok(settings)
}

fn load_settings_file(path: &Path) -> anyhow::Result<Option<FileSettings>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read settings file '{}'", path.display()))?;
    let parsed = toml::from_str::<FileSettings>(&raw)
        .with_context(|| format!("failed to parse settings file '{}'", path.display()))?;
    Ok(Some(parsed))
}

fn apply_file_settings(settings: &mut ClientSettings, file_cfg: FileSettings) {
    if let Some(v) = file_cfg.server_url {
        settings.server_url = v;
    }
    if let Some(v) = file_cfg.ws_path {
        settings.ws_path = v;
    }
    if let Some(v) = file_cfg.refresh_margin_secs {
        settings.refresh_margin = Duration::from_secs(v);
    }
    if let Some(v) = file_cfg.reconnect_initial_delay_ms {
        settings.reconnect.initial_delay = Duration::from_millis(v);
    }
    if let Some(v) = file_cfg.reconnect_max_delay_ms {
        settings.reconnect.max_delay = Duration::from_millis(v);
    }
    if let Some(v) = file_cfg.reconnect_multiplier {
        settings.reconnect.multiplier = v;
    }
    if let Some(v) = file_cfg.reconnect_jitter {
        settings.reconnect.jitter = v;
    }
    if let Some(v) = file_cfg.reconnect_max_attempts {
        settings.reconnect.max_attempts = v;
    }
    if let Some(v) = file_cfg.event_buffer_capacity {
        settings.event_buffer_capacity = v;
    }
    if let Some(v) = file_cfg.presence_staleness_secs {
        settings.presence_staleness = Duration::from_secs(v);
    }
    if let Some(v) = file_cfg.ring_timeout_secs {
        settings.ring_timeout = Duration::from_secs(v);
    }
    if let Some(v) = file_cfg.cache_stale_time_secs {
        settings.cache_stale_time = Duration::from_secs(v);
    }
    if let Some(v) = file_cfg.request_timeout_secs {
        settings.request_timeout = Duration::from_secs(v);
    }
    if let Some(v) = file_cfg.auth_ack_timeout_secs {
        settings.auth_ack_timeout = Duration::from_secs(v);
    }
}

pub(crate) fn apply_env_overrides(
    settings: &mut ClientSettings,
    lookup: impl Fn(&str) -> Option<String>,
) {
    if let Some(v) = lookup("APP__SERVER_URL") {
        settings.server_url = v;
    }
    if let Some(v) = lookup("APP__WS_PATH") {
        settings.ws_path = v;
    }
    if let Some(v) = parsed(&lookup, "APP__REFRESH_MARGIN_SECS") {
        settings.refresh_margin = Duration::from_secs(v);
    }
    if let Some(v) = parsed(&lookup, "APP__RECONNECT_INITIAL_DELAY_MS") {
        settings.reconnect.initial_delay = Duration::from_millis(v);
    }
    if let Some(v) = parsed(&lookup, "APP__RECONNECT_MAX_DELAY_MS") {
        settings.reconnect.max_delay = Duration::from_millis(v);
    }
    if let Some(v) = parsed(&lookup, "APP__RECONNECT_MAX_ATTEMPTS") {
        settings.reconnect.max_attempts = v;
    }
    if let Some(v) = parsed(&lookup, "APP__EVENT_BUFFER_CAPACITY") {
        settings.event_buffer_capacity = v;
    }
    if let Some(v) = parsed(&lookup, "APP__PRESENCE_STALENESS_SECS") {
        settings.presence_staleness = Duration::from_secs(v);
    }
    if let Some(v) = parsed(&lookup, "APP__RING_TIMEOUT_SECS") {
        settings.ring_timeout = Duration::from_secs(v);
    }
    if let Some(v) = parsed(&lookup, "APP__CACHE_STALE_TIME_SECS") {
        settings.cache_stale_time = Duration::from_secs(v);
    }
    if let Some(v) = parsed(&lookup, "APP__REQUEST_TIMEOUT_SECS") {
        settings.request_timeout = Duration::from_secs(v);
    }
    if let Some(v) = parsed(&lookup, "APP__AUTH_ACK_TIMEOUT_SECS") {
        settings.auth_ack_timeout = Duration::from_secs(v);
    }
}

fn parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    let raw = lookup(name)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("config: ignoring unparsable {name}={raw}");
            None
        }
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
