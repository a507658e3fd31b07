use std::{fs, path::Path, time::Duration};

use serde::Deserialize;
use server_api::{ApiLimits, RetryConfig};
use tracing::warn;
use url::Url;

const DEFAULT_SIGNING_SECRET: &str = "dev-object-signing-secret";

#[derive(Debug, Clone)]
pub struct Settings {
    pub server_bind: String,
    pub database_url: String,
    pub server_public_url: Option<String>,
    pub object_signing_secret: String,
    pub signed_url_ttl_seconds: u64,
    pub max_attachment_bytes: usize,
    pub max_request_bytes: usize,
    pub event_buffer: usize,
    pub retry_max_retries: u32,
    pub retry_initial_backoff_ms: u64,
    pub retry_max_backoff_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_bind: "127.0.0.1:8443".into(),
            database_url: "sqlite://./data/server.db".into(),
            server_public_url: None,
            object_signing_secret: DEFAULT_SIGNING_SECRET.into(),
            signed_url_ttl_seconds: 900,
            max_attachment_bytes: server_api::attachments::MAX_ATTACHMENT_BYTES,
            max_request_bytes: 48 * 1024 * 1024,
            event_buffer: 256,
            retry_max_retries: 3,
            retry_initial_backoff_ms: 50,
            retry_max_backoff_ms: 2_000,
        }
    }
}

/// Keys accepted in `server.toml`. Everything is optional.
#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    bind_addr: Option<String>,
    database_url: Option<String>,
    server_public_url: Option<String>,
    object_signing_secret: Option<String>,
    signed_url_ttl_seconds: Option<u64>,
    max_attachment_bytes: Option<usize>,
    max_request_bytes: Option<usize>,
    event_buffer: Option<usize>,
    retry_max_retries: Option<u32>,
    retry_initial_backoff_ms: Option<u64>,
    retry_max_backoff_ms: Option<u64>,
}

impl Settings {
    /// URL clients use to reach this server; attachment URLs are built from it.
    pub fn public_url(&self) -> String {
        let candidate = self
            .server_public_url
            .clone()
            .unwrap_or_else(|| format!("http://{}", self.server_bind));
        match Url::parse(&candidate) {
            Ok(url) => url.as_str().trim_end_matches('/').to_string(),
            Err(error) => {
                warn!(%candidate, %error, "invalid public url, falling back to bind address");
                format!("http://{}", self.server_bind)
            }
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.retry_max_retries,
            initial_backoff: Duration::from_millis(self.retry_initial_backoff_ms),
            max_backoff: Duration::from_millis(self.retry_max_backoff_ms),
            ..RetryConfig::default()
        }
    }

    pub fn api_limits(&self) -> ApiLimits {
        ApiLimits {
            max_attachment_bytes: self.max_attachment_bytes,
            signed_url_ttl: Duration::from_secs(self.signed_url_ttl_seconds),
            ..ApiLimits::default()
        }
    }

    fn apply_file(&mut self, file: FileSettings) {
        if let Some(v) = file.bind_addr {
            self.server_bind = v;
        }
        if let Some(v) = file.database_url {
            self.database_url = v;
        }
        if let Some(v) = file.server_public_url {
            self.server_public_url = Some(v);
        }
        if let Some(v) = file.object_signing_secret {
            self.object_signing_secret = v;
        }
        if let Some(v) = file.signed_url_ttl_seconds {
            self.signed_url_ttl_seconds = v;
        }
        if let Some(v) = file.max_attachment_bytes {
            self.max_attachment_bytes = v;
        }
        if let Some(v) = file.max_request_bytes {
            self.max_request_bytes = v;
        }
        if let Some(v) = file.event_buffer {
            self.event_buffer = v;
        }
        if let Some(v) = file.retry_max_retries {
            self.retry_max_retries = v;
        }
        if let Some(v) = file.retry_initial_backoff_ms {
            self.retry_initial_backoff_ms = v;
        }
        if let Some(v) = file.retry_max_backoff_ms {
            self.retry_max_backoff_ms = v;
        }
    }

    /// Later names win, so `APP__*` overrides the short aliases.
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        for key in ["SERVER_BIND", "APP__BIND_ADDR"] {
            if let Some(v) = lookup(key) {
                self.server_bind = v;
            }
        }
        for key in ["DATABASE_URL", "APP__DATABASE_URL"] {
            if let Some(v) = lookup(key) {
                self.database_url = v;
            }
        }
        for key in ["SERVER_PUBLIC_URL", "APP__SERVER_PUBLIC_URL"] {
            if let Some(v) = lookup(key) {
                self.server_public_url = Some(v);
            }
        }
        if let Some(v) = lookup("APP__OBJECT_SIGNING_SECRET") {
            self.object_signing_secret = v;
        }
        parse_into(&lookup, "APP__SIGNED_URL_TTL_SECONDS", &mut self.signed_url_ttl_seconds);
        parse_into(&lookup, "APP__MAX_ATTACHMENT_BYTES", &mut self.max_attachment_bytes);
        parse_into(&lookup, "APP__MAX_REQUEST_BYTES", &mut self.max_request_bytes);
        parse_into(&lookup, "APP__EVENT_BUFFER", &mut self.event_buffer);
        parse_into(&lookup, "APP__RETRY_MAX_RETRIES", &mut self.retry_max_retries);
        parse_into(
            &lookup,
            "APP__RETRY_INITIAL_BACKOFF_MS",
            &mut self.retry_initial_backoff_ms,
        );
        parse_into(&lookup, "APP__RETRY_MAX_BACKOFF_MS", &mut self.retry_max_backoff_ms);
    }
}

fn parse_into<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut T,
) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(parsed) => *target = parsed,
        Err(_) => warn!(key, value = %raw, "ignoring unparsable setting"),
    }
}

/// Defaults, then `server.toml` in the working directory, then the environment.
pub fn load_settings() -> Settings {
    load_settings_from(Path::new("server.toml"), |key| std::env::var(key).ok())
}

pub fn load_settings_from(
    config_path: &Path,
    lookup: impl Fn(&str) -> Option<String>,
) -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string(config_path) {
        match toml::from_str::<FileSettings>(&raw) {
            Ok(file) => settings.apply_file(file),
            Err(error) => warn!(path = %config_path.display(), %error, "ignoring invalid config file"),
        }
    }
    settings.apply_env(lookup);

    if settings.object_signing_secret == DEFAULT_SIGNING_SECRET {
        warn!("using the development object signing secret; set APP__OBJECT_SIGNING_SECRET");
    }
    settings
}

pub fn prepare_database_url(raw_database_url: &str) -> anyhow::Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    storage::ensure_sqlite_parent_dir(&database_url)?;
    Ok(database_url)
}

fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }
    if raw_database_url.starts_with("sqlite::memory:") {
        return raw_database_url.to_string();
    }

    let path = if let Some(path) = raw_database_url.strip_prefix("sqlite://") {
        path
    } else if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        path
    } else if raw_database_url.contains("://") {
        return raw_database_url.to_string();
    } else {
        raw_database_url
    };

    let path = path.replace('\\', "/");
    if is_windows_drive_path(&path) {
        format!("sqlite:{path}")
    } else {
        format!("sqlite://{path}")
    }
}

fn is_windows_drive_path(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 3 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' && bytes[2] == b'/'
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
