//! Layered configuration: defaults, then the config file, then the
//! environment, then command-line flags.

use anyhow::{Context, Result, bail};
use log::debug;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::env::VarError;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::http::{
    ConnectionPoolSettings, DEFAULT_BACKOFF_FACTOR, DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY,
    DEFAULT_MAX_RETRIES, DEFAULT_REQUEST_TIMEOUT, HttpClient, RetryPolicy, StaticToken,
    build_transport,
};
use crate::runtime::Runtime;
use crate::sse::DEFAULT_STREAM_BUFFER;

pub const DEFAULT_API_URL: &str = "http://localhost:5055";

pub const ENV_CONFIG: &str = "NBCTL_CONFIG";
pub const ENV_API_URL: &str = "NBCTL_API_URL";
pub const ENV_TOKEN: &str = "NBCTL_TOKEN";
pub const ENV_MAX_RETRIES: &str = "NBCTL_MAX_RETRIES";
pub const ENV_REQUEST_TIMEOUT_SECS: &str = "NBCTL_REQUEST_TIMEOUT_SECS";

/// On-disk format of `config.json`. Every key is optional.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    api_url: Option<String>,
    token: Option<String>,
    max_retries: Option<u32>,
    base_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    backoff_factor: Option<f64>,
    request_timeout_secs: Option<u64>,
    stream_buffer: Option<usize>,
}

/// Values given on the command line; they win over every other source.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub api_url: Option<String>,
    pub max_retries: Option<u32>,
}

/// Effective configuration. Read once at startup, immutable afterwards.
#[derive(Clone)]
pub struct Config {
    pub api_url: String,
    pub token: Option<String>,
    pub retry: RetryPolicy,
    pub pool: ConnectionPoolSettings,
    pub request_timeout: Duration,
    pub stream_buffer: usize,
    /// The config file that was read, if any.
    pub file: Option<PathBuf>,
}

impl Config {
    #[tracing::instrument(skip(runtime, overrides))]
    pub fn load<R: Runtime + ?Sized>(runtime: &R, overrides: &Overrides) -> Result<Self> {
        let mut api_url = DEFAULT_API_URL.to_string();
        let mut token = None;
        let mut max_retries = DEFAULT_MAX_RETRIES;
        let mut base_delay = DEFAULT_BASE_DELAY;
        let mut max_delay = DEFAULT_MAX_DELAY;
        let mut backoff_factor = DEFAULT_BACKOFF_FACTOR;
        let mut request_timeout = DEFAULT_REQUEST_TIMEOUT;
        let mut stream_buffer = DEFAULT_STREAM_BUFFER;

        let (file, file_config) = read_file(runtime)?;
        if let Some(fc) = file_config {
            api_url = fc.api_url.unwrap_or(api_url);
            token = fc.token.or(token);
            max_retries = fc.max_retries.unwrap_or(max_retries);
            base_delay = fc.base_delay_ms.map(Duration::from_millis).unwrap_or(base_delay);
            max_delay = fc.max_delay_ms.map(Duration::from_millis).unwrap_or(max_delay);
            backoff_factor = fc.backoff_factor.unwrap_or(backoff_factor);
            request_timeout = fc
                .request_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(request_timeout);
            stream_buffer = fc.stream_buffer.unwrap_or(stream_buffer);
        }

        if let Some(v) = env_value(runtime, ENV_API_URL)? {
            api_url = v;
        }
        if let Some(v) = env_value(runtime, ENV_TOKEN)? {
            token = Some(v);
        }
        if let Some(v) = parse_env(runtime, ENV_MAX_RETRIES)? {
            max_retries = v;
        }
        if let Some(v) = parse_env(runtime, ENV_REQUEST_TIMEOUT_SECS)? {
            request_timeout = Duration::from_secs(v);
        }

        if let Some(v) = &overrides.api_url {
            api_url = v.clone();
        }
        if let Some(v) = overrides.max_retries {
            max_retries = v;
        }

        Url::parse(&api_url).with_context(|| format!("Invalid API URL: {}", api_url))?;
        let retry = RetryPolicy::new(max_retries, base_delay, max_delay, backoff_factor)
            .context("Invalid retry settings")?;
        if stream_buffer == 0 {
            bail!("Invalid stream_buffer: must be at least 1");
        }
        if request_timeout.is_zero() {
            bail!("Invalid request timeout: must be at least 1 second");
        }

        let config = Self {
            api_url,
            token,
            retry,
            pool: ConnectionPoolSettings::default(),
            request_timeout,
            stream_buffer,
            file,
        };
        debug!("Loaded configuration: {:?}", config);
        Ok(config)
    }

    /// Builds the API client described by this configuration.
    pub fn http_client(&self) -> Result<HttpClient> {
        let user_agent = format!("nbctl/{}", env!("NBCTL_VERSION"));
        let transport = build_transport(&self.pool, &user_agent)?;
        let mut client = HttpClient::new(transport, &self.api_url, self.retry.clone())?
            .with_request_timeout(self.request_timeout)
            .with_stream_buffer(self.stream_buffer);
        if let Some(token) = &self.token {
            debug!("Using NBCTL_TOKEN for authentication: {}", redact(token));
            client = client.with_credentials(Arc::new(StaticToken::bearer(token)?));
        }
        Ok(client)
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("api_url", &self.api_url)
            .field("token", &self.token.as_deref().map(redact))
            .field("retry", &self.retry)
            .field("pool", &self.pool)
            .field("request_timeout", &self.request_timeout)
            .field("stream_buffer", &self.stream_buffer)
            .field("file", &self.file)
            .finish()
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let file = self
            .file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none)".to_string());
        writeln!(f, "config file:     {}", file)?;
        writeln!(f, "api_url:         {}", self.api_url)?;
        writeln!(
            f,
            "token:           {}",
            self.token.as_deref().map(redact).unwrap_or_else(|| "(unset)".to_string())
        )?;
        writeln!(f, "max_retries:     {}", self.retry.max_retries())?;
        writeln!(f, "base_delay:      {:?}", self.retry.base_delay())?;
        writeln!(f, "max_delay:       {:?}", self.retry.max_delay())?;
        writeln!(f, "backoff_factor:  {}", self.retry.backoff_factor())?;
        writeln!(f, "request_timeout: {:?}", self.request_timeout)?;
        writeln!(f, "stream_buffer:   {}", self.stream_buffer)
    }
}

/// Location of the config file: `NBCTL_CONFIG`, else `<config_dir>/nbctl/config.json`.
pub fn config_path<R: Runtime + ?Sized>(runtime: &R) -> Result<Option<PathBuf>> {
    if let Some(path) = env_value(runtime, ENV_CONFIG)? {
        return Ok(Some(PathBuf::from(path)));
    }
    Ok(runtime
        .config_dir()
        .map(|dir| dir.join("nbctl").join("config.json")))
}

fn read_file<R: Runtime + ?Sized>(runtime: &R) -> Result<(Option<PathBuf>, Option<FileConfig>)> {
    let explicit = env_value(runtime, ENV_CONFIG)?.is_some();
    let Some(path) = config_path(runtime)? else {
        return Ok((None, None));
    };

    if !runtime.exists(&path) {
        if explicit {
            bail!("Config file {} (from {}) does not exist", path.display(), ENV_CONFIG);
        }
        debug!("No config file at {}", path.display());
        return Ok((None, None));
    }

    let content = runtime.read_to_string(&path)?;
    let parsed: FileConfig = serde_json::from_str(&content)
        .with_context(|| format!("Invalid config file {}", path.display()))?;
    Ok((Some(path), Some(parsed)))
}

/// A set, non-blank environment variable.
fn env_value<R: Runtime + ?Sized>(runtime: &R, key: &str) -> Result<Option<String>> {
    match runtime.env_var(key) {
        Ok(value) if value.trim().is_empty() => Ok(None),
        Ok(value) => Ok(Some(value)),
        Err(VarError::NotPresent) => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Invalid {}", key)),
    }
}

fn parse_env<R, T>(runtime: &R, key: &str) -> Result<Option<T>>
where
    R: Runtime + ?Sized,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    env_value(runtime, key)?
        .map(|v| {
            v.trim()
                .parse()
                .with_context(|| format!("Invalid {}: {:?}", key, v))
        })
        .transpose()
}

fn redact(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() <= 8 {
        return "*********".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}*********{}", head, tail)
}
