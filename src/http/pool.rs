//! Connection pool configuration for the shared HTTP transport.
//!
//! Built once at startup; nothing here can be reconfigured afterwards, so
//! concurrent requests never race on pool limits.

use anyhow::{Context, Result};
use log::debug;
use reqwest::{Client, Url, tls};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Default cap on idle connections across all hosts.
pub const DEFAULT_MAX_IDLE_TOTAL: usize = 100;

/// Default cap on idle connections kept per host.
pub const DEFAULT_MAX_IDLE_PER_HOST: usize = 10;

/// Default cap on concurrent connections per host.
pub const DEFAULT_MAX_CONNS_PER_HOST: usize = 50;

/// Default time an idle connection is kept.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Default TCP connect timeout.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Default TCP keep-alive interval.
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(30);

/// Pool limits and socket timeouts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionPoolSettings {
    pub max_idle_total: usize,
    pub max_idle_per_host: usize,
    /// Zero means unlimited.
    pub max_conns_per_host: usize,
    pub idle_timeout: Duration,
    pub dial_timeout: Duration,
    pub keep_alive: Duration,
}

impl Default for ConnectionPoolSettings {
    fn default() -> Self {
        Self {
            max_idle_total: DEFAULT_MAX_IDLE_TOTAL,
            max_idle_per_host: DEFAULT_MAX_IDLE_PER_HOST,
            max_conns_per_host: DEFAULT_MAX_CONNS_PER_HOST,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            keep_alive: DEFAULT_KEEP_ALIVE,
        }
    }
}

impl ConnectionPoolSettings {
    /// Idle connections reqwest may keep per host.
    ///
    /// reqwest only knows a per-host idle cap, so the global cap bounds it too.
    pub fn effective_idle_per_host(&self) -> usize {
        self.max_idle_per_host.min(self.max_idle_total)
    }
}

/// A pooled client plus the per-host connection limiter that fronts it.
#[derive(Clone)]
pub struct Transport {
    client: Client,
    limiter: Arc<HostLimiter>,
    settings: Arc<ConnectionPoolSettings>,
}

impl Transport {
    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn settings(&self) -> &ConnectionPoolSettings {
        &self.settings
    }

    /// Waits for a free connection slot towards `url`'s host.
    pub async fn acquire(&self, url: &Url) -> Option<OwnedSemaphorePermit> {
        self.limiter.acquire(url).await
    }
}

/// Builds the shared transport: TLS 1.2 minimum, HTTP/2 negotiated via ALPN
/// when the server offers it, capped idle pool and explicit timeouts.
#[tracing::instrument(skip(settings))]
pub fn build_transport(settings: &ConnectionPoolSettings, user_agent: &str) -> Result<Transport> {
    debug!("Building HTTP transport with {:?}", settings);

    let client = Client::builder()
        .user_agent(user_agent)
        .min_tls_version(tls::Version::TLS_1_2)
        .pool_max_idle_per_host(settings.effective_idle_per_host())
        .pool_idle_timeout(settings.idle_timeout)
        .connect_timeout(settings.dial_timeout)
        .tcp_keepalive(settings.keep_alive)
        .http2_keep_alive_interval(settings.keep_alive)
        .build()
        .context("Failed to build HTTP client")?;

    Ok(Transport {
        client,
        limiter: Arc::new(HostLimiter::new(settings.max_conns_per_host)),
        settings: Arc::new(settings.clone()),
    })
}

/// Caps concurrent connections per `host:port`.
pub struct HostLimiter {
    per_host: usize,
    hosts: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl HostLimiter {
    pub fn new(per_host: usize) -> Self {
        Self {
            per_host,
            hosts: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `None` when the limiter is disabled (`per_host == 0`).
    pub async fn acquire(&self, url: &Url) -> Option<OwnedSemaphorePermit> {
        if self.per_host == 0 {
            return None;
        }
        let semaphore = {
            let mut hosts = self.hosts.lock().unwrap_or_else(|e| e.into_inner());
            hosts
                .entry(host_key(url))
                .or_insert_with(|| Arc::new(Semaphore::new(self.per_host)))
                .clone()
        };
        // The semaphore is never closed, so acquisition cannot fail.
        semaphore.acquire_owned().await.ok()
    }

    /// Free slots left for `url`'s host.
    pub fn available(&self, url: &Url) -> usize {
        let hosts = self.hosts.lock().unwrap_or_else(|e| e.into_inner());
        hosts
            .get(&host_key(url))
            .map(|s| s.available_permits())
            .unwrap_or(self.per_host)
    }
}

fn host_key(url: &Url) -> String {
    format!(
        "{}:{}",
        url.host_str().unwrap_or_default(),
        url.port_or_known_default().unwrap_or_default()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let s = ConnectionPoolSettings::default();
        assert_eq!(s.max_idle_total, 100);
        assert_eq!(s.max_idle_per_host, 10);
        assert_eq!(s.max_conns_per_host, 50);
        assert_eq!(s.idle_timeout, Duration::from_secs(90));
        assert_eq!(s.dial_timeout, Duration::from_secs(10));
        assert_eq!(s.keep_alive, Duration::from_secs(30));
    }

    #[test]
    fn test_effective_idle_per_host_respects_total() {
        let s = ConnectionPoolSettings {
            max_idle_total: 4,
            ..Default::default()
        };
        assert_eq!(s.effective_idle_per_host(), 4);
        assert_eq!(ConnectionPoolSettings::default().effective_idle_per_host(), 10);
    }

    #[test]
    fn test_build_transport() {
        let transport = build_transport(&ConnectionPoolSettings::default(), "nbctl-test").unwrap();
        assert_eq!(transport.settings(), &ConnectionPoolSettings::default());
    }

    #[tokio::test]
    async fn test_host_limiter_caps_per_host() {
        let limiter = HostLimiter::new(2);
        let a = Url::parse("http://notes.local:5055/api/a").unwrap();
        let b = Url::parse("http://other.local/api").unwrap();

        let p1 = limiter.acquire(&a).await;
        let p2 = limiter.acquire(&a).await;
        assert!(p1.is_some() && p2.is_some());
        assert_eq!(limiter.available(&a), 0);
        // Another host has its own budget.
        assert_eq!(limiter.available(&b), 2);

        let third = tokio::time::timeout(Duration::from_millis(20), limiter.acquire(&a)).await;
        assert!(third.is_err(), "third acquire should wait");

        drop(p1);
        let third = tokio::time::timeout(Duration::from_millis(200), limiter.acquire(&a)).await;
        assert!(third.is_ok());
    }

    #[tokio::test]
    async fn test_host_limiter_disabled() {
        let limiter = HostLimiter::new(0);
        let url = Url::parse("https://notes.local/").unwrap();
        assert!(limiter.acquire(&url).await.is_none());
    }
}
