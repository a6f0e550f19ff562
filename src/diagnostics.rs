//! On-demand connectivity probes used to explain failures.
//!
//! Nothing here sits on the request path: `diagnose` is called by the
//! `diagnose` command and only reports what it observed.

use anyhow::{Context, Result, anyhow, bail};
use log::debug;
use reqwest::{Client, Url};
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::{TcpStream, lookup_host};
use tokio_util::sync::CancellationToken;

use crate::degrade::{FallbackMode, evaluate};
use crate::http::{ApiError, ErrorKind, classify_anyhow};

/// Upper bound for each individual probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome of one probe.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResult {
    pub name: &'static str,
    pub success: bool,
    pub duration: Duration,
    pub detail: Option<String>,
    pub error: Option<String>,
    /// Classification of the failure, if any.
    pub kind: Option<ErrorKind>,
}

impl ProbeResult {
    fn ok(name: &'static str, duration: Duration, detail: String) -> Self {
        Self {
            name,
            success: true,
            duration,
            detail: Some(detail),
            error: None,
            kind: None,
        }
    }

    fn failed(name: &'static str, duration: Duration, err: &anyhow::Error) -> Self {
        Self {
            name,
            success: false,
            duration,
            detail: None,
            error: Some(format!("{:#}", err)),
            kind: Some(classify_anyhow(err)),
        }
    }

    fn skipped(name: &'static str, reason: &str) -> Self {
        Self {
            name,
            success: false,
            duration: Duration::ZERO,
            detail: None,
            error: Some(format!("skipped: {}", reason)),
            kind: None,
        }
    }
}

/// Results of the DNS, TCP and HTTP probes against one target.
#[derive(Debug, Clone)]
pub struct DiagnosticReport {
    pub target: Url,
    pub dns: ProbeResult,
    pub tcp: ProbeResult,
    pub http: ProbeResult,
}

impl DiagnosticReport {
    pub fn probes(&self) -> [&ProbeResult; 3] {
        [&self.dns, &self.tcp, &self.http]
    }

    pub fn all_ok(&self) -> bool {
        self.probes().iter().all(|p| p.success)
    }

    /// Degradation hint from the first failing probe that has a classification.
    pub fn fallback(&self) -> FallbackMode {
        self.probes()
            .iter()
            .find_map(|p| p.kind)
            .map(evaluate)
            .unwrap_or_default()
    }
}

impl fmt::Display for DiagnosticReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Diagnostics for {}", self.target)?;
        for probe in self.probes() {
            let status = if probe.success { "ok" } else { "FAIL" };
            let info = probe
                .detail
                .as_deref()
                .or(probe.error.as_deref())
                .unwrap_or_default();
            writeln!(
                f,
                "  {:<5} {:<5} {:>10.1?}  {}",
                probe.name, status, probe.duration, info
            )?;
        }
        let mode = self.fallback();
        if mode != FallbackMode::None {
            writeln!(f, "Suggested mode: {}", mode)?;
        }
        Ok(())
    }
}

/// Probes `target` with the default per-probe timeout.
pub async fn diagnose(
    client: &Client,
    target: &str,
    cancel: &CancellationToken,
) -> Result<DiagnosticReport> {
    diagnose_with_timeout(client, target, DEFAULT_PROBE_TIMEOUT, cancel).await
}

/// Resolves the host, dials the first address, and runs an HTTP GET.
///
/// DNS and TCP run in sequence; the HTTP probe runs alongside them. Only an
/// unusable target URL is an error; probe failures are recorded in the report.
#[tracing::instrument(skip(client, cancel))]
pub async fn diagnose_with_timeout(
    client: &Client,
    target: &str,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<DiagnosticReport> {
    let url = Url::parse(target).with_context(|| format!("Invalid target URL: {}", target))?;
    let Some(host) = url.host_str() else {
        bail!("Target URL has no host: {}", target);
    };
    let host = host.trim_start_matches('[').trim_end_matches(']').to_string();
    let Some(port) = url.port_or_known_default() else {
        bail!("Target URL has no port: {}", target);
    };

    let dns_then_tcp = async {
        let (dns, addr) = probe("dns", timeout, cancel, resolve(&host, port)).await;
        let tcp = match addr {
            Some(addr) => probe("tcp", timeout, cancel, connect(addr)).await.0,
            None => ProbeResult::skipped("tcp", "DNS resolution failed"),
        };
        (dns, tcp)
    };
    let http = async { probe("http", timeout, cancel, get(client, url.clone())).await.0 };

    let ((dns, tcp), http) = tokio::join!(dns_then_tcp, http);

    Ok(DiagnosticReport {
        target: url,
        dns,
        tcp,
        http,
    })
}

/// Times `fut`, bounded by `timeout` and `cancel`.
async fn probe<T, Fut>(
    name: &'static str,
    timeout: Duration,
    cancel: &CancellationToken,
    fut: Fut,
) -> (ProbeResult, Option<T>)
where
    Fut: Future<Output = Result<(String, T)>>,
{
    let start = Instant::now();
    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(anyhow!("cancelled")),
        result = tokio::time::timeout(timeout, fut) => match result {
            Ok(result) => result,
            Err(_) => Err(anyhow!("probe timeout after {:?}", timeout)),
        },
    };
    let duration = start.elapsed();

    match outcome {
        Ok((detail, value)) => {
            debug!("{} probe ok in {:?}: {}", name, duration, detail);
            (ProbeResult::ok(name, duration, detail), Some(value))
        }
        Err(e) => {
            debug!("{} probe failed in {:?}: {:#}", name, duration, e);
            (ProbeResult::failed(name, duration, &e), None)
        }
    }
}

async fn resolve(host: &str, port: u16) -> Result<(String, SocketAddr)> {
    let addrs: Vec<SocketAddr> = lookup_host((host, port))
        .await
        .with_context(|| format!("name resolution failed for {}", host))?
        .collect();
    let Some(first) = addrs.first().copied() else {
        bail!("no such host: {}", host);
    };
    let listed: Vec<String> = addrs.iter().map(|a| a.ip().to_string()).collect();
    Ok((listed.join(", "), first))
}

async fn connect(addr: SocketAddr) -> Result<(String, ())> {
    TcpStream::connect(addr)
        .await
        .with_context(|| format!("TCP connect to {} failed", addr))?;
    Ok((format!("connected to {}", addr), ()))
}

async fn get(client: &Client, url: Url) -> Result<(String, ())> {
    let response = client
        .get(url)
        .send()
        .await
        .context("HTTP request failed")?;
    let status = response.status();
    if status.is_server_error() {
        let body = response.bytes().await.map(|b| b.to_vec()).unwrap_or_default();
        return Err(ApiError::from_status(status, &body).into());
    }
    Ok((format!("HTTP {}", status.as_u16()), ()))
}
