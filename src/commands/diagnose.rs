use anyhow::{Result, bail};
use std::io::Write;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::degrade::{FallbackMode, message};
use crate::diagnostics;

/// Probe the API server (or `target`) and print the report.
///
/// Fails when any probe failed, after printing the report.
#[tracing::instrument(skip(config, cancel, out))]
pub async fn diagnose<W: Write>(
    config: &Config,
    target: Option<&str>,
    cancel: &CancellationToken,
    out: &mut W,
) -> Result<()> {
    let target = target.unwrap_or(&config.api_url);
    let client = config.http_client()?;
    let report = diagnostics::diagnose(client.inner(), target, cancel).await?;

    write!(out, "{}", report)?;
    let mode = report.fallback();
    if mode != FallbackMode::None {
        writeln!(out, "{}", message(mode))?;
    }

    if !report.all_ok() {
        bail!("Connectivity check failed for {}", report.target);
    }
    Ok(())
}
