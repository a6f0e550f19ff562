use anyhow::{Result, bail};
use std::io::Write;
use tokio_util::sync::CancellationToken;

use super::parse_body;
use crate::http::{HttpClient, TransportError};

/// Open an event stream and print content as it arrives.
#[tracing::instrument(skip(client, data, cancel, out))]
pub async fn stream<W: Write>(
    client: &HttpClient,
    path: &str,
    data: &str,
    cancel: &CancellationToken,
    out: &mut W,
) -> Result<()> {
    let body = parse_body(Some(data))?.unwrap_or_default();
    let mut frames = client.stream(path, &body, cancel).await?;

    while let Some(frame) = frames.next_frame().await {
        write!(out, "{}", frame.content)?;
        out.flush()?;
        if let Some(error) = frame.error {
            writeln!(out)?;
            bail!("Stream failed: {}", error);
        }
        if frame.done {
            break;
        }
    }
    writeln!(out)?;

    if cancel.is_cancelled() {
        return Err(TransportError::Cancelled {
            last_response: None,
        }
        .into());
    }
    Ok(())
}
