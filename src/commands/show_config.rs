use anyhow::Result;
use std::io::Write;

use crate::config::Config;

/// Print the effective configuration with the token redacted.
pub fn show_config<W: Write>(config: &Config, out: &mut W) -> Result<()> {
    write!(out, "{}", config)?;
    Ok(())
}
