//! Command implementations behind the CLI.

use anyhow::{Context, Result};
use reqwest::Method;
use serde_json::Value;
use std::io::Write;

use crate::http::Response;

mod diagnose;
mod request;
mod show_config;
mod stream;
mod upload;

pub use diagnose::diagnose;
pub use request::request;
pub use show_config::show_config;
pub use stream::stream;
pub use upload::{parse_field, upload};

/// Parses an HTTP method name, case-insensitively.
pub fn parse_method(method: &str) -> Result<Method> {
    Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .with_context(|| format!("Invalid HTTP method: {}", method))
}

/// Parses an optional JSON request body given on the command line.
pub fn parse_body(data: Option<&str>) -> Result<Option<Value>> {
    data.map(|d| serde_json::from_str(d).with_context(|| format!("Invalid JSON body: {}", d)))
        .transpose()
}

/// Writes a response body, pretty-printing it when it is JSON.
fn write_body<W: Write>(out: &mut W, response: &Response) -> Result<()> {
    match serde_json::from_slice::<Value>(&response.body) {
        Ok(json) => {
            serde_json::to_writer_pretty(&mut *out, &json)?;
            writeln!(out)?;
        }
        Err(_) => {
            out.write_all(&response.body)?;
            if !response.body.is_empty() && !response.body.ends_with(b"\n") {
                writeln!(out)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;
    use reqwest::header::HeaderMap;

    #[test]
    fn test_parse_method() {
        assert_eq!(parse_method("get").unwrap(), Method::GET);
        assert_eq!(parse_method("PATCH").unwrap(), Method::PATCH);
        assert!(parse_method("not a method").is_err());
    }

    #[test]
    fn test_parse_body() {
        assert_eq!(parse_body(None).unwrap(), None);
        assert_eq!(
            parse_body(Some(r#"{"a": 1}"#)).unwrap(),
            Some(serde_json::json!({"a": 1}))
        );
        assert!(parse_body(Some("{oops")).is_err());
    }

    #[test]
    fn test_write_body() {
        let mut out = Vec::new();
        let json = Response::new(StatusCode::OK, HeaderMap::new(), br#"{"id":"nb1"}"#.to_vec());
        write_body(&mut out, &json).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "{\n  \"id\": \"nb1\"\n}\n");

        let mut out = Vec::new();
        let text = Response::new(StatusCode::OK, HeaderMap::new(), b"pong".to_vec());
        write_body(&mut out, &text).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "pong\n");
    }
}
