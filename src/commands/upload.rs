use anyhow::Result;
use log::info;
use reqwest::multipart::{Form, Part};
use std::io::Write;
use std::path::Path;
use tokio_util::sync::CancellationToken;

use super::write_body;
use crate::http::HttpClient;
use crate::runtime::Runtime;

/// Parses a `name=value` form field.
pub fn parse_field(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
        _ => Err(format!("expected NAME=VALUE, got '{}'", s)),
    }
}

/// Upload a file as multipart form data. Never retried.
#[allow(clippy::too_many_arguments)]
#[tracing::instrument(skip(runtime, client, fields, cancel, out))]
pub async fn upload<R: Runtime + ?Sized, W: Write>(
    runtime: &R,
    client: &HttpClient,
    path: &str,
    file: &Path,
    file_field: &str,
    fields: &[(String, String)],
    cancel: &CancellationToken,
    out: &mut W,
) -> Result<()> {
    let bytes = runtime.read(file)?;
    let file_name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload".to_string());
    info!("Uploading {} ({} bytes) to {}", file_name, bytes.len(), path);

    let mut form = Form::new().part(
        file_field.to_string(),
        Part::bytes(bytes).file_name(file_name),
    );
    for (name, value) in fields {
        form = form.text(name.clone(), value.clone());
    }

    let response = client.upload(path, form, cancel).await?;
    write_body(out, &response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{ConnectionPoolSettings, RetryPolicy, build_transport};
    use crate::runtime::MockRuntime;
    use mockito::Matcher;
    use mockall::predicate::eq;
    use std::path::PathBuf;

    #[test]
    fn test_parse_field() {
        assert_eq!(
            parse_field("notebook_id=nb1").unwrap(),
            ("notebook_id".to_string(), "nb1".to_string())
        );
        assert_eq!(
            parse_field("title=a=b").unwrap(),
            ("title".to_string(), "a=b".to_string())
        );
        assert!(parse_field("novalue").is_err());
        assert!(parse_field("=x").is_err());
    }

    #[tokio::test]
    async fn test_upload_sends_file_and_fields() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/sources")
            .match_body(Matcher::AllOf(vec![
                Matcher::Regex(r#"name="file"; filename="paper.txt""#.to_string()),
                Matcher::Regex("hello paper".to_string()),
                Matcher::Regex(r#"name="notebook_id""#.to_string()),
            ]))
            .with_status(201)
            .with_body(r#"{"id":"src1"}"#)
            .expect(1)
            .create_async()
            .await;

        let mut runtime = MockRuntime::new();
        runtime
            .expect_read()
            .with(eq(PathBuf::from("/tmp/paper.txt")))
            .returning(|_| Ok(b"hello paper".to_vec()));

        let transport = build_transport(&ConnectionPoolSettings::default(), "nbctl-test").unwrap();
        let client = HttpClient::new(transport, &server.url(), RetryPolicy::default()).unwrap();

        let mut out = Vec::new();
        upload(
            &runtime,
            &client,
            "/api/sources",
            Path::new("/tmp/paper.txt"),
            "file",
            &[("notebook_id".to_string(), "nb1".to_string())],
            &CancellationToken::new(),
            &mut out,
        )
        .await
        .unwrap();

        mock.assert_async().await;
        assert!(String::from_utf8(out).unwrap().contains("src1"));
    }
}
