use anyhow::Result;
use log::debug;
use std::io::Write;
use tokio_util::sync::CancellationToken;

use super::{parse_body, parse_method, write_body};
use crate::http::HttpClient;

/// Send one request through the retrying client and print the response body.
#[tracing::instrument(skip(client, data, cancel, out))]
pub async fn request<W: Write>(
    client: &HttpClient,
    method: &str,
    path: &str,
    data: Option<&str>,
    include_headers: bool,
    cancel: &CancellationToken,
    out: &mut W,
) -> Result<()> {
    let method = parse_method(method)?;
    let body = parse_body(data)?;
    debug!("{} {} (body: {})", method, path, body.is_some());

    let response = client.request(method, path, body.as_ref(), cancel).await?;

    if include_headers {
        writeln!(out, "HTTP {}", response.status)?;
        for (name, value) in response.headers.iter() {
            writeln!(out, "{}: {}", name, value.to_str().unwrap_or("<binary>"))?;
        }
        writeln!(out)?;
    }

    let response = HttpClient::check_status(response)?;
    write_body(out, &response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{ApiError, ConnectionPoolSettings, RetryPolicy, build_transport};
    use mockito::Matcher;
    use std::time::Duration;

    fn client(url: &str) -> HttpClient {
        let transport = build_transport(&ConnectionPoolSettings::default(), "nbctl-test").unwrap();
        let policy =
            RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(2), 2.0).unwrap();
        HttpClient::new(transport, url, policy).unwrap()
    }

    #[tokio::test]
    async fn test_request_prints_json() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("PUT", "/api/notes/n1")
            .match_body(Matcher::Json(serde_json::json!({"title": "t"})))
            .with_status(200)
            .with_header("x-trace", "1")
            .with_body(r#"{"id":"n1"}"#)
            .create_async()
            .await;

        let mut out = Vec::new();
        request(
            &client(&server.url()),
            "put",
            "/api/notes/n1",
            Some(r#"{"title": "t"}"#),
            true,
            &CancellationToken::new(),
            &mut out,
        )
        .await
        .unwrap();

        mock.assert_async().await;
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP 200 OK\n"));
        assert!(text.contains("x-trace: 1\n"));
        assert!(text.ends_with("{\n  \"id\": \"n1\"\n}\n"));
    }

    #[tokio::test]
    async fn test_request_error_status() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/api/notebooks/x")
            .with_status(403)
            .create_async()
            .await;

        let mut out = Vec::new();
        let err = request(
            &client(&server.url()),
            "GET",
            "/api/notebooks/x",
            None,
            false,
            &CancellationToken::new(),
            &mut out,
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<ApiError>(),
            Some(ApiError::Forbidden(_))
        ));
        assert!(out.is_empty());
    }
}
