//! HTTP client that routes every replayable call through the retry executor.

use anyhow::{Context, Result};
use futures_util::StreamExt;
use log::debug;
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap};
use reqwest::multipart::Form;
use reqwest::{Client, Method, RequestBuilder, StatusCode, Url};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::auth::{Anonymous, CredentialProvider};
use super::error::{ApiError, TransportError};
use super::policy::RetryPolicy;
use super::pool::Transport;
use super::retry::execute;
use crate::sse::{DEFAULT_STREAM_BUFFER, FrameStream};

/// Default whole-call timeout for non-streaming requests.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// A fully read, non-streaming response.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: StatusCode, headers: HeaderMap, body: Vec<u8>) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// All values of header `name`, in received order.
    pub fn header_values(&self, name: &str) -> Vec<String> {
        self.headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok().map(str::to_string))
            .collect()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).context("Failed to parse JSON response")
    }
}

/// HTTP client bound to one API base URL.
#[derive(Clone)]
pub struct HttpClient {
    transport: Transport,
    base_url: Url,
    policy: Arc<RetryPolicy>,
    credentials: Arc<dyn CredentialProvider>,
    request_timeout: Duration,
    stream_buffer: usize,
}

impl HttpClient {
    /// Creates a client for `base_url` using the given transport and policy.
    pub fn new(transport: Transport, base_url: &str, policy: RetryPolicy) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .with_context(|| format!("Invalid API URL: {}", base_url))?;

        Ok(Self {
            transport,
            base_url,
            policy: Arc::new(policy),
            credentials: Arc::new(Anonymous),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            stream_buffer: DEFAULT_STREAM_BUFFER,
        })
    }

    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_stream_buffer(mut self, capacity: usize) -> Self {
        self.stream_buffer = capacity;
        self
    }

    /// Returns a reference to the underlying reqwest Client.
    pub fn inner(&self) -> &Client {
        self.transport.client()
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Resolves `path` below the base URL, keeping any base path prefix.
    pub fn url(&self, path: &str) -> Result<Url> {
        let joined = format!(
            "{}/{}",
            self.base_url.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        Url::parse(&joined).with_context(|| format!("Invalid request path: {}", path))
    }

    /// Sends a replayable request with retries and returns the raw response.
    ///
    /// Any status is returned as-is once retries are settled; use
    /// [`HttpClient::check_status`] to turn failures into [`ApiError`]s.
    #[tracing::instrument(skip(self, body, cancel))]
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        cancel: &CancellationToken,
    ) -> Result<Response> {
        let url = self.url(path)?;
        let operation_name = format!("{} {}", method, path);
        debug!("{} {}...", method, url);

        execute(&operation_name, &self.policy, cancel, || {
            self.send_once(method.clone(), url.clone(), body)
        })
        .await
    }

    /// One attempt: waits for a connection slot, sends, and reads the whole body.
    async fn send_once(&self, method: Method, url: Url, body: Option<&Value>) -> Result<Response> {
        let _permit = self.transport.acquire(&url).await;

        let mut request = self
            .inner()
            .request(method, url)
            .timeout(self.request_timeout);
        if let Some(body) = body {
            request = request.json(body);
        }
        let request = self.authorize(request).await?;

        let response = request.send().await.context("Failed to send request")?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .context("Failed to read response body")?
            .to_vec();

        Ok(Response::new(status, headers, body))
    }

    async fn authorize(&self, request: RequestBuilder) -> Result<RequestBuilder> {
        let credentials = self
            .credentials
            .authorization()
            .await
            .context("Failed to obtain credentials")?;
        Ok(match credentials {
            Some(value) => request.header(AUTHORIZATION, value),
            None => request,
        })
    }

    /// Passes 2xx responses through and turns anything else into an [`ApiError`].
    pub fn check_status(response: Response) -> Result<Response> {
        if response.is_success() {
            Ok(response)
        } else {
            Err(ApiError::from_status(response.status, &response.body).into())
        }
    }

    /// Performs a GET request and deserializes the JSON response.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<T> {
        let response = self.request(Method::GET, path, None, cancel).await?;
        Self::check_status(response)?.json()
    }

    /// Sends a JSON body and deserializes the JSON response.
    #[tracing::instrument(skip(self, body, cancel))]
    pub async fn send_json<B, T>(
        &self,
        method: Method,
        path: &str,
        body: &B,
        cancel: &CancellationToken,
    ) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let body = serde_json::to_value(body).context("Failed to serialize request body")?;
        let response = self.request(method, path, Some(&body), cancel).await?;
        Self::check_status(response)?.json()
    }

    /// Sends a DELETE and checks the status; the body is ignored.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn delete(&self, path: &str, cancel: &CancellationToken) -> Result<()> {
        let response = self.request(Method::DELETE, path, None, cancel).await?;
        Self::check_status(response)?;
        Ok(())
    }

    /// Uploads a multipart form in a single attempt.
    ///
    /// Multipart bodies cannot be replayed, so this never retries.
    #[tracing::instrument(skip(self, form, cancel))]
    pub async fn upload(
        &self,
        path: &str,
        form: Form,
        cancel: &CancellationToken,
    ) -> Result<Response> {
        let url = self.url(path)?;
        debug!("POST multipart {}...", url);

        let send = async {
            let _permit = self.transport.acquire(&url).await;
            let request = self
                .inner()
                .post(url.clone())
                .timeout(self.request_timeout)
                .multipart(form);
            let request = self.authorize(request).await?;
            let response = request.send().await.context("Failed to send upload")?;
            let status = response.status();
            let headers = response.headers().clone();
            let body = response
                .bytes()
                .await
                .context("Failed to read response body")?
                .to_vec();
            Ok::<_, anyhow::Error>(Response::new(status, headers, body))
        };

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(TransportError::Cancelled { last_response: None }.into());
            }
            response = send => response?,
        };
        Self::check_status(response)
    }

    /// Opens a Server-Sent-Events stream in a single attempt.
    ///
    /// The returned stream stops when `cancel` fires or when it is dropped.
    #[tracing::instrument(skip(self, body, cancel))]
    pub async fn stream(
        &self,
        path: &str,
        body: &Value,
        cancel: &CancellationToken,
    ) -> Result<FrameStream> {
        let url = self.url(path)?;
        debug!("Opening event stream {}...", url);

        let open = async {
            let permit = self.transport.acquire(&url).await;
            let request = self
                .inner()
                .post(url.clone())
                .header(ACCEPT, "text/event-stream")
                .json(body);
            let request = self.authorize(request).await?;
            let response = request
                .send()
                .await
                .context("Failed to open event stream")?;
            Ok::<_, anyhow::Error>((response, permit))
        };

        let (response, permit) = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(TransportError::Cancelled { last_response: None }.into());
            }
            opened = open => opened?,
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.bytes().await.map(|b| b.to_vec()).unwrap_or_default();
            return Err(ApiError::from_status(status, &body).into());
        }

        // The per-host slot stays taken until the reader drops the body stream.
        let source = response.bytes_stream().map(move |chunk| {
            let _slot = &permit;
            chunk
        });

        Ok(FrameStream::spawn(
            source,
            self.stream_buffer,
            cancel.child_token(),
        ))
    }
}
