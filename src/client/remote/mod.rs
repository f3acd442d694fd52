//! HTTP implementation of the client facade
//!
//! Speaks the server's REST v1/v2 API. Every request carries the configured
//! credentials; non-success statuses are mapped to `TransientNetwork` or
//! `Rejected` so the sync engine can tell retryable failures apart.

use crate::core::config::ServerConfig;
use crate::core::error::{is_transient_status, ErrorContext, ReplicaError, Result};
use reqwest::{Client, Method, RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

mod book;
mod library;
mod lists;
mod series;
pub(crate) mod sse;
mod user;

/// How requests authenticate against the server
#[derive(Clone)]
pub enum Credentials {
    Basic { username: String, password: String },
    ApiKey(String),
    Anonymous,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::Basic { username, .. } => write!(f, "Basic({username})"),
            Credentials::ApiKey(_) => write!(f, "ApiKey(***)"),
            Credentials::Anonymous => write!(f, "Anonymous"),
        }
    }
}

/// Network client for one server
#[derive(Clone)]
pub struct RemoteClient {
    http: Client,
    base: Url,
    credentials: Credentials,
    request_timeout: Duration,
}

impl RemoteClient {
    pub fn new(config: &ServerConfig, credentials: Credentials) -> Result<Self> {
        let base = Url::parse(&config.base_url).context("Invalid server base_url")?;
        // no client-wide timeout: it would also cut streamed bodies
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout))
            .user_agent(concat!("shelf-replica/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ReplicaError::Config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base,
            credentials,
            request_timeout: Duration::from_secs(config.request_timeout),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// Absolute URL for a list of path segments below the base URL.
    /// Segments are percent-encoded individually.
    pub(crate) fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| ReplicaError::Validation(format!("Base URL cannot have a path: {}", self.base)))?;
            path.pop_if_empty();
            for segment in segments {
                path.push(segment);
            }
        }
        Ok(url)
    }

    /// Request whose whole exchange, body included, must finish within
    /// `request_timeout`
    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.authorized(method, url).timeout(self.request_timeout)
    }

    fn authorized(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.http.request(method, url);
        match &self.credentials {
            Credentials::Basic { username, password } => builder.basic_auth(username, Some(password)),
            Credentials::ApiKey(key) => builder.header("X-API-Key", key),
            Credentials::Anonymous => builder,
        }
    }

    /// Send a request and turn a non-success status into an error
    async fn send(&self, builder: RequestBuilder) -> Result<Response> {
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let url = response.url().clone();
        let body = response.text().await.unwrap_or_default();
        let message = if body.is_empty() {
            format!("{} {}", status, url.path())
        } else {
            format!("{} {}: {}", status, url.path(), truncate(&body, 200))
        };

        let code = status.as_u16();
        if is_transient_status(code) {
            Err(ReplicaError::TransientNetwork(message))
        } else if code == 404 {
            Err(ReplicaError::NotFound(message))
        } else {
            Err(ReplicaError::Rejected { status: code, message })
        }
    }

    pub(crate) async fn get_json<T: DeserializeOwned>(&self, segments: &[&str], query: &[(&str, String)]) -> Result<T> {
        let url = self.url(segments)?;
        tracing::trace!(url = %url, "GET");
        let response = self.send(self.request(Method::GET, url).query(query)).await?;
        Ok(response.json::<T>().await?)
    }

    pub(crate) async fn get_bytes(&self, segments: &[&str]) -> Result<bytes::Bytes> {
        let url = self.url(segments)?;
        let response = self.send(self.request(Method::GET, url)).await?;
        Ok(response.bytes().await?)
    }

    /// GET that maps 404 to `None`
    pub(crate) async fn get_optional<T: DeserializeOwned>(&self, segments: &[&str]) -> Result<Option<T>> {
        match self.get_json(segments, &[]).await {
            Ok(value) => Ok(Some(value)),
            Err(ReplicaError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub(crate) async fn send_json<B: Serialize + ?Sized>(
        &self,
        method: Method,
        segments: &[&str],
        body: Option<&B>,
    ) -> Result<Response> {
        let url = self.url(segments)?;
        tracing::debug!(method = %method, url = %url, "Sending request");
        let mut builder = self.request(method, url);
        if let Some(body) = body {
            builder = builder.json(body);
        }
        self.send(builder).await
    }

    pub(crate) async fn send_empty(&self, method: Method, segments: &[&str], query: &[(&str, String)]) -> Result<()> {
        let url = self.url(segments)?;
        tracing::debug!(method = %method, url = %url, "Sending request");
        self.send(self.request(method, url).query(query)).await?;
        Ok(())
    }

    pub(crate) async fn send_for<B, T>(&self, method: Method, segments: &[&str], body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = self.send_json(method, segments, Some(body)).await?;
        Ok(response.json::<T>().await?)
    }

    /// Open a streamed GET, used for book files and the event stream. The
    /// body may outlive `request_timeout`; callers bound the open themselves.
    pub(crate) async fn open_stream(&self, segments: &[&str], accept: &str) -> Result<Response> {
        let url = self.url(segments)?;
        let builder = self.authorized(Method::GET, url).header(reqwest::header::ACCEPT, accept);
        self.send(builder).await
    }
}

/// Query pairs for a page request
pub(crate) fn page_query(page: crate::db::models::PageRequest) -> Vec<(&'static str, String)> {
    vec![("page", page.page.to_string()), ("size", page.size.to_string())]
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::client::BookFileSource;
    use futures::StreamExt;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn client(base: &str) -> RemoteClient {
        let config = ServerConfig {
            base_url: base.to_string(),
            request_timeout: 5,
            connect_timeout: 5,
        };
        RemoteClient::new(&config, Credentials::Anonymous).unwrap()
    }

    /// One-shot HTTP server: waits `head_delay` before the headers, then
    /// sends `body` one byte every `byte_delay`
    async fn slow_server(head_delay: Duration, body: &'static [u8], byte_delay: Duration) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 1024];
            let _ = socket.read(&mut request).await;
            tokio::time::sleep(head_delay).await;
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n",
                body.len()
            );
            if socket.write_all(head.as_bytes()).await.is_err() {
                return;
            }
            for byte in body {
                tokio::time::sleep(byte_delay).await;
                if socket.write_all(&[*byte]).await.is_err() {
                    return;
                }
                let _ = socket.flush().await;
            }
        });
        format!("http://{addr}")
    }

    fn short_timeout(base: &str) -> RemoteClient {
        let config = ServerConfig {
            base_url: base.to_string(),
            request_timeout: 1,
            connect_timeout: 1,
        };
        RemoteClient::new(&config, Credentials::Anonymous).unwrap()
    }

    #[tokio::test]
    async fn test_book_file_stream_outlives_request_timeout() {
        let base = slow_server(Duration::ZERO, b"1234", Duration::from_millis(450)).await;
        let remote = short_timeout(&base);

        let mut file = remote.open_book_file("b1").await.unwrap();
        assert_eq!(file.content_length, Some(4));
        let mut received = Vec::new();
        while let Some(chunk) = file.body.next().await {
            received.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(received, b"1234");
    }

    #[tokio::test]
    async fn test_json_call_bounded_by_request_timeout() {
        let base = slow_server(Duration::from_millis(1500), b"{}", Duration::ZERO).await;
        let remote = short_timeout(&base);

        let result = remote.get_json::<serde_json::Value>(&["api", "v1", "libraries"], &[]).await;
        assert!(matches!(result, Err(ReplicaError::TransientNetwork(_))));
    }

    #[test]
    fn test_url_building_encodes_segments() {
        let remote = client("https://media.example.org/komga/");
        let url = remote.url(&["api", "v1", "books", "a b/c"]).unwrap();
        assert_eq!(url.as_str(), "https://media.example.org/komga/api/v1/books/a%20b%2Fc");

        let remote = client("http://localhost:25600");
        let url = remote.url(&["sse", "v1", "events"]).unwrap();
        assert_eq!(url.as_str(), "http://localhost:25600/sse/v1/events");
    }

    #[test]
    fn test_invalid_base_url() {
        let config = ServerConfig {
            base_url: "not a url".to_string(),
            request_timeout: 5,
            connect_timeout: 5,
        };
        assert!(matches!(
            RemoteClient::new(&config, Credentials::Anonymous),
            Err(ReplicaError::Validation(_))
        ));
    }

    #[test]
    fn test_credentials_debug_hides_secrets() {
        let creds = Credentials::Basic { username: "ann".to_string(), password: "hunter2".to_string() };
        assert_eq!(format!("{creds:?}"), "Basic(ann)");
        assert_eq!(format!("{:?}", Credentials::ApiKey("k".to_string())), "ApiKey(***)");
    }

    #[test]
    fn test_truncate_on_char_boundary() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("ok", 10), "ok");
    }
}
