//! HTTP(S) origin backed by `reqwest`.

use async_trait::async_trait;
use reqwest::{Client, Url};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

use super::error::DownloadError;
use super::Origin;
use crate::constants::{HTTP_CONNECT_TIMEOUT, HTTP_READ_TIMEOUT, USER_AGENT};

/// Fetches sources over HTTP or HTTPS.
///
/// Each call issues a single GET. Non-success statuses and transport errors
/// are reported as failures; nothing is retried.
#[derive(Debug, Clone)]
pub struct HttpOrigin {
    client: Client,
}

impl HttpOrigin {
    /// Creates an origin with the default connect and read timeouts.
    pub fn new() -> Result<Self, DownloadError> {
        let client = Client::builder()
            .connect_timeout(HTTP_CONNECT_TIMEOUT)
            .read_timeout(HTTP_READ_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self { client })
    }

    /// Creates an origin with a custom HTTP client.
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

fn parse_url(url: &str) -> Result<Url, DownloadError> {
    let parsed = Url::parse(url).map_err(|e| DownloadError::InvalidUrl(format!("{}: {}", url, e)))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(DownloadError::InvalidUrl(format!(
            "{}: unsupported scheme {:?}",
            url, other
        ))),
    }
}

#[async_trait]
impl Origin for HttpOrigin {
    async fn fetch(
        &self,
        url: &str,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64, DownloadError> {
        let parsed = parse_url(url)?;
        let mut response = self.client.get(parsed).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::Status(status));
        }

        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await? {
            sink.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        sink.flush().await?;

        debug!(url, bytes = written, "origin fetch complete");
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// Serves one canned response per connection.
    async fn serve(status_line: &'static str, body: &'static [u8]) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let head = format!(
                    "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    status_line,
                    body.len()
                );
                let _ = socket.write_all(head.as_bytes()).await;
                let _ = socket.write_all(body).await;
                let _ = socket.shutdown().await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_fetch_streams_body() {
        let body: &'static [u8] = b"\x89PNG pretend image payload";
        let addr = serve("200 OK", body).await;
        let origin = HttpOrigin::new().unwrap();

        let mut sink = Vec::new();
        let written = origin
            .fetch(&format!("http://{}/cat.png", addr), &mut sink)
            .await
            .unwrap();
        assert_eq!(written, body.len() as u64);
        assert_eq!(sink, body);
    }

    #[tokio::test]
    async fn test_fetch_error_status() {
        let addr = serve("404 Not Found", b"gone").await;
        let origin = HttpOrigin::new().unwrap();

        let mut sink = Vec::new();
        let err = origin
            .fetch(&format!("http://{}/missing.png", addr), &mut sink)
            .await
            .unwrap_err();
        match err {
            DownloadError::Status(status) => assert_eq!(status.as_u16(), 404),
            other => panic!("unexpected error: {}", other),
        }
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_invalid_url() {
        let origin = HttpOrigin::new().unwrap();
        let mut sink = Vec::new();

        assert!(matches!(
            origin.fetch("not a url", &mut sink).await,
            Err(DownloadError::InvalidUrl(_))
        ));
        assert!(matches!(
            origin.fetch("ftp://example.com/a.png", &mut sink).await,
            Err(DownloadError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn test_fetch_connection_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let origin = HttpOrigin::new().unwrap();
        let mut sink = Vec::new();
        assert!(matches!(
            origin.fetch(&format!("http://{}/a.png", addr), &mut sink).await,
            Err(DownloadError::Http(_))
        ));
    }
}
