use std::time::Duration;

use axum::http::{HeaderMap, Method};
use tracing::debug;

use crate::models::config::ProxyConfig;

#[derive(Debug)]
pub enum ForwardError {
    Timeout,
    Request(reqwest::Error),
}

impl std::fmt::Display for ForwardError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ForwardError::Timeout => write!(f, "upstream deadline exceeded"),
            ForwardError::Request(e) => write!(f, "upstream request failed: {}", e),
        }
    }
}

// Issues one upstream call. The connect deadline lives on the client; the
// total deadline is applied around header receipt so streaming response
// bodies are never cut off by a wall-clock timeout.
pub struct Forwarder {
    client: reqwest::Client,
    request_timeout: Duration,
    idle_timeout: Duration,
}

impl Forwarder {
    pub fn new(config: &ProxyConfig) -> Self {
        Self::with_timeouts(
            Duration::from_secs(config.connect_timeout_secs),
            Duration::from_secs(config.request_timeout_secs),
            Duration::from_secs(config.idle_timeout_secs),
        )
    }

    pub fn with_timeouts(
        connect_timeout: Duration,
        request_timeout: Duration,
        idle_timeout: Duration,
    ) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .pool_max_idle_per_host(16)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .expect("Failed to create upstream HTTP client");

        Self {
            client,
            request_timeout,
            idle_timeout,
        }
    }

    // Deadline for draining a non-streaming response body.
    pub fn body_read_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub async fn forward(
        &self,
        method: Method,
        url: &str,
        headers: HeaderMap,
        body: Option<reqwest::Body>,
    ) -> Result<reqwest::Response, ForwardError> {
        let mut request = self.client.request(method, url).headers(headers);
        if let Some(body) = body {
            request = request.body(body);
        }

        debug!("Forwarding request to {}", url);
        match tokio::time::timeout(self.request_timeout, request.send()).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(ForwardError::Request(e)),
            Err(_) => Err(ForwardError::Timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::post, Router};
    use bytes::Bytes;

    async fn start_echo_server() -> (String, tokio::task::JoinHandle<()>) {
        let app = Router::new().route(
            "/v1/messages",
            post(|body: Bytes| async move { body }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}", addr), server)
    }

    #[tokio::test]
    async fn test_forward_round_trips_buffered_body() {
        let (base, server) = start_echo_server().await;
        let forwarder = Forwarder::with_timeouts(
            Duration::from_secs(2),
            Duration::from_secs(5),
            Duration::from_secs(5),
        );

        let payload = Bytes::from_static(b"{\"model\":\"claude\"}");
        let response = forwarder
            .forward(
                Method::POST,
                &format!("{}/v1/messages", base),
                HeaderMap::new(),
                Some(reqwest::Body::from(payload.clone())),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), 200);
        let echoed = response.bytes().await.unwrap();
        assert_eq!(echoed, payload);
        server.abort();
    }

    #[tokio::test]
    async fn test_forward_times_out_on_stalled_upstream() {
        let app = Router::new().route(
            "/slow",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                "late"
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let forwarder = Forwarder::with_timeouts(
            Duration::from_secs(2),
            Duration::from_millis(200),
            Duration::from_secs(5),
        );
        let result = forwarder
            .forward(
                Method::POST,
                &format!("http://{}/slow", addr),
                HeaderMap::new(),
                None,
            )
            .await;

        assert!(matches!(result, Err(ForwardError::Timeout)));
        server.abort();
    }
}
