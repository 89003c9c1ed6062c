//! Outgoing request logging for the hosting and Slack clients.

use std::time::Instant;

use axum::http;
use reqwest::{Request, Response};
use reqwest_middleware::{Middleware, Next, Result as MiddlewareResult};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::CORRELATION_ID_HEADER;

/// Correlation id of the inbound request being served, stored in request
/// extensions by the webhook layer.
#[derive(Debug, Clone)]
pub struct CorrelationId(pub String);

/// Logs every outgoing call with its method, path, status and latency, and
/// stamps it with a correlation id.
///
/// Calls are made from repository workers inside the span of the request
/// that caused them, so the span already names the inbound correlation id;
/// the header lets the remote side's logs be matched up too.
pub struct LoggingMiddleware {
    service: &'static str,
}

impl LoggingMiddleware {
    pub fn new(service: &'static str) -> Self {
        Self { service }
    }
}

#[async_trait::async_trait]
impl Middleware for LoggingMiddleware {
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> MiddlewareResult<Response> {
        if !req.headers().contains_key(CORRELATION_ID_HEADER) {
            let correlation_id = extensions
                .get::<CorrelationId>()
                .map(|id| id.0.clone())
                .unwrap_or_else(|| Uuid::new_v4().to_string());
            if let Ok(value) = correlation_id.parse() {
                req.headers_mut().insert(CORRELATION_ID_HEADER, value);
            }
        }

        let method = req.method().clone();
        let path = req.url().path().to_string();
        let started = Instant::now();

        let response = next.run(req, extensions).await;

        let elapsed_ms = started.elapsed().as_millis();
        match &response {
            Ok(resp) if resp.status().is_success() => {
                debug!(
                    service = self.service,
                    status = resp.status().as_u16(),
                    elapsed_ms,
                    "{} {}",
                    method,
                    path
                );
            }
            Ok(resp) => {
                warn!(
                    service = self.service,
                    status = resp.status().as_u16(),
                    elapsed_ms,
                    "{} {}",
                    method,
                    path
                );
            }
            Err(err) => {
                warn!(
                    service = self.service,
                    elapsed_ms,
                    "{} {} failed: {}",
                    method,
                    path,
                    err
                );
            }
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use reqwest_middleware::ClientBuilder;
    use wiremock::matchers::{header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    #[tokio::test]
    async fn test_adds_correlation_header() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ping"))
            .and(header_exists(CORRELATION_ID_HEADER))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client = ClientBuilder::new(reqwest::Client::new())
            .with(LoggingMiddleware::new("test"))
            .build();
        let response = client
            .get(format!("{}/ping", server.uri()))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), 200);
    }

    #[tokio::test]
    async fn test_keeps_existing_correlation_header() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(wiremock::matchers::header(CORRELATION_ID_HEADER, "abc-123"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let client = ClientBuilder::new(reqwest::Client::new())
            .with(LoggingMiddleware::new("test"))
            .build();
        let response = client
            .get(server.uri())
            .header(CORRELATION_ID_HEADER, "abc-123")
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), 204);
    }
}
