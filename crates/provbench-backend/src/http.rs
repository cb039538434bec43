//! HTTP client for the reporting backend's REST API.

use async_trait::async_trait;
use provbench_core::{BenchmarkRecord, CostUpdate, ProviderRecord, RunId, TaskCompletion};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::backend::ReputationBackend;
use crate::error::BackendError;
use crate::payload::{
    BenchmarkBatch, CostBatch, OfferReport, StartRunRequest, StartRunResponse, RUN_NAME,
};

/// reqwest-backed [`ReputationBackend`] talking to `<base_url>/v1`.
#[derive(Clone)]
pub struct HttpBackend {
    inner: reqwest::Client,
    base_url: String,
    api_token: Option<String>,
}

impl HttpBackend {
    /// Create a new client. `base_url` is the backend root without `/v1`.
    pub fn new(base_url: &str) -> Self {
        Self {
            inner: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token: None,
        }
    }

    /// Builder method to authenticate with a bearer token.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.api_token = Some(token.into());
        self
    }

    /// Full URL of an API path.
    pub fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn check(response: reqwest::Response, path: &str) -> Result<reqwest::Response, BackendError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Err(BackendError::Status {
            status,
            path: path.to_string(),
            body,
        })
    }

    /// POST a JSON body, ignoring the response body.
    async fn post_json<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<(), BackendError> {
        let url = self.url(path);
        debug!(url = %url, "POST request");

        let response = self
            .authorize(self.inner.post(&url))
            .json(body)
            .send()
            .await?;
        Self::check(response, path).await?;
        Ok(())
    }

    /// GET JSON from an absolute URL.
    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, BackendError> {
        debug!(url = %url, "GET request");

        let response = self.authorize(self.inner.get(url)).send().await?;
        let response = Self::check(response, url).await?;

        response
            .json()
            .await
            .map_err(|e| BackendError::Serialization(e.to_string()))
    }
}

#[async_trait]
impl ReputationBackend for HttpBackend {
    async fn start_run(&self) -> Result<RunId, BackendError> {
        let path = "task/start";
        let url = self.url(path);
        debug!(url = %url, "Starting run");

        let response = self
            .authorize(self.inner.post(&url))
            .json(&StartRunRequest { name: RUN_NAME })
            .send()
            .await?;
        let response: StartRunResponse = Self::check(response, path)
            .await?
            .json()
            .await
            .map_err(|e| BackendError::Serialization(e.to_string()))?;

        response
            .run_id()
            .ok_or_else(|| BackendError::Serialization("run id missing from response".to_string()))
    }

    async fn end_run(&self, run_id: &RunId, total_cost: f64) -> Result<(), BackendError> {
        let path = format!("task/end/{run_id}");
        let url = self.url(&path);
        debug!(url = %url, total_cost, "Ending run");

        let response = self
            .authorize(self.inner.post(&url))
            .query(&[("cost", total_cost)])
            .send()
            .await?;
        Self::check(response, &path).await?;
        Ok(())
    }

    async fn submit_offer(&self, report: &OfferReport) -> Result<(), BackendError> {
        self.post_json(&format!("task/offer/{}", report.run_id), report)
            .await
    }

    async fn submit_task_statuses(
        &self,
        completions: &[TaskCompletion],
    ) -> Result<(), BackendError> {
        self.post_json("submit/task/status/bulk", completions).await
    }

    async fn submit_benchmarks(&self, records: &[BenchmarkRecord]) -> Result<(), BackendError> {
        self.post_json("benchmark/bulk", &BenchmarkBatch { benchmarks: records })
            .await
    }

    async fn submit_cost_updates(&self, updates: &[CostUpdate]) -> Result<(), BackendError> {
        self.post_json("tasks/update-costs", &CostBatch { updates })
            .await
    }

    async fn blacklisted_providers(&self) -> Result<Vec<String>, BackendError> {
        self.get_json(&self.url("blacklisted-providers")).await
    }

    async fn blacklisted_operators(&self) -> Result<Vec<String>, BackendError> {
        self.get_json(&self.url("blacklisted-operators")).await
    }

    async fn provider_records(&self, url: &str) -> Result<Vec<ProviderRecord>, BackendError> {
        self.get_json(url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use provbench_core::ProviderId;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned response and hand back the raw request.
    async fn serve_once(status: &'static str, body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request).to_string();
                if let Some(head_end) = text.find("\r\n\r\n") {
                    let content_length = text[..head_end]
                        .lines()
                        .find_map(|l| {
                            let lower = l.to_ascii_lowercase();
                            lower
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap())
                        })
                        .unwrap_or(0);
                    if request.len() >= head_end + 4 + content_length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }

            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
            String::from_utf8_lossy(&request).to_string()
        });

        (format!("http://{addr}"), handle)
    }

    #[test]
    fn test_url_joins_base_and_path() {
        let backend = HttpBackend::new("http://api.localhost/");
        assert_eq!(
            backend.url("/task/start"),
            "http://api.localhost/v1/task/start"
        );
        assert_eq!(
            backend.url("blacklisted-providers"),
            "http://api.localhost/v1/blacklisted-providers"
        );
    }

    #[tokio::test]
    async fn test_start_run_sends_bearer_token() {
        let (base, request) = serve_once("200 OK", r#"{"id": 17, "name": "benchmark suite"}"#).await;
        let backend = HttpBackend::new(&base).with_token("secret");

        let run_id = backend.start_run().await.unwrap();
        assert_eq!(run_id, RunId::new("17"));

        let request = request.await.unwrap();
        assert!(request.starts_with("POST /v1/task/start"));
        assert!(request.to_ascii_lowercase().contains("authorization: bearer secret"));
        assert!(request.contains("benchmark suite"));
    }

    #[tokio::test]
    async fn test_end_run_passes_cost_as_query() {
        let (base, request) = serve_once("200 OK", "{}").await;
        let backend = HttpBackend::new(&base);

        backend.end_run(&RunId::new("17"), 1.5).await.unwrap();

        let request = request.await.unwrap();
        assert!(request.starts_with("POST /v1/task/end/17?cost=1.5"));
    }

    #[tokio::test]
    async fn test_blacklist_fetch_error_status() {
        let (base, _request) = serve_once("500 Internal Server Error", r#"{"error":"down"}"#).await;
        let backend = HttpBackend::new(&base);

        let err = backend.blacklisted_providers().await.unwrap_err();
        assert!(matches!(err, BackendError::Status { status: 500, .. }));
    }

    #[tokio::test]
    async fn test_provider_records_from_absolute_url() {
        let (base, _request) = serve_once(
            "200 OK",
            r#"[{"node_id": "0xa", "runtimes": {"vm": {"is_overpriced": true, "times_more_expensive": 1.1, "times_cheaper": null}}}]"#,
        )
        .await;
        let backend = HttpBackend::new("http://unused");

        let records = backend
            .provider_records(&format!("{base}/stats/providers"))
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].provider_id, ProviderId::new("0xa"));
    }
}
