//! Build and test through a remote execution service.
//!
//! The service accepts the same requests the local adapters take, as JSON,
//! on `POST {url}/build` and `POST {url}/test`, and answers with the outcome.

use crate::adapters::{
    BuildAdapter, BuildOutcome, BuildRequest, BuildStatus, TestAdapter, TestOutcome, TestRequest,
    TestStatus,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::{Duration, Instant};

/// Slack on top of the request's own timeout for the HTTP round trip.
const TRANSPORT_SLACK: Duration = Duration::from_secs(30);

/// Client for a remote execution service
#[derive(Clone)]
pub struct RemoteClient {
    client: Client,
    base_url: String,
}

impl RemoteClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn call<Req, Resp>(&self, path: &str, request: &Req, timeout: Duration) -> Result<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let url = format!("{}/{}", self.base_url, path);

        let response = self
            .client
            .post(&url)
            .timeout(timeout + TRANSPORT_SLACK)
            .json(request)
            .send()
            .await
            .with_context(|| format!("Failed to reach execution service at {}", url))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Execution service error: {} - {}", status, body);
        }

        response
            .json()
            .await
            .context("Failed to parse execution service response")
    }
}

pub struct RemoteBuildAdapter {
    client: RemoteClient,
}

impl RemoteBuildAdapter {
    pub fn new(client: RemoteClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BuildAdapter for RemoteBuildAdapter {
    async fn build(&self, request: &BuildRequest) -> BuildOutcome {
        let start = Instant::now();
        match self.client.call("build", request, request.timeout).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!("Remote build failed: {:#}", e);
                BuildOutcome {
                    status: BuildStatus::Failed,
                    log: format!("{:#}", e),
                    duration_ms: start.elapsed().as_millis() as u64,
                }
            }
        }
    }
}

pub struct RemoteTestAdapter {
    client: RemoteClient,
}

impl RemoteTestAdapter {
    pub fn new(client: RemoteClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TestAdapter for RemoteTestAdapter {
    async fn test(&self, request: &TestRequest) -> TestOutcome {
        let start = Instant::now();
        match self.client.call("test", request, request.timeout).await {
            Ok(outcome) => outcome,
            Err(e) => {
                // No answer says nothing about the tests; never report a kill.
                tracing::warn!("Remote test run failed: {:#}", e);
                TestOutcome {
                    status: TestStatus::Timeout,
                    log: format!("{:#}", e),
                    duration_ms: start.elapsed().as_millis() as u64,
                    results: Vec::new(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::post, Json, Router};
    use std::path::PathBuf;

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn build_request() -> BuildRequest {
        BuildRequest {
            descriptor: PathBuf::from("/p/a.vcxproj"),
            solution: None,
            configuration: "Debug".to_string(),
            platform: None,
            verbosity: "quiet".to_string(),
            out_dir: PathBuf::from("/p/out"),
            int_dir: PathBuf::from("/p/int"),
            rebuild: false,
            optimized: true,
            timeout: Duration::from_secs(5),
        }
    }

    fn test_request() -> TestRequest {
        TestRequest {
            binary_dir: PathBuf::from("/p/out"),
            filter: None,
            result_file: PathBuf::from("/p/out/r.json"),
            coverage_file: None,
            timeout: Duration::from_secs(5),
            kill_on_first_failure: true,
            failure_patterns: vec![],
        }
    }

    #[tokio::test]
    async fn test_remote_build_round_trip() {
        let app = Router::new().route(
            "/build",
            post(|Json(req): Json<BuildRequest>| async move {
                Json(BuildOutcome {
                    status: BuildStatus::Success,
                    log: format!("built {}", req.descriptor.display()),
                    duration_ms: 5,
                })
            }),
        );
        let url = serve(app).await;
        let adapter = RemoteBuildAdapter::new(RemoteClient::new(&url));
        let outcome = adapter.build(&build_request()).await;
        assert!(outcome.is_success());
        assert_eq!(outcome.log, "built /p/a.vcxproj");
    }

    #[tokio::test]
    async fn test_remote_test_round_trip() {
        let app = Router::new().route(
            "/test",
            post(|Json(_req): Json<TestRequest>| async move {
                Json(TestOutcome {
                    status: TestStatus::Failed,
                    log: "[  FAILED  ] A.b".to_string(),
                    duration_ms: 7,
                    results: vec![],
                })
            }),
        );
        let url = serve(app).await;
        let adapter = RemoteTestAdapter::new(RemoteClient::new(&format!("{}/", url)));
        let outcome = adapter.test(&test_request()).await;
        assert_eq!(outcome.status, TestStatus::Failed);
    }

    #[tokio::test]
    async fn test_unreachable_service_degrades_to_status() {
        let client = RemoteClient::new("http://127.0.0.1:9");
        let build = RemoteBuildAdapter::new(client.clone()).build(&build_request()).await;
        assert_eq!(build.status, BuildStatus::Failed);
        let test = RemoteTestAdapter::new(client).test(&test_request()).await;
        assert_eq!(test.status, TestStatus::Timeout);
    }
}
