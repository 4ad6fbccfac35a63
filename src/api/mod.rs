//! Typed pull client for the rig's HTTP data endpoints
//!
//! Owns the base URL and the shared `reqwest` client. The task poller uses
//! `analysis_job()` for the request/poll protocol; the subscription hub
//! uses `fetch()` for periodic kind-keyed pulls.

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Result;

/// Data kinds served by the rig's pull endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchKind {
    CurrentStatus,
    Realtime,
    LedStats,
    LedHistory,
    EnergyStats,
    HeatingPrediction,
    HeatingHistory,
}

impl FetchKind {
    /// Endpoint path for this kind
    pub fn path(&self) -> &'static str {
        match self {
            FetchKind::CurrentStatus => "/data/current-status",
            FetchKind::Realtime => "/data/realtime",
            FetchKind::LedStats => "/data/led_stats",
            FetchKind::LedHistory => "/data/led_history",
            FetchKind::EnergyStats => "/data/energy_stats",
            FetchKind::HeatingPrediction => "/data/heating-prediction",
            FetchKind::HeatingHistory => "/data/heating-history",
        }
    }
}

impl std::fmt::Display for FetchKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FetchKind::CurrentStatus => "current_status",
            FetchKind::Realtime => "realtime",
            FetchKind::LedStats => "led_stats",
            FetchKind::LedHistory => "led_history",
            FetchKind::EnergyStats => "energy_stats",
            FetchKind::HeatingPrediction => "heating_prediction",
            FetchKind::HeatingHistory => "heating_history",
        };
        write!(f, "{}", name)
    }
}

/// Actuator states reported by `/data/current-status`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrentStatus {
    pub ac_state: String,
    pub window_state: String,
}

/// LED usage counters from `/data/led_stats`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedStats {
    /// Cumulative on time in seconds
    pub total_on_time: f64,
    /// Number of on switches
    pub on_count: u64,
}

/// Energy figures attached to an LED analysis
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnergyInfo {
    /// kWh
    pub energy_consumption: f64,
    /// Currency units
    pub cost: f64,
}

/// Final result of an `led_analysis` job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedAnalysis {
    pub led_action: String,
    #[serde(default)]
    pub energy_info: Option<EnergyInfo>,
    #[serde(default)]
    pub analysis: Option<String>,
}

/// Point prediction from `/data/heating-prediction`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeatingEstimate {
    /// kWh
    pub estimated_usage: f64,
    /// Currency units
    pub estimated_cost: f64,
}

/// Full heating prediction report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeatingPrediction {
    pub prediction: HeatingEstimate,
    #[serde(default)]
    pub tips: Vec<String>,
    #[serde(default)]
    pub features: serde_json::Map<String, Value>,
}

/// One historical sensor sample from `/data/history`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistorySample {
    pub timestamp: DateTime<Utc>,
    pub temperature: f64,
    #[serde(default)]
    pub humidity: f64,
    #[serde(default)]
    pub light: f64,
}

/// Outcome of one analysis-job request
#[derive(Debug, Clone)]
pub enum JobResponse {
    /// 200: the final result
    Completed(Value),
    /// 202: accepted, poll with the task id
    Accepted { task_id: Option<String> },
}

/// API client configuration
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub base_url: String,
    pub timeout_ms: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:5000".to_string(),
            timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Deserialize)]
struct AcceptedBody {
    #[serde(default)]
    task_id: Option<String>,
}

/// HTTP client for the `/data/*` endpoints
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .http
            .get(self.url(path))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    pub async fn current_status(&self) -> Result<CurrentStatus> {
        self.get_json(FetchKind::CurrentStatus.path()).await
    }

    pub async fn led_stats(&self) -> Result<LedStats> {
        self.get_json(FetchKind::LedStats.path()).await
    }

    pub async fn heating_prediction(&self) -> Result<HeatingPrediction> {
        self.get_json(FetchKind::HeatingPrediction.path()).await
    }

    /// Historical samples between two instants, ISO-8601 encoded
    pub async fn history(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<HistorySample>> {
        let path = format!(
            "/data/history?start={}&end={}",
            urlencoding::encode(&start.to_rfc3339()),
            urlencoding::encode(&end.to_rfc3339())
        );
        self.get_json(&path).await
    }

    /// Untyped fetch for the subscription hub
    pub async fn fetch(&self, kind: FetchKind) -> Result<Value> {
        self.get_json(kind.path()).await
    }

    /// Request an analysis job, or poll an accepted one.
    ///
    /// 200 carries the final result; 202 means the job is still running.
    pub async fn analysis_job(
        &self,
        class: &str,
        params: &[(String, String)],
        task_id: Option<&str>,
    ) -> Result<JobResponse> {
        let mut request = self.http.get(self.url(&format!("/data/{}", class)));
        if !params.is_empty() {
            request = request.query(params);
        }
        if let Some(id) = task_id {
            request = request.query(&[("task_id", id)]);
        }

        let response = request.send().await?.error_for_status()?;

        if response.status() == StatusCode::ACCEPTED {
            let body: AcceptedBody = response.json().await.unwrap_or(AcceptedBody { task_id: None });
            Ok(JobResponse::Accepted {
                task_id: body.task_id,
            })
        } else {
            Ok(JobResponse::Completed(response.json().await?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// Serve one canned HTTP response and capture the request head
    async fn one_shot_server(status_line: &'static str, body: &'static str) -> (ApiConfig, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let mut request = String::new();
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                request.push_str(std::str::from_utf8(&buf[..n]).unwrap());
                if n == 0 || request.contains("\r\n\r\n") {
                    break;
                }
            }
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status_line,
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            let _ = stream.shutdown().await;
            request
        });
        let config = ApiConfig {
            base_url: format!("http://{}", addr),
            ..Default::default()
        };
        (config, handle)
    }

    #[tokio::test]
    async fn test_led_stats_typed() {
        let (config, server) =
            one_shot_server("200 OK", r#"{"total_on_time": 12.5, "on_count": 3}"#).await;
        let api = ApiClient::new(&config).unwrap();

        let stats = api.led_stats().await.unwrap();
        assert_eq!(stats.total_on_time, 12.5);
        assert_eq!(stats.on_count, 3);

        let request = server.await.unwrap();
        assert!(request.starts_with("GET /data/led_stats "));
    }

    #[tokio::test]
    async fn test_analysis_job_accepted() {
        let (config, server) = one_shot_server("202 Accepted", r#"{"task_id": "abc"}"#).await;
        let api = ApiClient::new(&config).unwrap();

        let params = vec![("period".to_string(), "day".to_string())];
        let response = api.analysis_job("led_analysis", &params, None).await.unwrap();
        match response {
            JobResponse::Accepted { task_id } => assert_eq!(task_id.as_deref(), Some("abc")),
            other => panic!("unexpected response: {:?}", other),
        }

        let request = server.await.unwrap();
        assert!(request.starts_with("GET /data/led_analysis?period=day "));
    }

    #[tokio::test]
    async fn test_analysis_job_poll_carries_task_id() {
        let (config, server) =
            one_shot_server("200 OK", r#"{"led_action": "off"}"#).await;
        let api = ApiClient::new(&config).unwrap();

        let response = api.analysis_job("led_analysis", &[], Some("abc")).await.unwrap();
        match response {
            JobResponse::Completed(value) => assert_eq!(value["led_action"], "off"),
            other => panic!("unexpected response: {:?}", other),
        }

        let request = server.await.unwrap();
        assert!(request.starts_with("GET /data/led_analysis?task_id=abc "));
    }

    #[tokio::test]
    async fn test_history_query_is_encoded() {
        let (config, server) = one_shot_server("200 OK", "[]").await;
        let api = ApiClient::new(&config).unwrap();

        let start = "2026-08-01T00:00:00Z".parse().unwrap();
        let end = "2026-08-02T00:00:00Z".parse().unwrap();
        let samples = api.history(start, end).await.unwrap();
        assert!(samples.is_empty());

        let request = server.await.unwrap();
        // Colons in the ISO timestamps must be percent-encoded
        assert!(request.contains("/data/history?start=2026-08-01T00%3A00%3A00"));
        assert!(request.contains("&end=2026-08-02T00%3A00%3A00"));
    }

    #[tokio::test]
    async fn test_server_error_is_surfaced() {
        let (config, _server) = one_shot_server("500 Internal Server Error", "{}").await;
        let api = ApiClient::new(&config).unwrap();

        let err = api.fetch(FetchKind::EnergyStats).await.unwrap_err();
        assert!(matches!(err, crate::ClientError::Http(_)));
    }

    #[test]
    fn test_kind_paths() {
        assert_eq!(FetchKind::CurrentStatus.path(), "/data/current-status");
        assert_eq!(FetchKind::HeatingPrediction.path(), "/data/heating-prediction");
        assert_eq!(FetchKind::LedStats.to_string(), "led_stats");
    }
}
