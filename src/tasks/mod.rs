//! Task poller: the request/poll protocol for analysis jobs
//!
//! One analysis job per task class at a time. A fresh `submit` for a class
//! supersedes the previous loop; superseded and cancelled loops never
//! deliver another result. Jobs the rig accepts with a task id are polled
//! at a fixed interval until they resolve or the deadline expires.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::{ApiClient, JobResponse};
use crate::events::{Observation, ObservationBus};

/// Terminal outcome of an analysis task
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    /// The rig produced a final result
    Completed(Value),
    /// The deadline expired before the job resolved
    TimedOut,
    /// The request or a poll failed
    Failed(String),
}

/// Re-submission policy for a task class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskRefresh {
    /// Run the job once and stop
    OneShot,
    /// Re-submit the job this long after each terminal result
    Every(Duration),
}

impl Default for TaskRefresh {
    fn default() -> Self {
        TaskRefresh::OneShot
    }
}

/// Task poller configuration
#[derive(Debug, Clone)]
pub struct TaskPollerConfig {
    /// Interval between status polls for an accepted job
    pub poll_interval_ms: u64,
    /// Maximum total wait for one job before it times out
    pub deadline_ms: u64,
    /// Re-submission policy applied to every submitted class
    pub refresh: TaskRefresh,
}

impl Default for TaskPollerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2_000,
            deadline_ms: 60_000,
            refresh: TaskRefresh::default(),
        }
    }
}

/// Resolved result carried by a task handle
#[derive(Debug, Clone)]
pub struct TaskResolution {
    /// Rig-assigned task id, or a local id for immediate results
    pub task_id: String,
    pub outcome: TaskOutcome,
}

/// Caller-side handle to one submitted analysis task
///
/// Dropping the handle does not cancel the task; call [`TaskHandle::cancel`]
/// or [`TaskPoller::cancel`] for that.
pub struct TaskHandle {
    class: String,
    cancel: CancellationToken,
    resolution: watch::Receiver<Option<TaskResolution>>,
}

impl TaskHandle {
    pub fn class(&self) -> &str {
        &self.class
    }

    /// Stop the poll loop immediately; no further results are delivered
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Snapshot of the latest resolution, if any
    pub fn resolution(&self) -> Option<TaskResolution> {
        self.resolution.borrow().clone()
    }

    /// Wait for the first terminal result.
    ///
    /// Returns `None` when the task was cancelled or superseded before
    /// resolving.
    pub async fn wait(&mut self) -> Option<TaskResolution> {
        loop {
            if let Some(resolution) = self.resolution.borrow().clone() {
                return Some(resolution);
            }
            if self.resolution.changed().await.is_err() {
                return self.resolution.borrow().clone();
            }
        }
    }
}

struct ActiveTask {
    generation: u64,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owner of the per-class poll loops
pub struct TaskPoller {
    api: Arc<ApiClient>,
    observations: Arc<ObservationBus>,
    config: TaskPollerConfig,
    next_generation: AtomicU64,
    active: Arc<Mutex<HashMap<String, ActiveTask>>>,
}

impl TaskPoller {
    pub fn new(
        api: Arc<ApiClient>,
        observations: Arc<ObservationBus>,
        config: TaskPollerConfig,
    ) -> Self {
        Self {
            api,
            observations,
            config,
            next_generation: AtomicU64::new(0),
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Submit an analysis job for a class.
    ///
    /// At most one loop runs per class; any in-flight loop for the same
    /// class is cancelled first and its late responses are suppressed.
    pub fn submit(&self, class: &str, params: Vec<(String, String)>) -> TaskHandle {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = CancellationToken::new();
        let (resolution_tx, resolution_rx) = watch::channel(None);

        let worker = TaskWorker {
            api: Arc::clone(&self.api),
            observations: Arc::clone(&self.observations),
            config: self.config.clone(),
            class: class.to_string(),
            params,
            generation,
            cancel: cancel.clone(),
            active: Arc::clone(&self.active),
            resolution: resolution_tx,
        };
        let handle = tokio::spawn(worker.run());

        let previous = self.active.lock().insert(
            class.to_string(),
            ActiveTask {
                generation,
                cancel: cancel.clone(),
                handle,
            },
        );
        if let Some(previous) = previous {
            info!(class, "Superseding in-flight analysis task");
            previous.cancel.cancel();
        }

        TaskHandle {
            class: class.to_string(),
            cancel,
            resolution: resolution_rx,
        }
    }

    /// Cancel the loop for a class, if one is running
    pub fn cancel(&self, class: &str) -> bool {
        match self.active.lock().remove(class) {
            Some(task) => {
                task.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Classes with a loop currently running
    pub fn active_classes(&self) -> Vec<String> {
        self.active.lock().keys().cloned().collect()
    }

    /// Cancel every loop and wait for the workers to finish
    pub async fn close(&self) {
        let drained: Vec<ActiveTask> = {
            let mut active = self.active.lock();
            active.drain().map(|(_, task)| task).collect()
        };
        for task in &drained {
            task.cancel.cancel();
        }
        for task in drained {
            let _ = task.handle.await;
        }
    }
}

struct TaskWorker {
    api: Arc<ApiClient>,
    observations: Arc<ObservationBus>,
    config: TaskPollerConfig,
    class: String,
    params: Vec<(String, String)>,
    generation: u64,
    cancel: CancellationToken,
    active: Arc<Mutex<HashMap<String, ActiveTask>>>,
    resolution: watch::Sender<Option<TaskResolution>>,
}

impl TaskWorker {
    async fn run(self) {
        loop {
            self.run_once().await;

            let interval = match self.config.refresh {
                TaskRefresh::OneShot => break,
                TaskRefresh::Every(interval) => interval,
            };
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        let mut active = self.active.lock();
        if active.get(&self.class).map(|t| t.generation) == Some(self.generation) {
            active.remove(&self.class);
        }
    }

    async fn run_once(&self) {
        let response = tokio::select! {
            _ = self.cancel.cancelled() => return,
            r = self.api.analysis_job(&self.class, &self.params, None) => r,
        };

        match response {
            Ok(JobResponse::Completed(value)) => {
                self.resolve(local_task_id(), TaskOutcome::Completed(value));
            }
            Ok(JobResponse::Accepted { task_id: Some(id) }) => {
                debug!(class = %self.class, task_id = %id, "Analysis job accepted");
                self.poll(id).await;
            }
            Ok(JobResponse::Accepted { task_id: None }) => {
                self.resolve(
                    local_task_id(),
                    TaskOutcome::Failed("job accepted without a task id".to_string()),
                );
            }
            Err(e) => {
                self.resolve(local_task_id(), TaskOutcome::Failed(e.to_string()));
            }
        }
    }

    async fn poll(&self, task_id: String) {
        let deadline = Duration::from_millis(self.config.deadline_ms);
        let interval = Duration::from_millis(self.config.poll_interval_ms);

        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => return,
            r = tokio::time::timeout(deadline, self.poll_until_final(&task_id, interval)) => {
                match r {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        warn!(
                            class = %self.class,
                            task_id = %task_id,
                            "Analysis task exceeded its deadline"
                        );
                        TaskOutcome::TimedOut
                    }
                }
            }
        };
        self.resolve(task_id, outcome);
    }

    async fn poll_until_final(&self, task_id: &str, interval: Duration) -> TaskOutcome {
        // Status polls for one task are strictly sequential
        loop {
            tokio::time::sleep(interval).await;
            match self.api.analysis_job(&self.class, &self.params, Some(task_id)).await {
                Ok(JobResponse::Completed(value)) => return TaskOutcome::Completed(value),
                Ok(JobResponse::Accepted { .. }) => {
                    debug!(class = %self.class, task_id, "Analysis task still pending");
                }
                Err(e) => return TaskOutcome::Failed(e.to_string()),
            }
        }
    }

    fn resolve(&self, task_id: String, outcome: TaskOutcome) {
        if self.cancel.is_cancelled() {
            debug!(class = %self.class, "Dropping result for a cancelled analysis task");
            return;
        }

        let _ = self.resolution.send(Some(TaskResolution {
            task_id: task_id.clone(),
            outcome: outcome.clone(),
        }));
        self.observations.publish(Observation::TaskResult {
            task_id,
            class: self.class.clone(),
            outcome,
        });
    }
}

fn local_task_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::broadcast;

    use crate::api::ApiConfig;

    /// Serve a fixed sequence of canned HTTP responses, one per connection
    async fn scripted_server(
        responses: Vec<(&'static str, &'static str)>,
    ) -> (String, Arc<AtomicUsize>, JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let served = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&served);

        let handle = tokio::spawn(async move {
            let mut requests = Vec::new();
            for (status_line, body) in responses {
                let (mut stream, _) = listener.accept().await.unwrap();
                let mut buf = vec![0u8; 4096];
                let mut head = String::new();
                loop {
                    let n = stream.read(&mut buf).await.unwrap();
                    head.push_str(std::str::from_utf8(&buf[..n]).unwrap());
                    if n == 0 || head.contains("\r\n\r\n") {
                        break;
                    }
                }
                requests.push(head);
                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status_line,
                    body.len(),
                    body
                );
                stream.write_all(response.as_bytes()).await.unwrap();
                let _ = stream.shutdown().await;
                counter.fetch_add(1, Ordering::SeqCst);
            }
            requests
        });

        (format!("http://{}", addr), served, handle)
    }

    fn poller_for(
        base_url: &str,
        config: TaskPollerConfig,
    ) -> (TaskPoller, broadcast::Receiver<Observation>) {
        let bus = Arc::new(ObservationBus::new());
        let observations = bus.subscribe();
        let api_config = ApiConfig {
            base_url: base_url.to_string(),
            ..Default::default()
        };
        let api = Arc::new(ApiClient::new(&api_config).unwrap());
        (TaskPoller::new(api, bus, config), observations)
    }

    async fn next_task_result(
        rx: &mut broadcast::Receiver<Observation>,
    ) -> (String, String, TaskOutcome) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Observation::TaskResult {
                    task_id,
                    class,
                    outcome,
                } = rx.recv().await.unwrap()
                {
                    return (task_id, class, outcome);
                }
            }
        })
        .await
        .expect("task result within 5s")
    }

    async fn wait_for_served(served: &Arc<AtomicUsize>, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while served.load(Ordering::SeqCst) < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("server progress within 5s");
    }

    #[tokio::test]
    async fn test_immediate_result_resolves() {
        let (base_url, _served, server) =
            scripted_server(vec![("200 OK", r#"{"led_action": "off"}"#)]).await;
        let (poller, mut observations) = poller_for(&base_url, TaskPollerConfig::default());

        let mut handle = poller.submit("led_analysis", vec![]);
        let resolution = handle.wait().await.expect("resolved");
        match &resolution.outcome {
            TaskOutcome::Completed(value) => assert_eq!(value["led_action"], "off"),
            other => panic!("unexpected outcome: {:?}", other),
        }

        let (task_id, class, outcome) = next_task_result(&mut observations).await;
        assert_eq!(task_id, resolution.task_id);
        assert_eq!(class, "led_analysis");
        assert!(matches!(outcome, TaskOutcome::Completed(_)));

        let requests = server.await.unwrap();
        assert!(requests[0].starts_with("GET /data/led_analysis "));
    }

    #[tokio::test]
    async fn test_accepted_job_polls_until_done() {
        let (base_url, _served, server) = scripted_server(vec![
            ("202 Accepted", r#"{"task_id": "t1"}"#),
            ("202 Accepted", r#"{"task_id": "t1"}"#),
            ("200 OK", r#"{"led_action": "on"}"#),
        ])
        .await;
        let config = TaskPollerConfig {
            poll_interval_ms: 20,
            deadline_ms: 5_000,
            ..Default::default()
        };
        let (poller, mut observations) = poller_for(&base_url, config);

        poller.submit("led_analysis", vec![]);
        let (task_id, class, outcome) = next_task_result(&mut observations).await;
        assert_eq!(task_id, "t1");
        assert_eq!(class, "led_analysis");
        assert!(matches!(outcome, TaskOutcome::Completed(_)));

        // Exactly one terminal result per job
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(
            observations.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));

        let requests = server.await.unwrap();
        assert!(requests[1].starts_with("GET /data/led_analysis?task_id=t1 "));
        assert!(requests[2].starts_with("GET /data/led_analysis?task_id=t1 "));
    }

    #[tokio::test]
    async fn test_silent_job_times_out() {
        // Deadline expires before the first poll tick fires
        let (base_url, _served, _server) =
            scripted_server(vec![("202 Accepted", r#"{"task_id": "t1"}"#)]).await;
        let config = TaskPollerConfig {
            poll_interval_ms: 200,
            deadline_ms: 50,
            ..Default::default()
        };
        let (poller, mut observations) = poller_for(&base_url, config);

        poller.submit("led_analysis", vec![]);
        let (task_id, _, outcome) = next_task_result(&mut observations).await;
        assert_eq!(task_id, "t1");
        assert!(matches!(outcome, TaskOutcome::TimedOut));
    }

    #[tokio::test]
    async fn test_supersession_suppresses_previous_loop() {
        let (base_url, served, server) = scripted_server(vec![
            ("202 Accepted", r#"{"task_id": "t1"}"#),
            ("200 OK", r#"{"led_action": "recheck"}"#),
        ])
        .await;
        let config = TaskPollerConfig {
            poll_interval_ms: 5_000,
            deadline_ms: 10_000,
            ..Default::default()
        };
        let (poller, mut observations) = poller_for(&base_url, config);

        poller.submit("led_analysis", vec![]);
        wait_for_served(&served, 1).await;

        poller.submit("led_analysis", vec![]);
        let (_, _, outcome) = next_task_result(&mut observations).await;
        match outcome {
            TaskOutcome::Completed(value) => assert_eq!(value["led_action"], "recheck"),
            other => panic!("unexpected outcome: {:?}", other),
        }

        // The superseded loop must not surface a second result
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(
            observations.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_stops_loop_without_result() {
        let (base_url, served, _server) =
            scripted_server(vec![("202 Accepted", r#"{"task_id": "t1"}"#)]).await;
        let config = TaskPollerConfig {
            poll_interval_ms: 5_000,
            deadline_ms: 10_000,
            ..Default::default()
        };
        let (poller, mut observations) = poller_for(&base_url, config);

        let mut handle = poller.submit("led_analysis", vec![]);
        wait_for_served(&served, 1).await;

        assert!(poller.cancel("led_analysis"));
        assert!(!poller.cancel("led_analysis"));
        assert!(handle.wait().await.is_none());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(
            observations.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
        assert!(poller.active_classes().is_empty());
    }

    #[tokio::test]
    async fn test_periodic_refresh_resubmits() {
        let (base_url, _served, _server) = scripted_server(vec![
            ("200 OK", r#"{"led_action": "one"}"#),
            ("200 OK", r#"{"led_action": "two"}"#),
        ])
        .await;
        let config = TaskPollerConfig {
            poll_interval_ms: 20,
            deadline_ms: 1_000,
            refresh: TaskRefresh::Every(Duration::from_millis(30)),
        };
        let (poller, mut observations) = poller_for(&base_url, config);

        poller.submit("led_analysis", vec![]);

        let (_, _, first) = next_task_result(&mut observations).await;
        let (_, _, second) = next_task_result(&mut observations).await;
        match (&first, &second) {
            (TaskOutcome::Completed(a), TaskOutcome::Completed(b)) => {
                assert_eq!(a["led_action"], "one");
                assert_eq!(b["led_action"], "two");
            }
            other => panic!("unexpected outcomes: {:?}", other),
        }

        assert!(poller.cancel("led_analysis"));
    }
}
