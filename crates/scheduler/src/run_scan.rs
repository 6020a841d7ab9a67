//! The `run_scan` task contract (spec.md §4.1/§4.2/§4.3): launch a scanner
//! container, pump its combined log stream through the scan parser (C2)
//! while persisting raw bytes and findings to the job registry (C3), wait
//! for exit, and always destroy the container, even on cancellation or a
//! detected loop.

use std::sync::Arc;
use std::time::Duration;

use container_runtime::{ContainerHandle, ContainerRuntime, LaunchSpec};
use job_registry::JobRegistry;
use scan_core::{CoreError, CoreResult, JobId, ScanFinding};
use scan_parser::{ParseEvent, ScanParser};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::container_name;

#[derive(Debug, Clone)]
pub struct ScanOutcome {
    pub findings: Vec<ScanFinding>,
    pub exit_code: i64,
    pub loop_detected: bool,
}

/// Everything `run_scan` needs beyond the job id, kept as one struct so the
/// scheduler's dispatcher can build it once per scan job.
pub struct ScanRequest {
    pub job_id: JobId,
    pub image: String,
    pub target: String,
    pub command: Vec<String>,
    pub timeout: Duration,
}

async fn launch_with_fresh_name(
    runtime: &dyn ContainerRuntime,
    request: &ScanRequest,
) -> CoreResult<ContainerHandle> {
    const MAX_NAME_ATTEMPTS: u32 = 3;
    let mut last_err = None;
    for _ in 0..MAX_NAME_ATTEMPTS {
        let container_name = container_name::allocate();
        let mut spec = LaunchSpec::new(request.image.clone(), container_name, request.target.clone());
        spec.command = request.command.clone();
        spec.timeout = request.timeout;
        match runtime.launch(spec).await {
            Ok(handle) => return Ok(handle),
            Err(e @ CoreError::RuntimeUnavailable(_)) => last_err = Some(e),
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or(CoreError::RuntimeUnavailable("exhausted container name attempts".to_string())))
}

/// Run one scan job end to end. `cancel` is the job's cooperative
/// cancellation token: the scheduler cancels it to abort a running scan
/// (spec.md §5), at which point the container is destroyed and
/// [`CoreError::Cancelled`] is returned without a partial [`ScanOutcome`].
pub async fn run_scan(
    runtime: Arc<dyn ContainerRuntime>,
    registry: Arc<JobRegistry>,
    request: ScanRequest,
    cancel: CancellationToken,
) -> CoreResult<ScanOutcome> {
    let handle = launch_with_fresh_name(runtime.as_ref(), &request).await?;
    info!(job_id = %request.job_id, container_name = %handle.container_name, "scan container launched");

    registry
        .transition(request.job_id, scan_core::JobState::Running, |j| {
            j.container_name = Some(handle.container_name.clone());
        })
        .await?;

    let outcome = pump_and_wait(runtime.as_ref(), registry.as_ref(), request.job_id, &handle, request.timeout, &cancel).await;

    if let Err(e) = runtime.destroy(&handle).await {
        warn!(job_id = %request.job_id, error = %e, "failed to destroy scan container, may require external cleanup");
    }

    outcome
}

async fn pump_and_wait(
    runtime: &dyn ContainerRuntime,
    registry: &JobRegistry,
    job_id: JobId,
    handle: &ContainerHandle,
    timeout: Duration,
    cancel: &CancellationToken,
) -> CoreResult<ScanOutcome> {
    let (mut rx, stream_token) = runtime.stream_logs(handle, 0).await?;
    let mut parser = ScanParser::new(job_id);
    let mut findings = Vec::new();
    let mut loop_detected = false;

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                stream_token.cancel();
                return Err(CoreError::Cancelled);
            }
            chunk = rx.recv() => {
                let Some(chunk) = chunk else { break };
                registry.append_log(job_id, &chunk.data).await?;

                let text = String::from_utf8_lossy(&chunk.data);
                let mut pos = chunk.offset;
                for line in text.split('\n') {
                    if !line.is_empty() {
                        if let Some(event) = parser.parse_line(line, pos) {
                            match event {
                                ParseEvent::Finding(finding) => findings.push(finding),
                                ParseEvent::LoopDetected => loop_detected = true,
                                ParseEvent::Progress { .. } | ParseEvent::Raw(_) => {}
                            }
                        }
                    }
                    pos += line.len() as u64 + 1;
                    if loop_detected {
                        break;
                    }
                }
            }
        }
        if loop_detected {
            break;
        }
    }

    stream_token.cancel();

    if loop_detected {
        warn!(job_id = %job_id, "scan output loop detected, aborting");
        return Err(CoreError::LoopDetected);
    }

    let exit_code = runtime.wait(handle, timeout).await?;
    Ok(ScanOutcome { findings, exit_code, loop_detected })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use container_runtime::{LogChunk, LogSource};
    use kv_store::InMemoryStore;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::mpsc;

    struct FakeRuntime {
        log_lines: Vec<&'static str>,
        wait_exit: i64,
        destroyed: Arc<StdMutex<bool>>,
    }

    #[async_trait]
    impl ContainerRuntime for FakeRuntime {
        async fn launch(&self, spec: LaunchSpec) -> CoreResult<ContainerHandle> {
            Ok(ContainerHandle {
                container_name: spec.container_name,
                runtime_id: "fake-id".to_string(),
                target: spec.target,
                start_time: Utc::now(),
            })
        }

        async fn stream_logs(
            &self,
            _handle: &ContainerHandle,
            _since_offset: u64,
        ) -> CoreResult<(mpsc::Receiver<LogChunk>, CancellationToken)> {
            let (tx, rx) = mpsc::channel(16);
            let lines = self.log_lines.clone();
            tokio::spawn(async move {
                let mut offset = 0u64;
                for line in lines {
                    let mut data = line.as_bytes().to_vec();
                    data.push(b'\n');
                    let len = data.len() as u64;
                    let _ = tx.send(LogChunk { source: LogSource::Stdout, offset, data }).await;
                    offset += len;
                }
            });
            Ok((rx, CancellationToken::new()))
        }

        async fn wait(&self, _handle: &ContainerHandle, _deadline: Duration) -> CoreResult<i64> {
            Ok(self.wait_exit)
        }

        async fn destroy(&self, _handle: &ContainerHandle) -> CoreResult<()> {
            *self.destroyed.lock().unwrap() = true;
            Ok(())
        }
    }

    fn registry() -> Arc<JobRegistry> {
        Arc::new(JobRegistry::new(Arc::new(InMemoryStore::new()), job_registry::DEFAULT_CAP_BYTES))
    }

    #[tokio::test]
    async fn successful_scan_collects_findings_and_exit_code() {
        let reg = registry();
        let job = reg
            .create(
                scan_core::JobKind::Scan(scan_core::ScanPayload {
                    scan_id: "c1".into(),
                    target: "https://example.com".into(),
                    template_selector: scan_core::TemplateSelector::All,
                }),
                None,
            )
            .await
            .unwrap();

        let destroyed = Arc::new(StdMutex::new(false));
        let runtime: Arc<dyn ContainerRuntime> = Arc::new(FakeRuntime {
            log_lines: vec![
                "[INF] New Scan Started",
                "[CVE-2024-0001] [http] [high] https://example.com detail",
            ],
            wait_exit: 0,
            destroyed: Arc::clone(&destroyed),
        });

        let request = ScanRequest {
            job_id: job.id,
            image: "projectdiscovery/nuclei:latest".into(),
            target: "https://example.com".into(),
            command: vec![],
            timeout: Duration::from_secs(60),
        };

        let outcome = run_scan(runtime, Arc::clone(&reg), request, CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(outcome.findings.len(), 1);
        assert!(!outcome.loop_detected);
        assert!(*destroyed.lock().unwrap());

        let job = reg.get(job.id).await.unwrap();
        assert_eq!(job.state, scan_core::JobState::Running);
        assert!(job.container_name.unwrap().starts_with("nuclei_scan_"));
    }

    #[tokio::test]
    async fn cancellation_destroys_the_container_and_returns_cancelled() {
        let reg = registry();
        let job = reg
            .create(
                scan_core::JobKind::Scan(scan_core::ScanPayload {
                    scan_id: "c1".into(),
                    target: "https://example.com".into(),
                    template_selector: scan_core::TemplateSelector::All,
                }),
                None,
            )
            .await
            .unwrap();

        let destroyed = Arc::new(StdMutex::new(false));
        let runtime: Arc<dyn ContainerRuntime> = Arc::new(FakeRuntime {
            log_lines: vec![],
            wait_exit: 0,
            destroyed: Arc::clone(&destroyed),
        });

        let token = CancellationToken::new();
        token.cancel();

        let request = ScanRequest {
            job_id: job.id,
            image: "projectdiscovery/nuclei:latest".into(),
            target: "https://example.com".into(),
            command: vec![],
            timeout: Duration::from_secs(60),
        };

        let err = run_scan(runtime, reg, request, token).await.unwrap_err();
        assert!(matches!(err, CoreError::Cancelled));
        assert!(*destroyed.lock().unwrap());
    }

    #[tokio::test]
    async fn looping_output_is_reported_and_container_destroyed() {
        let reg = registry();
        let job = reg
            .create(
                scan_core::JobKind::Scan(scan_core::ScanPayload {
                    scan_id: "c1".into(),
                    target: "https://example.com".into(),
                    template_selector: scan_core::TemplateSelector::All,
                }),
                None,
            )
            .await
            .unwrap();

        let destroyed = Arc::new(StdMutex::new(false));
        let lines: Vec<&'static str> = std::iter::repeat("retrying connection").take(45).collect();
        let runtime: Arc<dyn ContainerRuntime> = Arc::new(FakeRuntime {
            log_lines: lines,
            wait_exit: 0,
            destroyed: Arc::clone(&destroyed),
        });

        let request = ScanRequest {
            job_id: job.id,
            image: "projectdiscovery/nuclei:latest".into(),
            target: "https://example.com".into(),
            command: vec![],
            timeout: Duration::from_secs(60),
        };

        let err = run_scan(runtime, reg, request, CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, CoreError::LoopDetected));
        assert!(*destroyed.lock().unwrap());
    }
}
