use crate::aggregator::Aggregator;
use crate::status::{derive_overall_status, PluginStatus, RunState, Status};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const TICK_PERIOD: Duration = Duration::from_secs(5);
const JITTER_FACTOR: f64 = 1.2;

pub struct Annotator {
    client: kube::Client,
    namespace: String,
    pod_name: String,
    annotation_key: String,
    aggregator: Arc<Aggregator>,
}

impl Annotator {
    pub fn new(
        client: kube::Client,
        namespace: String,
        pod_name: String,
        annotation_key: String,
        aggregator: Arc<Aggregator>,
    ) -> Self {
        Self {
            client,
            namespace,
            pod_name,
            annotation_key,
            aggregator,
        }
    }

    /// Fires immediately on start, then at a ~5s jittered interval. Patch
    /// errors are logged and retried next tick; they never stop the run. On
    /// cancellation, one last annotation attempt is made before returning.
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            self.publish_once().await;

            let jitter = rand::thread_rng().gen_range(1.0..JITTER_FACTOR);
            let next = Duration::from_secs_f64(TICK_PERIOD.as_secs_f64() * jitter);

            tokio::select! {
                _ = tokio::time::sleep(next) => {}
                _ = cancel.cancelled() => {
                    self.publish_once().await;
                    return;
                }
            }
        }
    }

    async fn publish_once(&self) {
        let status = self.build_status().await;
        let value = match serde_json::to_value(&status) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize status annotation");
                return;
            }
        };

        if let Err(e) = crate::k8s::patch_pod_annotation(
            &self.client,
            &self.namespace,
            &self.pod_name,
            &self.annotation_key,
            serde_json::Value::String(value.to_string()),
        )
        .await
        {
            tracing::warn!(error = %e, "status annotation patch failed, will retry next tick");
        }
    }

    async fn build_status(&self) -> Status {
        let snapshot = self.aggregator.snapshot().await;
        let mut plugins = Vec::with_capacity(snapshot.expected.len());

        for key in &snapshot.expected {
            let (plugin, node) = key
                .split_once('/')
                .map(|(p, n)| (p.to_string(), n.to_string()))
                .unwrap_or_else(|| (key.clone(), "global".to_string()));

            let received = snapshot.received.contains(key);
            let failed = snapshot.synthetic_failures.contains(key);
            let progress = self.aggregator.snapshot_progress(key).await;

            let (status, result_status) = if failed {
                (RunState::Failed, "failed".to_string())
            } else if received {
                (RunState::Complete, "complete".to_string())
            } else {
                (RunState::Running, "running".to_string())
            };

            plugins.push(PluginStatus {
                plugin,
                node,
                status,
                result_status,
                result_status_counts: HashMap::new(),
                progress,
            });
        }

        let overall = derive_overall_status(&plugins).to_string();
        Status {
            plugins,
            status: overall,
            tar_info: None,
        }
    }
}
