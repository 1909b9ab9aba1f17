pub mod pod;

use crate::aggregator::{Aggregator, ResultPayload};
use crate::ca::{Authority, IssuedCert};
use crate::config::{Driver, PluginDefinition};
use crate::error::{AggregatorError, Result, SupervisorError};
use k8s_openapi::api::core::v1::Pod;
use kube::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const MONITOR_PERIOD: Duration = Duration::from_secs(10);
/// Extra time given to the ingestion consumer past the monitor deadline so a
/// timeout-generated synthetic result isn't dropped by a race with shutdown.
const INGESTION_GRACE: Duration = Duration::from_secs(10);

/// One per plugin, in its own task: launches pods, watches their health,
/// emits synthetic results on failure, and self-terminates on completion,
/// cancellation, or its own deadline.
pub struct Supervisor {
    def: PluginDefinition,
    namespace: String,
    client: Client,
    aggregator: Arc<Aggregator>,
    nodes: Vec<String>,
    aggregator_address: String,
    progress_port: u16,
    plugin_results_dir: String,
    created_pods: Mutex<Vec<String>>,
}

impl Supervisor {
    pub fn new(
        def: PluginDefinition,
        namespace: String,
        client: Client,
        aggregator: Arc<Aggregator>,
        nodes: Vec<String>,
        aggregator_address: String,
        progress_port: u16,
        plugin_results_dir: String,
    ) -> Self {
        Self {
            def,
            namespace,
            client,
            aggregator,
            nodes,
            aggregator_address,
            progress_port,
            plugin_results_dir,
            created_pods: Mutex::new(Vec::new()),
        }
    }

    pub async fn run(
        &self,
        authority: &Authority,
        deadline: Option<Instant>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let (ingest_tx, mut ingest_rx) = mpsc::channel::<ResultPayload>(16);
        let launched_at = chrono::Utc::now();

        if let Err(reason) = self.launch(authority).await {
            let _ = ingest_tx
                .send(ResultPayload::synthetic_error(
                    self.def.plugin_name.clone(),
                    "global",
                    reason,
                ))
                .await;
        }

        let monitor_cancel = cancel.child_token();
        let monitor = self.monitor_loop(ingest_tx.clone(), monitor_cancel.clone(), launched_at);
        let watcher = self.result_watcher(monitor_cancel.clone());

        tokio::pin!(monitor);
        tokio::pin!(watcher);

        let deadline_sleep = async {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(deadline_sleep);

        tokio::select! {
            _ = &mut monitor => {}
            _ = &mut watcher => { monitor_cancel.cancel(); }
            _ = &mut deadline_sleep => { monitor_cancel.cancel(); }
            _ = cancel.cancelled() => { monitor_cancel.cancel(); }
        }

        // Drain whatever synthetic results are already queued, bounded by a
        // small grace window so a deadline-triggered error isn't dropped.
        drop(ingest_tx);
        let _ = tokio::time::timeout(INGESTION_GRACE, async {
            while let Some(result) = ingest_rx.recv().await {
                self.aggregator.process_result(result).await;
            }
        })
        .await;

        if !self.def.skip_cleanup {
            self.cleanup().await?;
        }

        Ok(())
    }

    async fn launch(&self, authority: &Authority) -> std::result::Result<(), String> {
        let ca_cert_pem = authority.root_cert_pem();

        let targets: Vec<Option<String>> = match self.def.driver {
            Driver::Job => vec![None],
            Driver::DaemonSet => self.nodes.iter().cloned().map(Some).collect(),
        };

        for node in targets {
            let client_name = match &node {
                Some(node) => format!("{}-{node}", self.def.plugin_name),
                None => self.def.plugin_name.clone(),
            };
            let issued = authority
                .issue_client(&client_name)
                .map_err(|e| e.to_string())?;

            let pod_value = pod::build_pod(
                &self.def,
                &self.namespace,
                node.as_deref(),
                &self.aggregator_address,
                self.progress_port,
                &self.plugin_results_dir,
                &issued.cert_chain_pem,
                &issued.private_key_pem,
                &ca_cert_pem,
            );

            let pod: Pod = serde_json::from_value(pod_value).map_err(|e| e.to_string())?;
            let pod_name = pod.metadata.name.clone().unwrap_or_default();

            match crate::k8s::create_pod(&self.client, &self.namespace, &pod).await {
                Ok(_) => {
                    self.created_pods.lock().await.push(pod_name);
                }
                Err(e) => return Err(e.to_string()),
            }
        }

        Ok(())
    }

    async fn monitor_loop(
        &self,
        ingest: mpsc::Sender<ResultPayload>,
        cancel: CancellationToken,
        launched_at: chrono::DateTime<chrono::Utc>,
    ) {
        let mut ticker = tokio::time::interval(MONITOR_PERIOD);
        let mut reported: std::collections::HashSet<String> = std::collections::HashSet::new();

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancel.cancelled() => return,
            }

            let selector = pod::label_selector(&self.def.plugin_name, None);
            let pods = match crate::k8s::list_pods_by_label(&self.client, &self.namespace, &selector).await {
                Ok(pods) => pods,
                Err(e) => {
                    tracing::warn!(plugin = %self.def.plugin_name, error = %e, "orchestrator-transient: pod listing failed, retrying next tick");
                    continue;
                }
            };

            match self.def.driver {
                Driver::Job => {
                    if pods.len() != 1 {
                        if reported.insert("global".to_string()) {
                            let _ = ingest
                                .send(ResultPayload::synthetic_error(
                                    self.def.plugin_name.clone(),
                                    "global",
                                    format!("expected exactly one pod, found {}", pods.len()),
                                ))
                                .await;
                            return;
                        }
                        continue;
                    }
                    let input = pod::PodFailureInput {
                        pod: &pods[0],
                        grace_window: pod::DEFAULT_GRACE_WINDOW,
                        now: chrono::Utc::now(),
                    };
                    if let Some(reason) = pod::pod_failure_reason(&input) {
                        if reported.insert("global".to_string()) {
                            let _ = ingest
                                .send(ResultPayload::synthetic_error(
                                    self.def.plugin_name.clone(),
                                    "global",
                                    reason,
                                ))
                                .await;
                            return;
                        }
                    }
                }
                Driver::DaemonSet => {
                    for node in &self.nodes {
                        if reported.contains(node) {
                            continue;
                        }
                        if self.aggregator.plugin_has_results(&self.def.plugin_name).await {
                            return;
                        }
                        let pod = pods.iter().find(|p| {
                            p.metadata
                                .labels
                                .as_ref()
                                .and_then(|l| l.get(pod::NODE_LABEL))
                                .map(|n| n == node)
                                .unwrap_or(false)
                        });

                        match pod {
                            None => {
                                let age = chrono::Utc::now().signed_duration_since(launched_at);
                                if age.to_std().unwrap_or_default() > pod::DEFAULT_GRACE_WINDOW {
                                    reported.insert(node.clone());
                                    let _ = ingest
                                        .send(ResultPayload::synthetic_error(
                                            self.def.plugin_name.clone(),
                                            node.clone(),
                                            format!(
                                                "pod not scheduled on node within {:?}",
                                                pod::DEFAULT_GRACE_WINDOW
                                            ),
                                        ))
                                        .await;
                                }
                            }
                            Some(pod) => {
                                let input = pod::PodFailureInput {
                                    pod,
                                    grace_window: pod::DEFAULT_GRACE_WINDOW,
                                    now: chrono::Utc::now(),
                                };
                                if let Some(reason) = pod::pod_failure_reason(&input) {
                                    reported.insert(node.clone());
                                    let _ = ingest
                                        .send(ResultPayload::synthetic_error(
                                            self.def.plugin_name.clone(),
                                            node.clone(),
                                            reason,
                                        ))
                                        .await;
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    async fn result_watcher(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(Duration::from_secs(2));
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancel.cancelled() => return,
            }
            if self.aggregator.plugin_has_results(&self.def.plugin_name).await {
                return;
            }
        }
    }

    pub async fn cleanup(&self) -> Result<()> {
        let pods = self.created_pods.lock().await;
        for name in pods.iter() {
            if let Err(e) = crate::k8s::delete_pod(&self.client, &self.namespace, name).await {
                return Err(AggregatorError::Supervisor(SupervisorError::CleanupFailed {
                    plugin: self.def.plugin_name.clone(),
                    reason: e.to_string(),
                }));
            }
        }
        Ok(())
    }
}
