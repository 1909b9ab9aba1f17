use crate::aggregator::{Aggregator, Metrics, ResultPayload};
use crate::annotator::Annotator;
use crate::ca::Authority;
use crate::config::Config;
use crate::error::{AggregatorError, Result, TIMEOUT_SENTINEL};
use crate::registry::{KubeNodeLister, Registry};
use crate::supervisor::Supervisor;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Wires every component together for one run: builds the registry,
/// constructs the CA, starts the TLS server / annotator / supervisors, and
/// races them against the overall deadline. Grounded in the teacher's
/// `server::lifecycle::ServerManager::run` (start everything, wait on a
/// shutdown signal, tear everything down).
pub struct RunCoordinator {
    config: Config,
    client: kube::Client,
}

impl RunCoordinator {
    pub fn new(config: Config, client: kube::Client) -> Self {
        Self { config, client }
    }

    pub async fn run(self) -> Result<()> {
        let lister = KubeNodeLister::new(self.client.clone());
        let registry = Registry::build(&self.config.plugins, &lister).await?;
        let nodes = collect_nodes(&registry);

        let authority =
            Arc::new(Authority::generate().map_err(|e| AggregatorError::FatalStartup(e.to_string()))?);
        let server_cert = authority
            .issue_server(self.config.advertise_host())
            .map_err(|e| AggregatorError::FatalStartup(e.to_string()))?;
        let ca_cert_pem = authority.root_cert_pem();

        let metrics = Arc::new(Metrics::new());
        let aggregator = Arc::new(Aggregator::new(
            registry.into_expected(),
            self.config.output_dir.clone(),
            self.config.retry_window(),
            metrics,
        ));

        let run_cancel = CancellationToken::new();

        let aggregator_pod_name = self
            .config
            .aggregator_pod_name
            .clone()
            .unwrap_or_else(|| "aggregator".to_string());

        let annotator = Annotator::new(
            self.client.clone(),
            self.config.namespace.clone(),
            aggregator_pod_name,
            self.config.status_annotation_name.clone(),
            aggregator.clone(),
        );
        let annotator_cancel = run_cancel.child_token();
        let annotator_handle = tokio::spawn(async move { annotator.run(annotator_cancel).await });

        let server_cancel = run_cancel.child_token();
        let server_handle = {
            let bind_address = self.config.bind_address.clone();
            let bind_port = self.config.bind_port;
            let aggregator = aggregator.clone();
            let cert_chain = server_cert.cert_chain_pem.clone();
            let key_pem = server_cert.private_key_pem.clone();
            let ca_pem = ca_cert_pem.clone();
            tokio::spawn(async move {
                crate::http::run(
                    &bind_address,
                    bind_port,
                    &cert_chain,
                    &key_pem,
                    &ca_pem,
                    aggregator,
                    server_cancel,
                )
                .await
            })
        };

        let mut supervisor_handles = Vec::new();
        for plugin in &self.config.plugins {
            let supervisor = Arc::new(Supervisor::new(
                plugin.clone(),
                self.config.namespace.clone(),
                self.client.clone(),
                aggregator.clone(),
                nodes.clone(),
                self.config.advertise_address.clone(),
                self.config.progress_port,
                self.config.plugin_results_dir.clone(),
            ));
            let cancel = run_cancel.child_token();
            let deadline = plugin
                .effective_timeout(self.config.timeout())
                .map(|d| tokio::time::Instant::now() + d);
            let authority = authority.clone();

            let handle = tokio::spawn(async move { supervisor.run(&authority, deadline, cancel).await });
            supervisor_handles.push(handle);
        }

        let deadline = self.config.timeout();
        let graceful_period = self.config.graceful_shutdown_period();

        let outcome = race_until_done(&aggregator, deadline, graceful_period, &run_cancel).await;

        run_cancel.cancel();
        let _ = server_handle.await;
        for handle in supervisor_handles {
            let _ = handle.await;
        }
        let _ = annotator_handle.await;

        outcome
    }
}

/// On a hard-deadline timeout, the run is stuck waiting on whatever expected
/// keys never received a result. Each outstanding key gets its own synthetic
/// error so it persists under its own plugin/node path instead of a single
/// fake entry that no registered plugin ever owns.
async fn synthesize_timeouts(aggregator: &Arc<Aggregator>) {
    let snapshot = aggregator.snapshot().await;
    let received: std::collections::HashSet<&String> = snapshot.received.iter().collect();

    for key in &snapshot.expected {
        if received.contains(key) {
            continue;
        }
        let (plugin, node) = key
            .split_once('/')
            .map(|(p, n)| (p.to_string(), n.to_string()))
            .unwrap_or_else(|| (key.clone(), "global".to_string()));
        let timeout_result = ResultPayload::synthetic_error(plugin, node, TIMEOUT_SENTINEL);
        let _ = aggregator.process_result(timeout_result).await;
    }
}

fn collect_nodes(registry: &Registry) -> Vec<String> {
    registry
        .expected()
        .iter()
        .map(|e| e.node.clone())
        .filter(|n| n != "global")
        .collect()
}

async fn race_until_done(
    aggregator: &Arc<Aggregator>,
    deadline: Option<Duration>,
    graceful_period: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    let wait = aggregator.wait(cancel);
    tokio::pin!(wait);

    match deadline {
        None => wait.await,
        Some(deadline) => {
            let graceful_deadline = deadline.saturating_sub(graceful_period);
            tokio::select! {
                result = &mut wait => result,
                _ = tokio::time::sleep(graceful_deadline) => {
                    tracing::info!("entering graceful shutdown window, cancelling plugin work");
                    cancel.cancel();
                    match tokio::time::timeout(graceful_period, &mut wait).await {
                        Ok(result) => result,
                        Err(_) => {
                            synthesize_timeouts(aggregator).await;
                            Err(AggregatorError::Timeout { plugin: "run".to_string() })
                        }
                    }
                }
            }
        }
    }
}
