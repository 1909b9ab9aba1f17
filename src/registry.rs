use crate::aggregator::ExpectedResult;
use crate::config::{Driver, PluginDefinition};
use crate::error::{AggregatorError, Result};
use async_trait::async_trait;

/// Seam standing in for "ask the orchestrator for cluster inventory".
/// A `Forbidden` response yields an empty node list rather than a fatal
/// error; any other error is fatal to startup.
#[async_trait]
pub trait NodeLister: Send + Sync {
    async fn list_nodes(&self) -> std::result::Result<Vec<String>, NodeListError>;
}

#[derive(Debug, Clone)]
pub enum NodeListError {
    Forbidden,
    Other(String),
}

/// Lists nodes via the Kubernetes API; the production `NodeLister`.
pub struct KubeNodeLister {
    client: kube::Client,
}

impl KubeNodeLister {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl NodeLister for KubeNodeLister {
    async fn list_nodes(&self) -> std::result::Result<Vec<String>, NodeListError> {
        use k8s_openapi::api::core::v1::Node;
        use kube::api::{Api, ListParams};

        let nodes: Api<Node> = Api::all(self.client.clone());
        match nodes.list(&ListParams::default()).await {
            Ok(list) => Ok(list
                .items
                .into_iter()
                .filter_map(|n| n.metadata.name)
                .collect()),
            Err(kube::Error::Api(resp)) if resp.code == 403 => Err(NodeListError::Forbidden),
            Err(e) => Err(NodeListError::Other(e.to_string())),
        }
    }
}

/// Immutable `(plugin, node)` map built once at startup, shared read-only
/// for the rest of the run.
pub struct Registry {
    expected: Vec<ExpectedResult>,
}

impl Registry {
    pub async fn build(
        plugins: &[PluginDefinition],
        lister: &dyn NodeLister,
    ) -> Result<Self> {
        let mut expected = Vec::new();

        for plugin in plugins {
            match plugin.driver {
                Driver::DaemonSet => {
                    let nodes = match lister.list_nodes().await {
                        Ok(nodes) => nodes,
                        Err(NodeListError::Forbidden) => Vec::new(),
                        Err(NodeListError::Other(reason)) => {
                            return Err(AggregatorError::FatalStartup(format!(
                                "listing cluster inventory for plugin '{}': {reason}",
                                plugin.plugin_name
                            )));
                        }
                    };
                    for node in nodes {
                        expected.push(ExpectedResult::new(plugin.plugin_name.clone(), node));
                    }
                }
                Driver::Job => {
                    expected.push(ExpectedResult::new(plugin.plugin_name.clone(), ""));
                }
            }
        }

        Ok(Self { expected })
    }

    pub fn expected(&self) -> &[ExpectedResult] {
        &self.expected
    }

    pub fn into_expected(self) -> Vec<ExpectedResult> {
        self.expected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedLister(Vec<String>);

    #[async_trait]
    impl NodeLister for FixedLister {
        async fn list_nodes(&self) -> std::result::Result<Vec<String>, NodeListError> {
            Ok(self.0.clone())
        }
    }

    struct ForbiddenLister;

    #[async_trait]
    impl NodeLister for ForbiddenLister {
        async fn list_nodes(&self) -> std::result::Result<Vec<String>, NodeListError> {
            Err(NodeListError::Forbidden)
        }
    }

    fn daemonset(name: &str) -> PluginDefinition {
        PluginDefinition {
            plugin_name: name.to_string(),
            driver: Driver::DaemonSet,
            image: "example/plugin".to_string(),
            image_pull_policy: "IfNotPresent".to_string(),
            image_pull_secrets: vec![],
            service_account_name: None,
            skip_cleanup: false,
            extra_volumes: vec![],
            pod_spec_overrides: None,
            annotations: Default::default(),
            timeout_seconds: None,
        }
    }

    fn job(name: &str) -> PluginDefinition {
        PluginDefinition {
            driver: Driver::Job,
            ..daemonset(name)
        }
    }

    #[tokio::test]
    async fn job_plugin_expects_exactly_one_global_result() {
        let plugins = vec![job("e2e")];
        let registry = Registry::build(&plugins, &FixedLister(vec![])).await.unwrap();
        assert_eq!(registry.expected().len(), 1);
        assert_eq!(registry.expected()[0].node, "global");
    }

    #[tokio::test]
    async fn daemonset_plugin_expects_one_per_node() {
        let plugins = vec![daemonset("systemd_logs")];
        let lister = FixedLister(vec!["node1".to_string(), "node2".to_string()]);
        let registry = Registry::build(&plugins, &lister).await.unwrap();
        assert_eq!(registry.expected().len(), 2);
    }

    #[tokio::test]
    async fn forbidden_inventory_lookup_yields_empty_list_not_error() {
        let plugins = vec![daemonset("systemd_logs")];
        let registry = Registry::build(&plugins, &ForbiddenLister).await.unwrap();
        assert_eq!(registry.expected().len(), 0);
    }
}
