use crate::error::{AggregatorError, Result, SupervisorError};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::Client;

pub const FIELD_MANAGER: &str = "aggregatord";

/// Lists pods in `namespace` matching a label selector, the idiom used
/// throughout for both supervisor monitoring and annotator pod lookup.
pub async fn list_pods_by_label(client: &Client, namespace: &str, selector: &str) -> Result<Vec<Pod>> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let list_params = ListParams::default().labels(selector);
    let list = pods.list(&list_params).await?;
    Ok(list.items)
}

pub async fn delete_pod(client: &Client, namespace: &str, name: &str) -> Result<()> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    match pods.delete(name, &Default::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
        Err(e) => Err(AggregatorError::Kube(e)),
    }
}

/// Merge-patches `annotations[key] = value` onto a pod. Last-writer-wins;
/// never read-modify-write.
pub async fn patch_pod_annotation(
    client: &Client,
    namespace: &str,
    pod_name: &str,
    key: &str,
    value: serde_json::Value,
) -> Result<()> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let patch = serde_json::json!({
        "metadata": {
            "annotations": {
                key: value,
            }
        }
    });
    let params = PatchParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    };
    pods.patch(pod_name, &params, &Patch::Merge(patch)).await?;
    Ok(())
}

pub async fn create_pod(client: &Client, namespace: &str, pod: &Pod) -> Result<Pod> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    pods.create(&Default::default(), pod).await.map_err(|e| {
        AggregatorError::Supervisor(SupervisorError::LaunchFailed {
            plugin: pod
                .metadata
                .name
                .clone()
                .unwrap_or_else(|| "<unknown>".to_string()),
            reason: e.to_string(),
        })
    })
}
