use crate::config::PluginDefinition;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Container, EnvVar, Pod, PodSpec, PodTemplateSpec, Volume};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use std::time::Duration;

pub const PLUGIN_LABEL: &str = "aggregatord.io/plugin";
pub const NODE_LABEL: &str = "aggregatord.io/node";

/// Grace window before an unready/stuck pod is declared failing; the same
/// default both `ImagePullBackOff` and silent-termination checks use.
pub const DEFAULT_GRACE_WINDOW: Duration = Duration::from_secs(300);

pub fn pod_labels(plugin: &str, node: Option<&str>) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(PLUGIN_LABEL.to_string(), plugin.to_string());
    if let Some(node) = node {
        labels.insert(NODE_LABEL.to_string(), node.to_string());
    }
    labels
}

pub fn label_selector(plugin: &str, node: Option<&str>) -> String {
    match node {
        Some(node) => format!("{PLUGIN_LABEL}={plugin},{NODE_LABEL}={node}"),
        None => format!("{PLUGIN_LABEL}={plugin}"),
    }
}

/// Builds the pod spec for one plugin instance (the single Job-style pod, or
/// one of a DaemonSet-style plugin's per-node pods). `pod_spec_overrides` is
/// merge-patched onto the generated JSON afterward by the caller, mirroring
/// how the teacher's env-var substitution layers onto a parsed config.
pub fn build_pod(
    def: &PluginDefinition,
    namespace: &str,
    node: Option<&str>,
    aggregator_address: &str,
    progress_port: u16,
    results_dir: &str,
    client_cert_pem: &str,
    client_key_pem: &str,
    ca_cert_pem: &str,
) -> serde_json::Value {
    let name = match node {
        Some(node) => format!("{}-{}", def.plugin_name, sanitize(node)),
        None => def.plugin_name.clone(),
    };

    let mut labels = pod_labels(&def.plugin_name, node);
    for (k, v) in &def.annotations {
        labels.insert(k.clone(), v.clone());
    }

    let mut env = vec![
        EnvVar {
            name: "AGGREGATOR_ADDRESS".to_string(),
            value: Some(aggregator_address.to_string()),
            ..Default::default()
        },
        EnvVar {
            name: "PROGRESS_PORT".to_string(),
            value: Some(progress_port.to_string()),
            ..Default::default()
        },
        EnvVar {
            name: "RESULTS_DIR".to_string(),
            value: Some(results_dir.to_string()),
            ..Default::default()
        },
        EnvVar {
            name: "NODE_NAME".to_string(),
            value: Some(node.unwrap_or("global").to_string()),
            ..Default::default()
        },
    ];
    // Client material is handed to the plugin via env rather than a mounted
    // secret: the CA and every cert are per-run and in-memory only, so there
    // is nothing durable to back a Kubernetes Secret object with.
    env.push(EnvVar {
        name: "AGGREGATOR_CLIENT_CERT".to_string(),
        value: Some(client_cert_pem.to_string()),
        ..Default::default()
    });
    env.push(EnvVar {
        name: "AGGREGATOR_CLIENT_KEY".to_string(),
        value: Some(client_key_pem.to_string()),
        ..Default::default()
    });
    env.push(EnvVar {
        name: "AGGREGATOR_CA_CERT".to_string(),
        value: Some(ca_cert_pem.to_string()),
        ..Default::default()
    });

    let container = Container {
        name: "plugin".to_string(),
        image: Some(def.image.clone()),
        image_pull_policy: Some(def.image_pull_policy.clone()),
        env: Some(env),
        ..Default::default()
    };

    let pod = Pod {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![container],
            restart_policy: Some("Never".to_string()),
            service_account_name: def.service_account_name.clone(),
            image_pull_secrets: (!def.image_pull_secrets.is_empty()).then(|| {
                def.image_pull_secrets
                    .iter()
                    .map(|name| k8s_openapi::api::core::v1::LocalObjectReference {
                        name: name.clone(),
                    })
                    .collect()
            }),
            volumes: (!def.extra_volumes.is_empty()).then(|| {
                def.extra_volumes
                    .iter()
                    .filter_map(|v| serde_json::from_value::<Volume>(v.clone()).ok())
                    .collect()
            }),
            ..Default::default()
        }),
        ..Default::default()
    };

    let mut value = serde_json::to_value(&pod).expect("Pod always serializes");
    if let Some(overrides) = &def.pod_spec_overrides {
        merge_json(&mut value, overrides);
    }
    value
}

fn sanitize(node: &str) -> String {
    node.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect()
}

fn merge_json(base: &mut serde_json::Value, patch: &serde_json::Value) {
    match (base, patch) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(patch_map)) => {
            for (k, v) in patch_map {
                merge_json(base_map.entry(k.clone()).or_insert(serde_json::Value::Null), v);
            }
        }
        (base_slot, patch_value) => {
            *base_slot = patch_value.clone();
        }
    }
}

/// `PodSpec`/status pair the failure predicate operates on.
pub struct PodFailureInput<'a> {
    pub pod: &'a Pod,
    pub grace_window: Duration,
    pub now: DateTime<Utc>,
}

/// Mirrors spec §4.5's pod-failure predicate. Returns the reason a pod is
/// considered failing, or `None` if it still looks healthy.
pub fn pod_failure_reason(input: &PodFailureInput) -> Option<String> {
    let status = input.pod.status.as_ref()?;

    if let Some(conditions) = &status.conditions {
        for cond in conditions {
            if cond.type_ == "Unschedulable" && cond.status == "True" {
                return Some(format!(
                    "pod unschedulable: {}",
                    cond.message.clone().unwrap_or_default()
                ));
            }
        }
    }

    let container_statuses = status.container_statuses.as_deref().unwrap_or(&[]);
    for cs in container_statuses {
        if cs.restart_count > 2 {
            return Some(format!(
                "container {} restarted {} times",
                cs.name, cs.restart_count
            ));
        }

        if let Some(state) = &cs.state {
            if let Some(waiting) = &state.waiting {
                let reason = waiting.reason.as_deref().unwrap_or("");
                if reason == "ImagePullBackOff" || reason == "ErrImagePull" {
                    if let Some(start_time) = status.start_time.as_ref() {
                        let age = input.now.signed_duration_since(start_time.0);
                        if age.to_std().unwrap_or_default() > input.grace_window {
                            return Some(format!(
                                "container {} stuck in {reason} for more than {:?}",
                                cs.name, input.grace_window
                            ));
                        }
                    }
                }
            }

            if let Some(terminated) = &state.terminated {
                if let Some(finished_at) = &terminated.finished_at {
                    let age = input.now.signed_duration_since(finished_at.0);
                    if age.to_std().unwrap_or_default() > input.grace_window {
                        return Some(format!(
                            "container {} terminated at {:?} without uploading results",
                            cs.name, finished_at.0
                        ));
                    }
                }
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateTerminated, ContainerStateWaiting, ContainerStatus, PodCondition,
        PodStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn pod_with_status(status: PodStatus) -> Pod {
        Pod {
            status: Some(status),
            ..Default::default()
        }
    }

    #[test]
    fn unschedulable_condition_is_failing() {
        let pod = pod_with_status(PodStatus {
            conditions: Some(vec![PodCondition {
                type_: "Unschedulable".to_string(),
                status: "True".to_string(),
                message: Some("insufficient cpu".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        });
        let input = PodFailureInput {
            pod: &pod,
            grace_window: DEFAULT_GRACE_WINDOW,
            now: Utc::now(),
        };
        assert!(pod_failure_reason(&input).unwrap().contains("insufficient cpu"));
    }

    #[test]
    fn restart_count_over_two_is_failing() {
        let pod = pod_with_status(PodStatus {
            container_statuses: Some(vec![ContainerStatus {
                name: "plugin".to_string(),
                restart_count: 3,
                ..Default::default()
            }]),
            ..Default::default()
        });
        let input = PodFailureInput {
            pod: &pod,
            grace_window: DEFAULT_GRACE_WINDOW,
            now: Utc::now(),
        };
        assert!(pod_failure_reason(&input).is_some());
    }

    #[test]
    fn healthy_pod_is_not_failing() {
        let pod = pod_with_status(PodStatus {
            container_statuses: Some(vec![ContainerStatus {
                name: "plugin".to_string(),
                restart_count: 0,
                state: Some(ContainerState {
                    running: Some(Default::default()),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ..Default::default()
        });
        let input = PodFailureInput {
            pod: &pod,
            grace_window: DEFAULT_GRACE_WINDOW,
            now: Utc::now(),
        };
        assert!(pod_failure_reason(&input).is_none());
    }

    #[test]
    fn stuck_image_pull_past_grace_window_is_failing() {
        let old_start = Utc::now() - chrono::Duration::seconds(600);
        let pod = pod_with_status(PodStatus {
            start_time: Some(Time(old_start)),
            container_statuses: Some(vec![ContainerStatus {
                name: "plugin".to_string(),
                state: Some(ContainerState {
                    waiting: Some(ContainerStateWaiting {
                        reason: Some("ImagePullBackOff".to_string()),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ..Default::default()
        });
        let input = PodFailureInput {
            pod: &pod,
            grace_window: Duration::from_secs(300),
            now: Utc::now(),
        };
        assert!(pod_failure_reason(&input).is_some());
    }

    #[test]
    fn silent_termination_past_grace_window_is_failing() {
        let old_finish = Utc::now() - chrono::Duration::seconds(600);
        let pod = pod_with_status(PodStatus {
            container_statuses: Some(vec![ContainerStatus {
                name: "plugin".to_string(),
                state: Some(ContainerState {
                    terminated: Some(ContainerStateTerminated {
                        finished_at: Some(Time(old_finish)),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ..Default::default()
        });
        let input = PodFailureInput {
            pod: &pod,
            grace_window: Duration::from_secs(300),
            now: Utc::now(),
        };
        assert!(pod_failure_reason(&input).is_some());
    }
}
