use std::collections::BTreeMap;

use serde_json::Value;

use crate::crds::Summary;

fn int(value: &Value, pointer: &str) -> i64 {
    value.pointer(pointer).and_then(|v| v.as_i64()).unwrap_or(0)
}

fn text<'a>(value: &'a Value, pointer: &str) -> &'a str {
    value.pointer(pointer).and_then(|v| v.as_str()).unwrap_or("")
}

fn ready(state: &str) -> Summary {
    Summary {
        state: state.to_string(),
        error: false,
        transitioning: false,
        message: Vec::new(),
    }
}

fn transitioning(state: &str, message: String) -> Summary {
    Summary {
        state: state.to_string(),
        error: false,
        transitioning: true,
        message: vec![message],
    }
}

fn failed(state: &str, message: String) -> Summary {
    Summary {
        state: state.to_string(),
        error: true,
        transitioning: false,
        message: vec![message],
    }
}

/// A condition is ignored when every field of one ignore rule matches it.
fn condition_ignored(condition: &Value, ignore: &[BTreeMap<String, String>]) -> bool {
    ignore.iter().any(|rule| {
        !rule.is_empty()
            && rule.iter().all(|(field, want)| {
                condition
                    .get(field)
                    .and_then(|v| v.as_str())
                    .map(|got| got == want)
                    .unwrap_or(false)
            })
    })
}

fn conditions_summary(value: &Value, ignore: &[BTreeMap<String, String>]) -> Summary {
    let Some(conditions) = value
        .pointer("/status/conditions")
        .and_then(|c| c.as_array())
    else {
        return ready("active");
    };

    for condition in conditions {
        if condition_ignored(condition, ignore) {
            continue;
        }
        let type_ = text(condition, "/type");
        let status = text(condition, "/status");
        let message = text(condition, "/message");
        match (type_, status) {
            ("Ready", "False") => {
                return transitioning("notready", format!("Ready condition false: {}", message));
            }
            ("Failed" | "Stalled", "True") => {
                return failed("error", format!("{} condition true: {}", type_, message));
            }
            _ => {}
        }
    }
    ready("active")
}

fn deployment_summary(value: &Value) -> Summary {
    let desired = value
        .pointer("/spec/replicas")
        .and_then(|v| v.as_i64())
        .unwrap_or(1);
    let ready_replicas = int(value, "/status/readyReplicas");
    let updated = int(value, "/status/updatedReplicas");

    if updated < desired {
        return transitioning(
            "updating",
            format!("{}/{} replicas updated", updated, desired),
        );
    }
    if ready_replicas < desired {
        return transitioning(
            "updating",
            format!("{}/{} replicas ready", ready_replicas, desired),
        );
    }
    ready("active")
}

fn statefulset_summary(value: &Value) -> Summary {
    let desired = value
        .pointer("/spec/replicas")
        .and_then(|v| v.as_i64())
        .unwrap_or(1);
    let ready_replicas = int(value, "/status/readyReplicas");
    let current = text(value, "/status/currentRevision");
    let update = text(value, "/status/updateRevision");

    if ready_replicas < desired {
        return transitioning(
            "updating",
            format!("{}/{} replicas ready", ready_replicas, desired),
        );
    }
    if !update.is_empty() && current != update {
        return transitioning("updating", "revision rollout in progress".to_string());
    }
    ready("active")
}

fn daemonset_summary(value: &Value) -> Summary {
    let desired = int(value, "/status/desiredNumberScheduled");
    let ready_count = int(value, "/status/numberReady");
    if ready_count < desired {
        return transitioning("updating", format!("{}/{} pods ready", ready_count, desired));
    }
    ready("active")
}

fn pod_summary(value: &Value, ignore: &[BTreeMap<String, String>]) -> Summary {
    match text(value, "/status/phase") {
        "Succeeded" => ready("succeeded"),
        "Failed" => failed("failed", text(value, "/status/message").to_string()),
        "Running" => conditions_summary(value, ignore),
        phase => transitioning("pending", format!("pod phase {}", phase)),
    }
}

fn job_summary(value: &Value) -> Summary {
    if let Some(conditions) = value
        .pointer("/status/conditions")
        .and_then(|c| c.as_array())
    {
        for condition in conditions {
            let type_ = text(condition, "/type");
            let status = text(condition, "/status");
            if type_ == "Failed" && status == "True" {
                return failed("failed", text(condition, "/message").to_string());
            }
            if type_ == "Complete" && status == "True" {
                return ready("succeeded");
            }
        }
    }
    if int(value, "/status/succeeded") > 0 {
        return ready("succeeded");
    }
    transitioning("running", "job has not completed".to_string())
}

fn service_summary(value: &Value) -> Summary {
    if text(value, "/spec/type") == "LoadBalancer" {
        let ingress = value
            .pointer("/status/loadBalancer/ingress")
            .and_then(|v| v.as_array())
            .map(|a| !a.is_empty())
            .unwrap_or(false);
        if !ingress {
            return transitioning("pending", "load balancer is pending".to_string());
        }
    }
    ready("active")
}

fn pvc_summary(value: &Value) -> Summary {
    match text(value, "/status/phase") {
        "Bound" => ready("bound"),
        "Lost" => failed("lost", "claim lost its volume".to_string()),
        phase => transitioning("pending", format!("claim phase {}", phase)),
    }
}

/// Per-kind readiness. Kinds without a dedicated summariser fall back to
/// scanning `status.conditions` for a Ready condition.
pub fn summarize(value: &Value, ignore: &[BTreeMap<String, String>]) -> Summary {
    match value.get("kind").and_then(|k| k.as_str()).unwrap_or("") {
        "Deployment" => deployment_summary(value),
        "StatefulSet" => statefulset_summary(value),
        "DaemonSet" => daemonset_summary(value),
        "Pod" => pod_summary(value, ignore),
        "Job" => job_summary(value),
        "Service" => service_summary(value),
        "PersistentVolumeClaim" => pvc_summary(value),
        _ => conditions_summary(value, ignore),
    }
}

pub fn is_ready(summary: &Summary) -> bool {
    !summary.error && !summary.transitioning
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deployment_counts_replicas() {
        let ready_deploy = serde_json::json!({
            "kind": "Deployment",
            "spec": {"replicas": 3},
            "status": {"readyReplicas": 3, "updatedReplicas": 3}
        });
        assert!(is_ready(&summarize(&ready_deploy, &[])));

        let rolling = serde_json::json!({
            "kind": "Deployment",
            "spec": {"replicas": 3},
            "status": {"readyReplicas": 1, "updatedReplicas": 3}
        });
        let summary = summarize(&rolling, &[]);
        assert!(summary.transitioning);
        assert_eq!(summary.message, vec!["1/3 replicas ready"]);
    }

    #[test]
    fn pod_phases() {
        let failed_pod = serde_json::json!({
            "kind": "Pod",
            "status": {"phase": "Failed", "message": "oom killed"}
        });
        let summary = summarize(&failed_pod, &[]);
        assert!(summary.error);

        let pending = serde_json::json!({"kind": "Pod", "status": {"phase": "Pending"}});
        assert!(summarize(&pending, &[]).transitioning);

        let running = serde_json::json!({
            "kind": "Pod",
            "status": {"phase": "Running", "conditions": [{"type": "Ready", "status": "True"}]}
        });
        assert!(is_ready(&summarize(&running, &[])));
    }

    #[test]
    fn job_completion() {
        let complete = serde_json::json!({
            "kind": "Job",
            "status": {"conditions": [{"type": "Complete", "status": "True"}]}
        });
        assert!(is_ready(&summarize(&complete, &[])));

        let failed_job = serde_json::json!({
            "kind": "Job",
            "status": {"conditions": [{"type": "Failed", "status": "True", "message": "backoff"}]}
        });
        assert!(summarize(&failed_job, &[]).error);

        let running = serde_json::json!({"kind": "Job", "status": {"active": 1}});
        assert!(summarize(&running, &[]).transitioning);
    }

    #[test]
    fn service_load_balancer_waits_for_ingress() {
        let plain = serde_json::json!({"kind": "Service", "spec": {"type": "ClusterIP"}});
        assert!(is_ready(&summarize(&plain, &[])));

        let lb = serde_json::json!({
            "kind": "Service",
            "spec": {"type": "LoadBalancer"},
            "status": {"loadBalancer": {}}
        });
        assert!(summarize(&lb, &[]).transitioning);
    }

    #[test]
    fn pvc_phases() {
        let bound = serde_json::json!({"kind": "PersistentVolumeClaim", "status": {"phase": "Bound"}});
        assert!(is_ready(&summarize(&bound, &[])));

        let lost = serde_json::json!({"kind": "PersistentVolumeClaim", "status": {"phase": "Lost"}});
        assert!(summarize(&lost, &[]).error);
    }

    #[test]
    fn custom_resources_use_ready_condition() {
        let cr = serde_json::json!({
            "kind": "Database",
            "status": {"conditions": [{"type": "Ready", "status": "False", "message": "provisioning"}]}
        });
        let summary = summarize(&cr, &[]);
        assert!(summary.transitioning);
        assert!(summary.message[0].contains("provisioning"));
    }

    #[test]
    fn ignored_conditions_are_skipped() {
        let cr = serde_json::json!({
            "kind": "Database",
            "status": {"conditions": [{"type": "Ready", "status": "False", "message": "will never be"}]}
        });
        let ignore = vec![BTreeMap::from([
            ("type".to_string(), "Ready".to_string()),
            ("status".to_string(), "False".to_string()),
        ])];
        assert!(is_ready(&summarize(&cr, &ignore)));
    }

    #[test]
    fn objects_without_status_are_ready() {
        let cm = serde_json::json!({"kind": "ConfigMap", "data": {"foo": "bar"}});
        assert!(is_ready(&summarize(&cm, &[])));
    }
}
