use serde_json::Value;

use crate::crds::{ComparePatch, PatchOp};
use crate::error::AppResult;

/// Result of comparing one desired object against its live counterpart.
#[derive(Clone, Debug, PartialEq)]
pub enum DiffOutcome {
    /// A compare rule removed the resource from the plan.
    Ignored,
    Unchanged,
    /// JSON merge patch (live to desired) describing the difference.
    Changed(String),
}

/// Metadata the API server owns; never user-authoritative, never drift.
const VOLATILE_METADATA: &[&str] = &[
    "resourceVersion",
    "uid",
    "generation",
    "creationTimestamp",
    "managedFields",
    "selfLink",
];

fn strip_volatile(value: &mut Value) {
    if let Some(obj) = value.as_object_mut() {
        obj.remove("status");
        if let Some(metadata) = obj.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            for field in VOLATILE_METADATA {
                metadata.remove(*field);
            }
            if let Some(annotations) = metadata
                .get_mut("annotations")
                .and_then(|a| a.as_object_mut())
            {
                annotations.remove("kubectl.kubernetes.io/last-applied-configuration");
                annotations.remove("deployment.kubernetes.io/revision");
            }
        }
    }
}

fn kind_of(value: &Value) -> &str {
    value.get("kind").and_then(|k| k.as_str()).unwrap_or("")
}

/// Admission controllers inject CA bundles into webhook configurations; a
/// populated live caBundle must not count as drift.
fn strip_webhook_ca_bundles(live: &mut Value, desired: &mut Value) {
    let kind = kind_of(live);
    if kind != "ValidatingWebhookConfiguration" && kind != "MutatingWebhookConfiguration" {
        return;
    }
    let live_hooks = live.get_mut("webhooks").and_then(|w| w.as_array_mut());
    let Some(live_hooks) = live_hooks else { return };

    let mut injected = Vec::new();
    for (i, hook) in live_hooks.iter_mut().enumerate() {
        let config = hook.get_mut("clientConfig").and_then(|c| c.as_object_mut());
        if let Some(config) = config {
            let populated = config
                .get("caBundle")
                .and_then(|b| b.as_str())
                .map(|b| !b.is_empty())
                .unwrap_or(false);
            if populated {
                config.remove("caBundle");
                injected.push(i);
            }
        }
    }

    if let Some(desired_hooks) = desired.get_mut("webhooks").and_then(|w| w.as_array_mut()) {
        for i in injected {
            if let Some(config) = desired_hooks
                .get_mut(i)
                .and_then(|h| h.get_mut("clientConfig"))
                .and_then(|c| c.as_object_mut())
            {
                config.remove("caBundle");
            }
        }
    }
}

/// The control plane composes aggregated ClusterRole rules; the literal
/// rules list is not ours to compare.
fn strip_aggregated_role_rules(live: &mut Value, desired: &mut Value) {
    if kind_of(live) != "ClusterRole" {
        return;
    }
    let aggregated = live.get("aggregationRule").is_some() || desired.get("aggregationRule").is_some();
    if !aggregated {
        return;
    }
    if let Some(obj) = live.as_object_mut() {
        obj.remove("rules");
    }
    if let Some(obj) = desired.as_object_mut() {
        obj.remove("rules");
    }
}

/// Removes the value a JSON pointer addresses. Missing paths are fine;
/// array elements are cut out, map keys dropped.
fn remove_pointer(value: &mut Value, pointer: &str) {
    let Some((parent, token)) = pointer.rsplit_once('/') else {
        return;
    };
    let Some(parent) = value.pointer_mut(parent) else {
        return;
    };
    match parent {
        Value::Object(map) => {
            let token = token.replace("~1", "/").replace("~0", "~");
            map.remove(&token);
        }
        Value::Array(list) => {
            if let Ok(index) = token.parse::<usize>() {
                if index < list.len() {
                    list.remove(index);
                }
            }
        }
        _ => {}
    }
}

/// Applies the rule's JSON-patch operations one at a time, tolerating
/// operations whose path does not exist on this side of the diff.
fn apply_patch_ops(value: &mut Value, ops: &[PatchOp]) {
    for op in ops {
        if op.op == "ignore" {
            continue;
        }
        let mut raw = serde_json::Map::new();
        raw.insert("op".to_string(), Value::String(op.op.clone()));
        raw.insert("path".to_string(), Value::String(op.path.clone()));
        if let Some(v) = &op.value {
            raw.insert("value".to_string(), v.clone());
        }
        let patch: Result<json_patch::Patch, _> =
            serde_json::from_value(Value::Array(vec![Value::Object(raw)]));
        if let Ok(patch) = patch {
            if let Err(e) = json_patch::patch(value, &patch) {
                log::debug!("compare patch op {} {} skipped: {}", op.op, op.path, e);
            }
        }
    }
}

/// Does a compare rule target this object? Kind must match; apiVersion,
/// namespace and name are wildcards when empty.
pub fn rule_matches(
    rule: &ComparePatch,
    api_version: &str,
    kind: &str,
    namespace: &str,
    name: &str,
) -> bool {
    if rule.kind != kind {
        return false;
    }
    if !rule.api_version.is_empty() && rule.api_version != api_version {
        return false;
    }
    if !rule.namespace.is_empty() && rule.namespace != namespace {
        return false;
    }
    if !rule.name.is_empty() && rule.name != name {
        return false;
    }
    true
}

/// JSON merge patch turning `from` into `to`. Fields absent from `to` become
/// explicit nulls, nested maps recurse, everything else replaces wholesale.
fn merge_patch_diff(from: &Value, to: &Value) -> Value {
    match (from, to) {
        (Value::Object(from_map), Value::Object(to_map)) => {
            let mut patch = serde_json::Map::new();
            for (key, to_value) in to_map {
                match from_map.get(key) {
                    Some(from_value) if from_value == to_value => {}
                    Some(from_value) => {
                        patch.insert(key.clone(), merge_patch_diff(from_value, to_value));
                    }
                    None => {
                        patch.insert(key.clone(), to_value.clone());
                    }
                }
            }
            for key in from_map.keys() {
                if !to_map.contains_key(key) {
                    patch.insert(key.clone(), Value::Null);
                }
            }
            Value::Object(patch)
        }
        _ => to.clone(),
    }
}

/// Drops null leaves from a merge patch: maps lose null-valued entries (and
/// collapse when nothing is left), arrays lose null elements. A patch made
/// of nothing but nulls collapses to None.
fn prune_nulls(value: Value) -> Option<Value> {
    match value {
        Value::Object(map) => {
            let pruned: serde_json::Map<String, Value> = map
                .into_iter()
                .filter_map(|(k, v)| prune_nulls(v).map(|v| (k, v)))
                .collect();
            if pruned.is_empty() {
                None
            } else {
                Some(Value::Object(pruned))
            }
        }
        Value::Array(list) => Some(Value::Array(
            list.into_iter().filter(|v| !v.is_null()).collect(),
        )),
        Value::Null => None,
        other => Some(other),
    }
}

/// Compares a live object against its desired form under the bundle's
/// compare rules. The live object is normalised, the desired form is merged
/// onto it (so fields the bundle never set cannot drift), and the remaining
/// difference is reported as a merge patch.
pub fn compare(live: &Value, desired: &Value, rules: &[&ComparePatch]) -> AppResult<DiffOutcome> {
    if rules
        .iter()
        .any(|r| r.operations.iter().any(|op| op.op == "ignore"))
    {
        return Ok(DiffOutcome::Ignored);
    }

    let mut live_n = live.clone();
    let mut desired_n = desired.clone();
    strip_volatile(&mut live_n);
    strip_volatile(&mut desired_n);
    strip_webhook_ca_bundles(&mut live_n, &mut desired_n);
    strip_aggregated_role_rules(&mut live_n, &mut desired_n);

    for rule in rules {
        apply_patch_ops(&mut live_n, &rule.operations);
        apply_patch_ops(&mut desired_n, &rule.operations);
        for pointer in &rule.json_pointers {
            remove_pointer(&mut live_n, pointer);
            remove_pointer(&mut desired_n, pointer);
        }
    }

    let mut predicted = live_n.clone();
    json_patch::merge(&mut predicted, &desired_n);

    if predicted == live_n {
        return Ok(DiffOutcome::Unchanged);
    }

    let patch = merge_patch_diff(&live_n, &predicted);
    match prune_nulls(patch) {
        Some(patch) if patch.as_object().map(|m| !m.is_empty()).unwrap_or(true) => {
            Ok(DiffOutcome::Changed(serde_json::to_string(&patch)?))
        }
        _ => Ok(DiffOutcome::Unchanged),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(external_name: &str) -> Value {
        serde_json::json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {"name": "svc-test", "namespace": "ns-a"},
            "spec": {
                "externalName": external_name,
                "ports": [{"port": 80, "targetPort": 9376, "name": "myport"}]
            }
        })
    }

    #[test]
    fn identical_objects_are_unchanged() {
        let mut live = service("original");
        live["metadata"]["resourceVersion"] = "12345".into();
        live["metadata"]["uid"] = "abc".into();
        live["status"] = serde_json::json!({"loadBalancer": {}});

        let outcome = compare(&live, &service("original"), &[]).unwrap();
        assert_eq!(outcome, DiffOutcome::Unchanged);
    }

    #[test]
    fn modified_field_produces_patch() {
        let live = service("modified");
        let outcome = compare(&live, &service("original"), &[]).unwrap();
        match outcome {
            DiffOutcome::Changed(patch) => {
                assert!(patch.contains("externalName"));
                assert!(patch.contains("original"));
            }
            other => panic!("expected change, got {:?}", other),
        }
    }

    #[test]
    fn live_only_fields_do_not_drift() {
        let mut live = service("original");
        live["spec"]["clusterIP"] = "10.43.0.7".into();
        live["spec"]["type"] = "ClusterIP".into();

        let outcome = compare(&live, &service("original"), &[]).unwrap();
        assert_eq!(outcome, DiffOutcome::Unchanged);
    }

    #[test]
    fn ignore_rule_drops_resource() {
        let rule = ComparePatch {
            kind: "Service".to_string(),
            operations: vec![PatchOp {
                op: "ignore".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let outcome = compare(&service("x"), &service("y"), &[&rule]).unwrap();
        assert_eq!(outcome, DiffOutcome::Ignored);
    }

    #[test]
    fn remove_op_collapses_difference() {
        let mut live = service("original");
        live["spec"]["ports"][0]["port"] = 4242.into();

        let rule = ComparePatch {
            kind: "Service".to_string(),
            operations: vec![PatchOp {
                op: "remove".to_string(),
                path: "/spec/ports".to_string(),
                value: None,
            }],
            ..Default::default()
        };
        let outcome = compare(&live, &service("original"), &[&rule]).unwrap();
        assert_eq!(outcome, DiffOutcome::Unchanged);

        // without the rule the port change is drift
        let outcome = compare(&live, &service("original"), &[]).unwrap();
        assert!(matches!(outcome, DiffOutcome::Changed(_)));
    }

    #[test]
    fn json_pointers_are_ignored_in_diff() {
        let mut live = service("original");
        live["spec"]["externalName"] = "whatever".into();

        let rule = ComparePatch {
            kind: "Service".to_string(),
            json_pointers: vec!["/spec/externalName".to_string()],
            ..Default::default()
        };
        let outcome = compare(&live, &service("original"), &[&rule]).unwrap();
        assert_eq!(outcome, DiffOutcome::Unchanged);
    }

    #[test]
    fn null_only_patches_collapse_to_unchanged() {
        let live = serde_json::json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": {"name": "cm-test"},
            "data": {"foo": "bar", "stale": "still-here"}
        });
        let desired = serde_json::json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": {"name": "cm-test"},
            "data": {"foo": "bar", "stale": null}
        });
        let outcome = compare(&live, &desired, &[]).unwrap();
        assert_eq!(outcome, DiffOutcome::Unchanged);
    }

    #[test]
    fn injected_ca_bundle_is_not_drift() {
        let live = serde_json::json!({
            "apiVersion": "admissionregistration.k8s.io/v1",
            "kind": "ValidatingWebhookConfiguration",
            "metadata": {"name": "hooks"},
            "webhooks": [{"name": "a.example.com", "clientConfig": {"caBundle": "aW5qZWN0ZWQ="}}]
        });
        let desired = serde_json::json!({
            "apiVersion": "admissionregistration.k8s.io/v1",
            "kind": "ValidatingWebhookConfiguration",
            "metadata": {"name": "hooks"},
            "webhooks": [{"name": "a.example.com", "clientConfig": {}}]
        });
        let outcome = compare(&live, &desired, &[]).unwrap();
        assert_eq!(outcome, DiffOutcome::Unchanged);
    }

    #[test]
    fn aggregated_role_rules_are_not_drift() {
        let live = serde_json::json!({
            "apiVersion": "rbac.authorization.k8s.io/v1",
            "kind": "ClusterRole",
            "metadata": {"name": "aggregate"},
            "aggregationRule": {"clusterRoleSelectors": []},
            "rules": [{"apiGroups": [""], "resources": ["pods"], "verbs": ["get"]}]
        });
        let mut desired = live.clone();
        desired["rules"] = serde_json::json!([]);
        let outcome = compare(&live, &desired, &[]).unwrap();
        assert_eq!(outcome, DiffOutcome::Unchanged);
    }

    #[test]
    fn merge_patch_diff_marks_removals_with_null() {
        let from = serde_json::json!({"a": 1, "b": {"c": 2, "d": 3}});
        let to = serde_json::json!({"a": 1, "b": {"c": 9}});
        let patch = merge_patch_diff(&from, &to);
        assert_eq!(patch, serde_json::json!({"b": {"c": 9, "d": null}}));
    }

    #[test]
    fn prune_removes_null_array_entries() {
        let pruned = prune_nulls(serde_json::json!({"list": [1, null, 2], "gone": null})).unwrap();
        assert_eq!(pruned, serde_json::json!({"list": [1, 2]}));
    }

    #[test]
    fn rule_matching_wildcards() {
        let rule = ComparePatch {
            kind: "Service".to_string(),
            namespace: "ns-a".to_string(),
            ..Default::default()
        };
        assert!(rule_matches(&rule, "v1", "Service", "ns-a", "anything"));
        assert!(!rule_matches(&rule, "v1", "Service", "ns-b", "anything"));
        assert!(!rule_matches(&rule, "v1", "ConfigMap", "ns-a", "anything"));

        let named = ComparePatch {
            kind: "Service".to_string(),
            name: "svc-test".to_string(),
            ..Default::default()
        };
        assert!(rule_matches(&named, "v1", "Service", "ns-a", "svc-test"));
        assert!(!rule_matches(&named, "v1", "Service", "ns-a", "other"));
    }
}
