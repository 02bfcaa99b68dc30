use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::Api;
use kube::Client;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::crds::HelmOptions;
use crate::error::{AppError, AppResult};

const DEFAULT_VALUES_KEY: &str = "values.yaml";

/// Recursive map merge; `overlay` wins, non-map values replace wholesale.
pub fn deep_merge(base: &mut BTreeMap<String, Value>, overlay: BTreeMap<String, Value>) {
    for (key, value) in overlay {
        let merged = match (base.remove(&key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                let mut nested: BTreeMap<String, Value> = existing.into_iter().collect();
                deep_merge(&mut nested, incoming.into_iter().collect());
                Value::Object(nested.into_iter().collect())
            }
            (_, value) => value,
        };
        base.insert(key, merged);
    }
}

fn parse_values_blob(blob: &[u8]) -> AppResult<BTreeMap<String, Value>> {
    if blob.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(BTreeMap::new());
    }
    let yaml: serde_yaml::Value = serde_yaml::from_slice(blob)?;
    if yaml.is_null() {
        return Ok(BTreeMap::new());
    }
    let json = serde_json::to_value(yaml)?;
    match json {
        Value::Object(map) => Ok(map.into_iter().collect()),
        other => Err(AppError::Config(format!(
            "values must be a map, got {}",
            other
        ))),
    }
}

/// Resolves the bundle's effective Helm values: literal `values` first, then
/// every `valuesFrom` source in order (later sources win).
pub async fn resolve_values(
    local: &Client,
    default_namespace: &str,
    helm: &HelmOptions,
) -> AppResult<BTreeMap<String, Value>> {
    let mut values = helm.values.clone().unwrap_or_default();

    for source in helm.values_from.as_deref().unwrap_or(&[]) {
        if let Some(key_ref) = &source.config_map_key_ref {
            let ns = key_ref.namespace.as_deref().unwrap_or(default_namespace);
            let key = key_ref.key.as_deref().unwrap_or(DEFAULT_VALUES_KEY);
            let api: Api<ConfigMap> = Api::namespaced(local.clone(), ns);
            let cm = api.get(&key_ref.name).await.map_err(AppError::Kubernetes)?;
            let blob = cm
                .data
                .as_ref()
                .and_then(|d| d.get(key))
                .ok_or_else(|| {
                    AppError::NotFound(format!("key {} in configmap {}/{}", key, ns, key_ref.name))
                })?;
            deep_merge(&mut values, parse_values_blob(blob.as_bytes())?);
        }
        if let Some(key_ref) = &source.secret_key_ref {
            let ns = key_ref.namespace.as_deref().unwrap_or(default_namespace);
            let key = key_ref.key.as_deref().unwrap_or(DEFAULT_VALUES_KEY);
            let api: Api<Secret> = Api::namespaced(local.clone(), ns);
            let secret = api.get(&key_ref.name).await.map_err(AppError::Kubernetes)?;
            let blob = secret
                .data
                .as_ref()
                .and_then(|d| d.get(key))
                .ok_or_else(|| {
                    AppError::NotFound(format!("key {} in secret {}/{}", key, ns, key_ref.name))
                })?;
            deep_merge(&mut values, parse_values_blob(&blob.0)?);
        }
    }

    Ok(values)
}

/// Hash over a sidecar Secret's data blobs, keys sorted. Must match the
/// BundleDeployment's `valuesHash` before the Secret contents are trusted.
pub fn hash_secret_values(secret: &Secret) -> String {
    let mut hasher = Sha256::new();
    if let Some(data) = &secret.data {
        for (key, value) in data {
            hasher.update(key.as_bytes());
            hasher.update(&value.0);
        }
    }
    hex::encode(hasher.finalize())
}

/// Hydrates Helm options from the sidecar Secret: every data blob is a
/// values chunk, merged in key order over whatever the options carry inline.
pub fn merge_secret_values(helm: &mut HelmOptions, secret: &Secret) -> AppResult<()> {
    let mut values = helm.values.clone().unwrap_or_default();
    if let Some(data) = &secret.data {
        for blob in data.values() {
            deep_merge(&mut values, parse_values_blob(&blob.0)?);
        }
    }
    helm.values = Some(values);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::ByteString;

    fn map(json: serde_json::Value) -> BTreeMap<String, Value> {
        match json {
            Value::Object(m) => m.into_iter().collect(),
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn deep_merge_nests_and_replaces() {
        let mut base = map(serde_json::json!({
            "image": {"tag": "v1", "repo": "nginx"},
            "replicas": 1
        }));
        deep_merge(
            &mut base,
            map(serde_json::json!({
                "image": {"tag": "v2"},
                "replicas": 3,
                "extra": true
            })),
        );

        assert_eq!(base["image"]["tag"], "v2");
        assert_eq!(base["image"]["repo"], "nginx");
        assert_eq!(base["replicas"], 3);
        assert_eq!(base["extra"], true);
    }

    #[test]
    fn values_blob_parses_yaml() {
        let values = parse_values_blob(b"replicas: 2\nimage:\n  tag: v9\n").unwrap();
        assert_eq!(values["replicas"], 2);
        assert_eq!(values["image"]["tag"], "v9");

        assert!(parse_values_blob(b"- not\n- a\n- map\n").is_err());
        assert!(parse_values_blob(b"").unwrap().is_empty());
    }

    #[test]
    fn secret_hash_is_key_order_stable() {
        let mut secret = Secret::default();
        secret.data = Some(
            [
                ("b.yaml".to_string(), ByteString(b"y: 2".to_vec())),
                ("a.yaml".to_string(), ByteString(b"x: 1".to_vec())),
            ]
            .into(),
        );
        let first = hash_secret_values(&secret);

        // BTreeMap iteration already sorts; rebuilding in the other order
        // must not change the digest.
        let mut reordered = Secret::default();
        reordered.data = Some(
            [
                ("a.yaml".to_string(), ByteString(b"x: 1".to_vec())),
                ("b.yaml".to_string(), ByteString(b"y: 2".to_vec())),
            ]
            .into(),
        );
        assert_eq!(first, hash_secret_values(&reordered));
    }

    #[test]
    fn sidecar_values_merge_over_inline() {
        let mut helm = HelmOptions {
            values: Some(map(serde_json::json!({"replicas": 1, "name": "keep"}))),
            ..Default::default()
        };
        let mut secret = Secret::default();
        secret.data = Some(
            [(
                "values.yaml".to_string(),
                ByteString(b"replicas: 5".to_vec()),
            )]
            .into(),
        );
        merge_secret_values(&mut helm, &secret).unwrap();
        let values = helm.values.unwrap();
        assert_eq!(values["replicas"], 5);
        assert_eq!(values["name"], "keep");
    }
}
