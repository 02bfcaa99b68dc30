use std::collections::BTreeMap;
use std::io::Read;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use itertools::Itertools;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams};
use kube::Client;
use serde::Deserialize;

use crate::error::{AppError, AppResult};

/// Secret type Helm uses for its release storage.
pub const RELEASE_SECRET_TYPE: &str = "helm.sh/release.v1";

/// `namespace/name:revision` reference to one stored release revision.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReleaseRef {
    pub namespace: String,
    pub name: String,
    pub version: u32,
}

impl ReleaseRef {
    pub fn parse(s: &str) -> AppResult<Self> {
        let (path, version) = s
            .rsplit_once(':')
            .ok_or_else(|| AppError::NoResourceId(s.to_string()))?;
        let (namespace, name) = path
            .split_once('/')
            .ok_or_else(|| AppError::NoResourceId(s.to_string()))?;
        let version = version
            .parse()
            .map_err(|_| AppError::NoResourceId(s.to_string()))?;
        if namespace.is_empty() || name.is_empty() {
            return Err(AppError::NoResourceId(s.to_string()));
        }
        Ok(Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            version,
        })
    }
}

impl std::fmt::Display for ReleaseRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}:{}", self.namespace, self.name, self.version)
    }
}

/// The subset of Helm's release record the agent reads back.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Release {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    pub version: u32,
    #[serde(default)]
    pub manifest: String,
    #[serde(default)]
    pub info: ReleaseInfo,
    #[serde(default)]
    pub chart: ChartRecord,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ReleaseInfo {
    #[serde(default)]
    pub status: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ChartRecord {
    #[serde(default)]
    pub metadata: ChartMetadata,
}

#[derive(Clone, Debug, Default, Deserialize, serde::Serialize)]
pub struct ChartMetadata {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, rename = "kubeVersion", skip_serializing_if = "Option::is_none")]
    pub kube_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl Release {
    pub fn reference(&self) -> ReleaseRef {
        ReleaseRef {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
            version: self.version,
        }
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.chart
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .map(|s| s.as_str())
    }
}

pub fn secret_name(release: &str, version: u32) -> String {
    format!("sh.helm.release.v1.{}.v{}", release, version)
}

/// Decodes the `release` payload of a storage Secret: base64, then gzip,
/// then JSON.
pub fn decode_release(secret: &Secret) -> AppResult<Release> {
    let data = secret
        .data
        .as_ref()
        .and_then(|d| d.get("release"))
        .ok_or_else(|| AppError::Helm("release secret has no payload".to_string()))?;

    let compressed = BASE64
        .decode(&data.0)
        .map_err(|e| AppError::Helm(format!("release payload base64: {}", e)))?;

    let json = if compressed.starts_with(&[0x1f, 0x8b]) {
        let mut out = Vec::new();
        flate2::read::GzDecoder::new(&compressed[..])
            .read_to_end(&mut out)
            .map_err(|e| AppError::Helm(format!("release payload gzip: {}", e)))?;
        out
    } else {
        compressed
    };

    let mut release: Release = serde_json::from_slice(&json)?;
    if release.namespace.is_empty() {
        release.namespace = secret.metadata.namespace.clone().unwrap_or_default();
    }
    Ok(release)
}

/// Splits a rendered manifest stream into dynamic objects. Empty documents
/// and comment-only documents are skipped.
pub fn manifest_objects(manifest: &str) -> AppResult<Vec<DynamicObject>> {
    let mut objects = Vec::new();
    for doc in serde_yaml::Deserializer::from_str(manifest) {
        let value = serde_yaml::Value::deserialize(doc)?;
        if value.is_null() {
            continue;
        }
        let json = serde_json::to_value(&value)?;
        if json.get("kind").and_then(|k| k.as_str()).is_none() {
            continue;
        }
        let obj: DynamicObject = serde_json::from_value(json)?;
        objects.push(obj);
    }
    Ok(objects)
}

/// Read access to Helm's release storage on the local cluster.
#[derive(Clone)]
pub struct ReleaseStore {
    client: Client,
}

impl ReleaseStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// One exact revision. Resolves to the no-resource-ID sentinel when the
    /// revision is gone, so callers can skip dependent work.
    pub async fn get(&self, reference: &ReleaseRef) -> AppResult<Release> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &reference.namespace);
        match api.get(&secret_name(&reference.name, reference.version)).await {
            Ok(secret) => decode_release(&secret),
            Err(kube::Error::Api(e)) if e.code == 404 => {
                Err(AppError::NoResourceId(reference.to_string()))
            }
            Err(e) => Err(AppError::Kubernetes(e)),
        }
    }

    /// Full history of one release, newest first.
    pub async fn history(&self, namespace: &str, release: &str) -> AppResult<Vec<Release>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default().labels(&format!("owner=helm,name={}", release));
        let secrets = api.list(&lp).await.map_err(AppError::Kubernetes)?;

        let mut releases: Vec<Release> = secrets
            .items
            .iter()
            .filter(|s| s.type_.as_deref() == Some(RELEASE_SECRET_TYPE))
            .filter_map(|s| decode_release(s).ok())
            .collect();
        releases.sort_by_key(|r| std::cmp::Reverse(r.version));
        Ok(releases)
    }

    pub async fn latest(&self, namespace: &str, release: &str) -> AppResult<Option<Release>> {
        Ok(self.history(namespace, release).await?.into_iter().next())
    }

    /// Latest revision of every release on the cluster.
    pub async fn list_all(&self) -> AppResult<Vec<Release>> {
        let api: Api<Secret> = Api::all(self.client.clone());
        let lp = ListParams::default().labels("owner=helm");
        let secrets = api.list(&lp).await.map_err(AppError::Kubernetes)?;

        let releases = secrets
            .items
            .iter()
            .filter(|s| s.type_.as_deref() == Some(RELEASE_SECRET_TYPE))
            .filter_map(|s| decode_release(s).ok())
            .sorted_by(|a, b| {
                (&a.namespace, &a.name, std::cmp::Reverse(a.version)).cmp(&(
                    &b.namespace,
                    &b.name,
                    std::cmp::Reverse(b.version),
                ))
            })
            .dedup_by(|a, b| a.namespace == b.namespace && a.name == b.name)
            .collect();
        Ok(releases)
    }

    /// Drops one stored revision. Used to discard failed corrective
    /// upgrades when the bundle asks for no failure history.
    pub async fn delete_revision(&self, reference: &ReleaseRef) -> AppResult<()> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &reference.namespace);
        match api
            .delete(
                &secret_name(&reference.name, reference.version),
                &DeleteParams::default(),
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(AppError::Kubernetes(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::ByteString;
    use std::io::Write as _;

    fn release_secret(json: &serde_json::Value, gzip: bool) -> Secret {
        let raw = serde_json::to_vec(json).unwrap();
        let payload = if gzip {
            let mut enc =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            enc.write_all(&raw).unwrap();
            enc.finish().unwrap()
        } else {
            raw
        };
        let mut secret = Secret::default();
        secret.metadata.namespace = Some("ns-a".to_string());
        secret.type_ = Some(RELEASE_SECRET_TYPE.to_string());
        secret.data = Some(
            [(
                "release".to_string(),
                ByteString(BASE64.encode(payload).into_bytes()),
            )]
            .into(),
        );
        secret
    }

    #[test]
    fn release_ref_round_trip() {
        let parsed = ReleaseRef::parse("ns-a/my-bundle:3").unwrap();
        assert_eq!(parsed.namespace, "ns-a");
        assert_eq!(parsed.name, "my-bundle");
        assert_eq!(parsed.version, 3);
        assert_eq!(parsed.to_string(), "ns-a/my-bundle:3");

        assert!(ReleaseRef::parse("no-version").is_err());
        assert!(ReleaseRef::parse("name-only:2").is_err());
        assert!(ReleaseRef::parse("ns/name:not-a-number").is_err());
    }

    #[test]
    fn secret_names_match_helm_storage() {
        assert_eq!(secret_name("my-bundle", 2), "sh.helm.release.v1.my-bundle.v2");
    }

    #[test]
    fn decodes_gzipped_release() {
        let secret = release_secret(
            &serde_json::json!({
                "name": "my-bundle",
                "version": 2,
                "manifest": "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cm-test\n",
                "info": {"status": "deployed"},
                "chart": {"metadata": {
                    "name": "my-bundle", "version": "0.1.0",
                    "annotations": {"flotilla.dev/bundle-id": "my-bundle"}
                }}
            }),
            true,
        );
        let release = decode_release(&secret).unwrap();
        assert_eq!(release.version, 2);
        assert_eq!(release.namespace, "ns-a");
        assert_eq!(release.info.status, "deployed");
        assert_eq!(release.annotation("flotilla.dev/bundle-id"), Some("my-bundle"));
        assert_eq!(release.reference().to_string(), "ns-a/my-bundle:2");
    }

    #[test]
    fn decodes_plain_json_release() {
        let secret = release_secret(
            &serde_json::json!({"name": "r", "version": 1, "namespace": "explicit"}),
            false,
        );
        let release = decode_release(&secret).unwrap();
        assert_eq!(release.namespace, "explicit");
    }

    #[test]
    fn manifest_splits_documents() {
        let manifest = "\
---
apiVersion: v1
kind: ConfigMap
metadata:
  name: cm-test
data:
  foo: bar
---
# a comment-only document keeps the stream valid
---
apiVersion: v1
kind: Service
metadata:
  name: svc-test
";
        let objects = manifest_objects(manifest).unwrap();
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[0].types.as_ref().unwrap().kind, "ConfigMap");
        assert_eq!(objects[1].types.as_ref().unwrap().kind, "Service");
    }
}
