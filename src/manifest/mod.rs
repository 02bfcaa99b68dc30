use std::io::Read;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use kube::api::Api;
use kube::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::crds::Content;
use crate::error::{AppError, AppResult};

/// A bundle's resource files, materialised in memory and ready for chart
/// assembly.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Manifest {
    pub content_id: String,
    pub options_hash: String,
    #[serde(default)]
    pub resources: Vec<ResourceFile>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct ResourceFile {
    /// Path within the bundle, e.g. `configmap.yaml` or `chart/Chart.yaml`.
    pub name: String,
    pub content: String,
    /// `base64+gz` marks a file whose content is compressed; anything else
    /// is plain text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
}

impl Manifest {
    /// True when the bundle ships a real Helm chart rather than raw
    /// manifests.
    pub fn is_chart(&self) -> bool {
        self.resources.iter().any(|r| {
            r.name == "Chart.yaml" || r.name.ends_with("/Chart.yaml")
        })
    }
}

/// Splits a deployment ID into its content reference and options hash.
/// Format: `<contentID>:<optionsHash>`.
pub fn parse_deployment_id(id: &str) -> AppResult<(String, String)> {
    match id.split_once(':') {
        Some((content, options)) if !content.is_empty() => {
            Ok((content.to_string(), options.to_string()))
        }
        _ => Err(AppError::Content(format!(
            "malformed deployment ID {:?}",
            id
        ))),
    }
}

fn decode_base64_gzip(data: &str) -> AppResult<Vec<u8>> {
    let compressed = BASE64
        .decode(data.trim())
        .map_err(|e| AppError::Content(format!("base64 decode: {}", e)))?;
    let mut out = Vec::new();
    flate2::read::GzDecoder::new(&compressed[..])
        .read_to_end(&mut out)
        .map_err(|e| AppError::Content(format!("gzip decode: {}", e)))?;
    Ok(out)
}

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Decodes a Content payload into resource files, verifying the checksum
/// against the decompressed bytes when one is declared.
pub fn decode_content(content: &Content) -> AppResult<Vec<ResourceFile>> {
    let payload = content
        .spec
        .content
        .as_deref()
        .ok_or_else(|| AppError::Content("content payload is empty".to_string()))?;

    let raw = decode_base64_gzip(payload)?;

    if let Some(want) = content.spec.sha256sum.as_deref() {
        let got = sha256_hex(&raw);
        if got != want {
            return Err(AppError::Content(format!(
                "checksum mismatch: expected {}, computed {}",
                want, got
            )));
        }
    }

    let mut resources: Vec<ResourceFile> = serde_json::from_slice(&raw)?;
    for file in &mut resources {
        if file.encoding.as_deref() == Some("base64+gz") {
            let text = decode_base64_gzip(&file.content)?;
            file.content = String::from_utf8(text)
                .map_err(|e| AppError::Content(format!("{}: {}", file.name, e)))?;
            file.encoding = None;
        }
    }
    Ok(resources)
}

/// Resolves deployment IDs to bundle content stored on the upstream cluster.
#[derive(Clone)]
pub struct ContentLoader {
    upstream: Client,
}

impl ContentLoader {
    pub fn new(upstream: Client) -> Self {
        Self { upstream }
    }

    /// Fetches and decodes the Content referenced by `deployment_id`. A
    /// missing Content maps to the no-resource-ID error class: nothing the
    /// agent can do until upstream fixes the reference.
    pub async fn load(&self, deployment_id: &str) -> AppResult<Manifest> {
        let (content_id, options_hash) = parse_deployment_id(deployment_id)?;

        let api: Api<Content> = Api::all(self.upstream.clone());
        let content = match api.get(&content_id).await {
            Ok(c) => c,
            Err(kube::Error::Api(e)) if e.code == 404 => {
                return Err(AppError::NoResourceId(content_id));
            }
            Err(e) => return Err(AppError::Kubernetes(e)),
        };

        let resources = decode_content(&content)?;
        log::debug!(
            "Loaded content {} ({} resource files)",
            content_id,
            resources.len()
        );

        Ok(Manifest {
            content_id,
            options_hash,
            resources,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::ContentSpec;
    use std::io::Write as _;

    fn encode_base64_gzip(data: &[u8]) -> String {
        let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(data).unwrap();
        BASE64.encode(enc.finish().unwrap())
    }

    fn content_with(files: &[ResourceFile], checksum: bool) -> Content {
        let raw = serde_json::to_vec(files).unwrap();
        Content::new(
            "s-abc",
            ContentSpec {
                content: Some(encode_base64_gzip(&raw)),
                sha256sum: checksum.then(|| sha256_hex(&raw)),
            },
        )
    }

    #[test]
    fn deployment_id_parses() {
        let (content, options) = parse_deployment_id("s-abc:1a2b3c").unwrap();
        assert_eq!(content, "s-abc");
        assert_eq!(options, "1a2b3c");

        assert!(parse_deployment_id("no-separator").is_err());
        assert!(parse_deployment_id(":hash-only").is_err());
    }

    #[test]
    fn decodes_round_trip_with_checksum() {
        let files = vec![ResourceFile {
            name: "configmap.yaml".to_string(),
            content: "apiVersion: v1\nkind: ConfigMap".to_string(),
            encoding: None,
        }];
        let decoded = decode_content(&content_with(&files, true)).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].name, "configmap.yaml");
    }

    #[test]
    fn rejects_checksum_mismatch() {
        let files = vec![ResourceFile {
            name: "a.yaml".to_string(),
            content: "x: 1".to_string(),
            encoding: None,
        }];
        let mut content = content_with(&files, true);
        content.spec.sha256sum = Some("deadbeef".to_string());
        let err = decode_content(&content).unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[test]
    fn expands_per_file_compression() {
        let files = vec![ResourceFile {
            name: "big.yaml".to_string(),
            content: encode_base64_gzip(b"kind: Secret"),
            encoding: Some("base64+gz".to_string()),
        }];
        let decoded = decode_content(&content_with(&files, false)).unwrap();
        assert_eq!(decoded[0].content, "kind: Secret");
        assert!(decoded[0].encoding.is_none());
    }

    #[test]
    fn chart_detection() {
        let mut manifest = Manifest::default();
        assert!(!manifest.is_chart());
        manifest.resources.push(ResourceFile {
            name: "chart/Chart.yaml".to_string(),
            content: "name: test".to_string(),
            encoding: None,
        });
        assert!(manifest.is_chart());
    }
}
