use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use kube::api::DynamicObject;
use tempfile::TempDir;

use crate::error::{AppError, AppResult};
use crate::helm::release::ChartMetadata;
use crate::manifest::Manifest;

/// Chart annotation naming the owning BundleDeployment.
pub const BUNDLE_ID_ANNOTATION: &str = "flotilla.dev/bundle-id";
/// Chart annotation recording the impersonation identity used to install.
pub const SERVICE_ACCOUNT_ANNOTATION: &str = "flotilla.dev/service-account";

/// A chart directory on disk. Dropping it removes the backing temp dir, so
/// it must outlive any helm invocation that reads it.
pub struct ChartDir {
    _tmp: TempDir,
    pub path: PathBuf,
    pub metadata: ChartMetadata,
}

/// Helm chart names are DNS-ish; bundle IDs may not be.
fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    cleaned.trim_matches('-').to_string()
}

/// Directory prefix that holds `Chart.yaml`, e.g. `chart/` for a packaged
/// chart laid out under a single top-level directory.
fn chart_prefix(manifest: &Manifest) -> Option<String> {
    manifest
        .resources
        .iter()
        .filter_map(|r| {
            if r.name == "Chart.yaml" {
                Some(String::new())
            } else {
                r.name
                    .strip_suffix("/Chart.yaml")
                    .map(|p| format!("{}/", p))
            }
        })
        .min_by_key(|p| p.len())
}

/// Chart metadata of a chart bundle, read from its `Chart.yaml`.
pub fn chart_metadata(manifest: &Manifest) -> AppResult<Option<ChartMetadata>> {
    let prefix = match chart_prefix(manifest) {
        Some(p) => p,
        None => return Ok(None),
    };
    let chart_yaml = format!("{}Chart.yaml", prefix);
    let file = manifest
        .resources
        .iter()
        .find(|r| r.name == chart_yaml)
        .ok_or_else(|| AppError::Internal("chart prefix without Chart.yaml".to_string()))?;
    let metadata: ChartMetadata = serde_yaml::from_str(&file.content)?;
    Ok(Some(metadata))
}

fn write_file(root: &Path, rel: &str, content: &str) -> AppResult<()> {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content)?;
    Ok(())
}

fn stamp_chart_yaml(
    chart_yaml: &str,
    annotations: &BTreeMap<String, String>,
) -> AppResult<String> {
    let mut doc: serde_yaml::Mapping = serde_yaml::from_str(chart_yaml)?;
    let key = serde_yaml::Value::String("annotations".to_string());
    let existing = doc
        .entry(key)
        .or_insert_with(|| serde_yaml::Value::Mapping(Default::default()));
    if let serde_yaml::Value::Mapping(map) = existing {
        for (k, v) in annotations {
            map.insert(
                serde_yaml::Value::String(k.clone()),
                serde_yaml::Value::String(v.clone()),
            );
        }
    }
    Ok(serde_yaml::to_string(&doc)?)
}

/// Writes a chart bundle's files verbatim into a temp dir, with the
/// ownership annotations stamped into `Chart.yaml`. Used for rendering.
pub fn write_source_chart(
    manifest: &Manifest,
    annotations: &BTreeMap<String, String>,
) -> AppResult<ChartDir> {
    let prefix = chart_prefix(manifest)
        .ok_or_else(|| AppError::Internal("bundle has no Chart.yaml".to_string()))?;
    let tmp = tempfile::Builder::new().prefix("flotilla-chart-").tempdir()?;
    let root = tmp.path().join("chart");

    let mut metadata = ChartMetadata::default();
    for file in &manifest.resources {
        let Some(rel) = file.name.strip_prefix(&prefix) else {
            continue;
        };
        if rel == "Chart.yaml" {
            metadata = serde_yaml::from_str(&file.content)?;
            write_file(&root, rel, &stamp_chart_yaml(&file.content, annotations)?)?;
        } else {
            write_file(&root, rel, &file.content)?;
        }
    }

    let mut merged = metadata.annotations.take().unwrap_or_default();
    merged.extend(annotations.clone());
    metadata.annotations = Some(merged);

    Ok(ChartDir {
        path: root,
        metadata,
        _tmp: tmp,
    })
}

/// Prevents a second pass of Helm's template engine from interpreting
/// directives that survived rendering (or were literal data to begin with).
pub fn escape_templating(content: &str) -> String {
    content.replace("{{", "{{\"{{\"}}")
}

/// Synthesises the chart that actually gets installed: `Chart.yaml` carrying
/// the source chart's identity plus ownership annotations, and one template
/// holding the post-rendered objects.
pub fn write_rendered_chart(
    name: &str,
    source: Option<&ChartMetadata>,
    annotations: &BTreeMap<String, String>,
    objects: &[DynamicObject],
) -> AppResult<ChartDir> {
    let tmp = tempfile::Builder::new().prefix("flotilla-chart-").tempdir()?;
    let root = tmp.path().join("chart");

    let mut metadata = source.cloned().unwrap_or_default();
    if metadata.name.is_empty() {
        metadata.name = sanitize_name(name);
    }
    if metadata.version.is_empty() {
        metadata.version = "0.1.0".to_string();
    }
    let mut merged = metadata.annotations.take().unwrap_or_default();
    merged.extend(annotations.clone());
    metadata.annotations = Some(merged);

    let mut chart_yaml = serde_yaml::to_string(&serde_json::json!({
        "apiVersion": "v2",
        "name": metadata.name.clone(),
        "version": metadata.version.clone(),
    }))?;
    chart_yaml = stamp_chart_yaml(
        &chart_yaml,
        metadata.annotations.as_ref().unwrap_or(&Default::default()),
    )?;
    if let Some(kube_version) = metadata.kube_version.as_deref() {
        chart_yaml.push_str(&format!("kubeVersion: \"{}\"\n", kube_version));
    }
    write_file(&root, "Chart.yaml", &chart_yaml)?;
    write_file(&root, "values.yaml", "")?;

    let mut stream = String::new();
    for obj in objects {
        stream.push_str("---\n");
        stream.push_str(&serde_yaml::to_string(&serde_json::to_value(obj)?)?);
    }
    write_file(&root, "templates/objects.yaml", &escape_templating(&stream))?;

    Ok(ChartDir {
        path: root,
        metadata,
        _tmp: tmp,
    })
}

/// Concatenates a plain-manifest bundle into one rendered stream, skipping
/// anything that is not a Kubernetes manifest file.
pub fn raw_manifest_stream(manifest: &Manifest) -> String {
    let mut stream = String::new();
    for file in &manifest.resources {
        let lower = file.name.to_lowercase();
        if !(lower.ends_with(".yaml") || lower.ends_with(".yml") || lower.ends_with(".json")) {
            continue;
        }
        stream.push_str("---\n");
        stream.push_str(&file.content);
        if !file.content.ends_with('\n') {
            stream.push('\n');
        }
    }
    stream
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ResourceFile;

    fn chart_manifest() -> Manifest {
        Manifest {
            content_id: "s-abc".to_string(),
            options_hash: "h".to_string(),
            resources: vec![
                ResourceFile {
                    name: "chart/Chart.yaml".to_string(),
                    content: "apiVersion: v2\nname: nginx\nversion: 1.2.3\nkubeVersion: \">=1.20.0-0\"\n"
                        .to_string(),
                    encoding: None,
                },
                ResourceFile {
                    name: "chart/templates/deploy.yaml".to_string(),
                    content: "kind: Deployment\n".to_string(),
                    encoding: None,
                },
            ],
        }
    }

    fn annotations() -> BTreeMap<String, String> {
        [
            (BUNDLE_ID_ANNOTATION.to_string(), "my-bundle".to_string()),
            (SERVICE_ACCOUNT_ANNOTATION.to_string(), String::new()),
        ]
        .into()
    }

    #[test]
    fn chart_metadata_found_under_prefix() {
        let metadata = chart_metadata(&chart_manifest()).unwrap().unwrap();
        assert_eq!(metadata.name, "nginx");
        assert_eq!(metadata.version, "1.2.3");
        assert_eq!(metadata.kube_version.as_deref(), Some(">=1.20.0-0"));

        let plain = Manifest::default();
        assert!(chart_metadata(&plain).unwrap().is_none());
    }

    #[test]
    fn source_chart_is_written_with_annotations() {
        let chart = write_source_chart(&chart_manifest(), &annotations()).unwrap();
        let chart_yaml = std::fs::read_to_string(chart.path.join("Chart.yaml")).unwrap();
        assert!(chart_yaml.contains("flotilla.dev/bundle-id: my-bundle"));
        assert!(chart.path.join("templates/deploy.yaml").exists());
        assert_eq!(
            chart
                .metadata
                .annotations
                .as_ref()
                .unwrap()
                .get(BUNDLE_ID_ANNOTATION)
                .map(|s| s.as_str()),
            Some("my-bundle")
        );
    }

    #[test]
    fn rendered_chart_escapes_template_directives() {
        let obj: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "cm-test"},
            "data": {"tpl": "{{ .Values.not.ours }}"}
        }))
        .unwrap();
        let chart =
            write_rendered_chart("my-bundle", None, &annotations(), &[obj]).unwrap();
        let rendered =
            std::fs::read_to_string(chart.path.join("templates/objects.yaml")).unwrap();
        assert!(!rendered.contains("{{ .Values"));
        assert!(rendered.contains("{{\"{{\"}}"));

        let chart_yaml = std::fs::read_to_string(chart.path.join("Chart.yaml")).unwrap();
        assert!(chart_yaml.contains("name: my-bundle"));
    }

    #[test]
    fn rendered_chart_keeps_source_identity() {
        let source = ChartMetadata {
            name: "nginx".to_string(),
            version: "1.2.3".to_string(),
            kube_version: Some(">=1.20.0-0".to_string()),
            annotations: None,
        };
        let chart =
            write_rendered_chart("my-bundle", Some(&source), &annotations(), &[]).unwrap();
        let chart_yaml = std::fs::read_to_string(chart.path.join("Chart.yaml")).unwrap();
        assert!(chart_yaml.contains("name: nginx"));
        assert!(chart_yaml.contains("version: 1.2.3"));
        assert!(chart_yaml.contains("kubeVersion"));
    }

    #[test]
    fn raw_stream_skips_non_manifests() {
        let manifest = Manifest {
            content_id: "s".to_string(),
            options_hash: "h".to_string(),
            resources: vec![
                ResourceFile {
                    name: "cm.yaml".to_string(),
                    content: "kind: ConfigMap".to_string(),
                    encoding: None,
                },
                ResourceFile {
                    name: "README.md".to_string(),
                    content: "not a manifest".to_string(),
                    encoding: None,
                },
            ],
        };
        let stream = raw_manifest_stream(&manifest);
        assert!(stream.contains("kind: ConfigMap"));
        assert!(!stream.contains("not a manifest"));
    }

    #[test]
    fn name_sanitisation() {
        assert_eq!(sanitize_name("My_Bundle.v2"), "my-bundle-v2");
        assert_eq!(sanitize_name("--edge--"), "edge");
    }
}
