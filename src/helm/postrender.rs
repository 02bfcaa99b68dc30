use std::path::Path;

use kube::api::DynamicObject;
use tokio::process::Command;

use crate::crds::BundleDeploymentOptions;
use crate::error::{AppError, AppResult};
use crate::helm::release::manifest_objects;
use crate::manifest::Manifest;
use crate::objects;

const RENDERED_FILE: &str = "rendered-objects.yaml";

/// Appends `entry` to the `resources` list of a kustomization file, creating
/// the list when absent. Idempotent.
fn ensure_resource_entry(kustomization: &str, entry: &str) -> AppResult<String> {
    let mut doc: serde_yaml::Mapping = if kustomization.trim().is_empty() {
        Default::default()
    } else {
        serde_yaml::from_str(kustomization)?
    };

    let key = serde_yaml::Value::String("resources".to_string());
    let resources = doc
        .entry(key)
        .or_insert_with(|| serde_yaml::Value::Sequence(Default::default()));
    if let serde_yaml::Value::Sequence(list) = resources {
        let present = list
            .iter()
            .any(|v| v.as_str() == Some(entry));
        if !present {
            list.push(serde_yaml::Value::String(entry.to_string()));
        }
    }
    Ok(serde_yaml::to_string(&doc)?)
}

async fn kustomize_build(dir: &Path) -> AppResult<String> {
    let output = Command::new("kustomize")
        .arg("build")
        .arg(dir)
        .output()
        .await
        .map_err(|e| AppError::Kustomize(format!("spawning kustomize: {}", e)))?;

    if !output.status.success() {
        return Err(AppError::Kustomize(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Runs the bundle's kustomization over the rendered stream: the bundle
/// files under `dir` become the overlay, with the rendered objects added to
/// its resource list.
async fn apply_kustomize(rendered: &str, manifest: &Manifest, dir: &str) -> AppResult<String> {
    let dir = dir.trim_matches('/');
    let tmp = tempfile::Builder::new().prefix("flotilla-kustomize-").tempdir()?;

    let prefix = format!("{}/", dir);
    let mut kustomization = String::new();
    for file in &manifest.resources {
        let rel = if file.name == format!("{}/kustomization.yaml", dir)
            || (dir.is_empty() && file.name == "kustomization.yaml")
        {
            kustomization = file.content.clone();
            "kustomization.yaml".to_string()
        } else if dir.is_empty() {
            file.name.clone()
        } else if let Some(rest) = file.name.strip_prefix(&prefix) {
            rest.to_string()
        } else {
            continue;
        };

        if rel == "kustomization.yaml" {
            continue;
        }
        let path = tmp.path().join(&rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, &file.content)?;
    }

    std::fs::write(tmp.path().join(RENDERED_FILE), rendered)?;
    std::fs::write(
        tmp.path().join("kustomization.yaml"),
        ensure_resource_entry(&kustomization, RENDERED_FILE)?,
    )?;

    kustomize_build(tmp.path()).await
}

/// The post-render pipeline: takes Helm's rendered byte stream, applies the
/// requested Kustomize overlay, forces the target namespace, and stamps the
/// ownership metadata onto every object.
pub async fn post_render(
    rendered: &str,
    manifest: &Manifest,
    options: &BundleDeploymentOptions,
    set_id: &str,
) -> AppResult<Vec<DynamicObject>> {
    let kustomize_dir = options
        .kustomize
        .as_ref()
        .and_then(|k| k.dir.as_deref())
        .filter(|d| !d.is_empty());

    let rendered = match kustomize_dir {
        Some(dir) => apply_kustomize(rendered, manifest, dir).await?,
        None => rendered.to_string(),
    };

    let mut objects = manifest_objects(&rendered)?;
    finalize(&mut objects, options, set_id);
    Ok(objects)
}

/// Namespace forcing and ownership decoration; split out of the async path
/// so it stays testable without a kustomize binary.
fn finalize(objects: &mut [DynamicObject], options: &BundleDeploymentOptions, set_id: &str) {
    let target = options
        .target_namespace
        .as_deref()
        .filter(|ns| !ns.is_empty() && *ns != "-");

    for obj in objects.iter_mut() {
        if let Some(target) = target {
            if obj.metadata.namespace.is_some() {
                obj.metadata.namespace = Some(target.to_string());
            }
        }
        objects::decorate(obj, set_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::{APPLIED_HASH_LABEL, APPLIED_ID_ANNOTATION};
    use kube::ResourceExt;

    fn parse(yaml: &str) -> Vec<DynamicObject> {
        manifest_objects(yaml).unwrap()
    }

    #[test]
    fn resource_entry_is_appended_once() {
        let out = ensure_resource_entry("namePrefix: dev-\n", RENDERED_FILE).unwrap();
        assert!(out.contains("namePrefix: dev-"));
        assert!(out.contains(RENDERED_FILE));

        let again = ensure_resource_entry(&out, RENDERED_FILE).unwrap();
        assert_eq!(again.matches(RENDERED_FILE).count(), 1);
    }

    #[test]
    fn resource_entry_from_empty_file() {
        let out = ensure_resource_entry("", RENDERED_FILE).unwrap();
        assert!(out.contains("resources:"));
        assert!(out.contains(RENDERED_FILE));
    }

    #[test]
    fn finalize_decorates_every_object() {
        let mut objects = parse(
            "---\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cm-test\n  namespace: ns-a\n",
        );
        finalize(&mut objects, &BundleDeploymentOptions::default(), "set-1");
        assert_eq!(
            objects[0].annotations().get(APPLIED_ID_ANNOTATION).map(|s| s.as_str()),
            Some("set-1")
        );
        assert!(objects[0].labels().contains_key(APPLIED_HASH_LABEL));
    }

    #[test]
    fn target_namespace_forces_namespaced_objects_only() {
        let mut objects = parse(
            "---\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cm-test\n  namespace: ns-a\n---\napiVersion: rbac.authorization.k8s.io/v1\nkind: ClusterRole\nmetadata:\n  name: role\n",
        );
        let options = BundleDeploymentOptions {
            target_namespace: Some("ns-forced".to_string()),
            ..Default::default()
        };
        finalize(&mut objects, &options, "set-1");
        assert_eq!(objects[0].metadata.namespace.as_deref(), Some("ns-forced"));
        assert_eq!(objects[1].metadata.namespace, None);
    }

    #[test]
    fn dash_target_namespace_is_unset() {
        let mut objects = parse(
            "---\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cm-test\n  namespace: ns-a\n",
        );
        let options = BundleDeploymentOptions {
            target_namespace: Some("-".to_string()),
            ..Default::default()
        };
        finalize(&mut objects, &options, "set-1");
        assert_eq!(objects[0].metadata.namespace.as_deref(), Some("ns-a"));
    }
}
