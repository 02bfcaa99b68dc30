pub mod chart;
pub mod errors;
pub mod postrender;
pub mod release;
pub mod values;

use std::collections::BTreeMap;
use std::io::Write as _;

use async_trait::async_trait;
use itertools::Itertools;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::{Api, DynamicObject};
use kube::Client;
use tokio::process::Command;

use crate::crds::{BundleDeployment, CorrectDrift};
use crate::error::{AppError, AppResult};
use crate::manifest::Manifest;
use crate::objects;

pub use chart::{BUNDLE_ID_ANNOTATION, SERVICE_ACCOUNT_ANNOTATION};
pub use release::{Release, ReleaseRef, ReleaseStore};

/// Install/upgrade wait timeout when the bundle specifies none.
const DEFAULT_TIMEOUT_SECONDS: u64 = 600;
/// Retained release revisions when the bundle specifies none.
const DEFAULT_MAX_HISTORY: u32 = 10;

/// The rendered objects of one release revision.
#[derive(Clone, Debug, Default)]
pub struct Resources {
    /// `namespace/name:revision`; empty for dry-run renders.
    pub id: String,
    pub default_namespace: String,
    pub objects: Vec<DynamicObject>,
}

/// One deployed release, keyed by its owning bundle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeployedBundle {
    pub bundle_id: String,
    /// `namespace/name` of the backing release.
    pub release_name: String,
}

/// The deployer seam the reconcilers drive. Implemented by [`HelmDeployer`];
/// tests substitute a fake.
#[async_trait]
pub trait BundleDriver: Send + Sync {
    /// Renders and installs (or upgrades) the bundle, returning the stored
    /// release's resources. With `dry_run` the pipeline stops after
    /// post-rendering and nothing is written.
    async fn deploy(
        &self,
        bd: &BundleDeployment,
        manifest: &Manifest,
        dry_run: bool,
    ) -> AppResult<Resources>;

    /// Re-runs the upgrade in place to remove external changes. Honours
    /// `CorrectDrift.Force` and `CorrectDrift.KeepFailHistory`.
    async fn remove_external_changes(
        &self,
        bd: &BundleDeployment,
        manifest: &Manifest,
    ) -> AppResult<Resources>;

    /// Rendered objects of the exact revision `release_ref` points at.
    async fn resources(&self, bundle_id: &str, release_ref: &str) -> AppResult<Resources>;

    /// Same, for the revision immediately before `release_ref`.
    async fn resources_from_previous_release(
        &self,
        bundle_id: &str,
        release_ref: &str,
    ) -> AppResult<Resources>;

    /// All releases the agent owns, deduped by bundle ID.
    async fn list_deployments(&self) -> AppResult<Vec<DeployedBundle>>;

    /// Uninstalls the release at `namespace/name`.
    async fn delete_release(&self, release_name: &str) -> AppResult<()>;

    /// Uninstalls every release whose chart annotation names `bundle_id`.
    async fn delete(&self, bundle_id: &str) -> AppResult<()>;
}

/// Label selector evaluation for the target-namespace gate. Covers
/// matchLabels and the four matchExpressions operators.
pub fn selector_matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    if let Some(match_labels) = &selector.match_labels {
        for (k, v) in match_labels {
            if labels.get(k) != Some(v) {
                return false;
            }
        }
    }
    for expr in selector.match_expressions.as_deref().unwrap_or(&[]) {
        let actual = labels.get(&expr.key);
        let wanted = expr.values.as_deref().unwrap_or(&[]);
        let ok = match expr.operator.as_str() {
            "In" => actual.map(|v| wanted.contains(v)).unwrap_or(false),
            "NotIn" => actual.map(|v| !wanted.contains(v)).unwrap_or(true),
            "Exists" => actual.is_some(),
            "DoesNotExist" => actual.is_none(),
            _ => false,
        };
        if !ok {
            return false;
        }
    }
    true
}

enum DeployAction {
    Install,
    Upgrade,
}

pub struct HelmDeployer {
    local: Client,
    store: ReleaseStore,
    /// Namespace the impersonation service accounts live in.
    agent_namespace: String,
    /// Install namespace of last resort.
    default_namespace: String,
}

impl HelmDeployer {
    pub fn new(local: Client, agent_namespace: String, default_namespace: String) -> Self {
        Self {
            store: ReleaseStore::new(local.clone()),
            local,
            agent_namespace,
            default_namespace,
        }
    }

    pub fn store(&self) -> &ReleaseStore {
        &self.store
    }

    fn impersonation_args(&self, service_account: Option<&str>) -> Vec<String> {
        match service_account.filter(|sa| !sa.is_empty()) {
            Some(sa) => vec![
                "--kube-as-user".to_string(),
                format!("system:serviceaccount:{}:{}", self.agent_namespace, sa),
            ],
            None => Vec::new(),
        }
    }

    async fn helm(&self, args: Vec<String>) -> AppResult<String> {
        log::debug!("helm {}", args.join(" "));
        let output = Command::new("helm")
            .args(&args)
            .output()
            .await
            .map_err(|e| AppError::Helm(format!("spawning helm: {}", e)))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(AppError::Helm(errors::condense(&String::from_utf8_lossy(
                &output.stderr,
            ))))
        }
    }

    async fn guard_target_namespace(
        &self,
        bd: &BundleDeployment,
        namespace: &str,
    ) -> AppResult<()> {
        let Some(selector) = &bd.spec.options.allowed_target_namespace_selector else {
            return Ok(());
        };
        let api: Api<Namespace> = Api::all(self.local.clone());
        let labels = match api.get(namespace).await {
            Ok(ns) => ns.metadata.labels.unwrap_or_default(),
            Err(kube::Error::Api(e)) if e.code == 404 => BTreeMap::new(),
            Err(e) => return Err(AppError::Kubernetes(e)),
        };
        if selector_matches(selector, &labels) {
            Ok(())
        } else {
            Err(AppError::TargetNamespaceMismatch(namespace.to_string()))
        }
    }

    /// Fails early when the chart's kubeVersion constraint excludes the
    /// server. Unparseable constraints or versions are logged and waved
    /// through; helm re-checks at install time anyway.
    async fn guard_kube_version(&self, requirement: Option<&str>) -> AppResult<()> {
        let Some(requirement) = requirement else {
            return Ok(());
        };
        let info = self
            .local
            .apiserver_version()
            .await
            .map_err(AppError::Kubernetes)?;
        let raw = info.git_version.trim_start_matches('v');
        let raw = raw.split('+').next().unwrap_or(raw);

        let (Ok(version), Ok(req)) = (
            semver::Version::parse(raw),
            semver::VersionReq::parse(requirement),
        ) else {
            log::warn!(
                "cannot evaluate kubeVersion constraint {:?} against server {:?}",
                requirement,
                info.git_version
            );
            return Ok(());
        };

        if req.matches(&version) {
            Ok(())
        } else {
            Err(AppError::HelmFailure {
                message: format!(
                    "chart requires kubeVersion: {} which is incompatible with Kubernetes {}",
                    requirement, info.git_version
                ),
            })
        }
    }

    async fn render(
        &self,
        bd: &BundleDeployment,
        manifest: &Manifest,
        namespace: &str,
        annotations: &BTreeMap<String, String>,
        values_path: &std::path::Path,
    ) -> AppResult<String> {
        let helm_options = bd.spec.options.helm.clone().unwrap_or_default();
        if manifest.is_chart() && !helm_options.disable_pre_process {
            let source = chart::write_source_chart(manifest, annotations)?;
            let args = vec![
                "template".to_string(),
                bd.release_name(),
                source.path.display().to_string(),
                "-n".to_string(),
                namespace.to_string(),
                "-f".to_string(),
                values_path.display().to_string(),
            ];
            self.helm(args).await
        } else {
            Ok(chart::raw_manifest_stream(manifest))
        }
    }

    async fn uninstall(
        &self,
        namespace: &str,
        name: &str,
        service_account: Option<&str>,
    ) -> AppResult<()> {
        let mut args = vec![
            "uninstall".to_string(),
            name.to_string(),
            "-n".to_string(),
            namespace.to_string(),
        ];
        args.extend(self.impersonation_args(service_account));
        match self.helm(args).await {
            Ok(_) => {
                log::info!("Uninstalled release {}/{}", namespace, name);
                Ok(())
            }
            Err(AppError::Helm(msg)) if msg.contains("not found") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn deploy_inner(
        &self,
        bd: &BundleDeployment,
        manifest: &Manifest,
        dry_run: bool,
        correct: Option<&CorrectDrift>,
    ) -> AppResult<Resources> {
        let bundle_id = bd.metadata.name.clone().unwrap_or_default();
        let namespace = bd.effective_namespace(&self.default_namespace);
        let release_name = bd.release_name();
        let helm_options = bd.spec.options.helm.clone().unwrap_or_default();
        let service_account = bd.spec.options.service_account.as_deref();

        self.guard_target_namespace(bd, &namespace).await?;

        let annotations: BTreeMap<String, String> = [
            (BUNDLE_ID_ANNOTATION.to_string(), bundle_id.clone()),
            (
                SERVICE_ACCOUNT_ANNOTATION.to_string(),
                service_account.unwrap_or_default().to_string(),
            ),
        ]
        .into();

        let chart_meta = chart::chart_metadata(manifest)?;
        self.guard_kube_version(chart_meta.as_ref().and_then(|m| m.kube_version.as_deref()))
            .await?;

        let resolved = values::resolve_values(&self.local, &namespace, &helm_options).await?;
        let mut values_file = tempfile::NamedTempFile::new()?;
        values_file.write_all(serde_yaml::to_string(&resolved)?.as_bytes())?;

        let rendered = self
            .render(bd, manifest, &namespace, &annotations, values_file.path())
            .await?;
        let set_id = objects::set_id(&bundle_id);
        let rendered_objects =
            postrender::post_render(&rendered, manifest, &bd.spec.options, &set_id).await?;

        let last = self.store.latest(&namespace, &release_name).await?;
        if let Some(last) = &last {
            if last.info.status == "uninstalling" {
                if dry_run {
                    return Ok(Resources {
                        id: String::new(),
                        default_namespace: namespace,
                        objects: rendered_objects,
                    });
                }
                self.uninstall(&namespace, &release_name, service_account)
                    .await?;
            }
        }
        if dry_run {
            return Ok(Resources {
                id: String::new(),
                default_namespace: namespace,
                objects: rendered_objects,
            });
        }

        let final_chart = chart::write_rendered_chart(
            &bundle_id,
            chart_meta.as_ref(),
            &annotations,
            &rendered_objects,
        )?;

        let action = match &last {
            Some(last) if last.info.status != "uninstalling" && last.info.status != "uninstalled" => {
                DeployAction::Upgrade
            }
            _ => DeployAction::Install,
        };

        let timeout = format!(
            "{}s",
            match helm_options.timeout_seconds {
                Some(0) | None => DEFAULT_TIMEOUT_SECONDS,
                Some(t) => t,
            }
        );
        let force = helm_options.force || correct.map(|c| c.force).unwrap_or(false);

        let mut args: Vec<String> = match action {
            DeployAction::Install => {
                log::info!(
                    "Installing release {}/{} for bundle {}",
                    namespace,
                    release_name,
                    bundle_id
                );
                let mut args = vec![
                    "install".to_string(),
                    release_name.clone(),
                    final_chart.path.display().to_string(),
                    "-n".to_string(),
                    namespace.clone(),
                    "--create-namespace".to_string(),
                    "--wait".to_string(),
                    "--replace".to_string(),
                    "--timeout".to_string(),
                    timeout,
                ];
                if helm_options.atomic {
                    args.push("--atomic".to_string());
                }
                args
            }
            DeployAction::Upgrade => {
                log::info!(
                    "Upgrading release {}/{} for bundle {}",
                    namespace,
                    release_name,
                    bundle_id
                );
                let mut args = vec![
                    "upgrade".to_string(),
                    release_name.clone(),
                    final_chart.path.display().to_string(),
                    "-n".to_string(),
                    namespace.clone(),
                    "--atomic".to_string(),
                    "--wait".to_string(),
                    "--history-max".to_string(),
                    helm_options
                        .max_history
                        .unwrap_or(DEFAULT_MAX_HISTORY)
                        .to_string(),
                    "--timeout".to_string(),
                    timeout,
                ];
                if force {
                    args.push("--force".to_string());
                }
                args
            }
        };
        if helm_options.take_ownership {
            args.push("--take-ownership".to_string());
        }
        if helm_options.wait_for_jobs {
            args.push("--wait-for-jobs".to_string());
        }
        args.push("-f".to_string());
        args.push(values_file.path().display().to_string());
        args.extend(self.impersonation_args(service_account));

        if let Err(err) = self.helm(args).await {
            if let Some(correct) = correct {
                if !correct.keep_fail_history {
                    self.discard_failed_revision(&namespace, &release_name).await;
                }
            }
            let message = err.to_string();
            if errors::is_non_retriable(&message) {
                return Err(AppError::HelmFailure { message });
            }
            return Err(err);
        }

        let stored = self
            .store
            .latest(&namespace, &release_name)
            .await?
            .ok_or_else(|| {
                AppError::Helm(format!(
                    "release {}/{} has no stored revision after deploy",
                    namespace, release_name
                ))
            })?;

        Ok(Resources {
            id: stored.reference().to_string(),
            default_namespace: namespace,
            objects: release::manifest_objects(&stored.manifest)?,
        })
    }

    /// Best-effort removal of the failed revision a corrective upgrade left
    /// behind. Only called when the bundle asked for no failure history.
    async fn discard_failed_revision(&self, namespace: &str, release_name: &str) {
        match self.store.latest(namespace, release_name).await {
            Ok(Some(r)) if r.info.status.contains("failed") => {
                if let Err(e) = self.store.delete_revision(&r.reference()).await {
                    log::warn!(
                        "failed to discard failed revision {}: {}",
                        r.reference(),
                        e
                    );
                }
            }
            Ok(_) => {}
            Err(e) => log::warn!(
                "failed to inspect history of {}/{}: {}",
                namespace,
                release_name,
                e
            ),
        }
    }

    async fn resources_at(
        &self,
        bundle_id: &str,
        reference: &ReleaseRef,
    ) -> AppResult<Resources> {
        let stored = self.store.get(reference).await?;
        if stored.annotation(BUNDLE_ID_ANNOTATION) != Some(bundle_id) {
            return Err(AppError::NoResourceId(reference.to_string()));
        }
        Ok(Resources {
            id: reference.to_string(),
            default_namespace: reference.namespace.clone(),
            objects: release::manifest_objects(&stored.manifest)?,
        })
    }
}

#[async_trait]
impl BundleDriver for HelmDeployer {
    async fn deploy(
        &self,
        bd: &BundleDeployment,
        manifest: &Manifest,
        dry_run: bool,
    ) -> AppResult<Resources> {
        self.deploy_inner(bd, manifest, dry_run, None).await
    }

    async fn remove_external_changes(
        &self,
        bd: &BundleDeployment,
        manifest: &Manifest,
    ) -> AppResult<Resources> {
        let correct = bd.spec.correct_drift.clone().unwrap_or_default();
        self.deploy_inner(bd, manifest, false, Some(&correct)).await
    }

    async fn resources(&self, bundle_id: &str, release_ref: &str) -> AppResult<Resources> {
        let reference = ReleaseRef::parse(release_ref)?;
        self.resources_at(bundle_id, &reference).await
    }

    async fn resources_from_previous_release(
        &self,
        bundle_id: &str,
        release_ref: &str,
    ) -> AppResult<Resources> {
        let reference = ReleaseRef::parse(release_ref)?;
        if reference.version <= 1 {
            return Err(AppError::NoResourceId(release_ref.to_string()));
        }
        let previous = ReleaseRef {
            version: reference.version - 1,
            ..reference
        };
        self.resources_at(bundle_id, &previous).await
    }

    async fn list_deployments(&self) -> AppResult<Vec<DeployedBundle>> {
        let releases = self.store.list_all().await?;
        let deployments = releases
            .iter()
            .filter_map(|r| {
                r.annotation(BUNDLE_ID_ANNOTATION).map(|id| DeployedBundle {
                    bundle_id: id.to_string(),
                    release_name: format!("{}/{}", r.namespace, r.name),
                })
            })
            .unique_by(|d| d.bundle_id.clone())
            .collect();
        Ok(deployments)
    }

    async fn delete_release(&self, release_name: &str) -> AppResult<()> {
        let (namespace, name) = release_name
            .split_once('/')
            .ok_or_else(|| AppError::Internal(format!("malformed release {:?}", release_name)))?;
        let service_account = self
            .store
            .latest(namespace, name)
            .await?
            .and_then(|r| r.annotation(SERVICE_ACCOUNT_ANNOTATION).map(String::from));
        self.uninstall(namespace, name, service_account.as_deref())
            .await
    }

    async fn delete(&self, bundle_id: &str) -> AppResult<()> {
        // match on the chart annotation, not merely the release name
        let releases = self.store.list_all().await?;
        for release in releases {
            if release.annotation(BUNDLE_ID_ANNOTATION) != Some(bundle_id) {
                continue;
            }
            let service_account = release
                .annotation(SERVICE_ACCOUNT_ANNOTATION)
                .map(String::from);
            self.uninstall(
                &release.namespace,
                &release.name,
                service_account.as_deref(),
            )
            .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn match_labels_must_all_match() {
        let selector = LabelSelector {
            match_labels: Some(labels(&[("team", "edge"), ("env", "prod")])),
            match_expressions: None,
        };
        assert!(selector_matches(
            &selector,
            &labels(&[("team", "edge"), ("env", "prod"), ("extra", "x")])
        ));
        assert!(!selector_matches(&selector, &labels(&[("team", "edge")])));
    }

    #[test]
    fn match_expressions_operators() {
        let selector = LabelSelector {
            match_labels: None,
            match_expressions: Some(vec![
                LabelSelectorRequirement {
                    key: "tier".to_string(),
                    operator: "In".to_string(),
                    values: Some(vec!["a".to_string(), "b".to_string()]),
                },
                LabelSelectorRequirement {
                    key: "deprecated".to_string(),
                    operator: "DoesNotExist".to_string(),
                    values: None,
                },
            ]),
        };
        assert!(selector_matches(&selector, &labels(&[("tier", "a")])));
        assert!(!selector_matches(&selector, &labels(&[("tier", "c")])));
        assert!(!selector_matches(
            &selector,
            &labels(&[("tier", "a"), ("deprecated", "yes")])
        ));
    }

    #[test]
    fn empty_selector_matches_everything() {
        let selector = LabelSelector::default();
        assert!(selector_matches(&selector, &BTreeMap::new()));
    }
}
