pub mod drift;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::StreamExt;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::{Action, Config as ControllerConfig, Controller};
use kube::runtime::finalizer::{finalizer, Event as Finalizer};
use kube::runtime::watcher;
use kube::Client;
use kube::ResourceExt;
use sha2::{Digest, Sha256};

use crate::cleanup::Cleanup;
use crate::config::AgentConfig;
use crate::crds::{conditions, BundleDeployment, BundleDeploymentStatus};
use crate::desired::DesiredSet;
use crate::error::{format_error_chain, AppError, AppResult, ErrorList};
use crate::helm::{BundleDriver, Resources};
use crate::manifest::ContentLoader;
use crate::monitor::{self, Monitor};
use crate::objects;
use crate::trigger::Trigger;

const FINALIZER: &str = "flotilla.dev/agent";
/// Requeue cadence while deployed resources are still progressing.
const PROGRESS_REQUEUE: Duration = Duration::from_secs(30);
/// Requeue cadence while a dependency has not reported Ready.
const DEPENDENCY_REQUEUE: Duration = Duration::from_secs(15);

pub struct Context {
    pub upstream: Client,
    pub config: AgentConfig,
    pub driver: Arc<dyn BundleDriver>,
    pub monitor: Monitor,
    pub desired: DesiredSet,
    pub trigger: Arc<Trigger>,
    pub cleanup: Arc<Cleanup>,
    pub loader: ContentLoader,
    /// Input fingerprints of bundles whose last reconcile converged with an
    /// empty status patch; matching events are skipped outright.
    converged: Mutex<HashMap<String, String>>,
}

impl Context {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        upstream: Client,
        config: AgentConfig,
        driver: Arc<dyn BundleDriver>,
        monitor: Monitor,
        desired: DesiredSet,
        trigger: Arc<Trigger>,
        cleanup: Arc<Cleanup>,
        loader: ContentLoader,
    ) -> Self {
        Self {
            upstream,
            config,
            driver,
            monitor,
            desired,
            trigger,
            cleanup,
            loader,
            converged: Mutex::new(HashMap::new()),
        }
    }

    pub fn bundle_api(&self) -> Api<BundleDeployment> {
        Api::namespaced(self.upstream.clone(), &self.config.namespace)
    }

    fn converged_fingerprint(&self, bundle: &str) -> Option<String> {
        self.converged.lock().ok().and_then(|m| m.get(bundle).cloned())
    }

    fn mark_converged(&self, bundle: &str, fingerprint: Option<String>) {
        if let Ok(mut map) = self.converged.lock() {
            match fingerprint {
                Some(fp) => {
                    map.insert(bundle.to_string(), fp);
                }
                None => {
                    map.remove(bundle);
                }
            }
        }
    }
}

/// Everything that can change the outcome of a reconcile: the spec (via
/// generation), labels, annotations, and the one status field used for
/// forced re-sync. Status-only churn hashes identically.
pub fn input_fingerprint(bd: &BundleDeployment) -> String {
    let mut hasher = Sha256::new();
    hasher.update(
        serde_json::to_string(&serde_json::json!({
            "generation": bd.metadata.generation,
            "labels": bd.metadata.labels,
            "annotations": bd.metadata.annotations,
            "deploymentId": bd.spec.deployment_id,
            "syncGeneration": bd.status.as_ref().and_then(|s| s.sync_generation),
        }))
        .unwrap_or_default()
        .as_bytes(),
    );
    hex::encode(hasher.finalize())
}

/// Merge-patches the status subresource, skipping no-ops. Conflicts are
/// swallowed (the next reconcile retries); a vanished object is reported
/// but not retried.
pub async fn patch_status(
    api: &Api<BundleDeployment>,
    bundle: &str,
    original: Option<&BundleDeploymentStatus>,
    updated: &BundleDeploymentStatus,
) -> AppResult<bool> {
    let before = serde_json::to_value(original)?;
    let after = serde_json::to_value(Some(updated))?;
    if before == after {
        return Ok(false);
    }

    let patch = Patch::Merge(serde_json::json!({ "status": updated }));
    match api
        .patch_status(bundle, &PatchParams::default(), &patch)
        .await
    {
        Ok(_) => Ok(true),
        Err(kube::Error::Api(e)) if e.code == 409 => {
            log::debug!("status conflict on {}, retried next reconcile", bundle);
            Ok(false)
        }
        Err(kube::Error::Api(e)) if e.code == 404 => {
            log::warn!("status write on deleted BundleDeployment {}", bundle);
            Ok(false)
        }
        Err(e) => Err(AppError::Kubernetes(e)),
    }
}

async fn check_dependencies(ctx: &Context, bd: &BundleDeployment) -> AppResult<()> {
    let Some(depends_on) = &bd.spec.depends_on else {
        return Ok(());
    };
    let api = ctx.bundle_api();
    for dependency in depends_on.iter().filter(|d| !d.is_empty()) {
        let ready = api
            .get_opt(dependency)
            .await?
            .and_then(|dep| dep.status)
            .map(|s| s.ready && s.non_modified)
            .unwrap_or(false);
        if !ready {
            return Err(AppError::DependencyNotReady {
                name: dependency.clone(),
                requeue_after: DEPENDENCY_REQUEUE,
            });
        }
    }
    Ok(())
}

/// Hydrates Helm values from the sidecar Secret after verifying its hash.
/// A mismatch is retriable: the Secret usually catches up an instant later.
pub async fn hydrate_values(ctx: &Context, bd: &mut BundleDeployment) -> AppResult<()> {
    let Some(expected) = bd.spec.values_hash.clone() else {
        return Ok(());
    };
    let name = bd.name_any();
    let api: Api<k8s_openapi::api::core::v1::Secret> =
        Api::namespaced(ctx.upstream.clone(), &ctx.config.namespace);
    let secret = api.get(&name).await.map_err(AppError::Kubernetes)?;

    let actual = crate::helm::values::hash_secret_values(&secret);
    if actual != expected {
        return Err(AppError::ValuesHashMismatch(name));
    }

    let helm = bd.spec.options.helm.get_or_insert_with(Default::default);
    crate::helm::values::merge_secret_values(helm, &secret)
}

async fn deploy_bundle(ctx: &Context, bd: &BundleDeployment) -> AppResult<Resources> {
    let manifest = ctx.loader.load(&bd.spec.deployment_id).await?;
    ctx.driver.deploy(bd, &manifest, false).await
}

async fn apply(bd: Arc<BundleDeployment>, ctx: &Context) -> AppResult<Action> {
    let bundle = bd.name_any();

    // Paused bundles neither deploy nor watch for drift.
    if bd.spec.paused {
        log::debug!("BundleDeployment {} is paused", bundle);
        ctx.trigger.clear(&bundle);
        ctx.mark_converged(&bundle, None);
        return Ok(Action::await_change());
    }

    let fingerprint = input_fingerprint(&bd);
    if ctx.converged_fingerprint(&bundle).as_deref() == Some(fingerprint.as_str()) {
        log::debug!("BundleDeployment {} unchanged since convergence", bundle);
        return Ok(Action::await_change());
    }
    ctx.mark_converged(&bundle, None);

    let api = ctx.bundle_api();
    let original_status = bd.status.clone();
    let mut status = original_status.clone().unwrap_or_default();
    let mut errors = ErrorList::default();

    // Hydrate the working copy from the sidecar Secret before anything
    // touches Helm.
    let mut bd_work = (*bd).clone();
    if let Err(e) = hydrate_values(ctx, &mut bd_work).await {
        conditions::set(
            &mut status.conditions,
            conditions::CONDITION_DEPLOYED,
            false,
            "ValuesUnavailable",
            &e.to_string(),
        );
        monitor::update_display(&mut status);
        patch_status(&api, &bundle, original_status.as_ref(), &status).await?;
        return Err(e);
    }

    // Dependency gate: status is patched, the error stays here.
    if let Err(e) = check_dependencies(ctx, &bd_work).await {
        let requeue = match &e {
            AppError::DependencyNotReady { requeue_after, .. } => *requeue_after,
            _ => DEPENDENCY_REQUEUE,
        };
        conditions::set(
            &mut status.conditions,
            conditions::CONDITION_DEPLOYED,
            false,
            "DependencyNotReady",
            &e.to_string(),
        );
        monitor::update_display(&mut status);
        patch_status(&api, &bundle, original_status.as_ref(), &status).await?;
        return Ok(Action::requeue(requeue));
    }

    // Deploy when the applied ID is stale.
    let installed =
        status.applied_deployment_id.as_deref() == Some(bd_work.spec.deployment_id.as_str());
    let mut deployed_resources: Option<Resources> = None;
    if !installed {
        match deploy_bundle(ctx, &bd_work).await {
            Ok(resources) => {
                log::info!(
                    "deployed {} as release {}",
                    bundle,
                    resources.id
                );
                conditions::set(
                    &mut status.conditions,
                    conditions::CONDITION_DEPLOYED,
                    true,
                    "Deployed",
                    "",
                );
                conditions::set(
                    &mut status.conditions,
                    conditions::CONDITION_INSTALLED,
                    true,
                    "Installed",
                    "",
                );
                status.applied_deployment_id = Some(bd_work.spec.deployment_id.clone());
                status.release = Some(resources.id.clone());
                status.sync_generation = bd_work.spec.options.force_sync_generation;
                deployed_resources = Some(resources);
            }
            Err(AppError::NoResourceId(reference)) => {
                // nothing to do until upstream fixes the content reference
                log::warn!("bundle {} references missing content {}", bundle, reference);
                conditions::set(
                    &mut status.conditions,
                    conditions::CONDITION_DEPLOYED,
                    false,
                    "ContentMissing",
                    &format!("bundle content {} is not available", reference),
                );
                monitor::update_display(&mut status);
                patch_status(&api, &bundle, original_status.as_ref(), &status).await?;
                return Ok(Action::await_change());
            }
            Err(AppError::HelmFailure { message }) => {
                // user-visible but not retriable: record, advance the ID,
                // blank the release so stale history is never read
                conditions::set(
                    &mut status.conditions,
                    conditions::CONDITION_DEPLOYED,
                    true,
                    "Deployed",
                    "",
                );
                conditions::set(
                    &mut status.conditions,
                    conditions::CONDITION_INSTALLED,
                    false,
                    "HelmError",
                    &message,
                );
                conditions::set(
                    &mut status.conditions,
                    conditions::CONDITION_READY,
                    false,
                    "HelmError",
                    &message,
                );
                status.ready = false;
                status.non_modified = true;
                status.applied_deployment_id = Some(bd_work.spec.deployment_id.clone());
                status.release = None;
                status.sync_generation = bd_work.spec.options.force_sync_generation;
            }
            Err(e) => {
                conditions::set(
                    &mut status.conditions,
                    conditions::CONDITION_DEPLOYED,
                    false,
                    "Error",
                    &e.to_string(),
                );
                errors.push(e);
            }
        }
    }

    // Without the release's rendered objects nothing further can run.
    let resources = match deployed_resources {
        Some(resources) => Some(resources),
        None => match &status.release {
            Some(release) => match ctx.driver.resources(&bundle, release).await {
                Ok(resources) => Some(resources),
                Err(AppError::NoResourceId(_)) => None,
                Err(e) => {
                    errors.push(e);
                    None
                }
            },
            None => None,
        },
    };

    let Some(resources) = resources else {
        monitor::update_display(&mut status);
        if let Err(e) = patch_status(&api, &bundle, original_status.as_ref(), &status).await {
            errors.push(e);
        }
        return errors.into_result().map(|_| Action::await_change());
    };

    // Monitor: only once the deployment converged.
    let mut bd_eval = bd_work.clone();
    bd_eval.status = Some(status.clone());
    if monitor::should_update_status(&bd_eval) {
        let previous = match &status.release {
            Some(release) => ctx
                .driver
                .resources_from_previous_release(&bundle, release)
                .await
                .ok(),
            None => None,
        };
        match ctx
            .monitor
            .update_status(&bd_eval, &mut status, &resources, previous.as_ref())
            .await
        {
            Ok(_) => {
                conditions::set(
                    &mut status.conditions,
                    conditions::CONDITION_MONITORED,
                    true,
                    "Monitored",
                    "",
                );
            }
            Err(e) => {
                conditions::set(
                    &mut status.conditions,
                    conditions::CONDITION_MONITORED,
                    false,
                    "Error",
                    &e.to_string(),
                );
                errors.push(e);
            }
        }
    }

    // Forced redeploy: the agent's own bundle with reported modifications,
    // or a bumped sync generation.
    bd_eval.status = Some(status.clone());
    if monitor::should_redeploy_agent(&bd_eval) {
        log::info!("forcing redeploy of {}", bundle);
        status.applied_deployment_id = None;
        if let Err(e) = ctx.cleanup.old_agent(&status.modified_status).await {
            errors.push(e);
        }
    }

    // Refresh the drift subscription to exactly what the bundle owns now:
    // the rendered objects plus anything the plan would delete.
    let set_id = objects::set_id(&bundle);
    match ctx
        .desired
        .plan_delete(&resources.default_namespace, &set_id, &resources.objects)
        .await
    {
        Ok((_, orphans)) => {
            let mut watched = resources.objects.clone();
            watched.extend(orphans);
            if let Err(e) = ctx
                .trigger
                .on_change(&bundle, &resources.default_namespace, &watched)
                .await
            {
                errors.push(e);
            }
        }
        Err(e) => errors.push(e),
    }

    if let Err(e) = ctx.cleanup.cleanup_releases().await {
        errors.push(e);
    }

    monitor::update_display(&mut status);
    let patched = match patch_status(&api, &bundle, original_status.as_ref(), &status).await {
        Ok(patched) => patched,
        Err(e) => {
            errors.push(e);
            true
        }
    };

    if errors.is_empty() && status.ready && status.non_modified {
        if !patched {
            ctx.mark_converged(&bundle, Some(fingerprint));
        }
        errors.into_result().map(|_| Action::await_change())
    } else {
        errors.into_result().map(|_| Action::requeue(PROGRESS_REQUEUE))
    }
}

/// Tombstone path: uninstall the release and drop the drift subscription.
async fn cleanup(bd: Arc<BundleDeployment>, ctx: &Context) -> AppResult<Action> {
    let bundle = bd.name_any();
    ctx.trigger.clear(&bundle);
    ctx.mark_converged(&bundle, None);
    ctx.cleanup.cleanup_release(&bundle).await?;
    Ok(Action::await_change())
}

async fn reconcile(
    bd: Arc<BundleDeployment>,
    ctx: Arc<Context>,
) -> Result<Action, kube::runtime::finalizer::Error<AppError>> {
    let api = ctx.bundle_api();
    finalizer(&api, FINALIZER, bd, |event| async {
        match event {
            Finalizer::Apply(bd) => apply(bd, &ctx).await,
            Finalizer::Cleanup(bd) => cleanup(bd, &ctx).await,
        }
    })
    .await
}

fn error_policy(
    bd: Arc<BundleDeployment>,
    error: &kube::runtime::finalizer::Error<AppError>,
    _ctx: Arc<Context>,
) -> Action {
    log::warn!(
        "reconcile of {} failed: {}",
        bd.name_any(),
        format_error_chain(error)
    );
    Action::requeue(Duration::from_secs(5))
}

/// Runs the BundleDeployment controller until shutdown.
pub async fn run(ctx: Arc<Context>) {
    let api = ctx.bundle_api();
    log::info!(
        "starting BundleDeployment controller in namespace {} ({} workers)",
        ctx.config.namespace,
        ctx.config.concurrency
    );

    Controller::new(api, watcher::Config::default())
        .with_config(ControllerConfig::default().concurrency(ctx.config.concurrency))
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(obj) => log::debug!("reconciled {:?}", obj),
                Err(e) => log::debug!("reconcile error: {}", e),
            }
        })
        .await;
}
