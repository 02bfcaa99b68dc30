use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::controller::{hydrate_values, patch_status, Context};
use crate::crds::{conditions, BundleDeployment};
use crate::error::{format_error_chain, AppError, AppResult};
use crate::monitor;
use crate::trigger::DriftEvent;

/// Consumes the trigger's event channel with bounded parallelism. Events
/// for the same bundle may arrive in bursts; each handling pass reloads the
/// BundleDeployment, so stale events degrade into no-ops.
pub async fn run(ctx: Arc<Context>, rx: mpsc::Receiver<DriftEvent>) {
    let concurrency = ctx.config.concurrency as usize;
    log::info!("starting drift reconciler ({} workers)", concurrency);

    ReceiverStream::new(rx)
        .for_each_concurrent(concurrency, |event| {
            let ctx = ctx.clone();
            async move {
                if let Err(e) = handle(&ctx, &event.bundle).await {
                    log::warn!(
                        "drift reconcile of {} failed: {}",
                        event.bundle,
                        format_error_chain(&e)
                    );
                }
            }
        })
        .await;
}

async fn handle(ctx: &Context, bundle: &str) -> AppResult<()> {
    let api = ctx.bundle_api();
    let Some(bd) = api.get_opt(bundle).await? else {
        return Ok(());
    };

    if bd.spec.paused {
        ctx.trigger.clear(bundle);
        return Ok(());
    }

    // skip mid-install; the deploy path owns the status until it converges
    if !monitor::should_update_status(&bd) {
        return Ok(());
    }

    let original_status = bd.status.clone();
    let mut status = original_status.clone().unwrap_or_default();
    let Some(release) = status.release.clone() else {
        return Ok(());
    };

    let resources = match ctx.driver.resources(bundle, &release).await {
        Ok(resources) => resources,
        Err(AppError::NoResourceId(_)) => return Ok(()),
        Err(e) => return Err(e),
    };
    let previous = ctx
        .driver
        .resources_from_previous_release(bundle, &release)
        .await
        .ok();

    ctx.monitor
        .update_status(&bd, &mut status, &resources, previous.as_ref())
        .await?;

    let correct = bd.spec.correct_drift.clone().unwrap_or_default();
    if !status.modified_status.is_empty() && correct.enabled {
        log::info!(
            "correcting drift on {} ({} modified resources)",
            bundle,
            status.modified_status.len()
        );
        if let Err(e) = correct_drift(ctx, &bd, &mut status).await {
            // no tight retry loop; the next real trigger re-drives
            conditions::set(
                &mut status.conditions,
                conditions::CONDITION_READY,
                false,
                "DriftCorrectionFailed",
                &e.to_string(),
            );
            status.ready = false;
        }
    }

    monitor::update_display(&mut status);
    patch_status(&api, bundle, original_status.as_ref(), &status).await?;
    Ok(())
}

async fn correct_drift(
    ctx: &Context,
    bd: &BundleDeployment,
    status: &mut crate::crds::BundleDeploymentStatus,
) -> AppResult<()> {
    let mut bd_work = bd.clone();
    hydrate_values(ctx, &mut bd_work).await?;

    let manifest = ctx.loader.load(&bd_work.spec.deployment_id).await?;
    let resources = ctx.driver.remove_external_changes(&bd_work, &manifest).await?;

    status.release = Some(resources.id.clone());
    // the corrective upgrade re-applied the desired set; re-plan so the
    // patched status reflects the cluster after correction
    ctx.monitor
        .update_status(&bd_work, status, &resources, None)
        .await?;
    Ok(())
}
