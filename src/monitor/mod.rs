pub mod readiness;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use kube::api::DynamicObject;
use kube::ResourceExt;

use crate::config::AGENT_BUNDLE_PREFIX;
use crate::crds::{
    conditions, BundleDeployment, BundleDeploymentDisplay, BundleDeploymentStatus, DeployedResource,
    ModifiedStatus, NonReadyStatus, ResourceCounts,
};
use crate::desired::{DesiredSet, Plan};
use crate::error::AppResult;
use crate::helm::Resources;
use crate::objects::{self, gvk_of, object_key, DiscoveryCache, GvkKey};

/// Status lists are truncated to this many representative entries.
pub const MAX_STATUS_ENTRIES: usize = 10;

/// Status is only recomputed once the deployment converged: the applied ID
/// matches and the install did not fail.
pub fn should_update_status(bd: &BundleDeployment) -> bool {
    let Some(status) = &bd.status else {
        return false;
    };
    if status.applied_deployment_id.as_deref() != Some(bd.spec.deployment_id.as_str()) {
        return false;
    }
    !conditions::is_false(&status.conditions, conditions::CONDITION_INSTALLED)
}

/// The agent's own bundle once monitoring reports modifications, and any
/// bundle with a bumped force-sync generation, go through the forced
/// redeploy path.
pub fn should_redeploy_agent(bd: &BundleDeployment) -> bool {
    let agent_modified = bd.name_any().starts_with(AGENT_BUNDLE_PREFIX)
        && bd
            .status
            .as_ref()
            .map(|s| !s.modified_status.is_empty())
            .unwrap_or(false);
    if agent_modified {
        return true;
    }
    let force = bd.spec.options.force_sync_generation.unwrap_or(0);
    if force <= 0 {
        return false;
    }
    let synced = bd
        .status
        .as_ref()
        .and_then(|s| s.sync_generation)
        .unwrap_or(0);
    force != synced
}

fn gvk_display(api_version: &str, kind: &str) -> String {
    format!("{}.{}", kind.to_lowercase(), api_version)
}

pub fn modified_message(m: &ModifiedStatus) -> String {
    let what = if m.create {
        "missing"
    } else if m.delete {
        "extra"
    } else {
        "modified"
    };
    if m.namespace.is_empty() {
        format!("{} {} {}", gvk_display(&m.api_version, &m.kind), m.name, what)
    } else {
        format!(
            "{} {}/{} {}",
            gvk_display(&m.api_version, &m.kind),
            m.namespace,
            m.name,
            what
        )
    }
}

pub fn non_ready_message(nr: &NonReadyStatus) -> String {
    let detail = if nr.summary.message.is_empty() {
        nr.summary.state.clone()
    } else {
        nr.summary.message.join("; ")
    };
    if nr.namespace.is_empty() {
        format!("{} {} is not ready: {}", gvk_display(&nr.api_version, &nr.kind), nr.name, detail)
    } else {
        format!(
            "{} {}/{} is not ready: {}",
            gvk_display(&nr.api_version, &nr.kind),
            nr.namespace,
            nr.name,
            detail
        )
    }
}

fn split_key(key: &str) -> (String, String) {
    match key.split_once('/') {
        Some((ns, name)) => (ns.to_string(), name.to_string()),
        None => (String::new(), key.to_string()),
    }
}

/// Translates the plan's create/update/delete sets into ModifiedStatus
/// entries. Deletes only count as orphans when the previous release
/// contained the object; operators that copy the ownership hash onto their
/// own children must not show up here.
pub fn modified_from_plan(
    plan: &Plan,
    previous_keys: Option<&HashSet<(GvkKey, String)>>,
) -> Vec<ModifiedStatus> {
    let mut modified = Vec::new();

    for (gvk, keys) in &plan.create {
        for key in keys {
            let (namespace, name) = split_key(key);
            modified.push(ModifiedStatus {
                api_version: gvk.api_version(),
                kind: gvk.kind.clone(),
                namespace,
                name,
                create: true,
                ..Default::default()
            });
        }
    }

    for (gvk, entries) in &plan.update {
        for (key, patch) in entries {
            let (namespace, name) = split_key(key);
            modified.push(ModifiedStatus {
                api_version: gvk.api_version(),
                kind: gvk.kind.clone(),
                namespace,
                name,
                exist: true,
                patch: Some(patch.clone()),
                ..Default::default()
            });
        }
    }

    for (gvk, keys) in &plan.delete {
        for key in keys {
            let in_previous = previous_keys
                .map(|prev| prev.contains(&(gvk.clone(), key.clone())))
                .unwrap_or(false);
            if !in_previous {
                continue;
            }
            let (namespace, name) = split_key(key);
            modified.push(ModifiedStatus {
                api_version: gvk.api_version(),
                kind: gvk.kind.clone(),
                namespace,
                name,
                delete: true,
                exist: true,
                ..Default::default()
            });
        }
    }

    modified.sort_by_key(|m| m.sort_key());
    modified
}

/// Readiness summaries for the live objects the plan considered, sorted by
/// UID for determinism.
pub fn non_ready_from(
    objects: &[DynamicObject],
    ignore: &[std::collections::BTreeMap<String, String>],
) -> Vec<NonReadyStatus> {
    let mut non_ready = Vec::new();
    for obj in objects {
        let value = match serde_json::to_value(obj) {
            Ok(v) => v,
            Err(_) => continue,
        };
        let summary = readiness::summarize(&value, ignore);
        if readiness::is_ready(&summary) {
            continue;
        }
        let gvk = match gvk_of(obj) {
            Ok(gvk) => gvk,
            Err(_) => continue,
        };
        non_ready.push(NonReadyStatus {
            uid: obj.metadata.uid.clone().unwrap_or_default(),
            api_version: gvk.api_version(),
            kind: gvk.kind,
            namespace: obj.metadata.namespace.clone().unwrap_or_default(),
            name: obj.name_any(),
            summary,
        });
    }
    non_ready.sort_by(|a, b| a.uid.cmp(&b.uid));
    non_ready
}

/// Refreshes the display block from flags and conditions.
pub fn update_display(status: &mut BundleDeploymentStatus) {
    let state = if !status.ready {
        "NotReady"
    } else if !status.non_modified {
        "Modified"
    } else {
        "Ready"
    };
    let condition_text = |type_: &str| -> String {
        conditions::get(&status.conditions, type_)
            .map(|c| match &c.message {
                Some(m) if c.status == "False" => format!("False: {}", m),
                _ => c.status.clone(),
            })
            .unwrap_or_default()
    };
    status.display = Some(BundleDeploymentDisplay {
        deployed: condition_text(conditions::CONDITION_DEPLOYED),
        monitored: condition_text(conditions::CONDITION_MONITORED),
        state: state.to_string(),
    });
}

pub struct Monitor {
    cache: Arc<DiscoveryCache>,
    desired: DesiredSet,
}

impl Monitor {
    pub fn new(cache: Arc<DiscoveryCache>) -> Self {
        Self {
            desired: DesiredSet::new(cache.clone()),
            cache,
        }
    }

    async fn keys_of(
        &self,
        default_namespace: &str,
        objs: &[DynamicObject],
    ) -> AppResult<HashSet<(GvkKey, String)>> {
        let mut keys = HashSet::new();
        for obj in objs {
            let gvk = gvk_of(obj)?;
            let ns = obj
                .metadata
                .namespace
                .clone()
                .unwrap_or_else(|| default_namespace.to_string());
            let (_, namespaced) = self.cache.api_for(&gvk, &ns).await?;
            keys.insert((gvk, object_key(obj, default_namespace, namespaced)));
        }
        Ok(keys)
    }

    /// Plans the release's rendered objects against the live cluster and
    /// projects the result into the status: Resources, NonReadyStatus,
    /// ModifiedStatus, counts, flags and the Ready condition.
    pub async fn update_status(
        &self,
        bd: &BundleDeployment,
        status: &mut BundleDeploymentStatus,
        resources: &Resources,
        previous: Option<&Resources>,
    ) -> AppResult<Plan> {
        let bundle = bd.name_any();
        let set_id = objects::set_id(&bundle);
        let compare_patches = bd
            .spec
            .options
            .diff
            .as_ref()
            .map(|d| d.compare_patches.clone())
            .unwrap_or_default();
        let ignore = bd
            .spec
            .options
            .ignore
            .as_ref()
            .map(|i| i.conditions.clone())
            .unwrap_or_default();

        let plan = self
            .desired
            .plan(
                &resources.default_namespace,
                &set_id,
                &resources.objects,
                &compare_patches,
            )
            .await?;

        // live objects by identity, for UIDs and creation timestamps
        let mut live_map: HashMap<(GvkKey, String), &DynamicObject> = HashMap::new();
        for live in &plan.objects {
            if let Ok(gvk) = gvk_of(live) {
                let key = object_key(
                    live,
                    &resources.default_namespace,
                    live.metadata.namespace.is_some(),
                );
                live_map.insert((gvk, key), live);
            }
        }

        let mut deployed = Vec::new();
        for obj in &resources.objects {
            let gvk = gvk_of(obj)?;
            let ns = obj
                .metadata
                .namespace
                .clone()
                .unwrap_or_else(|| resources.default_namespace.clone());
            let (_, namespaced) = self.cache.api_for(&gvk, &ns).await?;
            let key = object_key(obj, &resources.default_namespace, namespaced);
            let created_at = live_map
                .get(&(gvk.clone(), key.clone()))
                .and_then(|live| live.metadata.creation_timestamp.as_ref())
                .map(|t| t.0.to_rfc3339());
            let (namespace, name) = split_key(&key);
            deployed.push(DeployedResource {
                api_version: gvk.api_version(),
                kind: gvk.kind,
                namespace,
                name,
                created_at,
            });
        }

        let previous_keys = match previous {
            Some(previous) => Some(
                self.keys_of(&previous.default_namespace, &previous.objects)
                    .await?,
            ),
            None => None,
        };

        let non_ready = non_ready_from(&plan.objects, &ignore);
        let modified = modified_from_plan(&plan, previous_keys.as_ref());

        let desired_ready = resources.objects.len() as i32;
        let missing = plan.create_count() as i32;
        let updated = plan.update_count() as i32;
        let orphaned = modified.iter().filter(|m| m.delete).count() as i32;
        let not_ready = non_ready.len() as i32;
        let counts = ResourceCounts {
            desired_ready,
            ready: (desired_ready - missing - updated - not_ready).max(0),
            not_ready,
            missing,
            modified: updated,
            orphaned,
            unknown: 0,
            wait_applied: 0,
        };

        status.ready = non_ready.is_empty();
        status.non_modified = modified.is_empty();

        let message = non_ready
            .first()
            .map(non_ready_message)
            .or_else(|| modified.first().map(modified_message))
            .unwrap_or_default();
        conditions::set(
            &mut status.conditions,
            conditions::CONDITION_READY,
            status.ready && status.non_modified,
            if status.ready && status.non_modified {
                "Ready"
            } else {
                "NotReady"
            },
            &message,
        );

        status.resources = deployed;
        status.non_ready_status = non_ready.into_iter().take(MAX_STATUS_ENTRIES).collect();
        status.modified_status = modified.into_iter().take(MAX_STATUS_ENTRIES).collect();
        status.resource_counts = Some(counts);

        Ok(plan)
    }
}
