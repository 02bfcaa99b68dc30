pub mod diff;

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use kube::api::DynamicObject;
use kube::ResourceExt;

use crate::crds::ComparePatch;
use crate::error::AppResult;
use crate::objects::{
    self, applied_hash, gvk_of, object_key, DiscoveryCache, GvkKey, APPLIED_HASH_LABEL,
};

pub use diff::DiffOutcome;

/// Dry-run result of reconciling a desired object set against the cluster.
#[derive(Clone, Debug, Default)]
pub struct Plan {
    /// Desired objects absent from the cluster.
    pub create: BTreeMap<GvkKey, BTreeSet<String>>,
    /// Previously-applied objects no longer in the desired set.
    pub delete: BTreeMap<GvkKey, BTreeSet<String>>,
    /// Existing objects whose desired form differs, with the merge patch
    /// turning live into desired.
    pub update: BTreeMap<GvkKey, BTreeMap<String, String>>,
    /// Live objects considered by the plan.
    pub objects: Vec<DynamicObject>,
    /// Live objects backing the delete set; the drift trigger watches these
    /// alongside the desired objects.
    pub orphans: Vec<DynamicObject>,
}

impl Plan {
    pub fn create_count(&self) -> usize {
        self.create.values().map(|s| s.len()).sum()
    }

    pub fn delete_count(&self) -> usize {
        self.delete.values().map(|s| s.len()).sum()
    }

    pub fn update_count(&self) -> usize {
        self.update.values().map(|m| m.len()).sum()
    }

    /// No creates, deletes or updates: the cluster matches the desired set.
    pub fn is_empty(&self) -> bool {
        self.create_count() == 0 && self.delete_count() == 0 && self.update_count() == 0
    }
}

/// Plans desired object sets against the live cluster. Used for monitoring
/// and for drift correction alike; it never mutates the cluster.
#[derive(Clone)]
pub struct DesiredSet {
    cache: Arc<DiscoveryCache>,
}

impl DesiredSet {
    pub fn new(cache: Arc<DiscoveryCache>) -> Self {
        Self { cache }
    }

    /// Computes the full three-way plan for `desired` under `set_id`.
    pub async fn plan(
        &self,
        default_namespace: &str,
        set_id: &str,
        desired: &[DynamicObject],
        compare_patches: &[ComparePatch],
    ) -> AppResult<Plan> {
        let mut plan = Plan::default();
        let mut desired_keys: HashSet<(GvkKey, String)> = HashSet::new();

        for obj in desired {
            let mut obj = obj.clone();
            objects::decorate(&mut obj, set_id);

            let gvk = gvk_of(&obj)?;
            let ns = obj
                .metadata
                .namespace
                .clone()
                .unwrap_or_else(|| default_namespace.to_string());
            let (api, namespaced) = self.cache.api_for(&gvk, &ns).await?;
            let key = object_key(&obj, default_namespace, namespaced);
            desired_keys.insert((gvk.clone(), key.clone()));

            let name = obj.name_any();
            let live = api.get_opt(&name).await?;
            let Some(live) = live else {
                plan.create.entry(gvk).or_default().insert(key);
                continue;
            };

            let live_value = serde_json::to_value(&live)?;
            let desired_value = serde_json::to_value(&obj)?;
            let rules: Vec<&ComparePatch> = compare_patches
                .iter()
                .filter(|r| {
                    diff::rule_matches(
                        r,
                        &gvk.api_version(),
                        &gvk.kind,
                        live.metadata.namespace.as_deref().unwrap_or(""),
                        &name,
                    )
                })
                .collect();

            match diff::compare(&live_value, &desired_value, &rules)? {
                DiffOutcome::Ignored | DiffOutcome::Unchanged => {}
                DiffOutcome::Changed(patch) => {
                    plan.update.entry(gvk).or_default().insert(key, patch);
                }
            }
            plan.objects.push(live);
        }

        let (delete, orphans) = self
            .sweep_deletes(default_namespace, set_id, &desired_keys, desired)
            .await?;
        plan.delete = delete;
        plan.orphans = orphans;

        Ok(plan)
    }

    /// Just the delete portion of the plan: everything labelled with the
    /// set's hash that the desired set no longer contains.
    pub async fn plan_delete(
        &self,
        default_namespace: &str,
        set_id: &str,
        desired: &[DynamicObject],
    ) -> AppResult<(BTreeMap<GvkKey, BTreeSet<String>>, Vec<DynamicObject>)> {
        let mut desired_keys: HashSet<(GvkKey, String)> = HashSet::new();
        for obj in desired {
            let gvk = gvk_of(obj)?;
            let ns = obj
                .metadata
                .namespace
                .clone()
                .unwrap_or_else(|| default_namespace.to_string());
            let (_, namespaced) = self.cache.api_for(&gvk, &ns).await?;
            desired_keys.insert((gvk, object_key(obj, default_namespace, namespaced)));
        }
        self.sweep_deletes(default_namespace, set_id, &desired_keys, desired)
            .await
    }

    async fn sweep_deletes(
        &self,
        default_namespace: &str,
        set_id: &str,
        desired_keys: &HashSet<(GvkKey, String)>,
        desired: &[DynamicObject],
    ) -> AppResult<(BTreeMap<GvkKey, BTreeSet<String>>, Vec<DynamicObject>)> {
        let mut namespaces: BTreeSet<String> = BTreeSet::new();
        namespaces.insert(default_namespace.to_string());
        for obj in desired {
            if let Some(ns) = &obj.metadata.namespace {
                namespaces.insert(ns.clone());
            }
        }
        let namespaces: Vec<String> = namespaces.into_iter().collect();

        let selector = format!("{}={}", APPLIED_HASH_LABEL, applied_hash(set_id));
        let labelled =
            objects::list_labelled(&self.cache.client(), &namespaces, &selector).await?;

        let mut delete: BTreeMap<GvkKey, BTreeSet<String>> = BTreeMap::new();
        let mut orphans = Vec::new();
        for obj in labelled {
            let gvk = match gvk_of(&obj) {
                Ok(gvk) => gvk,
                Err(_) => continue,
            };
            let key = object_key(&obj, default_namespace, obj.metadata.namespace.is_some());
            if desired_keys.contains(&(gvk.clone(), key.clone())) {
                continue;
            }
            if objects::is_prune_exempt(&obj) {
                continue;
            }
            delete.entry(gvk).or_default().insert(key);
            orphans.push(obj);
        }

        Ok((delete, orphans))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan_with(create: &[(&str, &str)], update: &[(&str, &str)]) -> Plan {
        let mut plan = Plan::default();
        for (kind, key) in create {
            plan.create
                .entry(GvkKey {
                    group: String::new(),
                    version: "v1".to_string(),
                    kind: kind.to_string(),
                })
                .or_default()
                .insert(key.to_string());
        }
        for (kind, key) in update {
            plan.update
                .entry(GvkKey {
                    group: String::new(),
                    version: "v1".to_string(),
                    kind: kind.to_string(),
                })
                .or_default()
                .insert(key.to_string(), "{}".to_string());
        }
        plan
    }

    #[test]
    fn counts_and_emptiness() {
        let empty = Plan::default();
        assert!(empty.is_empty());

        let plan = plan_with(
            &[("ConfigMap", "ns-a/cm-test"), ("Service", "ns-a/svc-test")],
            &[("Service", "ns-a/svc-other")],
        );
        assert_eq!(plan.create_count(), 2);
        assert_eq!(plan.update_count(), 1);
        assert_eq!(plan.delete_count(), 0);
        assert!(!plan.is_empty());
    }

    #[test]
    fn gvk_keys_order_deterministically() {
        let mut keys = vec![
            GvkKey {
                group: "apps".to_string(),
                version: "v1".to_string(),
                kind: "Deployment".to_string(),
            },
            GvkKey {
                group: String::new(),
                version: "v1".to_string(),
                kind: "ConfigMap".to_string(),
            },
        ];
        keys.sort();
        assert_eq!(keys[0].kind, "ConfigMap");
    }

}
