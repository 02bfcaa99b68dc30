use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use futures_util::StreamExt;
use kube::api::{Api, DynamicObject};
use kube::runtime::watcher;
use kube::ResourceExt;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::AppResult;
use crate::objects::{gvk_of, DiscoveryCache, GvkKey};

/// Drift notification: the named BundleDeployment's deployed objects
/// changed out of band.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DriftEvent {
    pub bundle: String,
}

/// Per-watch interest registry: bundle key to the object names it owns
/// within this (GVK, namespace).
type Interests = Arc<Mutex<HashMap<String, HashSet<String>>>>;

type WatchKey = (GvkKey, String);

struct WatchEntry {
    interests: Interests,
    handle: JoinHandle<()>,
}

struct TriggerState {
    watches: HashMap<WatchKey, WatchEntry>,
    by_bundle: HashMap<String, HashSet<WatchKey>>,
}

/// Owns one dynamic watcher per (GVK, namespace) pair any bundle cares
/// about. Watchers start on demand and stop when the last interested bundle
/// unregisters; all registry mutations are serialised behind one mutex.
pub struct Trigger {
    cache: Arc<DiscoveryCache>,
    tx: mpsc::Sender<DriftEvent>,
    state: Mutex<TriggerState>,
}

/// Content hash of everything that is not status or server-managed
/// metadata. Two objects with equal fingerprints have not drifted apart.
pub fn fingerprint(obj: &DynamicObject) -> String {
    let mut value = serde_json::to_value(obj).unwrap_or_default();
    if let Some(map) = value.as_object_mut() {
        map.remove("status");
        if let Some(metadata) = map.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            metadata.remove("resourceVersion");
            metadata.remove("managedFields");
            metadata.remove("generation");
        }
    }
    let mut hasher = Sha256::new();
    hasher.update(value.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

fn interested_bundles(interests: &HashMap<String, HashSet<String>>, name: &str) -> Vec<String> {
    interests
        .iter()
        .filter(|(_, names)| names.contains(name))
        .map(|(bundle, _)| bundle.clone())
        .collect()
}

async fn fire(interests: &Interests, tx: &mpsc::Sender<DriftEvent>, name: &str) {
    let bundles = match interests.lock() {
        Ok(map) => interested_bundles(&map, name),
        Err(_) => return,
    };
    for bundle in bundles {
        log::debug!("drift event for bundle {} (object {})", bundle, name);
        if tx.send(DriftEvent { bundle }).await.is_err() {
            return;
        }
    }
}

/// One watcher task. Initial sync records fingerprints without firing;
/// deletes always fire; updates fire only when non-status content changed.
async fn watch_task(
    api: Api<DynamicObject>,
    description: String,
    interests: Interests,
    tx: mpsc::Sender<DriftEvent>,
) {
    let mut seen: HashMap<String, String> = HashMap::new();
    let mut stream = watcher(api, watcher::Config::default()).boxed();

    log::debug!("starting drift watch on {}", description);
    while let Some(event) = stream.next().await {
        match event {
            Ok(watcher::Event::Init) | Ok(watcher::Event::InitDone) => {}
            Ok(watcher::Event::InitApply(obj)) => {
                seen.insert(obj.name_any(), fingerprint(&obj));
            }
            Ok(watcher::Event::Apply(obj)) => {
                let name = obj.name_any();
                let current = fingerprint(&obj);
                match seen.insert(name.clone(), current.clone()) {
                    Some(previous) if previous != current => {
                        fire(&interests, &tx, &name).await;
                    }
                    _ => {}
                }
            }
            Ok(watcher::Event::Delete(obj)) => {
                let name = obj.name_any();
                seen.remove(&name);
                fire(&interests, &tx, &name).await;
            }
            Err(e) => {
                // the watcher re-establishes itself; these are transient
                log::warn!("drift watch on {}: {}", description, e);
            }
        }
    }
}

impl Trigger {
    pub fn new(cache: Arc<DiscoveryCache>, tx: mpsc::Sender<DriftEvent>) -> Self {
        Self {
            cache,
            tx,
            state: Mutex::new(TriggerState {
                watches: HashMap::new(),
                by_bundle: HashMap::new(),
            }),
        }
    }

    /// Registers `bundle` against exactly the (GVK, namespace, name) set
    /// covered by `objs`. Watches no longer needed by any bundle are torn
    /// down; new ones are started.
    pub async fn on_change(
        &self,
        bundle: &str,
        default_namespace: &str,
        objs: &[DynamicObject],
    ) -> AppResult<()> {
        // resolve scopes before taking the registry lock
        let mut wanted: HashMap<WatchKey, (Api<DynamicObject>, HashSet<String>)> = HashMap::new();
        for obj in objs {
            let gvk = gvk_of(obj)?;
            let ns = obj
                .metadata
                .namespace
                .clone()
                .unwrap_or_else(|| default_namespace.to_string());
            let (api, namespaced) = self.cache.api_for(&gvk, &ns).await?;
            let watch_ns = if namespaced { ns } else { String::new() };
            wanted
                .entry((gvk, watch_ns))
                .or_insert_with(|| (api, HashSet::new()))
                .1
                .insert(obj.name_any());
        }

        let mut state = self
            .state
            .lock()
            .map_err(|_| crate::error::AppError::Internal("trigger registry poisoned".into()))?;

        let wanted_keys: HashSet<WatchKey> = wanted.keys().cloned().collect();
        let previous = state
            .by_bundle
            .insert(bundle.to_string(), wanted_keys.clone())
            .unwrap_or_default();

        // drop registrations this bundle no longer needs
        for stale in previous.difference(&wanted_keys) {
            Self::unregister(&mut state.watches, stale, bundle);
        }

        for ((gvk, ns), (api, names)) in wanted {
            let key = (gvk.clone(), ns.clone());
            match state.watches.get(&key) {
                Some(entry) => {
                    if let Ok(mut interests) = entry.interests.lock() {
                        interests.insert(bundle.to_string(), names);
                    }
                }
                None => {
                    let interests: Interests = Arc::new(Mutex::new(HashMap::from([(
                        bundle.to_string(),
                        names,
                    )])));
                    let description = if ns.is_empty() {
                        gvk.to_string()
                    } else {
                        format!("{} in {}", gvk, ns)
                    };
                    let handle = tokio::spawn(watch_task(
                        api,
                        description,
                        interests.clone(),
                        self.tx.clone(),
                    ));
                    state.watches.insert(key, WatchEntry { interests, handle });
                }
            }
        }

        Ok(())
    }

    /// Removes every registration for `bundle`.
    pub fn clear(&self, bundle: &str) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        let Some(keys) = state.by_bundle.remove(bundle) else {
            return;
        };
        for key in keys {
            Self::unregister(&mut state.watches, &key, bundle);
        }
    }

    fn unregister(watches: &mut HashMap<WatchKey, WatchEntry>, key: &WatchKey, bundle: &str) {
        let empty = match watches.get(key) {
            Some(entry) => {
                let mut interests = match entry.interests.lock() {
                    Ok(i) => i,
                    Err(_) => return,
                };
                interests.remove(bundle);
                interests.is_empty()
            }
            None => false,
        };
        if empty {
            if let Some(entry) = watches.remove(key) {
                log::debug!("stopping drift watch on {}.{}", key.0, key.1);
                entry.handle.abort();
            }
        }
    }

    /// Number of live watches; the sweep logs this for visibility.
    pub fn watch_count(&self) -> usize {
        self.state.lock().map(|s| s.watches.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::TypeMeta;

    fn object(json: serde_json::Value) -> DynamicObject {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn fingerprint_ignores_status_and_server_metadata() {
        let base = object(serde_json::json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {"name": "svc-test", "namespace": "ns-a", "resourceVersion": "1"},
            "spec": {"externalName": "original"}
        }));
        let mut noisy = base.clone();
        let mut value = serde_json::to_value(&noisy).unwrap();
        value["metadata"]["resourceVersion"] = "999".into();
        value["status"] = serde_json::json!({"loadBalancer": {"ingress": []}});
        noisy = serde_json::from_value(value).unwrap();

        assert_eq!(fingerprint(&base), fingerprint(&noisy));
    }

    #[test]
    fn fingerprint_changes_on_spec_mutation() {
        let base = object(serde_json::json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {"name": "svc-test"},
            "spec": {"externalName": "original"}
        }));
        let modified = object(serde_json::json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {"name": "svc-test"},
            "spec": {"externalName": "modified"}
        }));
        assert_ne!(fingerprint(&base), fingerprint(&modified));
    }

    #[test]
    fn interest_lookup_matches_names() {
        let interests = HashMap::from([
            (
                "bundle-a".to_string(),
                HashSet::from(["svc-test".to_string()]),
            ),
            (
                "bundle-b".to_string(),
                HashSet::from(["svc-test".to_string(), "cm-test".to_string()]),
            ),
        ]);
        let mut hit = interested_bundles(&interests, "svc-test");
        hit.sort();
        assert_eq!(hit, vec!["bundle-a", "bundle-b"]);
        assert_eq!(interested_bundles(&interests, "cm-test"), vec!["bundle-b"]);
        assert!(interested_bundles(&interests, "unknown").is_empty());
    }

    #[tokio::test]
    async fn fire_pushes_one_event_per_interested_bundle() {
        let (tx, mut rx) = mpsc::channel(8);
        let interests: Interests = Arc::new(Mutex::new(HashMap::from([(
            "bundle-a".to_string(),
            HashSet::from(["svc-test".to_string()]),
        )])));

        fire(&interests, &tx, "svc-test").await;
        fire(&interests, &tx, "not-watched").await;
        drop(tx);

        assert_eq!(
            rx.recv().await,
            Some(DriftEvent {
                bundle: "bundle-a".to_string()
            })
        );
        assert_eq!(rx.recv().await, None);
    }

    #[test]
    fn dynamic_object_keeps_type_meta_through_serde() {
        let obj = object(serde_json::json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "web"}
        }));
        let types: &TypeMeta = obj.types.as_ref().unwrap();
        assert_eq!(types.api_version, "apps/v1");
        assert_eq!(types.kind, "Deployment");
    }
}
