use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use kube::api::{
    Api, DeleteParams, DynamicObject, GroupVersionKind, ListParams, Patch, PatchParams, TypeMeta,
};
use kube::client::Client;
use kube::discovery::{pinned_kind, verbs, ApiCapabilities, ApiResource, Scope};
use kube::ResourceExt;
use sha2::{Digest, Sha256};

use crate::error::{AppError, AppResult};

/// Set ID of the objects applied for one bundle.
pub const APPLIED_ID_ANNOTATION: &str = "flotilla.dev/applied-id";
/// Hash of the set ID; the primary discovery mechanism for plan-delete.
pub const APPLIED_HASH_LABEL: &str = "flotilla.dev/applied-hash";
/// `"false"` exempts an object from plan-delete.
pub const PRUNE_ANNOTATION: &str = "flotilla.dev/prune";

pub const FIELD_MANAGER: &str = "flotilla-agent";

/// Group/version/kind triple usable as a map key with a deterministic order.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GvkKey {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl GvkKey {
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    pub fn to_gvk(&self) -> GroupVersionKind {
        GroupVersionKind {
            group: self.group.clone(),
            version: self.version.clone(),
            kind: self.kind.clone(),
        }
    }

    pub fn from_type_meta(types: &TypeMeta) -> AppResult<Self> {
        let gvk = GroupVersionKind::try_from(types)
            .map_err(|e| AppError::Internal(format!("failed parsing GVK: {}", e)))?;
        Ok(Self {
            group: gvk.group,
            version: gvk.version,
            kind: gvk.kind,
        })
    }
}

impl std::fmt::Display for GvkKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.kind.to_lowercase(), self.api_version())
    }
}

pub fn gvk_of(obj: &DynamicObject) -> AppResult<GvkKey> {
    let types = obj
        .types
        .as_ref()
        .ok_or_else(|| AppError::Internal("missing types on DynamicObject".to_string()))?;
    GvkKey::from_type_meta(types)
}

/// Stable set ID for the objects a bundle owns; recorded verbatim in the
/// applied-id annotation and hashed into the applied-hash label.
pub fn set_id(bundle_id: &str) -> String {
    format!("flotilla.dev-{}", bundle_id)
}

/// Truncated hex digest used as the ownership label value. Label values are
/// capped at 63 characters, so the full digest does not fit.
pub fn applied_hash(set_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(set_id.as_bytes());
    hex::encode(hasher.finalize())[..32].to_string()
}

/// Stamps the ownership contract onto an object. Idempotent.
pub fn decorate(obj: &mut DynamicObject, set_id: &str) {
    let annotations = obj
        .metadata
        .annotations
        .get_or_insert_with(BTreeMap::new);
    annotations.insert(APPLIED_ID_ANNOTATION.to_string(), set_id.to_string());

    let labels = obj.metadata.labels.get_or_insert_with(BTreeMap::new);
    labels.insert(APPLIED_HASH_LABEL.to_string(), applied_hash(set_id));
}

pub fn is_prune_exempt(obj: &DynamicObject) -> bool {
    obj.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(PRUNE_ANNOTATION))
        .map(|v| v == "false")
        .unwrap_or(false)
}

/// Object key within a GVK: `namespace/name` for namespaced kinds, bare
/// `name` otherwise.
pub fn object_key(obj: &DynamicObject, default_namespace: &str, namespaced: bool) -> String {
    if namespaced {
        let ns = obj
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| default_namespace.to_string());
        format!("{}/{}", ns, obj.name_any())
    } else {
        obj.name_any()
    }
}

/// Resolved discovery data per GVK. Read-mostly; one entry per kind is
/// computed through `pinned_kind` and reused for every lookup after that.
/// The whole cache is dropped on a 30s cadence so new CRDs are picked up.
pub struct DiscoveryCache {
    client: Client,
    inner: Mutex<HashMap<GvkKey, (ApiResource, Scope)>>,
}

impl DiscoveryCache {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    pub fn invalidate(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.clear();
        }
    }

    pub async fn resolve(&self, gvk: &GvkKey) -> AppResult<(ApiResource, Scope)> {
        if let Ok(inner) = self.inner.lock() {
            if let Some(entry) = inner.get(gvk) {
                return Ok(entry.clone());
            }
        }

        let (ar, caps): (ApiResource, ApiCapabilities) = pinned_kind(&self.client, &gvk.to_gvk())
            .await
            .map_err(|e| {
                AppError::Internal(format!("GVK {gvk:?} not found via discovery: {}", e))
            })?;

        let entry = (ar, caps.scope);
        if let Ok(mut inner) = self.inner.lock() {
            inner.insert(gvk.clone(), entry.clone());
        }
        Ok(entry)
    }

    /// Api handle for `gvk`, namespaced into `ns` when the kind requires it.
    pub async fn api_for(&self, gvk: &GvkKey, ns: &str) -> AppResult<(Api<DynamicObject>, bool)> {
        let (ar, scope) = self.resolve(gvk).await?;
        match scope {
            Scope::Namespaced => Ok((
                Api::namespaced_with(self.client.clone(), ns, &ar),
                true,
            )),
            Scope::Cluster => Ok((Api::all_with(self.client.clone(), &ar), false)),
        }
    }
}

/// SSA upsert of a dynamic object.
pub async fn apply(
    cache: &DiscoveryCache,
    default_namespace: &str,
    obj: DynamicObject,
) -> AppResult<DynamicObject> {
    // require name + type info
    let name = obj
        .metadata
        .name
        .clone()
        .ok_or_else(|| AppError::Internal("metadata.name required".to_string()))?;
    let gvk = gvk_of(&obj)?;

    let ns = obj
        .metadata
        .namespace
        .clone()
        .unwrap_or_else(|| default_namespace.to_string());
    log::debug!("Applying {}/{}", ns, name);

    let (api, _) = cache.api_for(&gvk, &ns).await?;

    let pp = PatchParams::apply(FIELD_MANAGER).force();
    let obj = api
        .patch(&name, &pp, &Patch::Apply(obj))
        .await
        .map_err(AppError::Kubernetes)?;

    Ok(obj)
}

/// Delete a DynamicObject
pub async fn delete(cache: &DiscoveryCache, obj: &DynamicObject) -> AppResult<()> {
    log::debug!(
        "Deleting {}/{}",
        obj.namespace().unwrap_or_else(|| "-".to_string()),
        obj.name_any()
    );

    let name = obj.name_any();
    let gvk = gvk_of(obj)?;
    let (ar, scope) = cache.resolve(&gvk).await?;

    let api: Api<DynamicObject> = match scope {
        Scope::Namespaced => {
            let ns = obj.metadata.namespace.clone().ok_or_else(|| {
                AppError::Internal("namespaced resource missing metadata.namespace".to_string())
            })?;
            Api::namespaced_with(cache.client(), &ns, &ar)
        }
        Scope::Cluster => Api::all_with(cache.client(), &ar),
    };

    match api.delete(&name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
        Err(e) => Err(AppError::Kubernetes(e)),
    }
}

/// Sweep every discoverable kind for objects carrying `label_selector`.
/// Namespaced kinds are listed in each of `namespaces`; cluster-scoped kinds
/// once. Kinds that refuse listing are skipped, not fatal.
pub async fn list_labelled(
    client: &Client,
    namespaces: &[String],
    label_selector: &str,
) -> AppResult<Vec<DynamicObject>> {
    let disc = kube::Discovery::new(client.clone())
        .run()
        .await
        .map_err(AppError::Kubernetes)?;
    let mut out = Vec::new();

    for group in disc.groups() {
        for (ar, caps) in group.resources_by_stability() {
            // Skip subresources like */status
            if ar.plural.contains('/') {
                continue;
            }
            if !caps.supports_operation(verbs::LIST) {
                continue;
            }
            let types = TypeMeta {
                api_version: ar.api_version.clone(),
                kind: ar.kind.clone(),
            };

            let apis: Vec<Api<DynamicObject>> = match caps.scope {
                Scope::Namespaced => namespaces
                    .iter()
                    .map(|ns| Api::namespaced_with(client.clone(), ns, &ar))
                    .collect(),
                Scope::Cluster => vec![Api::all_with(client.clone(), &ar)],
            };

            for api in apis {
                // Paginate to avoid truncation on large lists
                let mut lp = ListParams::default().labels(label_selector).limit(500);
                let mut continue_token: Option<String> = None;

                loop {
                    if let Some(token) = continue_token.clone() {
                        lp = ListParams {
                            continue_token: Some(token),
                            ..lp.clone()
                        };
                    }

                    let list = match api.list(&lp).await {
                        Ok(l) => l,
                        // 405 = method not allowed (common for subresources/misreported caps)
                        Err(kube::Error::Api(e)) if e.code == 405 => break,
                        // 403/404/etc.: skip this kind but keep going
                        Err(_) => break,
                    };

                    out.extend(list.items.into_iter().map(|mut o| {
                        o.types = o.types.or(Some(types.clone()));
                        o
                    }));

                    continue_token = list
                        .metadata
                        .continue_
                        .and_then(|x| if x.is_empty() { None } else { Some(x) });

                    if continue_token.is_none() {
                        break;
                    }
                }
            }
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(api_version: &str, kind: &str, ns: Option<&str>, name: &str) -> DynamicObject {
        let mut obj = DynamicObject {
            types: Some(TypeMeta {
                api_version: api_version.to_string(),
                kind: kind.to_string(),
            }),
            metadata: Default::default(),
            data: serde_json::json!({}),
        };
        obj.metadata.name = Some(name.to_string());
        obj.metadata.namespace = ns.map(|s| s.to_string());
        obj
    }

    #[test]
    fn gvk_key_from_core_and_grouped() {
        let svc = gvk_of(&object("v1", "Service", None, "svc")).unwrap();
        assert_eq!(svc.group, "");
        assert_eq!(svc.api_version(), "v1");
        assert_eq!(svc.to_string(), "service.v1");

        let deploy = gvk_of(&object("apps/v1", "Deployment", None, "d")).unwrap();
        assert_eq!(deploy.group, "apps");
        assert_eq!(deploy.api_version(), "apps/v1");
    }

    #[test]
    fn decoration_is_idempotent_and_hash_is_stable() {
        let mut obj = object("v1", "ConfigMap", Some("ns-a"), "cm-test");
        decorate(&mut obj, "ns-a/my-bundle");
        let first = obj.labels().get(APPLIED_HASH_LABEL).cloned().unwrap();
        decorate(&mut obj, "ns-a/my-bundle");
        let second = obj.labels().get(APPLIED_HASH_LABEL).cloned().unwrap();

        assert_eq!(first, second);
        assert_eq!(first.len(), 32);
        assert_eq!(first, applied_hash("ns-a/my-bundle"));
        assert_eq!(
            obj.annotations().get(APPLIED_ID_ANNOTATION).map(|s| s.as_str()),
            Some("ns-a/my-bundle")
        );
    }

    #[test]
    fn object_keys_respect_scope() {
        let obj = object("v1", "ConfigMap", Some("ns-a"), "cm-test");
        assert_eq!(object_key(&obj, "default", true), "ns-a/cm-test");

        let no_ns = object("v1", "ConfigMap", None, "cm-test");
        assert_eq!(object_key(&no_ns, "default", true), "default/cm-test");
        assert_eq!(object_key(&no_ns, "default", false), "cm-test");
    }

    #[test]
    fn prune_exemption_requires_false() {
        let mut obj = object("v1", "ConfigMap", None, "cm");
        assert!(!is_prune_exempt(&obj));
        obj.metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(PRUNE_ANNOTATION.to_string(), "false".to_string());
        assert!(is_prune_exempt(&obj));
    }
}
