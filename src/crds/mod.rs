pub mod conditions;

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use serde::{Deserialize, Serialize};

pub use conditions::Condition;

/// Desired deployment of a bundle onto this cluster, written by the upstream
/// management cluster into the agent's namespace there.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize)]
#[kube(
    group = "flotilla.dev",
    version = "v1alpha1",
    kind = "BundleDeployment",
    shortname = "bd",
    namespaced,
    schema = "disabled",
    status = "BundleDeploymentStatus",
    printcolumn = r#"{"name":"Deployed", "jsonPath":".status.display.deployed", "type":"string"}"#,
    printcolumn = r#"{"name":"Monitored", "jsonPath":".status.display.monitored", "type":"string"}"#,
    printcolumn = r#"{"name":"State", "jsonPath":".status.display.state", "type":"string"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BundleDeploymentSpec {
    /// Opaque fingerprint of the desired content and options, formatted
    /// `<contentID>:<optionsHash>`. A change means redeploy.
    #[serde(default)]
    pub deployment_id: String,
    /// Deployment configuration.
    #[serde(default)]
    pub options: BundleDeploymentOptions,
    /// While true the agent neither deploys nor watches for drift.
    #[serde(default)]
    pub paused: bool,
    /// Controls whether detected drift is corrected by re-applying.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correct_drift: Option<CorrectDrift>,
    /// When set, Helm values live in a sidecar Secret named like this
    /// BundleDeployment; the hash must match before the Secret is trusted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values_hash: Option<String>,
    /// Names of BundleDeployments in the same namespace that must be Ready
    /// before this one deploys.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<Vec<String>>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleDeploymentOptions {
    /// Fallback install namespace, applied to resources without one.
    /// `"-"` means "unset".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_namespace: Option<String>,
    /// Overrides `defaultNamespace` for release placement; forces every
    /// object into it. `"-"` means "unset".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_namespace: Option<String>,
    /// Service account in the agent's namespace used to impersonate Helm
    /// calls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helm: Option<HelmOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kustomize: Option<KustomizeOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<DiffOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ignore: Option<IgnoreOptions>,
    /// Bumping this forces a redeploy even when the deployment ID is
    /// unchanged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub force_sync_generation: Option<i64>,
    /// Label selector the release target namespace must match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_target_namespace_selector: Option<LabelSelector>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HelmOptions {
    /// Explicit Helm release name; otherwise the BundleDeployment name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Literal values, merged under any `valuesFrom` sources.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values_from: Option<Vec<ValuesFrom>>,
    /// Install/upgrade wait timeout; 0 falls back to the 10 minute default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub atomic: bool,
    #[serde(default)]
    pub take_ownership: bool,
    #[serde(default)]
    pub wait_for_jobs: bool,
    #[serde(default)]
    pub disable_pre_process: bool,
    /// Retained release revisions; default 10.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_history: Option<u32>,
}

/// Reference to a key of a ConfigMap or Secret on the local cluster whose
/// content is merged into the Helm values.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValuesFrom {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map_key_ref: Option<KeyRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key_ref: Option<KeyRef>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KustomizeOptions {
    /// Sub-directory within the bundle to run Kustomize against.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffOptions {
    #[serde(default)]
    pub compare_patches: Vec<ComparePatch>,
}

/// Diff post-processing rule for one resource. `operations` may carry the
/// special op `ignore` (drop the resource from the plan entirely) or plain
/// JSON-patch operations applied to both live and desired before diffing.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparePatch {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub operations: Vec<PatchOp>,
    /// JSON pointers whose values are ignored when computing the diff.
    #[serde(default)]
    pub json_pointers: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct PatchOp {
    pub op: String,
    #[serde(default)]
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IgnoreOptions {
    /// Conditions to ignore when summarising readiness, each given as the
    /// field values that must all match, e.g. `{"type": "Stalled"}`.
    #[serde(default)]
    pub conditions: Vec<BTreeMap<String, String>>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CorrectDrift {
    #[serde(default)]
    pub enabled: bool,
    /// Re-install with Helm's force flag so immutable-through-merge paths
    /// succeed via delete+recreate.
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub keep_fail_history: bool,
}

/// Cleared optional fields serialize as explicit nulls so the status merge
/// patch can remove them upstream.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleDeploymentStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub applied_deployment_id: Option<String>,
    /// `namespace/name:revision` of the backing Helm release.
    #[serde(default)]
    pub release: Option<String>,
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub non_modified: bool,
    #[serde(default)]
    pub display: Option<BundleDeploymentDisplay>,
    #[serde(default)]
    pub sync_generation: Option<i64>,
    #[serde(default)]
    pub resources: Vec<DeployedResource>,
    /// Representative out-of-band modifications, capped at 10.
    #[serde(default)]
    pub modified_status: Vec<ModifiedStatus>,
    /// Representative not-ready resources, capped at 10.
    #[serde(default)]
    pub non_ready_status: Vec<NonReadyStatus>,
    #[serde(default)]
    pub resource_counts: Option<ResourceCounts>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BundleDeploymentDisplay {
    #[serde(default)]
    pub deployed: String,
    #[serde(default)]
    pub monitored: String,
    #[serde(default)]
    pub state: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeployedResource {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModifiedStatus {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub name: String,
    /// The desired object is absent from the cluster and would be created.
    #[serde(default)]
    pub create: bool,
    /// The object exists but is no longer part of the desired set.
    #[serde(default)]
    pub delete: bool,
    #[serde(default)]
    pub exist: bool,
    /// JSON merge patch (live to desired) for modified objects.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<String>,
}

impl ModifiedStatus {
    /// `apiVersion/Kind Namespace/Name` identity used for deterministic
    /// ordering and log messages.
    pub fn sort_key(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.api_version, self.kind, self.namespace, self.name
        )
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NonReadyStatus {
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub summary: Summary,
}

/// Condensed readiness of one deployed object.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub error: bool,
    #[serde(default)]
    pub transitioning: bool,
    #[serde(default)]
    pub message: Vec<String>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceCounts {
    #[serde(default)]
    pub desired_ready: i32,
    #[serde(default)]
    pub ready: i32,
    #[serde(default)]
    pub not_ready: i32,
    #[serde(default)]
    pub missing: i32,
    #[serde(default)]
    pub modified: i32,
    #[serde(default)]
    pub orphaned: i32,
    #[serde(default)]
    pub unknown: i32,
    #[serde(default)]
    pub wait_applied: i32,
}

/// Bundle payload referenced by the content half of a deployment ID.
/// Cluster-scoped on the upstream cluster.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize)]
#[kube(
    group = "flotilla.dev",
    version = "v1alpha1",
    kind = "Content",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct ContentSpec {
    /// gzip+base64 encoded archive of the bundle's resource files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Checksum of the decoded payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256sum: Option<String>,
}

impl BundleDeployment {
    /// Namespace the release is placed in: `targetNamespace` wins over
    /// `defaultNamespace`; `"-"` unsets the field it appears on.
    pub fn effective_namespace(&self, agent_default: &str) -> String {
        let unset = |v: &Option<String>| -> Option<String> {
            v.as_deref()
                .filter(|s| !s.is_empty() && *s != "-")
                .map(|s| s.to_string())
        };
        unset(&self.spec.options.target_namespace)
            .or_else(|| unset(&self.spec.options.default_namespace))
            .unwrap_or_else(|| agent_default.to_string())
    }

    /// Helm release name for this bundle.
    pub fn release_name(&self) -> String {
        self.spec
            .options
            .helm
            .as_ref()
            .and_then(|h| h.release_name.clone())
            .unwrap_or_else(|| {
                self.metadata
                    .name
                    .clone()
                    .unwrap_or_default()
            })
    }
}
