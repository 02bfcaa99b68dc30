use std::sync::Arc;
use std::time::Duration;

use kube::api::{Api, DynamicObject, TypeMeta};
use kube::Client;
use sha2::{Digest, Sha256};

use crate::crds::{BundleDeployment, ModifiedStatus};
use crate::error::AppResult;
use crate::helm::BundleDriver;
use crate::objects::{self, DiscoveryCache};

pub struct Cleanup {
    upstream: Client,
    /// The agent's namespace on the upstream cluster.
    namespace: String,
    default_namespace: String,
    driver: Arc<dyn BundleDriver>,
    cache: Arc<DiscoveryCache>,
}

impl Cleanup {
    pub fn new(
        upstream: Client,
        namespace: String,
        default_namespace: String,
        driver: Arc<dyn BundleDriver>,
        cache: Arc<DiscoveryCache>,
    ) -> Self {
        Self {
            upstream,
            namespace,
            default_namespace,
            driver,
            cache,
        }
    }

    /// Tombstone path: the BundleDeployment is gone, uninstall whatever it
    /// left behind.
    pub async fn cleanup_release(&self, bundle_id: &str) -> AppResult<()> {
        log::info!("BundleDeployment {} is gone, uninstalling its release", bundle_id);
        self.driver.delete(bundle_id).await
    }

    /// Orphan pass: uninstall releases whose BundleDeployment no longer
    /// exists, and releases whose name no longer matches what their
    /// BundleDeployment would deploy today.
    pub async fn cleanup_releases(&self) -> AppResult<()> {
        let deployments = self.driver.list_deployments().await?;
        let api: Api<BundleDeployment> = Api::namespaced(self.upstream.clone(), &self.namespace);

        for deployment in deployments {
            let bd = api.get_opt(&deployment.bundle_id).await?;
            match bd {
                None => {
                    log::info!(
                        "release {} has no BundleDeployment {}, uninstalling",
                        deployment.release_name,
                        deployment.bundle_id
                    );
                    self.driver.delete(&deployment.bundle_id).await?;
                }
                Some(bd) => {
                    let expected = format!(
                        "{}/{}",
                        bd.effective_namespace(&self.default_namespace),
                        bd.release_name()
                    );
                    if deployment.release_name != expected {
                        log::info!(
                            "release {} no longer matches expected {}, uninstalling",
                            deployment.release_name,
                            expected
                        );
                        self.driver.delete_release(&deployment.release_name).await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Deletes the objects an old agent release left behind. Only invoked
    /// when the agent bundle itself is being redeployed.
    pub async fn old_agent(&self, modified: &[ModifiedStatus]) -> AppResult<()> {
        for status in modified.iter().filter(|m| m.delete) {
            let mut obj = DynamicObject {
                types: Some(TypeMeta {
                    api_version: status.api_version.clone(),
                    kind: status.kind.clone(),
                }),
                metadata: Default::default(),
                data: serde_json::json!({}),
            };
            obj.metadata.name = Some(status.name.clone());
            if !status.namespace.is_empty() {
                obj.metadata.namespace = Some(status.namespace.clone());
            }
            objects::delete(&self.cache, &obj).await?;
        }
        Ok(())
    }
}

/// Deterministic smear so many agents do not sweep in lockstep:
/// up to 10% of the interval, derived from the agent name and tick count.
pub fn jittered(interval: Duration, seed: &str, tick: u64) -> Duration {
    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    hasher.update(tick.to_be_bytes());
    let digest = hasher.finalize();
    let raw = u64::from_be_bytes([
        digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
    ]);
    let window = (interval.as_millis() as u64 / 10).max(1);
    interval + Duration::from_millis(raw % window)
}

/// Background sweep; wakes every garbage-collection interval (plus jitter)
/// until the process shuts down.
pub async fn run_sweeper(cleanup: Arc<Cleanup>, interval: Duration, seed: String) {
    let mut tick: u64 = 0;
    loop {
        tokio::time::sleep(jittered(interval, &seed, tick)).await;
        tick = tick.wrapping_add(1);
        log::debug!("starting garbage-collection sweep #{}", tick);
        if let Err(e) = cleanup.cleanup_releases().await {
            log::warn!("garbage-collection sweep failed: {}", e);
        }
    }
}
