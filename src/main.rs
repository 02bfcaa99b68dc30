mod cleanup;
mod config;
mod controller;
mod crds;
mod desired;
mod error;
mod helm;
mod manifest;
mod monitor;
mod objects;
mod trigger;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::cleanup::Cleanup;
use crate::config::AgentConfig;
use crate::controller::Context;
use crate::desired::DesiredSet;
use crate::helm::{BundleDriver, HelmDeployer};
use crate::manifest::ContentLoader;
use crate::monitor::Monitor;
use crate::objects::DiscoveryCache;
use crate::trigger::Trigger;

#[tokio::main]
#[allow(clippy::expect_used)]
async fn main() -> std::io::Result<()> {
    // Configure logger with custom filters; kube chatters at info level
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .filter_module("kube_runtime::controller", log::LevelFilter::Warn)
        .filter_module("kube_client", log::LevelFilter::Warn)
        .filter_module("tower", log::LevelFilter::Warn)
        .filter_module("hyper", log::LevelFilter::Warn)
        .filter_module("flotilla", log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let agent_config = AgentConfig::from_env().expect("invalid agent configuration");
    log::info!(
        "agent {} managing BundleDeployments from upstream namespace {}",
        agent_config.agent_name,
        agent_config.namespace
    );

    let upstream = config::upstream_client()
        .await
        .expect("failed to build upstream client");
    let local = config::local_client()
        .await
        .expect("failed to build local cluster client");

    let cache = Arc::new(DiscoveryCache::new(local.clone()));
    let driver: Arc<dyn BundleDriver> = Arc::new(HelmDeployer::new(
        local.clone(),
        agent_config.agent_namespace.clone(),
        agent_config.default_namespace.clone(),
    ));
    let monitor = Monitor::new(cache.clone());
    let desired = DesiredSet::new(cache.clone());

    let (drift_tx, drift_rx) = mpsc::channel(1024);
    let trigger = Arc::new(Trigger::new(cache.clone(), drift_tx));

    let gc = Arc::new(Cleanup::new(
        upstream.clone(),
        agent_config.namespace.clone(),
        agent_config.default_namespace.clone(),
        driver.clone(),
        cache.clone(),
    ));
    let loader = ContentLoader::new(upstream.clone());

    let ctx = Arc::new(Context::new(
        upstream,
        agent_config.clone(),
        driver,
        monitor,
        desired,
        trigger,
        gc.clone(),
        loader,
    ));

    // Drop the discovery cache periodically so freshly installed CRDs are
    // picked up without a restart.
    let cache_refresh = cache.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(30)).await;
            cache_refresh.invalidate();
        }
    });

    let gc_interval = agent_config.gc_interval;
    let seed = agent_config.agent_name.clone();
    tokio::select! {
        _ = controller::run(ctx.clone()) => {
            log::info!("BundleDeployment controller stopped");
        }
        _ = controller::drift::run(ctx.clone(), drift_rx) => {
            log::info!("drift reconciler stopped");
        }
        _ = cleanup::run_sweeper(gc, gc_interval, seed) => {
            log::info!("garbage-collection sweeper stopped");
        }
    }

    Ok(())
}
