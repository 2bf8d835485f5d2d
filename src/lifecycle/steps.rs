use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use async_trait::async_trait;
use tracing::{debug, info};

use crate::engine::step::Step;
use crate::engine::types::{
    ProvidedOperationContext, RequiredOperationContext, SCHEDULE_ID_KEY,
};
use crate::ledger::RunLedger;
use crate::probe::{
    self, ClusterRuntime, NODE_ID_LABEL, PROXY_PREFIX, SIDECAR_PREFIX, ServiceSpec,
};
use crate::storage::KeyValueStore;

use super::{IMAGE, IS_LEGACY, NODE_ID, RUN_ID, monitor_key};

fn keys(names: &[&str]) -> Vec<String> {
    names.iter().map(|k| k.to_string()).collect()
}

fn str_value<'a>(ctx: &'a RequiredOperationContext, key: &str) -> Result<&'a str> {
    ctx.get(key)
        .and_then(|v| v.as_str())
        .with_context(|| format!("context key '{}' must be a string", key))
}

fn bool_value(ctx: &RequiredOperationContext, key: &str) -> Result<bool> {
    ctx.get(key)
        .and_then(|v| v.as_bool())
        .with_context(|| format!("context key '{}' must be a boolean", key))
}

async fn remove_node_services(runtime: &dyn ClusterRuntime, node_id: &str) -> Result<usize> {
    let services = runtime.list_services(NODE_ID_LABEL, node_id).await?;
    for service in &services {
        runtime.remove_service(&service.id).await?;
    }
    Ok(services.len())
}

/// Creates the services of a node: one legacy service, or a sidecar plus its proxy.
/// Services that already exist are left alone.
pub struct CreateServices {
    pub runtime: Arc<dyn ClusterRuntime>,
    pub proxy_image: String,
}

impl CreateServices {
    fn desired(&self, node_id: &str, image: &str, is_legacy: bool) -> Vec<ServiceSpec> {
        let labels = HashMap::from([(NODE_ID_LABEL.to_string(), node_id.to_string())]);
        let env = HashMap::from([("DYNSCHED_NODE_ID".to_string(), node_id.to_string())]);
        if is_legacy {
            return vec![ServiceSpec {
                name: format!("dy-service_{}", node_id),
                image: image.to_string(),
                labels,
                env,
            }];
        }
        vec![
            ServiceSpec {
                name: format!("{}{}", SIDECAR_PREFIX, node_id),
                image: image.to_string(),
                labels: labels.clone(),
                env: env.clone(),
            },
            ServiceSpec {
                name: format!("{}{}", PROXY_PREFIX, node_id),
                image: self.proxy_image.clone(),
                labels,
                env,
            },
        ]
    }
}

#[async_trait]
impl Step for CreateServices {
    fn name(&self) -> &str {
        "CreateServices"
    }

    async fn execute(
        &self,
        ctx: RequiredOperationContext,
    ) -> Result<Option<ProvidedOperationContext>> {
        let node_id = str_value(&ctx, NODE_ID)?;
        let image = str_value(&ctx, IMAGE)?;
        let is_legacy = bool_value(&ctx, IS_LEGACY)?;

        let existing: HashSet<String> = self
            .runtime
            .list_services(NODE_ID_LABEL, node_id)
            .await?
            .into_iter()
            .map(|s| s.name)
            .collect();

        for spec in self.desired(node_id, image, is_legacy) {
            if existing.contains(&spec.name) {
                debug!(node_id = %node_id, service = %spec.name, "Service already exists");
                continue;
            }
            self.runtime.create_service(&spec).await?;
        }
        Ok(None)
    }

    async fn revert(
        &self,
        ctx: RequiredOperationContext,
    ) -> Result<Option<ProvidedOperationContext>> {
        let node_id = str_value(&ctx, NODE_ID)?;
        let removed = remove_node_services(self.runtime.as_ref(), node_id).await?;
        info!(node_id = %node_id, removed = removed, "Removed services of failed start");
        Ok(None)
    }

    fn execute_requires(&self) -> Vec<String> {
        keys(&[NODE_ID, IMAGE, IS_LEGACY])
    }

    fn revert_requires(&self) -> Vec<String> {
        keys(&[NODE_ID])
    }
}

/// Fails until every expected component of the node is running.
pub struct WaitForServicesPresent {
    pub runtime: Arc<dyn ClusterRuntime>,
    pub retries: u32,
    pub wait: Duration,
}

#[async_trait]
impl Step for WaitForServicesPresent {
    fn name(&self) -> &str {
        "WaitForServicesPresent"
    }

    async fn execute(
        &self,
        ctx: RequiredOperationContext,
    ) -> Result<Option<ProvidedOperationContext>> {
        let node_id = str_value(&ctx, NODE_ID)?;
        let is_legacy = bool_value(&ctx, IS_LEGACY)?;
        let presence = probe::get_services_presence(self.runtime.as_ref(), node_id).await?;
        if !presence.all_present(is_legacy) {
            bail!(
                "services of node '{}' not ready yet: {:?}",
                node_id,
                presence.expected(is_legacy)
            );
        }
        Ok(None)
    }

    fn execute_requires(&self) -> Vec<String> {
        keys(&[NODE_ID, IS_LEGACY])
    }

    fn execute_retries(&self) -> u32 {
        self.retries
    }

    fn wait_between_attempts(&self) -> Duration {
        self.wait
    }
}

/// Probes the node and fails as soon as an expected component is no longer running.
pub struct MonitorServices {
    pub runtime: Arc<dyn ClusterRuntime>,
}

#[async_trait]
impl Step for MonitorServices {
    fn name(&self) -> &str {
        "MonitorServices"
    }

    async fn execute(
        &self,
        ctx: RequiredOperationContext,
    ) -> Result<Option<ProvidedOperationContext>> {
        let node_id = str_value(&ctx, NODE_ID)?;
        let is_legacy = bool_value(&ctx, IS_LEGACY)?;
        let presence = probe::get_services_presence(self.runtime.as_ref(), node_id).await?;
        if !presence.all_present(is_legacy) {
            bail!("node '{}' lost a component: {:?}", node_id, presence.expected(is_legacy));
        }
        Ok(None)
    }

    fn execute_requires(&self) -> Vec<String> {
        keys(&[NODE_ID, IS_LEGACY])
    }
}

/// Records which schedule monitors a node, so that a stop can cancel it.
pub struct RegisterMonitor {
    pub kv: Arc<dyn KeyValueStore>,
}

#[async_trait]
impl Step for RegisterMonitor {
    fn name(&self) -> &str {
        "RegisterMonitor"
    }

    async fn execute(
        &self,
        ctx: RequiredOperationContext,
    ) -> Result<Option<ProvidedOperationContext>> {
        let node_id = str_value(&ctx, NODE_ID)?;
        let schedule_id = str_value(&ctx, SCHEDULE_ID_KEY)?;
        self.kv.set(&monitor_key(node_id), schedule_id).await?;
        Ok(None)
    }

    async fn revert(
        &self,
        ctx: RequiredOperationContext,
    ) -> Result<Option<ProvidedOperationContext>> {
        let node_id = str_value(&ctx, NODE_ID)?;
        let schedule_id = str_value(&ctx, SCHEDULE_ID_KEY)?;
        let key = monitor_key(node_id);
        if self.kv.get(&key).await?.as_deref() == Some(schedule_id) {
            self.kv.delete(&key).await?;
        }
        Ok(None)
    }

    fn execute_requires(&self) -> Vec<String> {
        keys(&[NODE_ID, SCHEDULE_ID_KEY])
    }

    fn revert_requires(&self) -> Vec<String> {
        keys(&[NODE_ID, SCHEDULE_ID_KEY])
    }
}

/// Removes every service labelled with the node id.
pub struct RemoveServices {
    pub runtime: Arc<dyn ClusterRuntime>,
}

#[async_trait]
impl Step for RemoveServices {
    fn name(&self) -> &str {
        "RemoveServices"
    }

    async fn execute(
        &self,
        ctx: RequiredOperationContext,
    ) -> Result<Option<ProvidedOperationContext>> {
        let node_id = str_value(&ctx, NODE_ID)?;
        let removed = remove_node_services(self.runtime.as_ref(), node_id).await?;
        info!(node_id = %node_id, removed = removed, "Removed services");
        Ok(None)
    }

    fn execute_requires(&self) -> Vec<String> {
        keys(&[NODE_ID])
    }
}

/// Fails until no service of the node is left running.
pub struct WaitForServicesAbsent {
    pub runtime: Arc<dyn ClusterRuntime>,
    pub retries: u32,
    pub wait: Duration,
}

#[async_trait]
impl Step for WaitForServicesAbsent {
    fn name(&self) -> &str {
        "WaitForServicesAbsent"
    }

    async fn execute(
        &self,
        ctx: RequiredOperationContext,
    ) -> Result<Option<ProvidedOperationContext>> {
        let node_id = str_value(&ctx, NODE_ID)?;
        let presence = probe::get_services_presence(self.runtime.as_ref(), node_id).await?;
        if !presence.all_absent() {
            bail!("services of node '{}' still around: {:?}", node_id, presence);
        }
        Ok(None)
    }

    fn execute_requires(&self) -> Vec<String> {
        keys(&[NODE_ID])
    }

    fn execute_retries(&self) -> u32 {
        self.retries
    }

    fn wait_between_attempts(&self) -> Duration {
        self.wait
    }
}

/// Drops the ledger row of a run, freeing the node for the next request.
pub struct ReleaseRun {
    pub ledger: Arc<RunLedger>,
}

#[async_trait]
impl Step for ReleaseRun {
    fn name(&self) -> &str {
        "ReleaseRun"
    }

    async fn execute(
        &self,
        ctx: RequiredOperationContext,
    ) -> Result<Option<ProvidedOperationContext>> {
        let run_id = str_value(&ctx, RUN_ID)?;
        self.ledger.remove_run(run_id).await?;
        Ok(None)
    }

    fn execute_requires(&self) -> Vec<String> {
        keys(&[RUN_ID])
    }
}

/// Flags a run so an operator sees it needs attention.
pub struct FlagRun {
    pub ledger: Arc<RunLedger>,
}

#[async_trait]
impl Step for FlagRun {
    fn name(&self) -> &str {
        "FlagRun"
    }

    async fn execute(
        &self,
        ctx: RequiredOperationContext,
    ) -> Result<Option<ProvidedOperationContext>> {
        let run_id = str_value(&ctx, RUN_ID)?;
        self.ledger.set_waiting_manual_intervention(run_id).await?;
        Ok(None)
    }

    fn execute_requires(&self) -> Vec<String> {
        keys(&[RUN_ID])
    }

    fn execute_retries(&self) -> u32 {
        3
    }
}
