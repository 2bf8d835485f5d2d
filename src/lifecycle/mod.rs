//! Start, monitor and stop of dynamic services, chained through continuations.
//!
//! ```text
//! start_service ──completed──▶ monitor_service (repeats until cancelled)
//!       │ reverted ──▶ finish_run
//!       └ parked   ──▶ flag_run_for_manual_intervention
//! stop_service  ──completed──▶ finish_run
//!       └ reverted/parked ──▶ flag_run_for_manual_intervention
//! ```

pub mod steps;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};

use crate::engine::types::{EventType, OperationContext, OperationToStart, ScheduleId};
use crate::engine::{Operation, OperationRegistry, Scheduler, SchedulerError, Step, StepGroup};
use crate::ledger::{LedgerError, Run, RunLedger};
use crate::probe::ClusterRuntime;
use crate::storage::KeyValueStore;

use steps::*;

pub const START_SERVICE: &str = "start_service";
pub const MONITOR_SERVICE: &str = "monitor_service";
pub const STOP_SERVICE: &str = "stop_service";
pub const FINISH_RUN: &str = "finish_run";
pub const FLAG_RUN_FOR_MANUAL_INTERVENTION: &str = "flag_run_for_manual_intervention";

pub const NODE_ID: &str = "node_id";
pub const IS_LEGACY: &str = "is_legacy";
pub const IMAGE: &str = "image";
pub const RUN_ID: &str = "run_id";

/// Store key holding the schedule id monitoring a node.
pub fn monitor_key(node_id: &str) -> String {
    format!("NODE:{}:MONITOR", node_id)
}

#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub proxy_image: String,
    /// Extra probe attempts while waiting for services to appear or vanish.
    pub presence_retries: u32,
    pub presence_wait: Duration,
    pub monitor_interval: Duration,
    pub group_timeout: Duration,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            proxy_image: "traefik:v3.1".to_string(),
            presence_retries: 30,
            presence_wait: Duration::from_secs(2),
            monitor_interval: Duration::from_secs(5),
            group_timeout: Duration::from_secs(60),
        }
    }
}

/// Handles the lifecycle steps need.
#[derive(Clone)]
pub struct LifecycleDeps {
    pub ledger: Arc<RunLedger>,
    pub runtime: Arc<dyn ClusterRuntime>,
    pub kv: Arc<dyn KeyValueStore>,
    pub settings: LifecycleSettings,
}

/// Register the five lifecycle operations.
pub fn register_operations(
    registry: &mut OperationRegistry,
    deps: &LifecycleDeps,
) -> Result<(), SchedulerError> {
    let settings = &deps.settings;
    let timeout = settings.group_timeout;

    registry.register_operation(
        START_SERVICE,
        Operation::new(vec![
            StepGroup::single(Arc::new(CreateServices {
                runtime: deps.runtime.clone(),
                proxy_image: settings.proxy_image.clone(),
            }))
            .with_timeout(timeout),
            StepGroup::single(Arc::new(WaitForServicesPresent {
                runtime: deps.runtime.clone(),
                retries: settings.presence_retries,
                wait: settings.presence_wait,
            }))
            .with_timeout(timeout),
        ])
        .with_initial_context_keys([NODE_ID, IMAGE, IS_LEGACY]),
    )?;

    registry.register_operation(
        MONITOR_SERVICE,
        Operation::new(vec![
            StepGroup::parallel(vec![
                Arc::new(ReleaseRun {
                    ledger: deps.ledger.clone(),
                }) as Arc<dyn Step>,
                Arc::new(RegisterMonitor {
                    kv: deps.kv.clone(),
                }),
            ])
            .with_timeout(timeout),
            StepGroup::single(Arc::new(MonitorServices {
                runtime: deps.runtime.clone(),
            }))
            .with_timeout(timeout)
            .repeating(settings.monitor_interval),
        ])
        .with_initial_context_keys([NODE_ID, IS_LEGACY, RUN_ID]),
    )?;

    registry.register_operation(
        STOP_SERVICE,
        Operation::new(vec![
            StepGroup::single(Arc::new(RemoveServices {
                runtime: deps.runtime.clone(),
            }))
            .with_timeout(timeout),
            StepGroup::single(Arc::new(WaitForServicesAbsent {
                runtime: deps.runtime.clone(),
                retries: settings.presence_retries,
                wait: settings.presence_wait,
            }))
            .with_timeout(timeout),
        ])
        .with_initial_context_keys([NODE_ID])
        .not_cancellable(),
    )?;

    registry.register_operation(
        FINISH_RUN,
        Operation::new(vec![StepGroup::single(Arc::new(ReleaseRun {
            ledger: deps.ledger.clone(),
        }))])
        .with_initial_context_keys([RUN_ID]),
    )?;

    registry.register_operation(
        FLAG_RUN_FOR_MANUAL_INTERVENTION,
        Operation::new(vec![StepGroup::single(Arc::new(FlagRun {
            ledger: deps.ledger.clone(),
        }))])
        .with_initial_context_keys([RUN_ID])
        .not_cancellable(),
    )?;

    Ok(())
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartServiceRequest {
    pub node_id: String,
    pub image: String,
    #[serde(default)]
    pub is_legacy: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct LaunchedRun {
    pub run: Run,
    pub schedule_id: ScheduleId,
}

/// Entry points for starting and stopping dynamic services.
pub struct Lifecycle {
    scheduler: Scheduler,
    ledger: Arc<RunLedger>,
    kv: Arc<dyn KeyValueStore>,
}

impl Lifecycle {
    pub fn new(scheduler: Scheduler, ledger: Arc<RunLedger>, kv: Arc<dyn KeyValueStore>) -> Self {
        Self {
            scheduler,
            ledger,
            kv,
        }
    }

    pub async fn start_service(
        &self,
        request: &StartServiceRequest,
    ) -> Result<LaunchedRun, LifecycleError> {
        let run = self
            .ledger
            .create_from_start_request(&request.node_id)
            .await?;

        let ctx = context([
            (NODE_ID, json!(request.node_id)),
            (IMAGE, json!(request.image)),
            (IS_LEGACY, json!(request.is_legacy)),
        ]);
        let schedule_id = match self.scheduler.start_operation(START_SERVICE, ctx).await {
            Ok(id) => id,
            Err(e) => {
                self.ledger.remove_run(&run.run_id).await?;
                return Err(e.into());
            }
        };

        let monitor = OperationToStart::new(
            MONITOR_SERVICE,
            context([
                (NODE_ID, json!(request.node_id)),
                (IS_LEGACY, json!(request.is_legacy)),
                (RUN_ID, json!(run.run_id)),
            ]),
        );
        self.scheduler
            .register_to_start_after_on_executed_completed(&schedule_id, monitor)
            .await?;
        self.scheduler
            .register_to_start_after_on_reverted_completed(
                &schedule_id,
                run_operation(FINISH_RUN, &run),
            )
            .await?;
        self.scheduler
            .register_to_start_after(
                &schedule_id,
                EventType::WaitingManualIntervention,
                run_operation(FLAG_RUN_FOR_MANUAL_INTERVENTION, &run),
            )
            .await?;

        info!(
            node_id = %request.node_id,
            run_id = %run.run_id,
            schedule_id = %schedule_id,
            "Starting service"
        );
        Ok(LaunchedRun { run, schedule_id })
    }

    pub async fn stop_service(&self, node_id: &str) -> Result<LaunchedRun, LifecycleError> {
        let run = self.ledger.create_from_stop_request(node_id).await?;

        self.cancel_monitor(node_id).await;

        let ctx = context([(NODE_ID, json!(node_id))]);
        let schedule_id = match self.scheduler.start_operation(STOP_SERVICE, ctx).await {
            Ok(id) => id,
            Err(e) => {
                self.ledger.remove_run(&run.run_id).await?;
                return Err(e.into());
            }
        };

        self.scheduler
            .register_to_start_after_on_executed_completed(
                &schedule_id,
                run_operation(FINISH_RUN, &run),
            )
            .await?;
        self.scheduler
            .register_to_start_after_on_reverted_completed(
                &schedule_id,
                run_operation(FLAG_RUN_FOR_MANUAL_INTERVENTION, &run),
            )
            .await?;
        self.scheduler
            .register_to_start_after(
                &schedule_id,
                EventType::WaitingManualIntervention,
                run_operation(FLAG_RUN_FOR_MANUAL_INTERVENTION, &run),
            )
            .await?;

        info!(
            node_id = %node_id,
            run_id = %run.run_id,
            schedule_id = %schedule_id,
            "Stopping service"
        );
        Ok(LaunchedRun { run, schedule_id })
    }

    /// Schedule id of the monitor watching `node_id`, if any.
    pub async fn monitor_schedule(&self, node_id: &str) -> anyhow::Result<Option<ScheduleId>> {
        self.kv.get(&monitor_key(node_id)).await
    }

    async fn cancel_monitor(&self, node_id: &str) {
        let schedule_id = match self.monitor_schedule(node_id).await {
            Ok(Some(id)) => id,
            Ok(None) => return,
            Err(e) => {
                warn!(
                    node_id = %node_id,
                    error = %format!("{:#}", e),
                    "Cannot read monitor schedule"
                );
                return;
            }
        };
        match self.scheduler.cancel_operation(&schedule_id).await {
            Ok(()) => info!(node_id = %node_id, schedule_id = %schedule_id, "Cancelled monitor"),
            Err(e) => warn!(
                node_id = %node_id,
                schedule_id = %schedule_id,
                error = %e,
                "Could not cancel monitor"
            ),
        }
    }
}

fn context<const N: usize>(entries: [(&str, serde_json::Value); N]) -> OperationContext {
    entries
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

fn run_operation(operation: &str, run: &Run) -> OperationToStart {
    OperationToStart::new(operation, context([(RUN_ID, json!(run.run_id))]))
}
