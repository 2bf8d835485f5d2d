use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use futures_util::future::join_all;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::engine::after_event::{AfterEventManager, OperationStarter};
use crate::engine::errors::SchedulerError;
use crate::engine::registry::OperationRegistry;
use crate::engine::step::{Operation, Step, StepGroup};
use crate::engine::tracker::{TaskResult, WorkerTracker};
use crate::engine::types::*;
use crate::storage::{KeyValueStore, ScheduleStore};

/// Drives schedules through their operation's step groups.
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    registry: Arc<OperationRegistry>,
    store: ScheduleStore,
    tracker: Arc<WorkerTracker>,
    after_event: AfterEventManager,
    active: Mutex<HashMap<ScheduleId, ActiveSchedule>>,
    restart_lock: tokio::sync::Mutex<()>,
}

/// In-process handles of a schedule that is not terminal yet.
struct ActiveSchedule {
    cancel: CancellationToken,
    status: watch::Sender<ScheduleStatus>,
}

/// What a group run ended with, per step.
struct GroupOutcome {
    statuses: Vec<(StepName, StepStatus)>,
}

impl GroupOutcome {
    fn all_succeeded(&self) -> bool {
        self.statuses.iter().all(|(_, s)| *s == StepStatus::Success)
    }

    fn any_cancelled(&self) -> bool {
        self.statuses
            .iter()
            .any(|(_, s)| *s == StepStatus::Cancelled)
    }

    fn in_error(&self) -> Vec<&str> {
        self.statuses
            .iter()
            .filter(|(_, s)| s.is_error())
            .map(|(n, _)| n.as_str())
            .collect()
    }
}

impl Scheduler {
    pub fn new(
        registry: Arc<OperationRegistry>,
        kv: Arc<dyn KeyValueStore>,
        tracker: Arc<WorkerTracker>,
    ) -> Self {
        let store = ScheduleStore::new(kv);
        let after_event = AfterEventManager::new(registry.clone(), store.clone());
        Self {
            inner: Arc::new(SchedulerInner {
                registry,
                store,
                tracker,
                after_event,
                active: Mutex::new(HashMap::new()),
                restart_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<OperationRegistry> {
        &self.inner.registry
    }

    pub fn tracker(&self) -> &Arc<WorkerTracker> {
        &self.inner.tracker
    }

    pub fn store(&self) -> &ScheduleStore {
        &self.inner.store
    }

    pub fn after_event(&self) -> &AfterEventManager {
        &self.inner.after_event
    }

    /// Validate the initial context, persist a new schedule and start driving it.
    pub async fn start_operation(
        &self,
        operation_name: &str,
        initial_context: OperationContext,
    ) -> Result<ScheduleId, SchedulerError> {
        let operation = self.inner.registry.get_operation(operation_name)?;

        for key in operation.initial_context_required_keys() {
            if !initial_context.contains_key(key) {
                return Err(SchedulerError::InitialContextKeyNotFound {
                    operation: operation_name.to_string(),
                    key: key.clone(),
                });
            }
        }
        let provided = operation.provided_context_keys();
        for key in initial_context.keys() {
            if provided.contains(key) || RESERVED_CONTEXT_KEYS.contains(&key.as_str()) {
                return Err(SchedulerError::InitialContextKeyNotAllowed {
                    operation: operation_name.to_string(),
                    key: key.clone(),
                });
            }
        }

        let schedule_id = Uuid::new_v4().to_string();
        let data = ScheduleData::new(&schedule_id, operation_name);
        self.inner
            .store
            .save_context(&schedule_id, &initial_context)
            .await?;
        self.inner.store.save_schedule(&data).await?;

        self.track(&schedule_id, ScheduleStatus::Pending);
        info!(schedule_id = %schedule_id, operation = %operation_name, "Scheduled operation");

        self.spawn_driver(schedule_id.clone());
        Ok(schedule_id)
    }

    /// Register a continuation on `schedule_id`. Fires immediately if the schedule
    /// already sits at `event_type`; dropped if it finished on another event.
    pub async fn register_to_start_after(
        &self,
        schedule_id: &str,
        event_type: EventType,
        to_start: OperationToStart,
    ) -> Result<(), SchedulerError> {
        self.inner
            .after_event
            .register_to_start_after(schedule_id, event_type, to_start)
            .await?;

        if let Some(data) = self.inner.store.get_schedule(schedule_id).await? {
            if data.has_reached(event_type) {
                self.inner
                    .after_event
                    .claim_and_fire(self, schedule_id, event_type)
                    .await;
            } else if data.status.is_terminal() {
                debug!(
                    schedule_id = %schedule_id,
                    event = %event_type,
                    status = %data.status,
                    "Schedule already finished, dropping unreachable continuation"
                );
                self.inner
                    .after_event
                    .unregister(schedule_id, event_type)
                    .await?;
            }
        }
        Ok(())
    }

    pub async fn register_to_start_after_on_executed_completed(
        &self,
        schedule_id: &str,
        to_start: OperationToStart,
    ) -> Result<(), SchedulerError> {
        self.register_to_start_after(schedule_id, EventType::ExecuteCompleted, to_start)
            .await
    }

    /// Registers `to_start` for both ways a revert can end: `Failed` and `Cancelled`.
    pub async fn register_to_start_after_on_reverted_completed(
        &self,
        schedule_id: &str,
        to_start: OperationToStart,
    ) -> Result<(), SchedulerError> {
        self.register_to_start_after(schedule_id, EventType::Failed, to_start.clone())
            .await?;
        self.register_to_start_after(schedule_id, EventType::Cancelled, to_start)
            .await
    }

    pub async fn get_schedule(&self, schedule_id: &str) -> Result<ScheduleData, SchedulerError> {
        self.inner
            .store
            .get_schedule(schedule_id)
            .await?
            .ok_or_else(|| SchedulerError::ScheduleNotFound(schedule_id.to_string()))
    }

    pub async fn get_context(
        &self,
        schedule_id: &str,
    ) -> Result<OperationContext, SchedulerError> {
        self.get_schedule(schedule_id).await?;
        Ok(self.inner.store.get_context(schedule_id).await?)
    }

    pub async fn list_schedules(&self) -> Result<Vec<ScheduleData>, SchedulerError> {
        Ok(self.inner.store.list_schedules().await?)
    }

    /// Ask a running schedule to stop and revert.
    pub async fn cancel_operation(&self, schedule_id: &str) -> Result<(), SchedulerError> {
        let data = self.get_schedule(schedule_id).await?;
        let operation = self.inner.registry.get_operation(&data.operation_name)?;

        if !operation.is_cancellable() {
            return Err(SchedulerError::OperationNotCancellable {
                schedule_id: schedule_id.to_string(),
                operation: data.operation_name.clone(),
            });
        }
        if data.status == ScheduleStatus::WaitingManualIntervention {
            return Err(SchedulerError::CannotCancelWhileWaitingForManualIntervention(
                schedule_id.to_string(),
            ));
        }
        if data.status.is_terminal() || data.is_reverting {
            warn!(
                schedule_id = %schedule_id,
                status = %data.status,
                reverting = data.is_reverting,
                "Nothing to cancel"
            );
            return Ok(());
        }

        let token = self
            .lock_active()
            .get(schedule_id)
            .map(|a| a.cancel.clone());
        match token {
            Some(token) => token.cancel(),
            None => {
                // Not driven by this process: leave the request in the record.
                let mut data = data.clone();
                data.cancel_requested = true;
                data.updated = Utc::now();
                self.inner.store.save_schedule(&data).await?;
            }
        }

        if let Some(group) = operation.step_groups().get(data.group_index) {
            let group_name = group.name(data.group_index);
            for step in group.steps() {
                let uid = task_uid(schedule_id, &group_name, false, step.name());
                if self.inner.tracker.cancel_run(&uid) {
                    debug!(schedule_id = %schedule_id, task_uid = %uid, "Cancelled in-flight step");
                }
            }
        }

        info!(
            schedule_id = %schedule_id,
            operation = %data.operation_name,
            "Cancellation requested"
        );
        Ok(())
    }

    /// Clear a failed execute step flagged for manual intervention and resume.
    pub async fn restart_step_stuck_in_manual_intervention(
        &self,
        schedule_id: &str,
        step_name: &str,
    ) -> Result<(), SchedulerError> {
        self.restart_step(schedule_id, step_name, false).await
    }

    /// Clear a failed revert step and resume reverting.
    pub async fn restart_step_stuck_during_revert(
        &self,
        schedule_id: &str,
        step_name: &str,
    ) -> Result<(), SchedulerError> {
        self.restart_step(schedule_id, step_name, true).await
    }

    /// Wait until the schedule's status satisfies `predicate`.
    ///
    /// Schedules not driven by this process are not waited on: their stored status is
    /// returned as is.
    pub async fn wait_for(
        &self,
        schedule_id: &str,
        predicate: impl Fn(ScheduleStatus) -> bool,
    ) -> Result<ScheduleStatus, SchedulerError> {
        let receiver = self
            .lock_active()
            .get(schedule_id)
            .map(|a| a.status.subscribe());

        if let Some(mut rx) = receiver {
            loop {
                let status = *rx.borrow_and_update();
                if predicate(status) {
                    return Ok(status);
                }
                if rx.changed().await.is_err() {
                    let status = *rx.borrow();
                    if predicate(status) {
                        return Ok(status);
                    }
                    break;
                }
            }
        }

        Ok(self.get_schedule(schedule_id).await?.status)
    }

    pub async fn wait_for_terminal(
        &self,
        schedule_id: &str,
    ) -> Result<ScheduleStatus, SchedulerError> {
        self.wait_for(schedule_id, |s| s.is_terminal()).await
    }

    /// Park schedules left unfinished by a previous process, then replay continuations.
    ///
    /// In-place resume is never attempted: steps may have had side effects against
    /// external state. Must run before this process starts any schedule.
    pub async fn recover(&self) -> Result<usize, SchedulerError> {
        let mut parked = 0;
        for mut data in self.inner.store.list_schedules().await? {
            if data.status.is_terminal() || data.status == ScheduleStatus::WaitingManualIntervention
            {
                if data.status == ScheduleStatus::WaitingManualIntervention {
                    self.track(&data.schedule_id, data.status);
                }
                continue;
            }

            let operation = match self.inner.registry.get_operation(&data.operation_name) {
                Ok(op) => op,
                Err(e) => {
                    error!(schedule_id = %data.schedule_id, error = %e, "Cannot recover schedule");
                    continue;
                }
            };

            if let Some(group) = operation.step_groups().get(data.group_index) {
                let group_name = group.name(data.group_index);
                for step in group.steps() {
                    let existing = self
                        .inner
                        .store
                        .get_step(&data.schedule_id, &group_name, data.is_reverting, step.name())
                        .await?;
                    if matches!(&existing, Some(s) if s.status == StepStatus::Success) {
                        continue;
                    }
                    let mut state = existing.unwrap_or_else(|| StepState::new(step.name()));
                    state.status = StepStatus::Failed;
                    state.error = Some("interrupted by a scheduler restart".to_string());
                    state.requires_manual_intervention = true;
                    state.finished = Some(Utc::now());
                    self.inner
                        .store
                        .save_step(&data.schedule_id, &group_name, data.is_reverting, &state)
                        .await?;
                }
            }

            data.status = ScheduleStatus::WaitingManualIntervention;
            data.error = Some(OperationError {
                kind: OperationErrorKind::FrameworkIssue,
                message: "scheduler restarted while the schedule was in progress".to_string(),
            });
            data.updated = Utc::now();
            self.inner.store.save_schedule(&data).await?;
            self.track(&data.schedule_id, data.status);

            warn!(
                schedule_id = %data.schedule_id,
                operation = %data.operation_name,
                group = data.group_index,
                reverting = data.is_reverting,
                "Parked interrupted schedule for manual intervention"
            );
            self.inner
                .after_event
                .on_event(self, &data.schedule_id, EventType::WaitingManualIntervention)
                .await;
            parked += 1;
        }

        self.inner.after_event.replay_pending(self).await?;
        Ok(parked)
    }

    // --- driving ---

    fn spawn_driver(&self, schedule_id: ScheduleId) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            if let Err(e) = scheduler.drive(&schedule_id).await {
                error!(schedule_id = %schedule_id, error = %e, "Schedule driver failed");
                scheduler.park_on_framework_error(&schedule_id, &e).await;
            }
        });
    }

    async fn drive(&self, schedule_id: &str) -> Result<(), SchedulerError> {
        let cancel = self.cancel_token(schedule_id);

        loop {
            let mut data = self.get_schedule(schedule_id).await?;
            if data.status.is_terminal() || data.status == ScheduleStatus::WaitingManualIntervention
            {
                return Ok(());
            }
            if data.status == ScheduleStatus::Pending {
                data.status = ScheduleStatus::Running;
                data.updated = Utc::now();
                self.inner.store.save_schedule(&data).await?;
                self.publish(schedule_id, data.status);
            }

            let operation = self.inner.registry.get_operation(&data.operation_name)?;

            if !data.is_reverting && (data.cancel_requested || cancel.is_cancelled()) {
                info!(schedule_id = %schedule_id, group = data.group_index, "Cancelled, reverting");
                data.cancel_requested = true;
                data.is_reverting = true;
                data.updated = Utc::now();
                self.inner.store.save_schedule(&data).await?;
                continue;
            }

            let group = operation
                .step_groups()
                .get(data.group_index)
                .ok_or_else(|| {
                    SchedulerError::Store(anyhow::anyhow!(
                        "schedule points at missing group {}",
                        data.group_index
                    ))
                })?
                .clone();
            let group_name = group.name(data.group_index);

            let outcome = self
                .run_group(&data, &group, &group_name, &cancel)
                .await?;

            if data.is_reverting {
                if outcome.all_succeeded() {
                    if data.group_index == 0 {
                        let (status, event) = if data.cancel_requested {
                            (ScheduleStatus::Cancelled, EventType::Cancelled)
                        } else {
                            (ScheduleStatus::Failed, EventType::Failed)
                        };
                        return self.finish(data, status, event).await;
                    }
                    data.group_index -= 1;
                    data.updated = Utc::now();
                    self.inner.store.save_schedule(&data).await?;
                    continue;
                }

                let stuck = outcome.in_error().join(", ");
                return self
                    .park(
                        data,
                        OperationErrorKind::StepIssue,
                        format!("revert of group {} did not complete: {}", group_name, stuck),
                    )
                    .await;
            }

            if outcome.all_succeeded() {
                if data.cancel_requested || cancel.is_cancelled() {
                    // Cancelled while the group ran: revert it too.
                    continue;
                }
                if data.group_index + 1 < operation.step_groups().len() {
                    data.group_index += 1;
                    data.updated = Utc::now();
                    self.inner.store.save_schedule(&data).await?;
                    continue;
                }
                if group.repeat_steps() {
                    debug!(
                        schedule_id = %schedule_id,
                        group = %group_name,
                        wait_s = group.wait_before_repeat().as_secs_f64(),
                        "Repeating group"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(group.wait_before_repeat()) => {}
                        _ = cancel.cancelled() => {}
                    }
                    for step in group.steps() {
                        self.inner
                            .store
                            .remove_step(schedule_id, &group_name, false, step.name())
                            .await?;
                    }
                    continue;
                }
                return self
                    .finish(data, ScheduleStatus::Succeeded, EventType::ExecuteCompleted)
                    .await;
            }

            let manual: Vec<&Arc<dyn Step>> = group
                .steps()
                .iter()
                .filter(|s| {
                    s.wait_for_manual_intervention()
                        && outcome
                            .statuses
                            .iter()
                            .any(|(n, st)| n == s.name() && *st == StepStatus::Failed)
                })
                .collect();

            if !manual.is_empty() {
                let mut names = Vec::new();
                for step in &manual {
                    if let Some(mut state) = self
                        .inner
                        .store
                        .get_step(schedule_id, &group_name, false, step.name())
                        .await?
                    {
                        state.requires_manual_intervention = true;
                        self.inner
                            .store
                            .save_step(schedule_id, &group_name, false, &state)
                            .await?;
                    }
                    names.push(step.name().to_string());
                }
                return self
                    .park(
                        data,
                        OperationErrorKind::StepIssue,
                        format!("steps waiting for manual intervention: {}", names.join(", ")),
                    )
                    .await;
            }

            if outcome.any_cancelled() {
                data.cancel_requested = true;
            }
            warn!(
                schedule_id = %schedule_id,
                group = %group_name,
                failed = %outcome.in_error().join(", "),
                "Group did not succeed, reverting"
            );
            data.is_reverting = true;
            data.updated = Utc::now();
            self.inner.store.save_schedule(&data).await?;
        }
    }

    async fn run_group(
        &self,
        data: &ScheduleData,
        group: &StepGroup,
        group_name: &str,
        cancel: &CancellationToken,
    ) -> Result<GroupOutcome, SchedulerError> {
        let schedule_id = data.schedule_id.as_str();
        let reverting = data.is_reverting;

        let mut statuses = Vec::new();
        let mut pending = Vec::new();
        for step in group.steps() {
            let existing = self
                .inner
                .store
                .get_step(schedule_id, group_name, reverting, step.name())
                .await?;
            match existing {
                Some(state) if state.status == StepStatus::Success => {
                    statuses.push((step.name().to_string(), StepStatus::Success));
                }
                _ => pending.push(step.clone()),
            }
        }

        if pending.is_empty() {
            return Ok(GroupOutcome { statuses });
        }

        let mut context = self.inner.store.get_context(schedule_id).await?;
        context.insert(
            SCHEDULE_ID_KEY.to_string(),
            serde_json::Value::String(schedule_id.to_string()),
        );
        context.insert(
            OPERATION_NAME_KEY.to_string(),
            serde_json::Value::String(data.operation_name.clone()),
        );

        let runs = pending.into_iter().map(|step| {
            self.run_step(
                schedule_id,
                group_name,
                reverting,
                step,
                &context,
                group.timeout(),
                cancel,
            )
        });
        let results = join_all(runs).await;

        let mut provided_any = false;
        let mut updates = OperationContext::new();
        for result in results {
            let (name, status, provided) = result?;
            if !provided.is_empty() {
                provided_any = true;
                updates.extend(provided);
            }
            statuses.push((name, status));
        }

        if provided_any {
            let mut stored = self.inner.store.get_context(schedule_id).await?;
            stored.extend(updates);
            self.inner.store.save_context(schedule_id, &stored).await?;
        }

        Ok(GroupOutcome { statuses })
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_step(
        &self,
        schedule_id: &str,
        group_name: &str,
        reverting: bool,
        step: Arc<dyn Step>,
        context: &OperationContext,
        timeout: std::time::Duration,
        cancel: &CancellationToken,
    ) -> Result<(StepName, StepStatus, ProvidedOperationContext), SchedulerError> {
        let name = step.name().to_string();
        let (requires, provides, retries) = if reverting {
            (step.revert_requires(), step.revert_provides(), step.revert_retries())
        } else {
            (step.execute_requires(), step.execute_provides(), step.execute_retries())
        };
        let direction = if reverting { "revert" } else { "execute" };
        let uid = task_uid(schedule_id, group_name, reverting, &name);
        let max_attempts = retries + 1;

        let mut state = StepState::new(&name);
        for attempt in 1..=max_attempts {
            state.status = StepStatus::Running;
            state.attempt = attempt;
            state.error = None;
            state.started = Some(Utc::now());
            state.finished = None;
            self.inner
                .store
                .save_step(schedule_id, group_name, reverting, &state)
                .await?;

            info!(
                schedule_id = %schedule_id,
                step = %name,
                direction = direction,
                attempt = attempt,
                max = max_attempts,
                "Running step"
            );

            let outcome = match project(context, &requires) {
                Err(message) => TaskResult::Error {
                    error: message.clone(),
                    traceback: message,
                },
                Ok(required) => {
                    let handler_step = step.clone();
                    let handler = move |ctx: RequiredOperationContext, _: CancellationToken| {
                        async move {
                            if reverting {
                                handler_step.revert(ctx).await
                            } else {
                                handler_step.execute(ctx).await
                            }
                        }
                    };
                    // Reverts run to completion; execute steps follow the schedule's cancel.
                    let tracker = &self.inner.tracker;
                    let result = if reverting {
                        tracker.handle_run(&uid, required, timeout, handler).await
                    } else {
                        tracker
                            .handle_run_linked(&uid, required, timeout, cancel, handler)
                            .await
                    };
                    match result {
                        TaskResult::Success(provided) => {
                            match filter_provided(&name, provided, &provides) {
                                Ok(provided) => TaskResult::Success(provided),
                                Err(message) => TaskResult::Error {
                                    error: message.clone(),
                                    traceback: message,
                                },
                            }
                        }
                        TaskResult::Error { error, traceback } => {
                            TaskResult::Error { error, traceback }
                        }
                        TaskResult::Cancelled => TaskResult::Cancelled,
                    }
                }
            };

            state.finished = Some(Utc::now());
            match outcome {
                TaskResult::Success(provided) => {
                    state.status = StepStatus::Success;
                    self.inner
                        .store
                        .save_step(schedule_id, group_name, reverting, &state)
                        .await?;
                    info!(
                        schedule_id = %schedule_id,
                        step = %name,
                        direction = direction,
                        "Step completed"
                    );
                    return Ok((name, StepStatus::Success, provided));
                }
                TaskResult::Cancelled => {
                    state.status = StepStatus::Cancelled;
                    state.error = Some("cancelled or timed out".to_string());
                    self.inner
                        .store
                        .save_step(schedule_id, group_name, reverting, &state)
                        .await?;
                    warn!(
                        schedule_id = %schedule_id,
                        step = %name,
                        direction = direction,
                        "Step cancelled"
                    );
                    return Ok((name, StepStatus::Cancelled, ProvidedOperationContext::new()));
                }
                TaskResult::Error { error, traceback } => {
                    state.status = StepStatus::Failed;
                    state.error = Some(error.clone());
                    self.inner
                        .store
                        .save_step(schedule_id, group_name, reverting, &state)
                        .await?;
                    warn!(
                        schedule_id = %schedule_id,
                        step = %name,
                        direction = direction,
                        attempt = attempt,
                        error = %error,
                        "Step attempt failed"
                    );
                    debug!(
                        schedule_id = %schedule_id,
                        step = %name,
                        traceback = %traceback,
                        "Step failure detail"
                    );

                    if attempt < max_attempts {
                        let wait = step.wait_between_attempts();
                        if reverting {
                            tokio::time::sleep(wait).await;
                        } else {
                            tokio::select! {
                                _ = tokio::time::sleep(wait) => {}
                                _ = cancel.cancelled() => {
                                    state.status = StepStatus::Cancelled;
                                    self.inner
                                        .store
                                        .save_step(schedule_id, group_name, reverting, &state)
                                        .await?;
                                    return Ok((
                                        name,
                                        StepStatus::Cancelled,
                                        ProvidedOperationContext::new(),
                                    ));
                                }
                            }
                        }
                    }
                }
            }
        }

        Ok((name, StepStatus::Failed, ProvidedOperationContext::new()))
    }

    async fn finish(
        &self,
        mut data: ScheduleData,
        status: ScheduleStatus,
        event: EventType,
    ) -> Result<(), SchedulerError> {
        data.status = status;
        data.updated = Utc::now();
        self.inner.store.save_schedule(&data).await?;
        self.inner.store.remove_progress(&data.schedule_id).await?;

        info!(
            schedule_id = %data.schedule_id,
            operation = %data.operation_name,
            status = %status,
            "Schedule finished"
        );

        self.publish(&data.schedule_id, status);
        self.lock_active().remove(&data.schedule_id);

        self.inner
            .after_event
            .discard_unreachable(&data.schedule_id, event)
            .await;
        self.inner
            .after_event
            .on_event(self, &data.schedule_id, event)
            .await;
        Ok(())
    }

    async fn park(
        &self,
        mut data: ScheduleData,
        kind: OperationErrorKind,
        message: String,
    ) -> Result<(), SchedulerError> {
        warn!(
            schedule_id = %data.schedule_id,
            operation = %data.operation_name,
            reverting = data.is_reverting,
            reason = %message,
            "Schedule waiting for manual intervention"
        );
        data.status = ScheduleStatus::WaitingManualIntervention;
        data.error = Some(OperationError { kind, message });
        data.updated = Utc::now();
        self.inner.store.save_schedule(&data).await?;
        self.publish(&data.schedule_id, data.status);

        self.inner
            .after_event
            .on_event(self, &data.schedule_id, EventType::WaitingManualIntervention)
            .await;
        Ok(())
    }

    async fn park_on_framework_error(&self, schedule_id: &str, err: &SchedulerError) {
        let data = match self.inner.store.get_schedule(schedule_id).await {
            Ok(Some(data)) => data,
            Ok(None) => return,
            Err(e) => {
                error!(
                    schedule_id = %schedule_id,
                    error = %format!("{:#}", e),
                    "Cannot park schedule"
                );
                return;
            }
        };
        if data.status.is_terminal() {
            return;
        }
        if let Err(e) = self
            .park(data, OperationErrorKind::FrameworkIssue, err.to_string())
            .await
        {
            error!(schedule_id = %schedule_id, error = %e, "Cannot park schedule");
        }
    }

    async fn restart_step(
        &self,
        schedule_id: &str,
        step_name: &str,
        during_revert: bool,
    ) -> Result<(), SchedulerError> {
        let _guard = self.inner.restart_lock.lock().await;

        let mut data = self.get_schedule(schedule_id).await?;
        let operation = self.inner.registry.get_operation(&data.operation_name)?;
        let group = current_group(&operation, &data)?;
        let group_name = group.name(data.group_index);

        if !group.contains_step(step_name) {
            return Err(SchedulerError::StepNameNotInCurrentGroup {
                schedule_id: schedule_id.to_string(),
                group: group_name,
                step: step_name.to_string(),
            });
        }

        let not_in_error = || SchedulerError::StepNotInErrorState {
            schedule_id: schedule_id.to_string(),
            step: step_name.to_string(),
        };

        if data.status != ScheduleStatus::WaitingManualIntervention
            || data.is_reverting != during_revert
        {
            return Err(not_in_error());
        }

        let state = self
            .inner
            .store
            .get_step(schedule_id, &group_name, during_revert, step_name)
            .await?
            .ok_or_else(not_in_error)?;
        if !state.status.is_error() {
            return Err(not_in_error());
        }
        if !during_revert && !state.requires_manual_intervention {
            return Err(SchedulerError::StepNotWaitingForManualIntervention {
                schedule_id: schedule_id.to_string(),
                step: step_name.to_string(),
            });
        }

        self.inner
            .store
            .remove_step(schedule_id, &group_name, during_revert, step_name)
            .await?;
        info!(
            schedule_id = %schedule_id,
            step = %step_name,
            reverting = during_revert,
            "Restarting step"
        );

        for other in group.steps().iter().filter(|s| s.name() != step_name) {
            let still_stuck = self
                .inner
                .store
                .get_step(schedule_id, &group_name, during_revert, other.name())
                .await?
                .is_some_and(|s| {
                    s.status.is_error() && (during_revert || s.requires_manual_intervention)
                });
            if still_stuck {
                debug!(
                    schedule_id = %schedule_id,
                    waiting_on = %other.name(),
                    "Other steps still need a restart"
                );
                return Ok(());
            }
        }

        data.status = ScheduleStatus::Running;
        data.error = None;
        data.updated = Utc::now();
        self.inner.store.save_schedule(&data).await?;
        self.track(schedule_id, data.status);
        self.spawn_driver(schedule_id.to_string());
        Ok(())
    }

    // --- in-process bookkeeping ---

    fn track(&self, schedule_id: &str, status: ScheduleStatus) {
        let mut active = self.lock_active();
        match active.get(schedule_id) {
            Some(entry) => {
                entry.status.send_replace(status);
            }
            None => {
                let (tx, _rx) = watch::channel(status);
                active.insert(
                    schedule_id.to_string(),
                    ActiveSchedule {
                        cancel: CancellationToken::new(),
                        status: tx,
                    },
                );
            }
        }
    }

    fn publish(&self, schedule_id: &str, status: ScheduleStatus) {
        if let Some(entry) = self.lock_active().get(schedule_id) {
            entry.status.send_replace(status);
        }
    }

    fn cancel_token(&self, schedule_id: &str) -> CancellationToken {
        let mut active = self.lock_active();
        let entry = active
            .entry(schedule_id.to_string())
            .or_insert_with(|| ActiveSchedule {
                cancel: CancellationToken::new(),
                status: watch::channel(ScheduleStatus::Running).0,
            });
        entry.cancel.clone()
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, HashMap<ScheduleId, ActiveSchedule>> {
        self.inner.active.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl OperationStarter for Scheduler {
    async fn start_operation(
        &self,
        operation_name: &str,
        initial_context: OperationContext,
    ) -> Result<ScheduleId, SchedulerError> {
        Scheduler::start_operation(self, operation_name, initial_context).await
    }
}

/// Tracker uid of one step attempt: `{schedule}:{group}:{E|R}:{step}`.
pub fn task_uid(schedule_id: &str, group_name: &str, reverting: bool, step: &str) -> String {
    let direction = if reverting { "R" } else { "E" };
    format!("{}:{}:{}:{}", schedule_id, group_name, direction, step)
}

fn current_group<'a>(
    operation: &'a Operation,
    data: &ScheduleData,
) -> Result<&'a StepGroup, SchedulerError> {
    operation
        .step_groups()
        .get(data.group_index)
        .ok_or_else(|| {
            SchedulerError::Store(anyhow::anyhow!(
                "schedule '{}' points at missing group {}",
                data.schedule_id,
                data.group_index
            ))
        })
}

/// Keys a step declared as required, or the list of missing ones.
fn project(
    context: &OperationContext,
    requires: &[String],
) -> Result<RequiredOperationContext, String> {
    let mut required = RequiredOperationContext::new();
    let mut missing = Vec::new();
    for key in requires {
        match context.get(key) {
            Some(value) => {
                required.insert(key.clone(), value.clone());
            }
            None => missing.push(key.as_str()),
        }
    }
    if missing.is_empty() {
        Ok(required)
    } else {
        Err(format!("missing required context keys: {}", missing.join(", ")))
    }
}

/// Check a step handed back every key it declared; drop the ones it did not declare.
fn filter_provided(
    step: &str,
    provided: Option<ProvidedOperationContext>,
    declared: &[String],
) -> Result<ProvidedOperationContext, String> {
    let mut provided = provided.unwrap_or_default();
    let mut result = ProvidedOperationContext::new();

    for key in declared {
        match provided.remove(key) {
            Some(serde_json::Value::Null) | None => {
                return Err(format!("step '{}' did not provide key '{}'", step, key));
            }
            Some(value) => {
                result.insert(key.clone(), value);
            }
        }
    }

    if !provided.is_empty() {
        let extra: Vec<&String> = provided.keys().collect();
        warn!(step = %step, keys = ?extra, "Dropping undeclared context keys");
    }

    Ok(result)
}
