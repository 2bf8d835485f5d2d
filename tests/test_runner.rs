//! End-to-end tests for the Scheduler driving operations over an in-memory store.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use dynsched::engine::types::*;
use dynsched::engine::{
    Operation, OperationRegistry, Scheduler, SchedulerError, Step, StepGroup, WorkerTracker,
};
use dynsched::storage::memory_store::MemoryStore;
use serde_json::{Value, json};

use common::{TestStep, ctx};

const WAIT: Duration = Duration::from_secs(10);

fn scheduler_with(ops: Vec<(&str, Operation)>) -> Scheduler {
    scheduler_with_slots(ops, 4)
}

fn scheduler_with_slots(ops: Vec<(&str, Operation)>, slots: usize) -> Scheduler {
    let mut registry = OperationRegistry::new();
    for (name, op) in ops {
        registry.register_operation(name, op).unwrap();
    }
    Scheduler::new(
        Arc::new(registry),
        Arc::new(MemoryStore::new()),
        Arc::new(WorkerTracker::new(slots)),
    )
}

fn single(step: &Arc<TestStep>) -> StepGroup {
    StepGroup::single(step.clone())
}

async fn terminal(scheduler: &Scheduler, id: &str) -> ScheduleStatus {
    tokio::time::timeout(WAIT, scheduler.wait_for_terminal(id))
        .await
        .expect("schedule did not finish in time")
        .unwrap()
}

async fn parked(scheduler: &Scheduler, id: &str) -> ScheduleData {
    tokio::time::timeout(
        WAIT,
        scheduler.wait_for(id, |s| s == ScheduleStatus::WaitingManualIntervention),
    )
    .await
    .expect("schedule did not park in time")
    .unwrap();
    scheduler.get_schedule(id).await.unwrap()
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn runs_groups_in_order_and_cleans_up() {
    let a = TestStep::new("a").arc();
    let b = TestStep::new("b").arc();
    let scheduler = scheduler_with(vec![("op", Operation::new(vec![single(&a), single(&b)]))]);

    let id = scheduler
        .start_operation("op", OperationContext::new())
        .await
        .unwrap();

    assert_eq!(terminal(&scheduler, &id).await, ScheduleStatus::Succeeded);
    assert_eq!(a.executes(), 1);
    assert_eq!(b.executes(), 1);
    assert_eq!(a.reverts(), 0);

    let data = scheduler.get_schedule(&id).await.unwrap();
    assert_eq!(data.group_index, 1);
    assert!(!data.is_reverting);
    assert!(data.error.is_none());

    // Progress is dropped, the record stays.
    assert!(scheduler.get_context(&id).await.unwrap().is_empty());
    assert!(
        scheduler
            .store()
            .get_step(&id, "0S", false, "a")
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn context_flows_from_group_to_group() {
    let producer = TestStep::new("producer")
        .requires(&["seed"])
        .provides("token", json!("abc"))
        .arc();
    let consumer = TestStep::new("consumer")
        .requires(&["token", "seed", SCHEDULE_ID_KEY, OPERATION_NAME_KEY])
        .arc();
    let scheduler = scheduler_with(vec![(
        "op",
        Operation::new(vec![single(&producer), single(&consumer)])
            .with_initial_context_keys(["seed", "unused"]),
    )]);

    let id = scheduler
        .start_operation(
            "op",
            ctx(&[("seed", json!(7)), ("unused", json!("x"))]),
        )
        .await
        .unwrap();
    assert_eq!(terminal(&scheduler, &id).await, ScheduleStatus::Succeeded);

    let seen = producer.last_seen().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen["seed"], json!(7));

    let seen = consumer.last_seen().unwrap();
    assert_eq!(seen["token"], json!("abc"));
    assert_eq!(seen["seed"], json!(7));
    assert_eq!(seen[SCHEDULE_ID_KEY], json!(id));
    assert_eq!(seen[OPERATION_NAME_KEY], json!("op"));
    assert!(!seen.contains_key("unused"));
}

#[tokio::test]
async fn failure_reverts_every_started_group() {
    let a = TestStep::new("a").arc();
    let b = TestStep::new("b").failing(u32::MAX).arc();
    let after = TestStep::new("after").arc();
    let scheduler = scheduler_with(vec![
        ("op", Operation::new(vec![single(&a), single(&b)])),
        ("after_revert", Operation::new(vec![single(&after)])),
    ]);

    let id = scheduler
        .start_operation("op", OperationContext::new())
        .await
        .unwrap();
    scheduler
        .register_to_start_after_on_reverted_completed(
            &id,
            OperationToStart::new("after_revert", OperationContext::new()),
        )
        .await
        .unwrap();

    assert_eq!(terminal(&scheduler, &id).await, ScheduleStatus::Failed);
    let data = scheduler.get_schedule(&id).await.unwrap();
    assert!(data.is_reverting);
    assert!(!data.cancel_requested);
    assert_eq!(data.group_index, 0);
    assert_eq!(b.reverts(), 1);
    assert_eq!(a.reverts(), 1);

    eventually(|| after.executes() == 1).await;
}

#[tokio::test]
async fn retries_until_success() {
    let flaky = TestStep::new("flaky").failing(2).retries(2).arc();
    let scheduler = scheduler_with(vec![("op", Operation::new(vec![single(&flaky)]))]);

    let id = scheduler
        .start_operation("op", OperationContext::new())
        .await
        .unwrap();

    assert_eq!(terminal(&scheduler, &id).await, ScheduleStatus::Succeeded);
    assert_eq!(flaky.executes(), 3);
    assert_eq!(flaky.reverts(), 0);
}

#[tokio::test]
async fn exhausted_retries_fail() {
    let flaky = TestStep::new("flaky").failing(5).retries(1).arc();
    let scheduler = scheduler_with(vec![("op", Operation::new(vec![single(&flaky)]))]);

    let id = scheduler
        .start_operation("op", OperationContext::new())
        .await
        .unwrap();

    assert_eq!(terminal(&scheduler, &id).await, ScheduleStatus::Failed);
    assert_eq!(flaky.executes(), 2);
}

#[tokio::test]
async fn parallel_failure_reverts_all_members() {
    let ok = TestStep::new("ok").arc();
    let bad = TestStep::new("bad").failing(u32::MAX).arc();
    let scheduler = scheduler_with(vec![(
        "op",
        Operation::new(vec![StepGroup::parallel(vec![
            ok.clone() as Arc<dyn Step>,
            bad.clone(),
        ])]),
    )]);

    let id = scheduler
        .start_operation("op", OperationContext::new())
        .await
        .unwrap();

    assert_eq!(terminal(&scheduler, &id).await, ScheduleStatus::Failed);
    assert_eq!(ok.executes(), 1);
    assert_eq!(ok.reverts(), 1);
    assert_eq!(bad.reverts(), 1);
}

#[tokio::test]
async fn null_provided_value_fails_the_step() {
    let step = TestStep::new("nothing").provides("k", Value::Null).arc();
    let scheduler = scheduler_with(vec![("op", Operation::new(vec![single(&step)]))]);

    let id = scheduler
        .start_operation("op", OperationContext::new())
        .await
        .unwrap();

    assert_eq!(terminal(&scheduler, &id).await, ScheduleStatus::Failed);
}

#[tokio::test]
async fn cancel_reverts_and_ends_cancelled() {
    let first = TestStep::new("first").arc();
    let slow = TestStep::new("slow").slow(Duration::from_secs(30)).arc();
    let cancelled = TestStep::new("on_cancel").arc();
    let scheduler = scheduler_with(vec![
        ("op", Operation::new(vec![single(&first), single(&slow)])),
        ("on_cancel", Operation::new(vec![single(&cancelled)])),
    ]);

    let id = scheduler
        .start_operation("op", OperationContext::new())
        .await
        .unwrap();
    scheduler
        .register_to_start_after(
            &id,
            EventType::Cancelled,
            OperationToStart::new("on_cancel", OperationContext::new()),
        )
        .await
        .unwrap();

    eventually(|| slow.executes() == 1).await;
    scheduler.cancel_operation(&id).await.unwrap();

    assert_eq!(terminal(&scheduler, &id).await, ScheduleStatus::Cancelled);
    let data = scheduler.get_schedule(&id).await.unwrap();
    assert!(data.cancel_requested);
    assert_eq!(slow.reverts(), 1);
    assert_eq!(first.reverts(), 1);
    assert_eq!(scheduler.tracker().tracked_count(), 0);

    eventually(|| cancelled.executes() == 1).await;

    // Cancelling a finished schedule is a no-op.
    scheduler.cancel_operation(&id).await.unwrap();
    assert_eq!(
        scheduler.get_schedule(&id).await.unwrap().status,
        ScheduleStatus::Cancelled
    );
}

#[tokio::test]
async fn group_timeout_ends_cancelled() {
    let slow = TestStep::new("slow").slow(Duration::from_secs(30)).arc();
    let scheduler = scheduler_with(vec![(
        "op",
        Operation::new(vec![
            StepGroup::single(slow.clone()).with_timeout(Duration::from_millis(50)),
        ]),
    )]);

    let id = scheduler
        .start_operation("op", OperationContext::new())
        .await
        .unwrap();

    assert_eq!(terminal(&scheduler, &id).await, ScheduleStatus::Cancelled);
    assert_eq!(slow.reverts(), 1);
}

#[tokio::test]
async fn not_cancellable_operation_rejects_cancel() {
    let step = TestStep::new("s").slow(Duration::from_millis(100)).arc();
    let scheduler = scheduler_with(vec![(
        "op",
        Operation::new(vec![single(&step)]).not_cancellable(),
    )]);

    let id = scheduler
        .start_operation("op", OperationContext::new())
        .await
        .unwrap();

    let err = scheduler.cancel_operation(&id).await.unwrap_err();
    assert!(matches!(err, SchedulerError::OperationNotCancellable { .. }));
    assert_eq!(terminal(&scheduler, &id).await, ScheduleStatus::Succeeded);
}

#[tokio::test]
async fn manual_intervention_parks_until_restart() {
    let a = TestStep::new("a").arc();
    let mi = TestStep::new("mi").manual().failing(1).arc();
    let flag = TestStep::new("flag").arc();
    let scheduler = scheduler_with(vec![
        ("op", Operation::new(vec![single(&a), single(&mi)])),
        ("flag", Operation::new(vec![single(&flag)])),
    ]);

    let id = scheduler
        .start_operation("op", OperationContext::new())
        .await
        .unwrap();
    scheduler
        .register_to_start_after(
            &id,
            EventType::WaitingManualIntervention,
            OperationToStart::new("flag", OperationContext::new()),
        )
        .await
        .unwrap();

    let data = parked(&scheduler, &id).await;
    assert!(!data.is_reverting);
    assert_eq!(data.group_index, 1);
    assert_eq!(
        data.error.as_ref().map(|e| e.kind),
        Some(OperationErrorKind::StepIssue)
    );
    assert_eq!(a.reverts(), 0);

    let record = scheduler
        .store()
        .get_step(&id, "1S", false, "mi")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, StepStatus::Failed);
    assert!(record.requires_manual_intervention);

    eventually(|| flag.executes() == 1).await;

    assert!(matches!(
        scheduler.cancel_operation(&id).await.unwrap_err(),
        SchedulerError::CannotCancelWhileWaitingForManualIntervention(_)
    ));
    assert!(matches!(
        scheduler
            .restart_step_stuck_in_manual_intervention(&id, "a")
            .await
            .unwrap_err(),
        SchedulerError::StepNameNotInCurrentGroup { .. }
    ));
    assert!(matches!(
        scheduler
            .restart_step_stuck_during_revert(&id, "mi")
            .await
            .unwrap_err(),
        SchedulerError::StepNotInErrorState { .. }
    ));

    scheduler
        .restart_step_stuck_in_manual_intervention(&id, "mi")
        .await
        .unwrap();

    assert_eq!(terminal(&scheduler, &id).await, ScheduleStatus::Succeeded);
    assert_eq!(mi.executes(), 2);
    assert_eq!(a.executes(), 1);
}

#[tokio::test]
async fn revert_failure_parks_until_restart() {
    let a = TestStep::new("a").failing_revert(1).arc();
    let b = TestStep::new("b").failing(u32::MAX).arc();
    let scheduler = scheduler_with(vec![("op", Operation::new(vec![single(&a), single(&b)]))]);

    let id = scheduler
        .start_operation("op", OperationContext::new())
        .await
        .unwrap();

    let data = parked(&scheduler, &id).await;
    assert!(data.is_reverting);
    assert_eq!(data.group_index, 0);

    assert!(matches!(
        scheduler
            .restart_step_stuck_in_manual_intervention(&id, "a")
            .await
            .unwrap_err(),
        SchedulerError::StepNotInErrorState { .. }
    ));

    scheduler
        .restart_step_stuck_during_revert(&id, "a")
        .await
        .unwrap();

    assert_eq!(terminal(&scheduler, &id).await, ScheduleStatus::Failed);
    assert_eq!(a.reverts(), 2);
    assert_eq!(b.reverts(), 1);
}

#[tokio::test]
async fn repeating_group_runs_until_cancelled() {
    let setup = TestStep::new("setup").arc();
    let watch = TestStep::new("watch").arc();
    let scheduler = scheduler_with(vec![(
        "op",
        Operation::new(vec![
            single(&setup),
            StepGroup::single(watch.clone()).repeating(Duration::from_millis(10)),
        ]),
    )]);

    let id = scheduler
        .start_operation("op", OperationContext::new())
        .await
        .unwrap();

    eventually(|| watch.executes() >= 3).await;
    assert_eq!(
        scheduler.get_schedule(&id).await.unwrap().status,
        ScheduleStatus::Running
    );

    scheduler.cancel_operation(&id).await.unwrap();
    assert_eq!(terminal(&scheduler, &id).await, ScheduleStatus::Cancelled);
    assert_eq!(setup.executes(), 1);
    assert_eq!(setup.reverts(), 1);
    assert_eq!(watch.reverts(), 1);
}

#[tokio::test]
async fn initial_context_is_checked() {
    let step = TestStep::new("s").provides("out", json!(1)).arc();
    let scheduler = scheduler_with(vec![(
        "op",
        Operation::new(vec![single(&step)]).with_initial_context_keys(["seed"]),
    )]);

    assert!(matches!(
        scheduler.start_operation("nope", OperationContext::new()).await,
        Err(SchedulerError::OperationNotFound(_))
    ));
    assert!(matches!(
        scheduler.start_operation("op", OperationContext::new()).await,
        Err(SchedulerError::InitialContextKeyNotFound { key, .. }) if key == "seed"
    ));
    assert!(matches!(
        scheduler
            .start_operation("op", ctx(&[("seed", json!(1)), ("out", json!(2))]))
            .await,
        Err(SchedulerError::InitialContextKeyNotAllowed { key, .. }) if key == "out"
    ));
    assert!(matches!(
        scheduler
            .start_operation("op", ctx(&[("seed", json!(1)), (SCHEDULE_ID_KEY, json!("x"))]))
            .await,
        Err(SchedulerError::InitialContextKeyNotAllowed { .. })
    ));
    assert!(scheduler.list_schedules().await.unwrap().is_empty());
    assert_eq!(step.executes(), 0);
}

#[tokio::test]
async fn unknown_schedule_is_not_found() {
    let scheduler = scheduler_with(vec![]);
    assert!(matches!(
        scheduler.get_schedule("missing").await,
        Err(SchedulerError::ScheduleNotFound(_))
    ));
    assert!(matches!(
        scheduler.cancel_operation("missing").await,
        Err(SchedulerError::ScheduleNotFound(_))
    ));
}

#[tokio::test]
async fn registering_after_the_event_fires_immediately() {
    let step = TestStep::new("s").arc();
    let next = TestStep::new("next").arc();
    let scheduler = scheduler_with(vec![
        ("op", Operation::new(vec![single(&step)])),
        ("next", Operation::new(vec![single(&next)])),
    ]);

    let id = scheduler
        .start_operation("op", OperationContext::new())
        .await
        .unwrap();
    assert_eq!(terminal(&scheduler, &id).await, ScheduleStatus::Succeeded);

    scheduler
        .register_to_start_after_on_executed_completed(
            &id,
            OperationToStart::new("next", OperationContext::new()),
        )
        .await
        .unwrap();

    eventually(|| next.executes() == 1).await;
    assert!(scheduler.store().list_events().await.unwrap().is_empty());
}

#[tokio::test]
async fn recover_parks_interrupted_schedules() {
    let step = TestStep::new("s1").arc();
    let flag = TestStep::new("flag").arc();
    let scheduler = scheduler_with(vec![
        ("op", Operation::new(vec![single(&step)])),
        ("flag", Operation::new(vec![single(&flag)])),
    ]);

    // Left behind by a process that died mid-run.
    let mut data = ScheduleData::new("interrupted", "op");
    data.status = ScheduleStatus::Running;
    scheduler.store().save_schedule(&data).await.unwrap();
    scheduler
        .store()
        .save_context("interrupted", &OperationContext::new())
        .await
        .unwrap();
    scheduler
        .register_to_start_after(
            "interrupted",
            EventType::WaitingManualIntervention,
            OperationToStart::new("flag", OperationContext::new()),
        )
        .await
        .unwrap();

    let mut done = ScheduleData::new("done", "op");
    done.status = ScheduleStatus::Succeeded;
    scheduler.store().save_schedule(&done).await.unwrap();

    assert_eq!(scheduler.recover().await.unwrap(), 1);

    let data = scheduler.get_schedule("interrupted").await.unwrap();
    assert_eq!(data.status, ScheduleStatus::WaitingManualIntervention);
    assert_eq!(
        data.error.as_ref().map(|e| e.kind),
        Some(OperationErrorKind::FrameworkIssue)
    );
    let record = scheduler
        .store()
        .get_step("interrupted", "0S", false, "s1")
        .await
        .unwrap()
        .unwrap();
    assert!(record.requires_manual_intervention);
    assert_eq!(step.executes(), 0);
    eventually(|| flag.executes() == 1).await;

    scheduler
        .restart_step_stuck_in_manual_intervention("interrupted", "s1")
        .await
        .unwrap();
    assert_eq!(
        terminal(&scheduler, "interrupted").await,
        ScheduleStatus::Succeeded
    );
    assert_eq!(step.executes(), 1);
}

#[tokio::test]
async fn cancel_while_waiting_for_a_slot_ends_cancelled() {
    let hog = TestStep::new("hog").slow(Duration::from_millis(800)).arc();
    let queued = TestStep::new("queued").arc();
    let scheduler = scheduler_with_slots(
        vec![
            ("hog", Operation::new(vec![single(&hog)])),
            ("victim", Operation::new(vec![single(&queued)])),
        ],
        1,
    );

    let hog_id = scheduler
        .start_operation("hog", OperationContext::new())
        .await
        .unwrap();
    eventually(|| hog.executes() == 1).await;
    assert!(!scheduler.tracker().has_free_slots());

    let id = scheduler
        .start_operation("victim", OperationContext::new())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(queued.executes(), 0);

    scheduler.cancel_operation(&id).await.unwrap();

    assert_eq!(terminal(&scheduler, &id).await, ScheduleStatus::Cancelled);
    assert_eq!(queued.executes(), 0);
    assert!(scheduler.get_schedule(&id).await.unwrap().cancel_requested);
    assert_eq!(terminal(&scheduler, &hog_id).await, ScheduleStatus::Succeeded);
    assert_eq!(scheduler.tracker().tracked_count(), 0);
}

/// Cancels its own schedule from inside execute, then completes normally.
struct SelfCancellingStep {
    scheduler: OnceLock<Scheduler>,
    executes: AtomicU32,
    reverts: AtomicU32,
}

#[async_trait]
impl Step for SelfCancellingStep {
    fn name(&self) -> &str {
        "self_cancelling"
    }

    async fn execute(
        &self,
        ctx: RequiredOperationContext,
    ) -> anyhow::Result<Option<ProvidedOperationContext>> {
        self.executes.fetch_add(1, Ordering::SeqCst);
        let schedule_id = ctx[SCHEDULE_ID_KEY].as_str().unwrap().to_string();
        self.scheduler
            .get()
            .unwrap()
            .cancel_operation(&schedule_id)
            .await?;
        Ok(None)
    }

    async fn revert(
        &self,
        _ctx: RequiredOperationContext,
    ) -> anyhow::Result<Option<ProvidedOperationContext>> {
        self.reverts.fetch_add(1, Ordering::SeqCst);
        Ok(None)
    }

    fn execute_requires(&self) -> Vec<String> {
        vec![SCHEDULE_ID_KEY.to_string()]
    }
}

#[tokio::test]
async fn cancel_during_the_last_group_reverts_it() {
    let first = TestStep::new("first").arc();
    let last = Arc::new(SelfCancellingStep {
        scheduler: OnceLock::new(),
        executes: AtomicU32::new(0),
        reverts: AtomicU32::new(0),
    });
    let scheduler = scheduler_with(vec![(
        "op",
        Operation::new(vec![single(&first), StepGroup::single(last.clone())]),
    )]);
    assert!(last.scheduler.set(scheduler.clone()).is_ok());

    let id = scheduler
        .start_operation("op", OperationContext::new())
        .await
        .unwrap();

    assert_eq!(terminal(&scheduler, &id).await, ScheduleStatus::Cancelled);
    assert_eq!(last.executes.load(Ordering::SeqCst), 1);
    assert_eq!(last.reverts.load(Ordering::SeqCst), 1);
    assert_eq!(first.reverts(), 1);
}

#[tokio::test]
async fn finishing_discards_unreachable_continuations() {
    let step = TestStep::new("s").slow(Duration::from_millis(100)).arc();
    let next = TestStep::new("next").arc();
    let scheduler = scheduler_with(vec![
        ("op", Operation::new(vec![single(&step)])),
        ("next", Operation::new(vec![single(&next)])),
    ]);

    let id = scheduler
        .start_operation("op", OperationContext::new())
        .await
        .unwrap();
    for event in EventType::ALL {
        scheduler
            .register_to_start_after(
                &id,
                event,
                OperationToStart::new("next", OperationContext::new()),
            )
            .await
            .unwrap();
    }

    assert_eq!(terminal(&scheduler, &id).await, ScheduleStatus::Succeeded);
    eventually(|| next.executes() == 1).await;
    assert!(scheduler.store().list_events().await.unwrap().is_empty());

    // Registering for an event the schedule can no longer reach keeps nothing.
    scheduler
        .register_to_start_after(
            &id,
            EventType::Failed,
            OperationToStart::new("next", OperationContext::new()),
        )
        .await
        .unwrap();
    assert!(scheduler.store().list_events().await.unwrap().is_empty());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(next.executes(), 1);
}
