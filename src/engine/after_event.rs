use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::engine::errors::SchedulerError;
use crate::engine::registry::OperationRegistry;
use crate::engine::types::{EventType, OperationContext, OperationToStart, ScheduleId};
use crate::storage::ScheduleStore;

/// Anything able to launch an operation. Implemented by the scheduler.
#[async_trait]
pub trait OperationStarter: Send + Sync {
    async fn start_operation(
        &self,
        operation_name: &str,
        initial_context: OperationContext,
    ) -> Result<ScheduleId, SchedulerError>;
}

/// Launches follow-up operations once a schedule reaches an event.
///
/// Registrations are persisted at `SCHEDULE:{id}:EVENTS:{event}` and mirrored in memory
/// for the lifetime of the process. Delivery is at-least-once.
pub struct AfterEventManager {
    registry: Arc<OperationRegistry>,
    store: ScheduleStore,
    pending: Mutex<HashMap<(ScheduleId, EventType), OperationToStart>>,
}

impl AfterEventManager {
    pub fn new(registry: Arc<OperationRegistry>, store: ScheduleStore) -> Self {
        Self {
            registry,
            store,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Register `to_start` to run once `schedule_id` reaches `event_type`.
    ///
    /// The operation name is checked first; an unknown name persists nothing.
    /// Registering twice for the same pair overwrites.
    pub async fn register_to_start_after(
        &self,
        schedule_id: &str,
        event_type: EventType,
        to_start: OperationToStart,
    ) -> Result<(), SchedulerError> {
        self.registry.get_operation(&to_start.operation_name)?;

        self.store
            .set_event(schedule_id, event_type, &to_start)
            .await?;

        debug!(
            schedule_id = %schedule_id,
            event = %event_type,
            operation = %to_start.operation_name,
            "Registered continuation"
        );
        self.lock_pending()
            .insert((schedule_id.to_string(), event_type), to_start);
        Ok(())
    }

    /// Drop a registration without firing it. Returns whether one existed.
    pub async fn unregister(
        &self,
        schedule_id: &str,
        event_type: EventType,
    ) -> Result<bool, SchedulerError> {
        let in_memory = self
            .lock_pending()
            .remove(&(schedule_id.to_string(), event_type))
            .is_some();
        let in_store = self.store.delete_event(schedule_id, event_type).await?;
        Ok(in_memory || in_store)
    }

    /// Called by the runner when `schedule_id` reaches `event_type`.
    pub async fn on_event(
        &self,
        starter: &dyn OperationStarter,
        schedule_id: &str,
        event_type: EventType,
    ) {
        let in_memory = self
            .lock_pending()
            .remove(&(schedule_id.to_string(), event_type));

        let to_start = match in_memory {
            Some(to_start) => Some(to_start),
            None => match self.store.get_event(schedule_id, event_type).await {
                Ok(found) => found,
                Err(e) => {
                    warn!(
                        schedule_id = %schedule_id,
                        event = %event_type,
                        error = %format!("{:#}", e),
                        "Could not read continuation"
                    );
                    None
                }
            },
        };

        if let Some(to_start) = to_start {
            self.safe_on_event_type(
                starter,
                event_type,
                schedule_id,
                &to_start.operation_name,
                to_start.initial_context,
            )
            .await;
        }
    }

    /// Fire a continuation with exactly the arguments given.
    ///
    /// The persisted entry is removed first if still present; its absence does not
    /// prevent the start. Errors are logged, never returned.
    pub async fn safe_on_event_type(
        &self,
        starter: &dyn OperationStarter,
        event_type: EventType,
        schedule_id: &str,
        operation_name: &str,
        initial_context: OperationContext,
    ) {
        match self.store.delete_event(schedule_id, event_type).await {
            Ok(true) => {}
            Ok(false) => debug!(
                schedule_id = %schedule_id,
                event = %event_type,
                "Continuation entry already gone"
            ),
            Err(e) => warn!(
                schedule_id = %schedule_id,
                event = %event_type,
                error = %format!("{:#}", e),
                "Failed to delete continuation entry"
            ),
        }

        self.start(starter, event_type, schedule_id, operation_name, initial_context).await;
    }

    /// Fire the registration for `(schedule_id, event_type)` only if this call is the
    /// one removing it from both memory and the store. Returns whether it fired.
    ///
    /// Used when a registration races the event it waits for: whichever side claims
    /// the entry first delivers it.
    pub async fn claim_and_fire(
        &self,
        starter: &dyn OperationStarter,
        schedule_id: &str,
        event_type: EventType,
    ) -> bool {
        let claimed = self
            .lock_pending()
            .remove(&(schedule_id.to_string(), event_type));
        let Some(to_start) = claimed else {
            return false;
        };

        match self.store.delete_event(schedule_id, event_type).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(
                    schedule_id = %schedule_id,
                    event = %event_type,
                    "Continuation already delivered"
                );
                return false;
            }
            Err(e) => warn!(
                schedule_id = %schedule_id,
                event = %event_type,
                error = %format!("{:#}", e),
                "Failed to delete continuation entry"
            ),
        }

        self.start(
            starter,
            event_type,
            schedule_id,
            &to_start.operation_name,
            to_start.initial_context,
        )
        .await;
        true
    }

    /// Drop the registrations `schedule_id` can no longer reach once it ended on `reached`.
    pub async fn discard_unreachable(&self, schedule_id: &str, reached: EventType) -> usize {
        let mut discarded = 0;
        for event_type in EventType::ALL.into_iter().filter(|e| *e != reached) {
            match self.unregister(schedule_id, event_type).await {
                Ok(true) => discarded += 1,
                Ok(false) => {}
                Err(e) => warn!(
                    schedule_id = %schedule_id,
                    event = %event_type,
                    error = %e,
                    "Failed to discard continuation"
                ),
            }
        }
        if discarded > 0 {
            debug!(schedule_id = %schedule_id, discarded = discarded, "Discarded continuations");
        }
        discarded
    }

    async fn start(
        &self,
        starter: &dyn OperationStarter,
        event_type: EventType,
        schedule_id: &str,
        operation_name: &str,
        initial_context: OperationContext,
    ) {
        match starter
            .start_operation(operation_name, initial_context)
            .await
        {
            Ok(new_schedule_id) => info!(
                schedule_id = %schedule_id,
                event = %event_type,
                operation = %operation_name,
                started = %new_schedule_id,
                "Started continuation"
            ),
            Err(e) => error!(
                schedule_id = %schedule_id,
                event = %event_type,
                operation = %operation_name,
                error = %e,
                "Failed to start continuation"
            ),
        }
    }

    /// Fire persisted registrations whose schedule already sits at the registered event.
    /// Registrations pointing at a schedule that no longer exists are dropped.
    pub async fn replay_pending(
        &self,
        starter: &dyn OperationStarter,
    ) -> Result<usize, SchedulerError> {
        let mut fired = 0;
        for (schedule_id, event_type) in self.store.list_events().await? {
            match self.store.get_schedule(&schedule_id).await? {
                Some(data) if data.has_reached(event_type) => {
                    self.on_event(starter, &schedule_id, event_type).await;
                    fired += 1;
                }
                Some(_) => {}
                None => {
                    warn!(
                        schedule_id = %schedule_id,
                        event = %event_type,
                        "Dropping continuation of unknown schedule"
                    );
                    self.store.delete_event(&schedule_id, event_type).await?;
                }
            }
        }

        if fired > 0 {
            info!(fired = fired, "Replayed pending continuations");
        }
        Ok(fired)
    }

    fn lock_pending(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<(ScheduleId, EventType), OperationToStart>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}
