use std::sync::Arc;

use anyhow::{Context as _, Result};

use crate::engine::types::{
    EventType, OperationContext, OperationToStart, ScheduleData, StepState,
};
use crate::storage::KeyValueStore;

const SCHEDULE_PREFIX: &str = "SCHEDULE:";

/// Typed view over a [`KeyValueStore`] for everything keyed by a schedule id.
///
/// Layout:
/// - `SCHEDULE:{id}` schedule record
/// - `SCHEDULE:{id}:CONTEXT` operation context
/// - `SCHEDULE:{id}:STEPS:{group}:{E|R}:{step}` step records
/// - `SCHEDULE:{id}:EVENTS:{event}` registered continuations
#[derive(Clone)]
pub struct ScheduleStore {
    kv: Arc<dyn KeyValueStore>,
}

impl ScheduleStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    pub fn kv(&self) -> &Arc<dyn KeyValueStore> {
        &self.kv
    }

    pub fn schedule_key(schedule_id: &str) -> String {
        format!("{}{}", SCHEDULE_PREFIX, schedule_id)
    }

    pub fn context_key(schedule_id: &str) -> String {
        format!("{}{}:CONTEXT", SCHEDULE_PREFIX, schedule_id)
    }

    pub fn step_key(schedule_id: &str, group: &str, is_reverting: bool, step: &str) -> String {
        let direction = if is_reverting { "R" } else { "E" };
        format!(
            "{}{}:STEPS:{}:{}:{}",
            SCHEDULE_PREFIX, schedule_id, group, direction, step
        )
    }

    pub fn event_key(schedule_id: &str, event: EventType) -> String {
        format!("{}{}:EVENTS:{}", SCHEDULE_PREFIX, schedule_id, event)
    }

    // --- schedules ---

    pub async fn get_schedule(&self, schedule_id: &str) -> Result<Option<ScheduleData>> {
        self.get_json(&Self::schedule_key(schedule_id)).await
    }

    pub async fn save_schedule(&self, data: &ScheduleData) -> Result<()> {
        self.set_json(&Self::schedule_key(&data.schedule_id), data)
            .await
    }

    /// Every schedule record in the store.
    pub async fn list_schedules(&self) -> Result<Vec<ScheduleData>> {
        let mut schedules = Vec::new();
        for key in self.kv.keys(SCHEDULE_PREFIX).await? {
            let rest = &key[SCHEDULE_PREFIX.len()..];
            if rest.contains(':') {
                continue;
            }
            if let Some(data) = self.get_json::<ScheduleData>(&key).await? {
                schedules.push(data);
            }
        }
        schedules.sort_by(|a, b| a.created.cmp(&b.created));
        Ok(schedules)
    }

    // --- context ---

    pub async fn get_context(&self, schedule_id: &str) -> Result<OperationContext> {
        Ok(self
            .get_json(&Self::context_key(schedule_id))
            .await?
            .unwrap_or_default())
    }

    pub async fn save_context(&self, schedule_id: &str, ctx: &OperationContext) -> Result<()> {
        self.set_json(&Self::context_key(schedule_id), ctx).await
    }

    // --- steps ---

    pub async fn get_step(
        &self,
        schedule_id: &str,
        group: &str,
        is_reverting: bool,
        step: &str,
    ) -> Result<Option<StepState>> {
        self.get_json(&Self::step_key(schedule_id, group, is_reverting, step))
            .await
    }

    pub async fn save_step(
        &self,
        schedule_id: &str,
        group: &str,
        is_reverting: bool,
        state: &StepState,
    ) -> Result<()> {
        self.set_json(
            &Self::step_key(schedule_id, group, is_reverting, &state.step_name),
            state,
        )
        .await
    }

    pub async fn remove_step(
        &self,
        schedule_id: &str,
        group: &str,
        is_reverting: bool,
        step: &str,
    ) -> Result<bool> {
        self.kv
            .delete(&Self::step_key(schedule_id, group, is_reverting, step))
            .await
    }

    /// Drop context and step records, keeping the schedule record and continuations.
    pub async fn remove_progress(&self, schedule_id: &str) -> Result<()> {
        self.kv.delete(&Self::context_key(schedule_id)).await?;
        let steps_prefix = format!("{}{}:STEPS:", SCHEDULE_PREFIX, schedule_id);
        for key in self.kv.keys(&steps_prefix).await? {
            self.kv.delete(&key).await?;
        }
        Ok(())
    }

    // --- continuations ---

    pub async fn get_event(
        &self,
        schedule_id: &str,
        event: EventType,
    ) -> Result<Option<OperationToStart>> {
        self.get_json(&Self::event_key(schedule_id, event)).await
    }

    pub async fn set_event(
        &self,
        schedule_id: &str,
        event: EventType,
        to_start: &OperationToStart,
    ) -> Result<()> {
        self.set_json(&Self::event_key(schedule_id, event), to_start)
            .await
    }

    pub async fn delete_event(&self, schedule_id: &str, event: EventType) -> Result<bool> {
        self.kv.delete(&Self::event_key(schedule_id, event)).await
    }

    /// `(schedule_id, event)` of every registered continuation.
    pub async fn list_events(&self) -> Result<Vec<(String, EventType)>> {
        let mut events = Vec::new();
        for key in self.kv.keys(SCHEDULE_PREFIX).await? {
            let rest = &key[SCHEDULE_PREFIX.len()..];
            if let Some((schedule_id, event)) = rest.split_once(":EVENTS:")
                && let Some(event) = EventType::parse(event)
            {
                events.push((schedule_id.to_string(), event));
            }
        }
        Ok(events)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.kv.get(key).await? {
            Some(raw) => {
                let value = serde_json::from_str(&raw)
                    .with_context(|| format!("Failed to parse store entry: {}", key))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn set_json<T: serde::Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        self.kv.set(key, &raw).await
    }
}
