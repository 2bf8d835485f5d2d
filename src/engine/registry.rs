use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::debug;

use crate::engine::errors::SchedulerError;
use crate::engine::step::{GroupKind, Operation, Step};
use crate::engine::types::RESERVED_CONTEXT_KEYS;

/// Table of known operations.
///
/// Filled during start-up, then wrapped in an `Arc` and shared read-only with the
/// scheduler and the after-event manager.
#[derive(Default)]
pub struct OperationRegistry {
    operations: HashMap<String, Arc<Operation>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and register an operation under `name`.
    pub fn register_operation(
        &mut self,
        name: impl Into<String>,
        operation: Operation,
    ) -> Result<(), SchedulerError> {
        let name = name.into();
        validate_operation(&operation).map_err(|reason| SchedulerError::InvalidOperation {
            operation: name.clone(),
            reason,
        })?;

        if self.operations.contains_key(&name) {
            return Err(SchedulerError::DuplicateOperation(name));
        }

        debug!(operation = %name, groups = operation.step_groups().len(), "Registered operation");
        self.operations.insert(name, Arc::new(operation));
        Ok(())
    }

    pub fn get_operation(&self, name: &str) -> Result<Arc<Operation>, SchedulerError> {
        self.operations
            .get(name)
            .cloned()
            .ok_or_else(|| SchedulerError::OperationNotFound(name.to_string()))
    }

    pub fn get_step(
        &self,
        operation_name: &str,
        step_name: &str,
    ) -> Result<Arc<dyn Step>, SchedulerError> {
        self.get_operation(operation_name)?
            .find_step(step_name)
            .ok_or_else(|| SchedulerError::StepNotFound {
                operation: operation_name.to_string(),
                step: step_name.to_string(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.operations.contains_key(name)
    }

    /// Registered operations sorted by name.
    pub fn list(&self) -> Vec<(&str, &Operation)> {
        let mut entries: Vec<(&str, &Operation)> = self
            .operations
            .iter()
            .map(|(name, op)| (name.as_str(), op.as_ref()))
            .collect();
        entries.sort_by_key(|(name, _)| *name);
        entries
    }
}

fn validate_operation(operation: &Operation) -> Result<(), String> {
    let groups = operation.step_groups();
    if groups.is_empty() {
        return Err("an operation needs at least one step group".to_string());
    }

    let mut step_names = HashSet::new();
    let mut execute_provided: HashSet<String> = HashSet::new();
    let mut revert_provided: HashSet<String> = HashSet::new();
    let mut available: HashSet<String> = operation
        .initial_context_required_keys()
        .iter()
        .cloned()
        .collect();
    available.extend(RESERVED_CONTEXT_KEYS.iter().map(|k| k.to_string()));

    for (index, group) in groups.iter().enumerate() {
        let group_name = group.name(index);

        if group.steps().is_empty() {
            return Err(format!("group {} has no steps", group_name));
        }
        if group.kind() == GroupKind::Parallel && group.steps().len() < 2 {
            return Err(format!(
                "parallel group {} needs at least 2 steps",
                group_name
            ));
        }
        if group.repeat_steps() && index != groups.len() - 1 {
            return Err(format!(
                "only the last group may repeat, {} is not last",
                group_name
            ));
        }

        let mut provided_by_group = Vec::new();
        for step in group.steps() {
            let step_name = step.name();
            if !step_names.insert(step_name.to_string()) {
                return Err(format!("step '{}' is declared more than once", step_name));
            }
            if group.repeat_steps() && step.wait_for_manual_intervention() {
                return Err(format!(
                    "step '{}' waits for manual intervention and cannot be in repeating group {}",
                    step_name, group_name
                ));
            }

            for key in step.execute_requires() {
                if !available.contains(&key) {
                    return Err(format!(
                        "step '{}' requires '{}', missing from initial context and prior groups",
                        step_name, key
                    ));
                }
            }

            for key in step.execute_provides() {
                if RESERVED_CONTEXT_KEYS.contains(&key.as_str()) {
                    return Err(format!("step '{}' provides reserved key '{}'", step_name, key));
                }
                if !execute_provided.insert(key.clone()) {
                    return Err(format!(
                        "key '{}' is provided by more than one step on execute",
                        key
                    ));
                }
                provided_by_group.push(key);
            }
            for key in step.revert_provides() {
                if RESERVED_CONTEXT_KEYS.contains(&key.as_str()) {
                    return Err(format!("step '{}' provides reserved key '{}'", step_name, key));
                }
                if !revert_provided.insert(key.clone()) {
                    return Err(format!(
                        "key '{}' is provided by more than one step on revert",
                        key
                    ));
                }
            }
        }

        available.extend(provided_by_group);
    }

    Ok(())
}
