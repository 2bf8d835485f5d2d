use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::engine::types::{ProvidedOperationContext, RequiredOperationContext};

pub const DEFAULT_WAIT_BETWEEN_ATTEMPTS: Duration = Duration::from_secs(5);
pub const DEFAULT_GROUP_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_WAIT_BEFORE_REPEAT: Duration = Duration::from_secs(5);

/// A named unit of work inside an operation.
///
/// Steps hold whatever handles they need (ledger, runtime, ...) as fields and keep no
/// state between invocations. Failing is done by returning an error; the runner decides
/// whether to retry, revert or wait for an operator.
#[async_trait]
pub trait Step: Send + Sync {
    /// Step name, unique within one operation.
    fn name(&self) -> &str;

    /// Forward action. Receives only the keys listed in `execute_requires`.
    async fn execute(
        &self,
        ctx: RequiredOperationContext,
    ) -> Result<Option<ProvidedOperationContext>>;

    /// Compensating action. Must tolerate `execute` never having run.
    async fn revert(
        &self,
        _ctx: RequiredOperationContext,
    ) -> Result<Option<ProvidedOperationContext>> {
        Ok(None)
    }

    fn execute_requires(&self) -> Vec<String> {
        Vec::new()
    }

    fn execute_provides(&self) -> Vec<String> {
        Vec::new()
    }

    fn revert_requires(&self) -> Vec<String> {
        Vec::new()
    }

    fn revert_provides(&self) -> Vec<String> {
        Vec::new()
    }

    fn execute_retries(&self) -> u32 {
        0
    }

    fn revert_retries(&self) -> u32 {
        0
    }

    fn wait_between_attempts(&self) -> Duration {
        DEFAULT_WAIT_BETWEEN_ATTEMPTS
    }

    /// When true, an execute failure parks the schedule instead of reverting it.
    fn wait_for_manual_intervention(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupKind {
    Single,
    Parallel,
}

/// Steps that run together. The unit of ordering and of rollback.
#[derive(Clone)]
pub struct StepGroup {
    kind: GroupKind,
    steps: Vec<Arc<dyn Step>>,
    timeout: Duration,
    repeat_steps: bool,
    wait_before_repeat: Duration,
}

impl StepGroup {
    pub fn single(step: Arc<dyn Step>) -> Self {
        Self {
            kind: GroupKind::Single,
            steps: vec![step],
            timeout: DEFAULT_GROUP_TIMEOUT,
            repeat_steps: false,
            wait_before_repeat: DEFAULT_WAIT_BEFORE_REPEAT,
        }
    }

    /// All members are dispatched at once; the group finishes when every member finished.
    pub fn parallel(steps: Vec<Arc<dyn Step>>) -> Self {
        Self {
            kind: GroupKind::Parallel,
            steps,
            timeout: DEFAULT_GROUP_TIMEOUT,
            repeat_steps: false,
            wait_before_repeat: DEFAULT_WAIT_BEFORE_REPEAT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run this group again after `wait_before_repeat` every time it succeeds.
    /// Only valid on the last group of an operation.
    pub fn repeating(mut self, wait_before_repeat: Duration) -> Self {
        self.repeat_steps = true;
        self.wait_before_repeat = wait_before_repeat;
        self
    }

    pub fn kind(&self) -> GroupKind {
        self.kind
    }

    pub fn steps(&self) -> &[Arc<dyn Step>] {
        &self.steps
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn repeat_steps(&self) -> bool {
        self.repeat_steps
    }

    pub fn wait_before_repeat(&self) -> Duration {
        self.wait_before_repeat
    }

    pub fn contains_step(&self, name: &str) -> bool {
        self.steps.iter().any(|s| s.name() == name)
    }

    /// Name used in store keys and task uids, e.g. `0S`, `1P`, `2SR`.
    pub fn name(&self, index: usize) -> String {
        let kind = match self.kind {
            GroupKind::Single => "S",
            GroupKind::Parallel => "P",
        };
        let repeat = if self.repeat_steps { "R" } else { "" };
        format!("{}{}{}", index, kind, repeat)
    }
}

impl fmt::Debug for StepGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.steps.iter().map(|s| s.name()).collect();
        f.debug_struct("StepGroup")
            .field("kind", &self.kind)
            .field("steps", &names)
            .field("timeout", &self.timeout)
            .field("repeat_steps", &self.repeat_steps)
            .finish()
    }
}

/// Ordered sequence of step groups. Immutable once registered.
#[derive(Debug, Clone)]
pub struct Operation {
    step_groups: Vec<StepGroup>,
    initial_context_required_keys: BTreeSet<String>,
    is_cancellable: bool,
}

impl Operation {
    pub fn new(step_groups: Vec<StepGroup>) -> Self {
        Self {
            step_groups,
            initial_context_required_keys: BTreeSet::new(),
            is_cancellable: true,
        }
    }

    pub fn with_initial_context_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.initial_context_required_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn not_cancellable(mut self) -> Self {
        self.is_cancellable = false;
        self
    }

    pub fn step_groups(&self) -> &[StepGroup] {
        &self.step_groups
    }

    pub fn initial_context_required_keys(&self) -> &BTreeSet<String> {
        &self.initial_context_required_keys
    }

    pub fn is_cancellable(&self) -> bool {
        self.is_cancellable
    }

    pub fn find_step(&self, name: &str) -> Option<Arc<dyn Step>> {
        self.step_groups
            .iter()
            .flat_map(|g| g.steps())
            .find(|s| s.name() == name)
            .cloned()
    }

    /// Every key any step provides, in either direction.
    pub fn provided_context_keys(&self) -> HashSet<String> {
        self.step_groups
            .iter()
            .flat_map(|g| g.steps())
            .flat_map(|s| {
                let mut keys = s.execute_provides();
                keys.extend(s.revert_provides());
                keys
            })
            .collect()
    }
}
