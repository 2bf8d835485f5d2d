//! Shared fixtures for the scheduler tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde_json::Value;

use dynsched::engine::Step;
use dynsched::engine::types::{
    OperationContext, ProvidedOperationContext, RequiredOperationContext,
};

/// Scriptable step that records every invocation.
pub struct TestStep {
    name: String,
    requires: Vec<String>,
    provides: HashMap<String, Value>,
    revert_requires: Vec<String>,
    revert_provides: HashMap<String, Value>,
    execute_failures: AtomicU32,
    revert_failures: AtomicU32,
    execute_delay: Duration,
    execute_retries: u32,
    revert_retries: u32,
    manual: bool,
    pub execute_calls: AtomicU32,
    pub revert_calls: AtomicU32,
    pub seen: Mutex<Vec<RequiredOperationContext>>,
}

impl TestStep {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            requires: Vec::new(),
            provides: HashMap::new(),
            revert_requires: Vec::new(),
            revert_provides: HashMap::new(),
            execute_failures: AtomicU32::new(0),
            revert_failures: AtomicU32::new(0),
            execute_delay: Duration::ZERO,
            execute_retries: 0,
            revert_retries: 0,
            manual: false,
            execute_calls: AtomicU32::new(0),
            revert_calls: AtomicU32::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn requires(mut self, keys: &[&str]) -> Self {
        self.requires = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn provides(mut self, key: &str, value: Value) -> Self {
        self.provides.insert(key.to_string(), value);
        self
    }

    pub fn revert_requires(mut self, keys: &[&str]) -> Self {
        self.revert_requires = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn revert_provides(mut self, key: &str, value: Value) -> Self {
        self.revert_provides.insert(key.to_string(), value);
        self
    }

    /// Fail the next `n` executes. `u32::MAX` fails forever.
    pub fn failing(self, n: u32) -> Self {
        self.execute_failures.store(n, Ordering::SeqCst);
        self
    }

    pub fn failing_revert(self, n: u32) -> Self {
        self.revert_failures.store(n, Ordering::SeqCst);
        self
    }

    pub fn slow(mut self, delay: Duration) -> Self {
        self.execute_delay = delay;
        self
    }

    pub fn retries(mut self, n: u32) -> Self {
        self.execute_retries = n;
        self
    }

    pub fn revert_retries(mut self, n: u32) -> Self {
        self.revert_retries = n;
        self
    }

    pub fn manual(mut self) -> Self {
        self.manual = true;
        self
    }

    pub fn arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn executes(&self) -> u32 {
        self.execute_calls.load(Ordering::SeqCst)
    }

    pub fn reverts(&self) -> u32 {
        self.revert_calls.load(Ordering::SeqCst)
    }

    pub fn last_seen(&self) -> Option<RequiredOperationContext> {
        self.seen.lock().unwrap().last().cloned()
    }
}

fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
            0 => None,
            u32::MAX => Some(u32::MAX),
            n => Some(n - 1),
        })
        .is_ok()
}

#[async_trait]
impl Step for TestStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        ctx: RequiredOperationContext,
    ) -> Result<Option<ProvidedOperationContext>> {
        self.execute_calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(ctx);
        if !self.execute_delay.is_zero() {
            tokio::time::sleep(self.execute_delay).await;
        }
        if take_failure(&self.execute_failures) {
            bail!("{} failed on purpose", self.name);
        }
        Ok(Some(self.provides.clone()))
    }

    async fn revert(
        &self,
        _ctx: RequiredOperationContext,
    ) -> Result<Option<ProvidedOperationContext>> {
        self.revert_calls.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.revert_failures) {
            bail!("revert of {} failed on purpose", self.name);
        }
        Ok(Some(self.revert_provides.clone()))
    }

    fn execute_requires(&self) -> Vec<String> {
        self.requires.clone()
    }

    fn execute_provides(&self) -> Vec<String> {
        self.provides.keys().cloned().collect()
    }

    fn revert_requires(&self) -> Vec<String> {
        self.revert_requires.clone()
    }

    fn revert_provides(&self) -> Vec<String> {
        self.revert_provides.keys().cloned().collect()
    }

    fn execute_retries(&self) -> u32 {
        self.execute_retries
    }

    fn revert_retries(&self) -> u32 {
        self.revert_retries
    }

    fn wait_between_attempts(&self) -> Duration {
        Duration::from_millis(10)
    }

    fn wait_for_manual_intervention(&self) -> bool {
        self.manual
    }
}

pub fn ctx(entries: &[(&str, Value)]) -> OperationContext {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}
