use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One task (container instance) of a service, as the runtime reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeTask {
    pub state: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeService {
    pub id: String,
    pub name: String,
    pub labels: HashMap<String, String>,
    pub tasks: Vec<RuntimeTask>,
}

/// What to create.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// The container orchestrator dynamic services run on.
#[async_trait]
pub trait ClusterRuntime: Send + Sync {
    /// Services carrying label `key=value`, with their tasks.
    async fn list_services(&self, label_key: &str, label_value: &str)
    -> Result<Vec<RuntimeService>>;

    /// Create a service and return its id.
    async fn create_service(&self, spec: &ServiceSpec) -> Result<String>;

    /// Remove a service. Removing an unknown service is not an error.
    async fn remove_service(&self, service_id: &str) -> Result<()>;
}

/// Runtime kept in memory. New services get one task in `initial_task_state`.
pub struct InMemoryRuntime {
    services: Mutex<Vec<RuntimeService>>,
    initial_task_state: String,
}

impl Default for InMemoryRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRuntime {
    pub fn new() -> Self {
        Self::with_initial_task_state("running")
    }

    pub fn with_initial_task_state(state: &str) -> Self {
        Self {
            services: Mutex::new(Vec::new()),
            initial_task_state: state.to_string(),
        }
    }

    /// Add a service as is, e.g. one created outside the scheduler.
    pub fn insert_service(&self, service: RuntimeService) {
        self.lock().push(service);
    }

    /// Append a task with `state` to the service named `name`. False when unknown.
    pub fn push_task_state(&self, name: &str, state: &str) -> bool {
        let mut services = self.lock();
        match services.iter_mut().find(|s| s.name == name) {
            Some(service) => {
                service.tasks.push(RuntimeTask {
                    state: state.to_string(),
                    timestamp: Utc::now(),
                });
                true
            }
            None => false,
        }
    }

    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().iter().map(|s| s.name.clone()).collect();
        names.sort();
        names
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<RuntimeService>> {
        self.services.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ClusterRuntime for InMemoryRuntime {
    async fn list_services(
        &self,
        label_key: &str,
        label_value: &str,
    ) -> Result<Vec<RuntimeService>> {
        Ok(self
            .lock()
            .iter()
            .filter(|s| s.labels.get(label_key).map(String::as_str) == Some(label_value))
            .cloned()
            .collect())
    }

    async fn create_service(&self, spec: &ServiceSpec) -> Result<String> {
        let mut services = self.lock();
        if services.iter().any(|s| s.name == spec.name) {
            bail!("service '{}' already exists", spec.name);
        }
        let id = Uuid::new_v4().simple().to_string();
        services.push(RuntimeService {
            id: id.clone(),
            name: spec.name.clone(),
            labels: spec.labels.clone(),
            tasks: vec![RuntimeTask {
                state: self.initial_task_state.clone(),
                timestamp: Utc::now(),
            }],
        });
        Ok(id)
    }

    async fn remove_service(&self, service_id: &str) -> Result<()> {
        self.lock().retain(|s| s.id != service_id);
        Ok(())
    }
}
