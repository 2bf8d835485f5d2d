use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use tracing::{debug, info};

use super::runtime::{ClusterRuntime, RuntimeService, RuntimeTask, ServiceSpec};

/// Docker Engine (swarm mode) over its HTTP API, e.g. `http://127.0.0.1:2375`.
pub struct DockerRuntime {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DockerService {
    #[serde(rename = "ID")]
    id: String,
    spec: DockerServiceSpec,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DockerServiceSpec {
    name: String,
    #[serde(default)]
    labels: HashMap<String, String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DockerTask {
    status: DockerTaskStatus,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DockerTaskStatus {
    state: String,
    timestamp: DateTime<Utc>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreatedService {
    #[serde(rename = "ID")]
    id: String,
}

impl DockerRuntime {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url_with_filters(&self, path: &str, filters: &serde_json::Value) -> Result<Url> {
        let url = Url::parse_with_params(
            &format!("{}{}", self.base_url, path),
            &[("filters", filters.to_string())],
        )
        .with_context(|| format!("Invalid docker url: {}{}", self.base_url, path))?;
        Ok(url)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: Url) -> Result<T> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .with_context(|| format!("Request to {} failed", url))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Docker API {} returned {}: {}", url.path(), status, body);
        }
        response
            .json()
            .await
            .with_context(|| format!("Invalid JSON from {}", url.path()))
    }
}

#[async_trait]
impl ClusterRuntime for DockerRuntime {
    async fn list_services(
        &self,
        label_key: &str,
        label_value: &str,
    ) -> Result<Vec<RuntimeService>> {
        let filters = serde_json::json!({ "label": [format!("{}={}", label_key, label_value)] });
        let services: Vec<DockerService> = self
            .get_json(self.url_with_filters("/services", &filters)?)
            .await?;

        let mut result = Vec::with_capacity(services.len());
        for service in services {
            let filters = serde_json::json!({ "service": [service.id.clone()] });
            let tasks: Vec<DockerTask> = self
                .get_json(self.url_with_filters("/tasks", &filters)?)
                .await?;
            debug!(service = %service.spec.name, tasks = tasks.len(), "Listed service tasks");

            result.push(RuntimeService {
                id: service.id,
                name: service.spec.name,
                labels: service.spec.labels,
                tasks: tasks
                    .into_iter()
                    .map(|t| RuntimeTask {
                        state: t.status.state,
                        timestamp: t.status.timestamp,
                    })
                    .collect(),
            });
        }
        Ok(result)
    }

    async fn create_service(&self, spec: &ServiceSpec) -> Result<String> {
        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        let body = serde_json::json!({
            "Name": spec.name,
            "Labels": spec.labels,
            "TaskTemplate": {
                "ContainerSpec": {
                    "Image": spec.image,
                    "Env": env,
                    "Labels": spec.labels,
                },
                "RestartPolicy": { "Condition": "on-failure" },
            },
        });

        let url = format!("{}/services/create", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("Request to {} failed", url))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("Failed to create service '{}' ({}): {}", spec.name, status, text);
        }
        let created: CreatedService = response.json().await.context("Invalid create response")?;
        info!(service = %spec.name, id = %created.id, "Created service");
        Ok(created.id)
    }

    async fn remove_service(&self, service_id: &str) -> Result<()> {
        let url = format!("{}/services/{}", self.base_url, service_id);
        let response = self
            .client
            .delete(&url)
            .send()
            .await
            .with_context(|| format!("Request to {} failed", url))?;
        match response.status() {
            s if s.is_success() => {
                info!(id = %service_id, "Removed service");
                Ok(())
            }
            StatusCode::NOT_FOUND => {
                debug!(id = %service_id, "Service already gone");
                Ok(())
            }
            s => {
                let text = response.text().await.unwrap_or_default();
                bail!("Failed to remove service '{}' ({}): {}", service_id, s, text)
            }
        }
    }
}
