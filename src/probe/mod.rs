//! Infrastructure state probe: maps what the cluster runtime reports for a node onto
//! a small per-component presence enum.

pub mod docker;
pub mod runtime;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::warn;

pub use runtime::{ClusterRuntime, InMemoryRuntime, RuntimeService, RuntimeTask, ServiceSpec};

/// Label every service of a dynamic service carries.
pub const NODE_ID_LABEL: &str = "io.dynsched.node-id";
pub const SIDECAR_PREFIX: &str = "dy-sidecar_";
pub const PROXY_PREFIX: &str = "dy-proxy_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComponentPresence {
    Present,
    Starting,
    Failed,
    Absent,
}

impl std::fmt::Display for ComponentPresence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ComponentPresence::Present => write!(f, "PRESENT"),
            ComponentPresence::Starting => write!(f, "STARTING"),
            ComponentPresence::Failed => write!(f, "FAILED"),
            ComponentPresence::Absent => write!(f, "ABSENT"),
        }
    }
}

/// Presence per component. `None` means the component does not apply to this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ServicesPresence {
    pub legacy: Option<ComponentPresence>,
    pub dy_sidecar: Option<ComponentPresence>,
    pub dy_proxy: Option<ComponentPresence>,
}

impl ServicesPresence {
    /// Presence of the components a node of the given kind is expected to have.
    pub fn expected(&self, is_legacy: bool) -> Vec<(&'static str, ComponentPresence)> {
        if is_legacy {
            vec![("legacy", self.legacy.unwrap_or(ComponentPresence::Absent))]
        } else {
            vec![
                ("dy_sidecar", self.dy_sidecar.unwrap_or(ComponentPresence::Absent)),
                ("dy_proxy", self.dy_proxy.unwrap_or(ComponentPresence::Absent)),
            ]
        }
    }

    pub fn all_present(&self, is_legacy: bool) -> bool {
        self.expected(is_legacy)
            .iter()
            .all(|(_, p)| *p == ComponentPresence::Present)
    }

    /// True when no component of any kind is left.
    pub fn all_absent(&self) -> bool {
        [self.legacy, self.dy_sidecar, self.dy_proxy]
            .iter()
            .flatten()
            .all(|p| *p == ComponentPresence::Absent)
    }
}

/// Map a runtime task state onto a presence.
pub fn presence_from_task_state(state: &str) -> ComponentPresence {
    match state {
        "running" => ComponentPresence::Present,
        "new" | "allocated" | "pending" | "assigned" | "accepted" | "preparing" | "ready"
        | "starting" => ComponentPresence::Starting,
        "failed" | "rejected" | "orphaned" => ComponentPresence::Failed,
        "complete" | "shutdown" | "remove" => ComponentPresence::Absent,
        other => {
            warn!(state = %other, "Unknown task state, treating as absent");
            ComponentPresence::Absent
        }
    }
}

/// Presence of one service, judged by its most recent task.
pub fn service_presence(service: &RuntimeService) -> ComponentPresence {
    match service.tasks.iter().max_by_key(|t| t.timestamp) {
        Some(task) => presence_from_task_state(&task.state),
        None => ComponentPresence::Starting,
    }
}

/// Classify already-listed services of one node.
pub fn classify_services(services: &[RuntimeService]) -> ServicesPresence {
    if services.is_empty() {
        return ServicesPresence {
            legacy: Some(ComponentPresence::Absent),
            dy_sidecar: Some(ComponentPresence::Absent),
            dy_proxy: Some(ComponentPresence::Absent),
        };
    }

    let mut presence = ServicesPresence::default();
    let mut new_style = false;
    for service in services {
        let state = service_presence(service);
        if service.name.starts_with(SIDECAR_PREFIX) {
            new_style = true;
            presence.dy_sidecar = Some(state);
        } else if service.name.starts_with(PROXY_PREFIX) {
            new_style = true;
            presence.dy_proxy = Some(state);
        } else {
            presence.legacy = Some(state);
        }
    }

    if new_style {
        presence.dy_sidecar.get_or_insert(ComponentPresence::Absent);
        presence.dy_proxy.get_or_insert(ComponentPresence::Absent);
    }
    presence
}

/// List the services labelled with `node_id` and report their presence.
pub async fn get_services_presence(
    runtime: &dyn ClusterRuntime,
    node_id: &str,
) -> Result<ServicesPresence> {
    let services = runtime.list_services(NODE_ID_LABEL, node_id).await?;
    Ok(classify_services(&services))
}
