//! Derives the cluster objects a SpireServer or SpireAgent needs.
//!
//! Planning is pure: the same spec, rendered config and context always give
//! the same descriptors with the same names. The order is a dependency hint
//! (service account before workload, and so on); server-side apply tolerates
//! forward references, so nothing depends on it strictly.

mod agent;
mod server;

use std::collections::BTreeMap;

use k8s_openapi::{
    api::{
        apps::v1::{DaemonSet, StatefulSet},
        core::v1::{ConfigMap, HTTPGetAction, Probe, Service, ServiceAccount},
        rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, Role, RoleBinding, RoleRef, Subject},
    },
    apimachinery::pkg::{apis::meta::v1::OwnerReference, util::intstr::IntOrString},
};
use kube::api::ObjectMeta;

pub use agent::plan_agent;
pub use server::plan_server;

use crate::render::{HEALTH_PORT, LIVE_PATH, READY_PATH};

pub const SERVER_NAME: &str = "spire-server";
pub const AGENT_NAME: &str = "spire-agent";
pub const BUNDLE_NAME: &str = "spire-bundle";

pub const DEFAULT_SERVER_IMAGE: &str = "ghcr.io/spiffe/spire-server:1.5.1";
pub const DEFAULT_AGENT_IMAGE: &str = "ghcr.io/spiffe/spire-agent:1.5.1";
pub const DEFAULT_WAIT_IMAGE: &str = "cgr.dev/chainguard/wait-for-it";

const MANAGED_BY: (&str, &str) = ("app.kubernetes.io/managed-by", "spire-operator");
/// Label selector matching every object the operator plans.
pub const MANAGED_BY_SELECTOR: &str = "app.kubernetes.io/managed-by=spire-operator";

/// Container images used by the planned workloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Images {
    pub server: String,
    pub agent: String,
    /// Blocks agent start-up until the server's service answers.
    pub wait_for_server: String,
}

impl Default for Images {
    fn default() -> Self {
        Self {
            server: DEFAULT_SERVER_IMAGE.to_string(),
            agent: DEFAULT_AGENT_IMAGE.to_string(),
            wait_for_server: DEFAULT_WAIT_IMAGE.to_string(),
        }
    }
}

/// Where and for whom the resources are planned.
#[derive(Debug, Clone)]
pub struct PlanContext<'a> {
    pub namespace: &'a str,
    /// Set on namespaced objects so they are collected with the desired-state object.
    pub owner: Option<OwnerReference>,
    pub images: &'a Images,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    ServiceAccount(ServiceAccount),
    Role(Role),
    RoleBinding(RoleBinding),
    ClusterRole(ClusterRole),
    ClusterRoleBinding(ClusterRoleBinding),
    ConfigMap(ConfigMap),
    StatefulSet(StatefulSet),
    DaemonSet(DaemonSet),
    Service(Service),
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        use k8s_openapi::Resource;

        match self {
            Payload::ServiceAccount(_) => ServiceAccount::KIND,
            Payload::Role(_) => Role::KIND,
            Payload::RoleBinding(_) => RoleBinding::KIND,
            Payload::ClusterRole(_) => ClusterRole::KIND,
            Payload::ClusterRoleBinding(_) => ClusterRoleBinding::KIND,
            Payload::ConfigMap(_) => ConfigMap::KIND,
            Payload::StatefulSet(_) => StatefulSet::KIND,
            Payload::DaemonSet(_) => DaemonSet::KIND,
            Payload::Service(_) => Service::KIND,
        }
    }

    fn is_namespaced(&self) -> bool {
        !matches!(
            self,
            Payload::ClusterRole(_) | Payload::ClusterRoleBinding(_)
        )
    }
}

/// One cluster object to exist, in planned creation order.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceDescriptor {
    pub name: String,
    /// `None` for cluster-scoped objects.
    pub namespace: Option<String>,
    pub creation_order: usize,
    pub payload: Payload,
}

impl ResourceDescriptor {
    pub fn kind(&self) -> &'static str {
        self.payload.kind()
    }

    pub fn namespaced(&self) -> bool {
        self.namespace.is_some()
    }
}

/// Numbers payloads in the order given.
fn ordered(ctx: &PlanContext<'_>, payloads: Vec<(String, Payload)>) -> Vec<ResourceDescriptor> {
    payloads
        .into_iter()
        .enumerate()
        .map(|(creation_order, (name, payload))| ResourceDescriptor {
            namespace: payload
                .is_namespaced()
                .then(|| ctx.namespace.to_string()),
            name,
            creation_order,
            payload,
        })
        .collect()
}

fn labels(app: &str) -> BTreeMap<String, String> {
    [
        ("app".to_string(), app.to_string()),
        (MANAGED_BY.0.to_string(), MANAGED_BY.1.to_string()),
    ]
    .into()
}

pub(crate) fn selector(app: &str) -> BTreeMap<String, String> {
    [("app".to_string(), app.to_string())].into()
}

fn namespaced_meta(name: &str, app: &str, ctx: &PlanContext<'_>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(ctx.namespace.to_string()),
        labels: Some(labels(app)),
        owner_references: ctx.owner.clone().map(|owner| vec![owner]),
        ..Default::default()
    }
}

/// Cluster-scoped objects cannot be owned by a namespaced object.
fn cluster_meta(name: &str, app: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        labels: Some(labels(app)),
        ..Default::default()
    }
}

fn rule(api_group: &str, resources: &[&str], verbs: &[&str]) -> PolicyRule {
    PolicyRule {
        api_groups: Some(vec![api_group.to_string()]),
        resources: Some(resources.iter().map(|r| r.to_string()).collect()),
        verbs: verbs.iter().map(|v| v.to_string()).collect(),
        ..Default::default()
    }
}

fn role_ref(kind: &str, name: &str) -> RoleRef {
    RoleRef {
        api_group: "rbac.authorization.k8s.io".to_string(),
        kind: kind.to_string(),
        name: name.to_string(),
    }
}

fn service_account_subject(name: &str, namespace: &str) -> Subject {
    Subject {
        kind: "ServiceAccount".to_string(),
        name: name.to_string(),
        namespace: Some(namespace.to_string()),
        ..Default::default()
    }
}

fn config_map(meta: ObjectMeta, data: Option<BTreeMap<String, String>>) -> ConfigMap {
    ConfigMap {
        metadata: meta,
        data,
        ..Default::default()
    }
}

fn liveness_probe() -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(LIVE_PATH.to_string()),
            port: IntOrString::Int(HEALTH_PORT),
            ..Default::default()
        }),
        failure_threshold: Some(2),
        initial_delay_seconds: Some(15),
        period_seconds: Some(60),
        timeout_seconds: Some(3),
        ..Default::default()
    }
}

fn readiness_probe() -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(READY_PATH.to_string()),
            port: IntOrString::Int(HEALTH_PORT),
            ..Default::default()
        }),
        initial_delay_seconds: Some(5),
        period_seconds: Some(5),
        ..Default::default()
    }
}
