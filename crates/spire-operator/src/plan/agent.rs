use k8s_openapi::{
    api::{
        apps::v1::{DaemonSet, DaemonSetSpec},
        core::v1::{
            ConfigMapVolumeSource, Container, HostPathVolumeSource, PodSpec, PodTemplateSpec,
            ServiceAccount, Volume, VolumeMount,
        },
        rbac::v1::{ClusterRole, ClusterRoleBinding},
    },
    apimachinery::pkg::apis::meta::v1::LabelSelector,
};
use kube::api::ObjectMeta;

use super::{
    AGENT_NAME, BUNDLE_NAME, Payload, PlanContext, ResourceDescriptor, SERVER_NAME, cluster_meta,
    config_map, labels, liveness_probe, namespaced_meta, ordered, readiness_probe, role_ref, rule,
    selector, service_account_subject,
};
use crate::{
    api::SpireAgentSpec,
    render::{AGENT_CONFIG_FILE, AGENT_SOCKET_DIR, BUNDLE_DIR, RenderedConfig},
};

const CONFIG_VOLUME: &str = "spire-config";
const BUNDLE_VOLUME: &str = "spire-bundle";
const SOCKET_VOLUME: &str = "spire-agent-socket";

/// RBAC, service account, config map and per-node daemon set for a SpireAgent.
pub fn plan_agent(
    spec: &SpireAgentSpec,
    rendered: &RenderedConfig,
    ctx: &PlanContext<'_>,
) -> Vec<ResourceDescriptor> {
    let namespace = ctx.namespace;
    let cluster_role_name = format!("{namespace}-{AGENT_NAME}-cluster-role");
    let cluster_role_binding_name = format!("{cluster_role_name}-binding");
    let meta = |name: &str| namespaced_meta(name, AGENT_NAME, ctx);

    // Workload attestation looks up pods through the kubelet.
    let cluster_role = ClusterRole {
        metadata: cluster_meta(&cluster_role_name, AGENT_NAME),
        rules: Some(vec![rule("", &["pods", "nodes", "nodes/proxy"], &["get"])]),
        ..Default::default()
    };

    let cluster_role_binding = ClusterRoleBinding {
        metadata: cluster_meta(&cluster_role_binding_name, AGENT_NAME),
        role_ref: role_ref("ClusterRole", &cluster_role_name),
        subjects: Some(vec![service_account_subject(AGENT_NAME, namespace)]),
    };

    let service_account = ServiceAccount {
        metadata: meta(AGENT_NAME),
        ..Default::default()
    };

    let agent_config = config_map(meta(AGENT_NAME), Some(rendered.data().clone()));

    let daemon_set = daemon_set(spec, meta(AGENT_NAME), ctx);

    ordered(
        ctx,
        vec![
            (cluster_role_name, Payload::ClusterRole(cluster_role)),
            (
                cluster_role_binding_name,
                Payload::ClusterRoleBinding(cluster_role_binding),
            ),
            (AGENT_NAME.to_string(), Payload::ServiceAccount(service_account)),
            (AGENT_NAME.to_string(), Payload::ConfigMap(agent_config)),
            (AGENT_NAME.to_string(), Payload::DaemonSet(daemon_set)),
        ],
    )
}

fn daemon_set(spec: &SpireAgentSpec, metadata: ObjectMeta, ctx: &PlanContext<'_>) -> DaemonSet {
    let wait_for_server = Container {
        name: "init".to_string(),
        image: Some(ctx.images.wait_for_server.clone()),
        args: Some(vec![
            "-t".to_string(),
            "30".to_string(),
            format!("{SERVER_NAME}:{}", spec.port),
        ]),
        ..Default::default()
    };

    let agent = Container {
        name: AGENT_NAME.to_string(),
        image: Some(ctx.images.agent.clone()),
        args: Some(vec![
            "-config".to_string(),
            format!("/run/spire/config/{AGENT_CONFIG_FILE}"),
        ]),
        volume_mounts: Some(vec![
            VolumeMount {
                name: CONFIG_VOLUME.to_string(),
                mount_path: "/run/spire/config".to_string(),
                read_only: Some(true),
                ..Default::default()
            },
            VolumeMount {
                name: BUNDLE_VOLUME.to_string(),
                mount_path: BUNDLE_DIR.to_string(),
                ..Default::default()
            },
            VolumeMount {
                name: SOCKET_VOLUME.to_string(),
                mount_path: AGENT_SOCKET_DIR.to_string(),
                read_only: Some(false),
                ..Default::default()
            },
        ]),
        liveness_probe: Some(liveness_probe()),
        readiness_probe: Some(readiness_probe()),
        ..Default::default()
    };

    let config_map_volume = |volume: &str, config_map: &str| Volume {
        name: volume.to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: config_map.to_string(),
            ..Default::default()
        }),
        ..Default::default()
    };

    DaemonSet {
        metadata,
        spec: Some(DaemonSetSpec {
            selector: LabelSelector {
                match_labels: Some(selector(AGENT_NAME)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels(AGENT_NAME)),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    host_pid: Some(true),
                    host_network: Some(true),
                    dns_policy: Some("ClusterFirstWithHostNet".to_string()),
                    service_account_name: Some(AGENT_NAME.to_string()),
                    init_containers: Some(vec![wait_for_server]),
                    containers: vec![agent],
                    volumes: Some(vec![
                        config_map_volume(CONFIG_VOLUME, AGENT_NAME),
                        config_map_volume(BUNDLE_VOLUME, BUNDLE_NAME),
                        Volume {
                            name: SOCKET_VOLUME.to_string(),
                            host_path: Some(HostPathVolumeSource {
                                path: AGENT_SOCKET_DIR.to_string(),
                                type_: Some("DirectoryOrCreate".to_string()),
                            }),
                            ..Default::default()
                        },
                    ]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}
