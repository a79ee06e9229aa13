use k8s_openapi::{
    api::{
        apps::v1::{StatefulSet, StatefulSetSpec},
        core::v1::{
            ConfigMapVolumeSource, Container, ContainerPort, PersistentVolumeClaim,
            PersistentVolumeClaimSpec, PodSpec, PodTemplateSpec, Service, ServiceAccount,
            ServicePort, ServiceSpec, Volume, VolumeMount, VolumeResourceRequirements,
        },
        rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding},
    },
    apimachinery::pkg::{
        api::resource::Quantity, apis::meta::v1::LabelSelector, util::intstr::IntOrString,
    },
};
use kube::api::ObjectMeta;

use super::{
    BUNDLE_NAME, Payload, PlanContext, ResourceDescriptor, SERVER_NAME, cluster_meta, config_map,
    labels, liveness_probe, namespaced_meta, ordered, readiness_probe, role_ref, rule, selector,
    service_account_subject,
};
use crate::{
    api::SpireServerSpec,
    render::{RenderedConfig, SERVER_CONFIG_FILE},
};

const CONFIG_VOLUME: &str = "spire-config";
const DATA_VOLUME: &str = "spire-data";
const DATA_VOLUME_SIZE: &str = "1Gi";
/// Governing service of the stateful set, giving each replica a DNS name.
pub const HEADLESS_SERVICE_NAME: &str = "spire-server-headless";

/// Service account, RBAC, config maps, stateful set and service for a SpireServer.
pub fn plan_server(
    spec: &SpireServerSpec,
    rendered: &RenderedConfig,
    ctx: &PlanContext<'_>,
) -> Vec<ResourceDescriptor> {
    let namespace = ctx.namespace;
    let role_name = format!("{SERVER_NAME}-configmap-role");
    let role_binding_name = format!("{role_name}-binding");
    let cluster_role_name = format!("{namespace}-{SERVER_NAME}-trust-role");
    let cluster_role_binding_name = format!("{cluster_role_name}-binding");
    let meta = |name: &str| namespaced_meta(name, SERVER_NAME, ctx);

    let service_account = ServiceAccount {
        metadata: meta(SERVER_NAME),
        ..Default::default()
    };

    // The bundle notifier rewrites the bundle config map.
    let role = Role {
        metadata: meta(&role_name),
        rules: Some(vec![rule("", &["configmaps"], &["patch", "get", "list"])]),
    };

    let role_binding = RoleBinding {
        metadata: meta(&role_binding_name),
        role_ref: role_ref("Role", &role_name),
        subjects: Some(vec![service_account_subject(SERVER_NAME, namespace)]),
    };

    // Kubernetes node attestors validate agent tokens through the TokenReview API.
    let cluster_role = ClusterRole {
        metadata: cluster_meta(&cluster_role_name, SERVER_NAME),
        rules: Some(vec![rule(
            "authentication.k8s.io",
            &["tokenreviews"],
            &["create"],
        )]),
        ..Default::default()
    };

    let cluster_role_binding = ClusterRoleBinding {
        metadata: cluster_meta(&cluster_role_binding_name, SERVER_NAME),
        role_ref: role_ref("ClusterRole", &cluster_role_name),
        subjects: Some(vec![service_account_subject(SERVER_NAME, namespace)]),
    };

    let server_config = config_map(meta(SERVER_NAME), Some(rendered.data().clone()));

    // Reserved only; the server publishes the bundle into it at runtime.
    let bundle = config_map(meta(BUNDLE_NAME), None);

    let stateful_set = stateful_set(spec, meta(SERVER_NAME), ctx);

    let headless = Service {
        metadata: meta(HEADLESS_SERVICE_NAME),
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            ..service_spec(spec.port)
        }),
        ..Default::default()
    };

    let service = Service {
        metadata: meta(SERVER_NAME),
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            ..service_spec(spec.port)
        }),
        ..Default::default()
    };

    ordered(
        ctx,
        vec![
            (SERVER_NAME.to_string(), Payload::ServiceAccount(service_account)),
            (role_name, Payload::Role(role)),
            (role_binding_name, Payload::RoleBinding(role_binding)),
            (cluster_role_name, Payload::ClusterRole(cluster_role)),
            (
                cluster_role_binding_name,
                Payload::ClusterRoleBinding(cluster_role_binding),
            ),
            (SERVER_NAME.to_string(), Payload::ConfigMap(server_config)),
            (BUNDLE_NAME.to_string(), Payload::ConfigMap(bundle)),
            (HEADLESS_SERVICE_NAME.to_string(), Payload::Service(headless)),
            (SERVER_NAME.to_string(), Payload::StatefulSet(stateful_set)),
            (SERVER_NAME.to_string(), Payload::Service(service)),
        ],
    )
}

fn service_spec(port: i64) -> ServiceSpec {
    ServiceSpec {
        selector: Some(selector(SERVER_NAME)),
        ports: Some(vec![ServicePort {
            name: Some("grpc".to_string()),
            port: port as i32,
            target_port: Some(IntOrString::Int(port as i32)),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

fn stateful_set(spec: &SpireServerSpec, metadata: ObjectMeta, ctx: &PlanContext<'_>) -> StatefulSet {
    let container = Container {
        name: SERVER_NAME.to_string(),
        image: Some(ctx.images.server.clone()),
        args: Some(vec![
            "-config".to_string(),
            format!("/run/spire/config/{SERVER_CONFIG_FILE}"),
        ]),
        ports: Some(vec![ContainerPort {
            name: Some("grpc".to_string()),
            container_port: spec.port as i32,
            ..Default::default()
        }]),
        volume_mounts: Some(vec![
            VolumeMount {
                name: CONFIG_VOLUME.to_string(),
                mount_path: "/run/spire/config".to_string(),
                read_only: Some(true),
                ..Default::default()
            },
            VolumeMount {
                name: DATA_VOLUME.to_string(),
                mount_path: "/run/spire/data".to_string(),
                read_only: Some(false),
                ..Default::default()
            },
        ]),
        liveness_probe: Some(liveness_probe()),
        readiness_probe: Some(readiness_probe()),
        ..Default::default()
    };

    let data_claim = PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(DATA_VOLUME.to_string()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(
                    [(
                        "storage".to_string(),
                        Quantity(DATA_VOLUME_SIZE.to_string()),
                    )]
                    .into(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    };

    StatefulSet {
        metadata,
        spec: Some(StatefulSetSpec {
            replicas: Some(spec.replicas),
            service_name: Some(HEADLESS_SERVICE_NAME.to_string()),
            selector: LabelSelector {
                match_labels: Some(selector(SERVER_NAME)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels(SERVER_NAME)),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(SERVER_NAME.to_string()),
                    containers: vec![container],
                    volumes: Some(vec![Volume {
                        name: CONFIG_VOLUME.to_string(),
                        config_map: Some(ConfigMapVolumeSource {
                            name: SERVER_NAME.to_string(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            volume_claim_templates: Some(vec![data_claim]),
            ..Default::default()
        }),
        ..Default::default()
    }
}
