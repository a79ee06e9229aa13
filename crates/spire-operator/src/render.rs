//! Renders `server.conf` and `agent.conf` from validated specs.

pub mod block;

use std::collections::BTreeMap;

use crate::{
    api::{KeyStorage, NodeAttestor, SpireAgentSpec, SpireServerSpec, WorkloadAttestor},
    plan::{AGENT_NAME, SERVER_NAME},
};
use block::{Block, Document, Value};

pub const SERVER_CONFIG_FILE: &str = "server.conf";
pub const AGENT_CONFIG_FILE: &str = "agent.conf";

pub const HEALTH_PORT: i32 = 8080;
pub const LIVE_PATH: &str = "/live";
pub const READY_PATH: &str = "/ready";

const SERVER_DATA_DIR: &str = "/run/spire/data";
const DEFAULT_SQLITE_PATH: &str = "/run/spire/data/datastore.sqlite3";
pub(crate) const AGENT_SOCKET_DIR: &str = "/run/spire/sockets";
pub(crate) const BUNDLE_DIR: &str = "/run/spire/bundle";

pub const DEFAULT_CLUSTER_NAME: &str = "demo-cluster";

/// Settings that come from the operator rather than from the spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderOptions {
    /// Cluster identifier embedded in the Kubernetes attestor blocks.
    pub cluster_name: String,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            cluster_name: DEFAULT_CLUSTER_NAME.to_string(),
        }
    }
}

/// Config file name mapped to its full text, ready to become config map data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedConfig(BTreeMap<String, String>);

impl RenderedConfig {
    fn single(file_name: &str, doc: Document) -> Self {
        Self([(file_name.to_string(), doc.to_string())].into())
    }

    pub fn get(&self, file_name: &str) -> Option<&str> {
        self.0.get(file_name).map(String::as_str)
    }

    pub fn data(&self) -> &BTreeMap<String, String> {
        &self.0
    }
}

pub fn render_server(
    spec: &SpireServerSpec,
    namespace: &str,
    options: &RenderOptions,
) -> RenderedConfig {
    let server = Block::new("server")
        .attr("bind_address", "0.0.0.0")
        .attr("bind_port", spec.port.to_string())
        .attr("socket_path", "/tmp/spire-server/private/api.sock")
        .attr("trust_domain", spec.trust_domain.as_str())
        .attr("data_dir", SERVER_DATA_DIR)
        .attr("log_level", "DEBUG")
        .attr("ca_key_type", "rsa-2048")
        .attr(
            "ca_subject",
            Value::Map(vec![
                ("country".to_string(), vec!["US".to_string()].into()),
                ("organization".to_string(), vec!["SPIFFE".to_string()].into()),
                ("common_name".to_string(), "".into()),
            ]),
        );

    let data_store = Block::labeled("DataStore", "sql").block(
        Block::new("plugin_data")
            .attr(
                "database_type",
                spec.data_store.as_deref().unwrap_or("sqlite3"),
            )
            .attr(
                "connection_string",
                spec.connection_string
                    .as_deref()
                    .unwrap_or(DEFAULT_SQLITE_PATH),
            ),
    );

    let allow_list = vec![format!("{namespace}:{AGENT_NAME}")];
    let node_attestors = spec
        .node_attestors
        .iter()
        .filter_map(|name| name.parse::<NodeAttestor>().ok())
        .map(|attestor| {
            let plugin_data = match attestor {
                NodeAttestor::K8sSat => Block::new("plugin_data").attr(
                    "clusters",
                    cluster_map(
                        &options.cluster_name,
                        vec![
                            ("use_token_review_api_validation".to_string(), true.into()),
                            (
                                "service_account_allow_list".to_string(),
                                allow_list.clone().into(),
                            ),
                        ],
                    ),
                ),
                NodeAttestor::K8sPsat => Block::new("plugin_data").attr(
                    "clusters",
                    cluster_map(
                        &options.cluster_name,
                        vec![(
                            "service_account_allow_list".to_string(),
                            allow_list.clone().into(),
                        )],
                    ),
                ),
                NodeAttestor::JoinToken => Block::new("plugin_data"),
            };

            let plugin_data = plugin_data
                .attr_opt("ca_bundle_path", spec.ca_bundle_path.as_deref())
                .attr_opt(
                    "cert_authorities",
                    (!spec.cert_authorities.is_empty()).then(|| spec.cert_authorities.clone()),
                )
                .attr_opt("cert_authorities_path", spec.cert_authorities_path.as_deref());

            Block::labeled("NodeAttestor", attestor.as_str()).block(plugin_data)
        });

    let key_manager = key_manager(&spec.key_storage, |storage| match storage {
        KeyStorage::Disk => {
            Block::new("plugin_data").attr("keys_path", format!("{SERVER_DATA_DIR}/keys.json"))
        }
        KeyStorage::Memory => Block::new("plugin_data"),
    });

    let notifier = Block::labeled("Notifier", "k8sbundle")
        .block(Block::new("plugin_data").attr("namespace", namespace));

    let plugins = Block::new("plugins")
        .block(data_store)
        .blocks(node_attestors)
        .blocks(key_manager)
        .block(notifier);

    RenderedConfig::single(
        SERVER_CONFIG_FILE,
        Document::new()
            .block(server)
            .block(plugins)
            .block(health_checks()),
    )
}

pub fn render_agent(spec: &SpireAgentSpec, options: &RenderOptions) -> RenderedConfig {
    let agent = Block::new("agent")
        .attr("data_dir", "/run/spire")
        .attr("log_level", "DEBUG")
        .attr("server_address", SERVER_NAME)
        .attr("server_port", spec.port.to_string())
        .attr("socket_path", format!("{AGENT_SOCKET_DIR}/agent.sock"))
        .attr("trust_bundle_path", format!("{BUNDLE_DIR}/bundle.crt"))
        .attr("trust_domain", spec.trust_domain.as_str());

    let node_attestor = spec
        .node_attestor
        .parse::<NodeAttestor>()
        .ok()
        .map(|attestor| {
            let plugin_data = match attestor {
                NodeAttestor::K8sSat | NodeAttestor::K8sPsat => {
                    Block::new("plugin_data").attr("cluster", options.cluster_name.as_str())
                }
                NodeAttestor::JoinToken => Block::new("plugin_data"),
            }
            .attr_opt("private_key_path", spec.private_key_path.as_deref())
            .attr_opt("certificate_path", spec.certificate_path.as_deref())
            .attr_opt("host_key_path", spec.host_key_path.as_deref())
            .attr_opt("host_cert_path", spec.host_cert_path.as_deref());

            Block::labeled("NodeAttestor", attestor.as_str()).block(plugin_data)
        });

    let key_manager = key_manager(&spec.key_storage, |storage| match storage {
        KeyStorage::Disk => Block::new("plugin_data").attr("directory", "/run/spire"),
        KeyStorage::Memory => Block::new("plugin_data"),
    });

    let workload_attestors = spec
        .workload_attestors
        .iter()
        .filter_map(|name| name.parse::<WorkloadAttestor>().ok())
        .map(|attestor| {
            let block = Block::labeled("WorkloadAttestor", attestor.as_str());
            match attestor {
                WorkloadAttestor::K8s => block.block(
                    Block::new("plugin_data").attr("skip_kubelet_verification", true),
                ),
                WorkloadAttestor::Unix | WorkloadAttestor::Docker => {
                    block.block(Block::new("plugin_data"))
                }
                WorkloadAttestor::Systemd | WorkloadAttestor::Windows => block,
            }
        });

    let plugins = Block::new("plugins")
        .blocks(node_attestor)
        .blocks(key_manager)
        .blocks(workload_attestors);

    RenderedConfig::single(
        AGENT_CONFIG_FILE,
        Document::new()
            .block(agent)
            .block(plugins)
            .block(health_checks()),
    )
}

fn cluster_map(cluster_name: &str, settings: Vec<(String, Value)>) -> Value {
    Value::Map(vec![(cluster_name.to_string(), Value::Map(settings))])
}

fn key_manager(
    key_storage: &str,
    plugin_data: impl FnOnce(KeyStorage) -> Block,
) -> Option<Block> {
    let storage = key_storage.parse::<KeyStorage>().ok()?;
    Some(Block::labeled("KeyManager", storage.as_str()).block(plugin_data(storage)))
}

fn health_checks() -> Block {
    Block::new("health_checks")
        .attr("listener_enabled", true)
        .attr("bind_address", "0.0.0.0")
        .attr("bind_port", HEALTH_PORT.to_string())
        .attr("live_path", LIVE_PATH)
        .attr("ready_path", READY_PATH)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::tests::{agent_spec, server_spec};

    #[test]
    fn server_config_contains_spec_values() {
        let rendered = render_server(&server_spec(), "spire", &RenderOptions::default());
        let text = rendered.get(SERVER_CONFIG_FILE).unwrap();

        assert!(text.contains(r#"trust_domain = "example.org""#));
        assert!(text.contains(r#"bind_port = "8081""#));
        assert!(text.contains(r#"NodeAttestor "k8s_sat""#));
        assert!(text.contains(r#"KeyManager "disk""#));
        assert!(text.contains(r#"connection_string = "/data/store.db""#));
        assert!(text.contains(r#"service_account_allow_list = [ "spire:spire-agent" ]"#));
        assert!(text.contains(r#"Notifier "k8sbundle""#));
        assert!(text.contains(r#"live_path = "/live""#));
        assert_eq!(rendered.data().len(), 1);
    }

    #[test]
    fn server_config_is_byte_stable() {
        let spec = server_spec();
        let options = RenderOptions::default();
        assert_eq!(
            render_server(&spec, "spire", &options),
            render_server(&spec.clone(), "spire", &options)
        );
    }

    #[test]
    fn node_attestors_keep_input_order() {
        let spec = SpireServerSpec {
            node_attestors: vec![
                "join_token".to_string(),
                "k8s_psat".to_string(),
                "k8s_sat".to_string(),
            ],
            ..server_spec()
        };
        let rendered = render_server(&spec, "spire", &RenderOptions::default());
        let text = rendered.get(SERVER_CONFIG_FILE).unwrap();

        let positions: Vec<usize> = ["join_token", "k8s_psat", "k8s_sat"]
            .iter()
            .map(|name| text.find(&format!("NodeAttestor \"{name}\"")).unwrap())
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(text.matches("NodeAttestor ").count(), 3);
    }

    #[test]
    fn unknown_attestors_are_skipped() {
        let spec = SpireServerSpec {
            node_attestors: vec!["k8s_sat".to_string(), "aws_iid".to_string()],
            ..server_spec()
        };
        let rendered = render_server(&spec, "spire", &RenderOptions::default());
        let text = rendered.get(SERVER_CONFIG_FILE).unwrap();
        assert!(!text.contains("aws_iid"));
        assert_eq!(text.matches("NodeAttestor ").count(), 1);
    }

    #[test]
    fn key_storage_is_canonicalized() {
        let spec = SpireServerSpec {
            key_storage: "MEMORY".to_string(),
            ..server_spec()
        };
        let rendered = render_server(&spec, "spire", &RenderOptions::default());
        let text = rendered.get(SERVER_CONFIG_FILE).unwrap();
        assert!(text.contains(r#"KeyManager "memory""#));
        assert!(!text.contains("keys_path"));
    }

    #[test]
    fn default_data_store_is_sqlite() {
        let spec = SpireServerSpec {
            data_store: None,
            connection_string: None,
            ..server_spec()
        };
        let rendered = render_server(&spec, "spire", &RenderOptions::default());
        let text = rendered.get(SERVER_CONFIG_FILE).unwrap();
        assert!(text.contains(r#"database_type = "sqlite3""#));
        assert!(text.contains(DEFAULT_SQLITE_PATH));
    }

    #[test]
    fn trust_material_goes_into_attestor_data() {
        let spec = SpireServerSpec {
            ca_bundle_path: Some("/certs/ca.pem".to_string()),
            cert_authorities: vec!["ca-one".to_string(), "ca-two".to_string()],
            ..server_spec()
        };
        let rendered = render_server(&spec, "spire", &RenderOptions::default());
        let text = rendered.get(SERVER_CONFIG_FILE).unwrap();
        assert!(text.contains(r#"ca_bundle_path = "/certs/ca.pem""#));
        assert!(text.contains(r#"cert_authorities = [ "ca-one", "ca-two" ]"#));
        assert!(!text.contains("cert_authorities_path"));
    }

    #[test]
    fn agent_config_contains_spec_values() {
        let options = RenderOptions {
            cluster_name: "prod".to_string(),
        };
        let rendered = render_agent(&agent_spec(), &options);
        let text = rendered.get(AGENT_CONFIG_FILE).unwrap();

        assert!(text.contains(r#"server_address = "spire-server""#));
        assert!(text.contains(r#"server_port = "8081""#));
        assert!(text.contains(r#"trust_domain = "example.org""#));
        assert!(text.contains(r#"NodeAttestor "k8s_sat""#));
        assert!(text.contains(r#"cluster = "prod""#));
        assert!(text.contains(r#"KeyManager "memory""#));
        assert!(text.contains(r#"WorkloadAttestor "k8s""#));
        assert!(text.contains("skip_kubelet_verification = true"));
        assert!(text.contains("WorkloadAttestor \"unix\" {\n        plugin_data {}"));
        assert!(text.contains("health_checks {"));
    }

    #[test]
    fn agent_key_material_is_rendered_when_set() {
        let spec = SpireAgentSpec {
            node_attestor: "join_token".to_string(),
            private_key_path: Some("/keys/agent.key".to_string()),
            host_cert_path: Some("/keys/host.crt".to_string()),
            ..agent_spec()
        };
        let rendered = render_agent(&spec, &RenderOptions::default());
        let text = rendered.get(AGENT_CONFIG_FILE).unwrap();
        assert!(text.contains(r#"private_key_path = "/keys/agent.key""#));
        assert!(text.contains(r#"host_cert_path = "/keys/host.crt""#));
        assert!(!text.contains("certificate_path"));
    }

    #[test]
    fn systemd_attestor_has_no_plugin_data() {
        let spec = SpireAgentSpec {
            workload_attestors: vec!["systemd".to_string()],
            ..agent_spec()
        };
        let rendered = render_agent(&spec, &RenderOptions::default());
        let text = rendered.get(AGENT_CONFIG_FILE).unwrap();
        assert!(text.contains("    WorkloadAttestor \"systemd\" {}\n"));
    }
}
