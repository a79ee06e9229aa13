use std::{fmt, str::FromStr};

use garde::Validate;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::validation::rules;

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, PartialEq, Validate, JsonSchema)]
#[kube(
    group = "spire.hpe.com",
    version = "v1",
    kind = "SpireServer",
    namespaced
)]
#[kube(status = "SpireServerStatus", shortname = "spireserver")]
#[serde(rename_all = "camelCase")]
pub struct SpireServerSpec {
    #[garde(custom(rules::trust_domain))]
    pub trust_domain: String,
    #[garde(range(min = 0, max = 65535))]
    pub port: i64,
    #[garde(custom(rules::node_attestors))]
    pub node_attestors: Vec<String>,
    #[garde(custom(rules::key_storage))]
    pub key_storage: String,
    #[serde(default = "default_replicas")]
    #[garde(range(min = 1))]
    pub replicas: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[garde(skip)]
    pub data_store: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[garde(skip)]
    pub connection_string: Option<String>,
    /// Trust bundle used by attestors that verify x509 material.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[garde(skip)]
    pub ca_bundle_path: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[garde(skip)]
    pub cert_authorities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[garde(skip)]
    pub cert_authorities_path: Option<String>,
}

fn default_replicas() -> i32 {
    1
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct SpireServerStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthState>,
}

/// Coarse readiness of the server's replicas, derived from pod conditions.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthState {
    Error,
    Initializing,
    Live,
    Ready,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HealthState::Error => "ERROR",
            HealthState::Initializing => "INITIALIZING",
            HealthState::Live => "LIVE",
            HealthState::Ready => "READY",
        })
    }
}

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, PartialEq, Validate, JsonSchema)]
#[kube(
    group = "spire.hpe.com",
    version = "v1",
    kind = "SpireAgent",
    namespaced
)]
#[kube(shortname = "spireagent")]
#[serde(rename_all = "camelCase")]
pub struct SpireAgentSpec {
    #[garde(custom(rules::trust_domain))]
    pub trust_domain: String,
    /// Port of the server this agent dials.
    #[serde(alias = "serverPort")]
    #[garde(range(min = 0, max = 65535))]
    pub port: i64,
    #[garde(custom(rules::node_attestor))]
    pub node_attestor: String,
    #[garde(custom(rules::workload_attestors))]
    pub workload_attestors: Vec<String>,
    #[garde(custom(rules::key_storage))]
    pub key_storage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[garde(skip)]
    pub private_key_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[garde(skip)]
    pub certificate_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[garde(skip)]
    pub host_key_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[garde(skip)]
    pub host_cert_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unsupported value {0:?}")]
pub struct UnsupportedValue(pub String);

/// Declares a closed set of plugin names carried as strings in the CRDs.
macro_rules! plugin_names {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl FromStr for $name {
            type Err = UnsupportedValue;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(UnsupportedValue(other.to_string())),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

plugin_names!(
    /// Plugins that prove a node's identity to the server.
    NodeAttestor {
        K8sSat => "k8s_sat",
        K8sPsat => "k8s_psat",
        JoinToken => "join_token",
    }
);

plugin_names!(
    /// Plugins that identify the local process asking the agent for an identity.
    WorkloadAttestor {
        K8s => "k8s",
        Unix => "unix",
        Docker => "docker",
        Systemd => "systemd",
        Windows => "windows",
    }
);

plugin_names!(
    DataStore {
        Sqlite3 => "sqlite3",
        Postgres => "postgres",
        Mysql => "mysql",
    }
);

/// Where generated private keys live. Parsed case-insensitively.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum KeyStorage {
    Disk,
    Memory,
}

impl KeyStorage {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyStorage::Disk => "disk",
            KeyStorage::Memory => "memory",
        }
    }
}

impl FromStr for KeyStorage {
    type Err = UnsupportedValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "disk" => Ok(KeyStorage::Disk),
            "memory" => Ok(KeyStorage::Memory),
            _ => Err(UnsupportedValue(s.to_string())),
        }
    }
}
