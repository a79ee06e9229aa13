//! Domain rules for SpireServer and SpireAgent specs that the CRD schema
//! cannot express.
//!
//! [`validate_server`] and [`validate_agent`] apply the rules in a fixed order
//! and stop at the first violation. The same predicates back the `garde`
//! attributes on the spec types, which report every violation at once.

use std::{collections::HashSet, str::FromStr, sync::LazyLock};

use regex::Regex;
use thiserror::Error;

use crate::api::{
    DataStore, KeyStorage, NodeAttestor, SpireAgentSpec, SpireServerSpec, WorkloadAttestor,
};

static TRUST_DOMAIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([a-zA-Z0-9][a-zA-Z0-9-]{0,60}[a-zA-Z0-9]\.)+[A-Za-z]{2,}$")
        .expect("trust domain pattern compiles")
});

/// Why a spec was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("trust domain {0:?} is not a valid DNS name")]
    TrustDomain(String),
    #[error("port {0} is outside 0-65535")]
    Port(i64),
    #[error("port {agent} does not correspond to the SPIRE server port {server}")]
    PortMismatch { agent: i64, server: i64 },
    #[error("at least one {0} attestor is required")]
    NoAttestors(&'static str),
    #[error("node attestor {0:?} is not supported")]
    UnsupportedNodeAttestor(String),
    #[error("workload attestor {0:?} is not supported")]
    UnsupportedWorkloadAttestor(String),
    #[error("attestor {0:?} is listed more than once")]
    DuplicateAttestor(String),
    #[error("node attestor {attestor:?} is not offered by the server (offered: {offered:?})")]
    AttestorNotOffered {
        attestor: String,
        offered: Vec<String>,
    },
    #[error("key storage {0:?} is not supported, use disk or memory")]
    KeyStorage(String),
    #[error("replicas must be at least 1, got {0}")]
    Replicas(i32),
    #[error("data store {0:?} is not supported")]
    DataStore(String),
    #[error("data store {0} requires a connection string")]
    MissingConnectionString(DataStore),
    #[error("sqlite3 cannot be shared by {0} replicas")]
    SqliteReplicas(i32),
}

/// The parts of a server's spec an agent has to agree with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerFacts {
    pub port: i64,
    pub node_attestors: Vec<String>,
}

impl From<&SpireServerSpec> for ServerFacts {
    fn from(spec: &SpireServerSpec) -> Self {
        Self {
            port: spec.port,
            node_attestors: spec.node_attestors.clone(),
        }
    }
}

pub fn validate_server(spec: &SpireServerSpec) -> Result<(), Rejection> {
    check_trust_domain(&spec.trust_domain)?;
    check_port(spec.port)?;
    check_attestors::<NodeAttestor>(&spec.node_attestors, "node", |name| {
        Rejection::UnsupportedNodeAttestor(name.to_string())
    })?;
    check_key_storage(&spec.key_storage)?;

    if spec.replicas < 1 {
        return Err(Rejection::Replicas(spec.replicas));
    }

    if let Some(data_store) = &spec.data_store {
        let data_store = data_store
            .parse::<DataStore>()
            .map_err(|e| Rejection::DataStore(e.0))?;

        if spec
            .connection_string
            .as_deref()
            .is_none_or(|conn| conn.trim().is_empty())
        {
            return Err(Rejection::MissingConnectionString(data_store));
        }

        if data_store == DataStore::Sqlite3 && spec.replicas > 1 {
            return Err(Rejection::SqliteReplicas(spec.replicas));
        }
    }

    Ok(())
}

/// Validates an agent spec. `server` carries the settings of the server in the
/// agent's namespace; without it the cross-checks against the server are skipped.
pub fn validate_agent(spec: &SpireAgentSpec, server: Option<&ServerFacts>) -> Result<(), Rejection> {
    check_trust_domain(&spec.trust_domain)?;
    check_port(spec.port)?;

    if let Some(server) = server.filter(|server| server.port != spec.port) {
        return Err(Rejection::PortMismatch {
            agent: spec.port,
            server: server.port,
        });
    }

    spec.node_attestor
        .parse::<NodeAttestor>()
        .map_err(|e| Rejection::UnsupportedNodeAttestor(e.0))?;

    if let Some(server) = server.filter(|server| !server.node_attestors.contains(&spec.node_attestor)) {
        return Err(Rejection::AttestorNotOffered {
            attestor: spec.node_attestor.clone(),
            offered: server.node_attestors.clone(),
        });
    }

    check_attestors::<WorkloadAttestor>(&spec.workload_attestors, "workload", |name| {
        Rejection::UnsupportedWorkloadAttestor(name.to_string())
    })?;
    check_key_storage(&spec.key_storage)?;

    Ok(())
}

fn check_trust_domain(trust_domain: &str) -> Result<(), Rejection> {
    if trust_domain.is_empty() || !TRUST_DOMAIN.is_match(trust_domain) {
        return Err(Rejection::TrustDomain(trust_domain.to_string()));
    }
    Ok(())
}

fn check_port(port: i64) -> Result<(), Rejection> {
    if !(0..=65535).contains(&port) {
        return Err(Rejection::Port(port));
    }
    Ok(())
}

fn check_attestors<P: FromStr>(
    names: &[String],
    role: &'static str,
    unsupported: impl Fn(&str) -> Rejection,
) -> Result<(), Rejection> {
    if names.is_empty() {
        return Err(Rejection::NoAttestors(role));
    }

    let mut seen = HashSet::new();
    for name in names {
        if name.parse::<P>().is_err() {
            return Err(unsupported(name));
        }
        if !seen.insert(name.as_str()) {
            return Err(Rejection::DuplicateAttestor(name.clone()));
        }
    }

    Ok(())
}

fn check_key_storage(key_storage: &str) -> Result<(), Rejection> {
    key_storage
        .parse::<KeyStorage>()
        .map(drop)
        .map_err(|e| Rejection::KeyStorage(e.0))
}

/// Adapters exposing the checks as `garde` custom rules.
pub(crate) mod rules {
    use super::*;

    fn report(rejection: Rejection) -> garde::Error {
        garde::Error::new(rejection.to_string())
    }

    pub fn trust_domain(value: &str, _: &()) -> garde::Result {
        check_trust_domain(value).map_err(report)
    }

    pub fn key_storage(value: &str, _: &()) -> garde::Result {
        check_key_storage(value).map_err(report)
    }

    pub fn node_attestor(value: &str, _: &()) -> garde::Result {
        value
            .parse::<NodeAttestor>()
            .map(drop)
            .map_err(|e| report(Rejection::UnsupportedNodeAttestor(e.0)))
    }

    pub fn node_attestors(value: &[String], _: &()) -> garde::Result {
        check_attestors::<NodeAttestor>(value, "node", |name| {
            Rejection::UnsupportedNodeAttestor(name.to_string())
        })
        .map_err(report)
    }

    pub fn workload_attestors(value: &[String], _: &()) -> garde::Result {
        check_attestors::<WorkloadAttestor>(value, "workload", |name| {
            Rejection::UnsupportedWorkloadAttestor(name.to_string())
        })
        .map_err(report)
    }
}
