use std::sync::Arc;

use k8s_openapi::{
    api::core::v1::ObjectReference, apimachinery::pkg::apis::meta::v1::OwnerReference,
};

use super::{Error, Result};
use crate::{
    client::ClusterClient, config::OperatorConfig, health::HealthMonitors, plan::Images,
    render::RenderOptions, validation::Rejection,
};

pub mod agent;
pub mod server;

/// State shared by every reconciliation.
pub struct ReconcilerCtx {
    pub client: Arc<dyn ClusterClient>,
    pub monitors: HealthMonitors,
    pub render: RenderOptions,
    pub images: Images,
}

impl ReconcilerCtx {
    pub fn new(client: Arc<dyn ClusterClient>, config: &OperatorConfig) -> Self {
        Self {
            client,
            monitors: HealthMonitors::new(config.health_poll_interval()),
            render: config.render_options(),
            images: config.images(),
        }
    }
}

/// How a single reconciliation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The object was deleted before it could be fetched.
    Gone,
    /// The object was deleted because its spec broke a domain rule.
    Rejected(Rejection),
    Applied,
}

pub(crate) fn owner_ref_from_object_ref(object_ref: &ObjectReference) -> Result<OwnerReference> {
    Ok(OwnerReference {
        api_version: object_ref
            .api_version
            .clone()
            .ok_or(Error::MissingField)?,
        kind: object_ref.kind.clone().ok_or(Error::MissingField)?,
        name: object_ref.name.clone().ok_or(Error::MissingField)?,
        uid: object_ref.uid.clone().ok_or(Error::MissingField)?,
        controller: Some(true),
        ..Default::default()
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use std::time::Duration;

    use super::*;
    use crate::client::MockClusterClient;

    pub(crate) fn context(client: MockClusterClient) -> ReconcilerCtx {
        ReconcilerCtx {
            client: Arc::new(client),
            monitors: HealthMonitors::new(Duration::from_secs(3600)),
            render: RenderOptions::default(),
            images: Images::default(),
        }
    }

    #[test]
    fn owner_ref_requires_uid() {
        let object_ref = ObjectReference {
            api_version: Some("spire.hpe.com/v1".to_string()),
            kind: Some("SpireServer".to_string()),
            name: Some("main".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            owner_ref_from_object_ref(&object_ref),
            Err(Error::MissingField)
        ));

        let owner = owner_ref_from_object_ref(&ObjectReference {
            uid: Some("1234".to_string()),
            ..object_ref
        })
        .unwrap();
        assert_eq!(owner.kind, "SpireServer");
        assert_eq!(owner.controller, Some(true));
    }
}
