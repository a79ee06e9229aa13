use tracing::{Level, instrument};

use crate::{Error, Result, client::ClusterClient, plan::ResourceDescriptor};

/// Applies every descriptor in creation order and reports the first failure.
///
/// A failure does not stop the pass, and nothing already applied is rolled
/// back; the next reconciliation retries whatever is missing.
#[instrument(level = Level::DEBUG, skip_all, fields(resources = descriptors.len()))]
pub async fn apply(client: &dyn ClusterClient, descriptors: &[ResourceDescriptor]) -> Result<()> {
    let mut ordered: Vec<&ResourceDescriptor> = descriptors.iter().collect();
    ordered.sort_by_key(|d| d.creation_order);

    let mut first_failure = None;
    for descriptor in ordered {
        match client.apply(descriptor).await {
            Ok(()) => tracing::debug!(kind = descriptor.kind(), name = %descriptor.name, "Applied"),
            Err(error) => {
                tracing::warn!(
                    kind = descriptor.kind(),
                    name = %descriptor.name,
                    "Failed to apply: {error}"
                );
                if first_failure.is_none() {
                    first_failure = Some(Error::Apply {
                        kind: descriptor.kind(),
                        name: descriptor.name.clone(),
                        source: Box::new(error),
                    });
                }
            }
        }
    }

    match first_failure {
        Some(error) => Err(error),
        None => Ok(()),
    }
}
