use std::{sync::Arc, time::Duration};

use futures::Stream;
use k8s_openapi::api::{apps::v1::DaemonSet, core::v1::ConfigMap};
use kube::{
    Api, Client, Resource, ResourceExt,
    runtime::{
        Controller,
        controller::{Action, Error as ControllerError},
        reflector::ObjectRef,
        watcher,
    },
};
use tracing::{Level, instrument};

use super::{Outcome, ReconcilerCtx, owner_ref_from_object_ref};
use crate::{
    Error, Result,
    api::SpireAgent,
    apply::apply,
    health::ObjectKey,
    plan::{MANAGED_BY_SELECTOR, PlanContext, plan_agent},
    render::render_agent,
    validation::{ServerFacts, validate_agent},
};

pub fn control_loop(
    client: Client,
    context: Arc<ReconcilerCtx>,
) -> impl Stream<Item = Result<(ObjectRef<SpireAgent>, Action), ControllerError<Error, watcher::Error>>>
{
    let agents = Api::<SpireAgent>::all(client.clone());
    let managed = watcher::Config::default().labels(MANAGED_BY_SELECTOR);

    Controller::new(agents, watcher::Config::default())
        .owns(Api::<DaemonSet>::all(client.clone()), managed.clone())
        .owns(Api::<ConfigMap>::all(client), managed)
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
}

#[instrument(level = Level::DEBUG, skip_all, fields(agent = %agent.name_any()))]
async fn reconcile(agent: Arc<SpireAgent>, context: Arc<ReconcilerCtx>) -> Result<Action> {
    let namespace = agent.namespace().ok_or(Error::MissingField)?;
    let key = ObjectKey::new(namespace, agent.name_any());

    match reconcile_agent(&context, &key).await? {
        Outcome::Applied => Ok(Action::requeue(Duration::from_secs(300))),
        Outcome::Gone | Outcome::Rejected(_) => Ok(Action::await_change()),
    }
}

fn error_policy(agent: Arc<SpireAgent>, error: &Error, _context: Arc<ReconcilerCtx>) -> Action {
    tracing::warn!(agent = %agent.name_any(), "Reconcile failed: {error}");
    Action::requeue(Duration::from_secs(10))
}

/// Same pipeline as the server, without health monitoring. The agent is
/// checked against the SpireServer in its namespace when there is one.
pub async fn reconcile_agent(context: &ReconcilerCtx, key: &ObjectKey) -> Result<Outcome> {
    tracing::info!(agent = %key, "Reconciling...");

    let Some(agent) = context.client.get_agent(&key.namespace, &key.name).await? else {
        tracing::info!(agent = %key, "SpireAgent is gone");
        return Ok(Outcome::Gone);
    };

    let servers = context.client.list_servers(&key.namespace).await?;
    let server = match servers.iter().min_by_key(|server| server.name_any()) {
        Some(server) => {
            if servers.len() > 1 {
                tracing::info!(
                    agent = %key,
                    server = %server.name_any(),
                    candidates = servers.len(),
                    "Several SpireServers in namespace, checking against the first by name"
                );
            }
            Some(ServerFacts::from(&server.spec))
        }
        None => {
            tracing::warn!(agent = %key, "No SpireServer in namespace, skipping server checks");
            None
        }
    };

    if let Err(rejection) = validate_agent(&agent.spec, server.as_ref()) {
        tracing::warn!(agent = %key, "Deleting SpireAgent with rejected spec: {rejection}");
        context
            .client
            .delete_agent(&key.namespace, &key.name)
            .await?;
        return Ok(Outcome::Rejected(rejection));
    }

    let rendered = render_agent(&agent.spec, &context.render);
    let plan = PlanContext {
        namespace: &key.namespace,
        owner: Some(owner_ref_from_object_ref(&agent.object_ref(&()))?),
        images: &context.images,
    };
    apply(
        context.client.as_ref(),
        &plan_agent(&agent.spec, &rendered, &plan),
    )
    .await?;

    Ok(Outcome::Applied)
}
