use std::{sync::Arc, time::Duration};

use futures::Stream;
use k8s_openapi::api::{
    apps::v1::StatefulSet,
    core::v1::{ConfigMap, Service},
};
use kube::{
    Api, Client, Resource, ResourceExt,
    runtime::{
        Controller,
        controller::{Action, Error as ControllerError},
        finalizer::{Event as Finalizer, finalizer},
        reflector::ObjectRef,
        watcher,
    },
};
use tracing::{Level, instrument};

use super::{Outcome, ReconcilerCtx, owner_ref_from_object_ref};
use crate::{
    Error, Result,
    api::{HealthState, SpireServer, SpireServerStatus},
    apply::apply,
    health::ObjectKey,
    plan::{MANAGED_BY_SELECTOR, PlanContext, plan_server},
    render::render_server,
    validation::validate_server,
};

/// Held on every SpireServer until its health monitor has been stopped.
pub const SERVER_FINALIZER: &str = "spire.hpe.com/health-monitor";

pub fn control_loop(
    client: Client,
    context: Arc<ReconcilerCtx>,
) -> impl Stream<Item = Result<(ObjectRef<SpireServer>, Action), ControllerError<Error, watcher::Error>>>
{
    let servers = Api::<SpireServer>::all(client.clone());
    let managed = watcher::Config::default().labels(MANAGED_BY_SELECTOR);

    Controller::new(servers, watcher::Config::default())
        .owns(Api::<StatefulSet>::all(client.clone()), managed.clone())
        .owns(Api::<ConfigMap>::all(client.clone()), managed.clone())
        .owns(Api::<Service>::all(client.clone()), managed)
        .shutdown_on_signal()
        .run(
            move |server, context| reconcile(server, context, client.clone()),
            error_policy,
            context,
        )
}

#[instrument(level = Level::DEBUG, skip_all, fields(server = %server.name_any()))]
async fn reconcile(
    server: Arc<SpireServer>,
    context: Arc<ReconcilerCtx>,
    client: Client,
) -> Result<Action> {
    let namespace = server.namespace().ok_or(Error::MissingField)?;
    let key = ObjectKey::new(namespace.as_str(), server.name_any());
    let servers = Api::<SpireServer>::namespaced(client, &namespace);

    let (context, key) = (&context, &key);
    finalizer(&servers, SERVER_FINALIZER, server, |event| async move {
        match event {
            Finalizer::Apply(_) => apply_server(context, key).await,
            Finalizer::Cleanup(_) => cleanup_server(context, key).await,
        }
    })
    .await
    .map_err(|e| Error::Finalizer(Box::new(e)))
}

async fn apply_server(context: &ReconcilerCtx, key: &ObjectKey) -> Result<Action> {
    match reconcile_server(context, key).await? {
        // Resync periodically so drifted children get re-applied
        Outcome::Applied => Ok(Action::requeue(Duration::from_secs(300))),
        Outcome::Gone | Outcome::Rejected(_) => Ok(Action::await_change()),
    }
}

fn error_policy(server: Arc<SpireServer>, error: &Error, _context: Arc<ReconcilerCtx>) -> Action {
    tracing::warn!(server = %server.name_any(), "Reconcile failed: {error}");
    Action::requeue(Duration::from_secs(10))
}

/// Fetch, validate, render, plan, apply, then make sure the health monitor runs.
///
/// A spec that fails validation gets the object deleted. Apply failures are
/// returned after every resource has been attempted.
pub async fn reconcile_server(context: &ReconcilerCtx, key: &ObjectKey) -> Result<Outcome> {
    tracing::info!(server = %key, "Reconciling...");

    let Some(server) = context.client.get_server(&key.namespace, &key.name).await? else {
        tracing::info!(server = %key, "SpireServer is gone");
        context.monitors.stop(key).await;
        return Ok(Outcome::Gone);
    };

    if let Err(rejection) = validate_server(&server.spec) {
        tracing::warn!(server = %key, "Deleting SpireServer with rejected spec: {rejection}");
        context.monitors.stop(key).await;
        context
            .client
            .delete_server(&key.namespace, &key.name)
            .await?;
        return Ok(Outcome::Rejected(rejection));
    }

    let rendered = render_server(&server.spec, &key.namespace, &context.render);
    let plan = PlanContext {
        namespace: &key.namespace,
        owner: Some(owner_ref_from_object_ref(&server.object_ref(&()))?),
        images: &context.images,
    };
    apply(
        context.client.as_ref(),
        &plan_server(&server.spec, &rendered, &plan),
    )
    .await?;

    if server.status.as_ref().and_then(|s| s.health).is_none() {
        context
            .client
            .patch_server_status(
                &key.namespace,
                &key.name,
                &SpireServerStatus {
                    health: Some(HealthState::Initializing),
                },
            )
            .await?;
    }

    context.monitors.ensure_started(
        Arc::clone(&context.client),
        key.clone(),
        server.spec.replicas,
    );

    Ok(Outcome::Applied)
}

/// Stops the health monitor of a SpireServer that is being deleted.
///
/// Owned namespaced children are garbage collected through their owner
/// references; the finalizer is released once this returns.
pub async fn cleanup_server(context: &ReconcilerCtx, key: &ObjectKey) -> Result<Action> {
    tracing::info!(server = %key, "Cleaning up deleted SpireServer");
    context.monitors.stop(key).await;
    Ok(Action::await_change())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use k8s_openapi::api::core::v1::{Pod, PodCondition, PodStatus};

    use super::*;
    use crate::{
        api::SpireServerSpec,
        client::MockClusterClient,
        reconcilers::tests::context,
        validation::{Rejection, tests::server_spec},
    };

    fn key() -> ObjectKey {
        ObjectKey::new("spire", "main")
    }

    fn server(spec: SpireServerSpec, health: Option<HealthState>) -> SpireServer {
        let mut server = SpireServer::new("main", spec);
        server.metadata.namespace = Some("spire".to_string());
        server.metadata.uid = Some("5e1f".to_string());
        server.status = health.map(|health| SpireServerStatus {
            health: Some(health),
        });
        server
    }

    fn ready_pod() -> Pod {
        Pod {
            status: Some(PodStatus {
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: "True".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Mock that serves `server` and records every status write.
    fn serving(server: SpireServer) -> (MockClusterClient, Arc<Mutex<Vec<HealthState>>>) {
        let written = Arc::new(Mutex::new(Vec::new()));
        let mut client = MockClusterClient::new();
        client
            .expect_get_server()
            .returning(move |_, _| Ok(Some(server.clone())));
        client
            .expect_list_pods()
            .returning(|_, _| Ok(vec![ready_pod()]));
        let recorded = Arc::clone(&written);
        client
            .expect_patch_server_status()
            .returning(move |_, _, status| {
                recorded.lock().unwrap().extend(status.health);
                Ok(())
            });
        (client, written)
    }

    #[tokio::test]
    async fn missing_server_is_not_an_error() {
        let mut client = MockClusterClient::new();
        client.expect_get_server().returning(|_, _| Ok(None));
        client.expect_apply().never();
        let context = context(client);

        let outcome = reconcile_server(&context, &key()).await.unwrap();
        assert_eq!(outcome, Outcome::Gone);
    }

    #[tokio::test]
    async fn rejected_server_is_deleted() {
        let spec = SpireServerSpec {
            replicas: 3,
            ..server_spec()
        };
        let invalid = server(spec, None);
        let mut client = MockClusterClient::new();
        client
            .expect_get_server()
            .returning(move |_, _| Ok(Some(invalid.clone())));
        client
            .expect_delete_server()
            .times(1)
            .returning(|namespace, name| {
                assert_eq!((namespace, name), ("spire", "main"));
                Ok(())
            });
        client.expect_apply().never();
        client.expect_patch_server_status().never();
        let context = context(client);

        let outcome = reconcile_server(&context, &key()).await.unwrap();
        assert_eq!(outcome, Outcome::Rejected(Rejection::SqliteReplicas(3)));
        assert!(!context.monitors.is_running(&key()));
    }

    #[tokio::test]
    async fn valid_server_is_applied_and_monitored() {
        let (mut client, written) = serving(server(server_spec(), None));
        client.expect_apply().times(10).returning(|descriptor| {
            assert!(descriptor.namespace.is_none() || descriptor.namespace.as_deref() == Some("spire"));
            Ok(())
        });
        let context = context(client);

        let outcome = reconcile_server(&context, &key()).await.unwrap();
        assert_eq!(outcome, Outcome::Applied);
        assert!(context.monitors.is_running(&key()));
        assert_eq!(written.lock().unwrap()[0], HealthState::Initializing);

        context.monitors.stop(&key()).await;
    }

    #[tokio::test]
    async fn existing_status_is_left_to_the_monitor() {
        let (mut client, written) = serving(server(server_spec(), Some(HealthState::Live)));
        client.expect_apply().returning(|_| Ok(()));
        let context = context(client);

        reconcile_server(&context, &key()).await.unwrap();
        context.monitors.stop(&key()).await;

        assert!(
            !written
                .lock()
                .unwrap()
                .contains(&HealthState::Initializing)
        );
    }

    #[tokio::test]
    async fn repeated_reconciliation_keeps_one_monitor() {
        let (mut client, _) = serving(server(server_spec(), None));
        client.expect_apply().times(20).returning(|_| Ok(()));
        let context = context(client);

        reconcile_server(&context, &key()).await.unwrap();
        assert!(
            !context
                .monitors
                .ensure_started(Arc::clone(&context.client), key(), 1)
        );
        reconcile_server(&context, &key()).await.unwrap();

        assert!(context.monitors.stop(&key()).await);
        assert!(!context.monitors.stop(&key()).await);
    }

    #[tokio::test]
    async fn apply_failure_is_reported_without_monitoring() {
        let (mut client, written) = serving(server(server_spec(), None));
        client.expect_apply().returning(|descriptor| match descriptor.kind() {
            "StatefulSet" => Err(Error::MissingField),
            _ => Ok(()),
        });
        let context = context(client);

        let error = reconcile_server(&context, &key()).await.unwrap_err();
        assert!(matches!(error, Error::Apply { kind: "StatefulSet", .. }));
        assert!(!context.monitors.is_running(&key()));
        assert!(written.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn deleted_server_stops_its_monitor() {
        let (mut client, _) = serving(server(server_spec(), None));
        client.expect_apply().returning(|_| Ok(()));
        let context = context(client);
        reconcile_server(&context, &key()).await.unwrap();
        assert!(context.monitors.is_running(&key()));

        let mut gone = MockClusterClient::new();
        gone.expect_get_server().returning(|_, _| Ok(None));
        let context = ReconcilerCtx {
            client: Arc::new(gone),
            ..context
        };

        let outcome = reconcile_server(&context, &key()).await.unwrap();
        assert_eq!(outcome, Outcome::Gone);
        assert!(!context.monitors.is_running(&key()));
    }

    #[tokio::test]
    async fn cleanup_stops_monitor_of_deleting_server() {
        let (mut client, written) = serving(server(server_spec(), None));
        client.expect_apply().returning(|_| Ok(()));
        let context = context(client);
        reconcile_server(&context, &key()).await.unwrap();
        assert!(context.monitors.is_running(&key()));

        let action = cleanup_server(&context, &key()).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert!(!context.monitors.is_running(&key()));

        let writes = written.lock().unwrap().len();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(written.lock().unwrap().len(), writes);
    }

    #[tokio::test]
    async fn cleanup_without_monitor_succeeds() {
        let context = context(MockClusterClient::new());
        let action = cleanup_server(&context, &key()).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn applied_server_resyncs_and_rejected_waits() {
        let (mut client, _) = serving(server(server_spec(), None));
        client.expect_apply().returning(|_| Ok(()));
        let context = context(client);
        assert_eq!(
            apply_server(&context, &key()).await.unwrap(),
            Action::requeue(Duration::from_secs(300))
        );
        context.monitors.stop(&key()).await;

        let mut gone = MockClusterClient::new();
        gone.expect_get_server().returning(|_, _| Ok(None));
        assert_eq!(
            apply_server(&crate::reconcilers::tests::context(gone), &key())
                .await
                .unwrap(),
            Action::await_change()
        );
    }
}
