use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use futures::{Stream, StreamExt};
use k8s_openapi::api::apps::v1::Deployment;
use kube::{
    Api, Client, Resource, ResourceExt,
    config::KubeConfigOptions,
    runtime::{
        Controller, WatchStreamExt,
        controller::{self, Action},
        predicates,
        reflector::{self, ObjectRef, Store},
        watcher,
    },
};
use tokio::time::Instant;
use tokio_retry2::strategy::ExponentialBackoff;
use tracing::{debug, error, info, warn};

pub mod config;
pub mod crds;
pub mod reconcile;
pub mod store;

use config::RunConfig;
use crds::*;
use reconcile::{Outcome, Reconciler};
use store::{IntentKey, KubeStore};

struct Context {
    reconciler: Reconciler<KubeStore>,
    intents: Store<DeploymentSync>,
    backoff: ErrorBackoff,
    resync_interval: Duration,
    reconcile_timeout: Duration,
}

pub async fn run(config: RunConfig) -> anyhow::Result<()> {
    let options = KubeConfigOptions::default();

    // Load kubeconfig if it's present otherwise fall back to cluster config
    let kube_config = kube::Config::from_kubeconfig(&options)
        .await
        .or_else(|_| kube::Config::incluster())?;
    let client = Client::try_from(kube_config)?;

    let intents = match &config.namespace {
        Some(ns) => Api::<DeploymentSync>::namespaced(client.clone(), ns),
        None => Api::<DeploymentSync>::all(client.clone()),
    };
    // Sources and destinations may live in any namespace.
    let deployments = Api::<Deployment>::all(client.clone());

    let (reader, writer) = reflector::store::<DeploymentSync>();
    let intent_changes = spec_changes(
        watcher(intents, watcher::Config::default())
            .default_backoff()
            .reflect(writer)
            .applied_objects(),
    );
    let deployment_changes = spec_changes(
        watcher(deployments, watcher::Config::default())
            .default_backoff()
            .applied_objects(),
    );

    let ctx = Arc::new(Context {
        reconciler: Reconciler::new(KubeStore::new(client), config.retry_policy()),
        intents: reader.clone(),
        backoff: ErrorBackoff::default(),
        resync_interval: config.resync_interval(),
        reconcile_timeout: config.reconcile_timeout(),
    });

    info!(
        namespace = config.namespace.as_deref().unwrap_or("*"),
        resync_secs = config.resync_interval,
        concurrency = config.concurrency,
        "Starting DeploymentSync controller"
    );

    let store = reader.clone();
    Controller::for_stream(intent_changes, reader)
        .with_config(controller::Config::default().concurrency(config.concurrency))
        .watches_stream(deployment_changes, move |deployment| {
            intents_referencing(&store, &deployment)
        })
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((intent, _)) => debug!("DeploymentSync '{}' reconciled", intent),
                Err(e) => warn!("Reconcile failed: {}", e),
            }
        })
        .await;

    info!("DeploymentSync controller shut down");
    Ok(())
}

/// Drops events that leave `metadata.generation` unchanged.
///
/// Status writes (our own `lastSyncTime`, a Deployment's rollout progress)
/// never bump the generation, so they do not trigger a reconcile; only spec
/// changes and the periodic resync do.
fn spec_changes<K, S>(stream: S) -> impl Stream<Item = Result<K, watcher::Error>> + Send
where
    K: Resource<DynamicType = ()> + Send + 'static,
    S: Stream<Item = Result<K, watcher::Error>> + Send + 'static,
{
    stream.predicate_filter(predicates::generation)
}

/// Maps a changed Deployment to every intent that uses it as source or destination.
fn intents_referencing(
    store: &Store<DeploymentSync>,
    deployment: &Deployment,
) -> Vec<ObjectRef<DeploymentSync>> {
    let Some(namespace) = deployment.namespace() else {
        return Vec::new();
    };
    let name = deployment.name_any();

    store
        .state()
        .iter()
        .filter(|intent| intent.spec.references(&namespace, &name))
        .map(|intent| ObjectRef::from_obj(intent.as_ref()))
        .collect()
}

fn intent_key(intent: &DeploymentSync) -> IntentKey {
    IntentKey::new(intent.namespace().unwrap_or_default(), intent.name_any())
}

async fn reconcile(
    intent: Arc<DeploymentSync>,
    ctx: Arc<Context>,
) -> Result<Action, reconcile::Error> {
    let key = intent_key(&intent);
    let deadline = Instant::now() + ctx.reconcile_timeout;

    let outcome = ctx.reconciler.reconcile(&key, deadline).await?;
    ctx.backoff.reset(&key);

    info!(intent = %key, %outcome, "DeploymentSync reconciled");
    Ok(match outcome {
        Outcome::IntentGone => Action::await_change(),
        Outcome::Created | Outcome::Updated => Action::requeue(ctx.resync_interval),
    })
}

fn error_policy(intent: Arc<DeploymentSync>, err: &reconcile::Error, ctx: Arc<Context>) -> Action {
    let key = intent_key(&intent);

    if !err.is_retryable() {
        error!(intent = %key, error = %err, "DeploymentSync cannot be reconciled until it changes");
        return Action::await_change();
    }

    ctx.backoff.prune(|k| {
        ctx.intents
            .get(&ObjectRef::new(&k.name).within(&k.namespace))
            .is_some()
    });
    let delay = ctx.backoff.next(&key);
    warn!(intent = %key, error = %err, retry_in = ?delay, "Reconcile failed, backing off");
    Action::requeue(delay)
}

const MAX_ERROR_BACKOFF: Duration = Duration::from_secs(300);

/// Per-intent exponential backoff for failed reconciles: 500ms, 1s, 2s, ... capped at 5m.
#[derive(Default)]
struct ErrorBackoff {
    failures: Mutex<HashMap<IntentKey, u32>>,
}

impl ErrorBackoff {
    fn next(&self, key: &IntentKey) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        let count = failures.entry(key.clone()).or_insert(0);
        let attempt = *count as usize;
        *count = count.saturating_add(1);

        ExponentialBackoff::from_millis(2)
            .factor(250)
            .max_delay(MAX_ERROR_BACKOFF)
            .nth(attempt)
            .unwrap_or(MAX_ERROR_BACKOFF)
    }

    /// Forgets intents that no longer exist; deleted intents are never reconciled again.
    fn prune(&self, exists: impl Fn(&IntentKey) -> bool) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|key, _| exists(key));
    }

    fn reset(&self, key: &IntentKey) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }
}
