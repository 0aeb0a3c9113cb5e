use std::{collections::BTreeMap, time::Duration};

use k8s_openapi::{
    api::apps::v1::Deployment, apimachinery::pkg::apis::meta::v1::Time, chrono::Utc,
};
use kube::{ResourceExt, api::ObjectMeta};
use thiserror::Error;
use tokio::time::{Instant, timeout_at};
use tokio_retry2::{
    Retry, RetryError,
    strategy::{ExponentialBackoff, jitter},
};
use tracing::{debug, info, warn};

use crate::{
    crds::{DeploymentSync, DeploymentSyncStatus, SchemaError},
    store::{IntentKey, StoreError, SyncStore, with_deadline},
};

pub const SOURCE_NAMESPACE_LABEL: &str = "homerow.ca/source-namespace";
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGER_NAME: &str = "deploymentsync.homerow.ca";

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to fetch DeploymentSync '{key}': {source}")]
    IntentFetch { key: IntentKey, source: StoreError },

    #[error("DeploymentSync '{key}' is malformed: {source}")]
    Schema { key: IntentKey, source: SchemaError },

    #[error("source Deployment '{namespace}/{name}' not found")]
    SourceNotFound { namespace: String, name: String },

    #[error("failed to fetch source Deployment '{namespace}/{name}': {source}")]
    SourceFetch {
        namespace: String,
        name: String,
        source: StoreError,
    },

    #[error("failed to fetch destination Deployment '{namespace}/{name}': {source}")]
    DestinationFetch {
        namespace: String,
        name: String,
        source: StoreError,
    },

    #[error("failed to write destination Deployment '{namespace}/{name}': {source}")]
    DestinationWrite {
        namespace: String,
        name: String,
        source: StoreError,
    },

    #[error("destination Deployment '{namespace}/{name}' still conflicting after {attempts} attempts")]
    DestinationConflict {
        namespace: String,
        name: String,
        attempts: usize,
    },
}

impl Error {
    /// Malformed intents cannot be fixed by retrying; everything else can.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Error::Schema { .. })
    }

    fn is_conflict(&self) -> bool {
        matches!(
            self,
            Error::DestinationWrite {
                source: StoreError::Conflict,
                ..
            }
        )
    }
}

/// What a successful reconcile did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The intent no longer exists.
    IntentGone,
    Created,
    Updated,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::IntentGone => f.write_str("intent gone"),
            Outcome::Created => f.write_str("created"),
            Outcome::Updated => f.write_str("updated"),
        }
    }
}

/// Bounds the in-reconcile retries of destination write conflicts.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub conflict_retries: usize,
    pub base_delay_millis: u64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            conflict_retries: 5,
            base_delay_millis: 10,
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    fn strategy(&self) -> impl Iterator<Item = Duration> {
        ExponentialBackoff::from_millis(self.base_delay_millis)
            .max_delay(self.max_delay)
            .map(jitter)
            .take(self.conflict_retries)
    }
}

/// Drives the destination Deployment of a `DeploymentSync` toward its source.
///
/// Holds no object state between calls; every invocation reads the intent,
/// source and destination afresh.
pub struct Reconciler<S> {
    store: S,
    retry: RetryPolicy,
}

impl<S: SyncStore> Reconciler<S> {
    pub fn new(store: S, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Reconciles the intent identified by `key`. Every store call fails with
    /// [`StoreError::Cancelled`] once `deadline` has passed.
    pub async fn reconcile(&self, key: &IntentKey, deadline: Instant) -> Result<Outcome, Error> {
        let intent = match with_deadline(deadline, self.store.get_intent(key)).await {
            Ok(intent) => intent,
            Err(StoreError::NotFound) => {
                debug!(intent = %key, "DeploymentSync no longer exists, nothing to reconcile");
                return Ok(Outcome::IntentGone);
            }
            Err(StoreError::Schema(source)) => {
                return Err(Error::Schema {
                    key: key.clone(),
                    source,
                });
            }
            Err(source) => {
                return Err(Error::IntentFetch {
                    key: key.clone(),
                    source,
                });
            }
        };

        let (source_namespace, name) = intent.spec.source_ref();
        let source = with_deadline(deadline, self.store.get_deployment(source_namespace, name))
            .await
            .map_err(|source| match source {
                StoreError::NotFound => Error::SourceNotFound {
                    namespace: source_namespace.to_owned(),
                    name: name.to_owned(),
                },
                source => Error::SourceFetch {
                    namespace: source_namespace.to_owned(),
                    name: name.to_owned(),
                    source,
                },
            })?;

        let outcome = self.sync_destination_with_retry(&intent, &source, deadline).await?;

        let status = DeploymentSyncStatus {
            last_sync_time: Some(Time(Utc::now())),
        };
        if let Err(e) =
            with_deadline(deadline, self.store.update_intent_status(&intent, &status)).await
        {
            warn!(intent = %key, error = %e, "Unable to record last sync time");
        }

        Ok(outcome)
    }

    async fn sync_destination_with_retry(
        &self,
        intent: &DeploymentSync,
        source: &Deployment,
        deadline: Instant,
    ) -> Result<Outcome, Error> {
        let (namespace, name) = intent.spec.destination_ref();
        let retries = Retry::spawn(self.retry.strategy(), move || async move {
            self.sync_destination(intent, source, deadline)
                .await
                .map_err(|e| {
                    if e.is_conflict() {
                        debug!(error = %e, "Destination changed underneath us, retrying");
                        RetryError::transient(e)
                    } else {
                        RetryError::permanent(e)
                    }
                })
        });
        // Backoff sleeps between attempts count against the deadline too.
        let result = timeout_at(deadline, retries)
            .await
            .unwrap_or_else(|_| {
                Err(Error::DestinationWrite {
                    namespace: namespace.to_owned(),
                    name: name.to_owned(),
                    source: StoreError::Cancelled,
                })
            });

        result.map_err(|e| match e {
            Error::DestinationWrite {
                namespace,
                name,
                source: StoreError::Conflict,
            } => Error::DestinationConflict {
                namespace,
                name,
                attempts: self.retry.conflict_retries + 1,
            },
            e => e,
        })
    }

    async fn sync_destination(
        &self,
        intent: &DeploymentSync,
        source: &Deployment,
        deadline: Instant,
    ) -> Result<Outcome, Error> {
        let (namespace, name) = intent.spec.destination_ref();
        let write_error = |source: StoreError| Error::DestinationWrite {
            namespace: namespace.to_owned(),
            name: name.to_owned(),
            source,
        };

        match with_deadline(deadline, self.store.get_deployment(namespace, name)).await {
            Err(StoreError::NotFound) => {
                info!(
                    namespace,
                    deployment = name,
                    source_namespace = %intent.spec.source_namespace,
                    "Creating Deployment in destination namespace"
                );
                let destination = Deployment {
                    metadata: ObjectMeta {
                        namespace: Some(namespace.to_owned()),
                        name: Some(name.to_owned()),
                        labels: Some(sync_labels(intent)),
                        ..ObjectMeta::default()
                    },
                    spec: source.spec.clone(),
                    ..Deployment::default()
                };
                with_deadline(deadline, self.store.create_deployment(&destination))
                    .await
                    .map_err(write_error)?;
                Ok(Outcome::Created)
            }
            Err(source) => Err(Error::DestinationFetch {
                namespace: namespace.to_owned(),
                name: name.to_owned(),
                source,
            }),
            Ok(mut destination) => {
                info!(
                    namespace,
                    deployment = name,
                    resource_version = ?destination.resource_version(),
                    "Updating Deployment in destination namespace"
                );
                // Full overwrite of the spec; metadata identity and status stay as stored.
                destination.spec = source.spec.clone();
                destination
                    .metadata
                    .labels
                    .get_or_insert_default()
                    .extend(sync_labels(intent));
                with_deadline(deadline, self.store.update_deployment(&destination))
                    .await
                    .map_err(write_error)?;
                Ok(Outcome::Updated)
            }
        }
    }
}

fn sync_labels(intent: &DeploymentSync) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            SOURCE_NAMESPACE_LABEL.to_owned(),
            intent.spec.source_namespace.clone(),
        ),
        (MANAGED_BY_LABEL.to_owned(), MANAGER_NAME.to_owned()),
    ])
}
