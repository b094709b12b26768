//! Generic controller for any [`Workload`] kind
//!
//! One instance runs per watched kind. The watch only delivers identities;
//! the reconciler always re-reads the object through the store.

use futures::StreamExt;
use kube::{
    runtime::{
        controller::{self, Action, Controller},
        watcher::Config,
    },
    Api, ResourceExt,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

use crate::adapters::store::KubeWorkloadStore;
use crate::controllers::Context;
use crate::metrics::prometheus::{RECONCILE_DURATION, RECONCILIATIONS, RECONCILIATION_ERRORS};
use crate::reconcilers::image_clone::Outcome;
use crate::workload::Workload;
use crate::Error;

/// Delay before a workload whose conflicts outlasted the local retries is tried again
pub const CONFLICT_REQUEUE: Duration = Duration::from_secs(1);

/// Run the controller for workload kind `K` in all namespaces
pub async fn run<K: Workload>(ctx: Arc<Context>) {
    let workloads: Api<K> = Api::all(ctx.client.clone());

    info!("Starting {} controller", K::KIND);

    Controller::new(workloads, Config::default().any_semantic())
        .shutdown_on_signal()
        .run(reconcile::<K>, error_policy::<K>, ctx)
        .for_each(|res| async move {
            match res {
                Ok((object, _)) => debug!("Reconciled {}", object),
                // Already logged with full context by the reconciler
                Err(controller::Error::ReconcilerFailed(_, _)) => {}
                Err(e) => error!("{} controller error: {}", K::KIND, e),
            }
        })
        .await;

    info!("{} controller stopped", K::KIND);
}

/// Reconcile the workload identified by a notification
#[instrument(skip(workload, ctx), fields(kind = K::KIND, name = %workload.name_any(), namespace = %workload.namespace().unwrap_or_default()))]
async fn reconcile<K: Workload>(workload: Arc<K>, ctx: Arc<Context>) -> Result<Action, Error> {
    let start = Instant::now();
    let ns = workload.namespace().unwrap_or_default();
    let name = workload.name_any();

    RECONCILIATIONS.with_label_values(&[K::KIND]).inc();

    let store = KubeWorkloadStore::<K>::new(ctx.client.clone());
    let result = ctx.cloner.reconcile(&store, &ns, &name).await;

    RECONCILE_DURATION
        .with_label_values(&[K::KIND])
        .observe(start.elapsed().as_secs_f64());

    match result {
        Ok(outcome) => {
            debug!(?outcome, "Reconciliation finished");
            Ok(action_for(&outcome))
        }
        Err(e) => {
            RECONCILIATION_ERRORS.with_label_values(&[K::KIND]).inc();
            Err(e)
        }
    }
}

/// Map a finished reconciliation to the work queue action
pub fn action_for(outcome: &Outcome) -> Action {
    match outcome {
        Outcome::Requeue => Action::requeue(CONFLICT_REQUEUE),
        Outcome::Skipped
        | Outcome::NotFound
        | Outcome::UpToDate
        | Outcome::Committed { .. }
        | Outcome::Deleted => Action::await_change(),
    }
}

/// Requeue delay for a failed reconciliation by error type
pub fn requeue_delay(err: &Error) -> Duration {
    match err {
        Error::StoreFetchError { .. }
        | Error::StoreUpdateError { .. }
        | Error::KubeError(_)
        | Error::Cancelled => Duration::from_secs(30),
        Error::MirrorCopyError { .. } | Error::RegistryError(_) => Duration::from_secs(60),
        Error::CredentialError { .. } | Error::SecretError(_) => Duration::from_secs(120),
        Error::ConfigError(_) | Error::InvalidImageReference(_) => Duration::from_secs(300),
    }
}

/// Error policy for the controller
fn error_policy<K: Workload>(workload: Arc<K>, err: &Error, _ctx: Arc<Context>) -> Action {
    let delay = requeue_delay(err);

    warn!(
        kind = K::KIND,
        namespace = %workload.namespace().unwrap_or_default(),
        name = %workload.name_any(),
        "Reconciliation error, retrying in {}s",
        delay.as_secs()
    );

    Action::requeue(delay)
}
