//! The `override` workflow.
//!
//! One invocation runs a fixed sequence: resolve where the operator runs, check it is a cluster
//! operator, flip its override in the cluster version, and, unless it is handed back to the
//! cluster version operator, patch its deployment. The override edit and the deployment patch are
//! separate writes. If the second one fails the override stays in place and the command can
//! simply be run again.
use std::{io::Write, time::Duration};

use snafu::{ResultExt, Snafu};

use crate::{
    client::{self, ClusterClient},
    names::{self, ComponentIdentity},
    overrides::{self, OverrideEdit, OverrideKey},
    retry::Backoff,
    workload::{self, PatchOutcome, WorkloadPatch},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{name:?} is not a cluster operator (see `oc get clusteroperators`)"))]
    UnknownComponent { source: client::Error, name: String },

    #[snafu(display("failed to look up cluster operator {name:?}"))]
    GetClusterOperator { source: client::Error, name: String },

    #[snafu(display("failed to resolve the operator deployment"))]
    ResolveDeployment { source: names::Error },

    #[snafu(display("failed to set the override for {identity}"))]
    CommitOverride {
        source: overrides::Error,
        identity: String,
    },

    #[snafu(display("failed to patch {identity}"))]
    PatchWorkload {
        source: workload::Error,
        identity: String,
    },

    #[snafu(display("failed to write output"))]
    WriteOutput { source: std::io::Error },
}

/// A validated `override` invocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OverrideRequest {
    pub component: String,
    pub deployment: Option<String>,

    /// Hand the operator back to the cluster version operator. The patch is ignored.
    pub managed: bool,
    pub patch: WorkloadPatch,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Settings {
    /// Pause between the override edit and the deployment patch.
    ///
    /// This gives the cluster version operator a chance to notice the override before the
    /// deployment changes. It narrows the window in which the cluster version operator reverts
    /// the patch, it doesn't close it.
    pub settle_delay: Duration,
    pub backoff: Backoff,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_secs(1),
            backoff: Backoff::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Outcome {
    pub identity: ComponentIdentity,
    pub override_edit: OverrideEdit,

    /// `None` if the operator was handed back.
    pub patch: Option<PatchOutcome>,
}

/// Runs the `override` workflow, writing progress lines to `out`.
pub async fn run<C, W>(
    client: &C,
    request: &OverrideRequest,
    settings: &Settings,
    out: &mut W,
) -> Result<Outcome, Error>
where
    C: ClusterClient + ?Sized,
    W: Write,
{
    let identity = ComponentIdentity::resolve(&request.component, request.deployment.as_deref());
    tracing::info!(
        component = %request.component,
        namespace = %identity.namespace,
        deployment = %identity.deployment,
        "resolved operator deployment"
    );

    match client.get_cluster_operator(&request.component).await {
        Ok(_) => {}
        Err(source) if source.is_not_found() => {
            return Err(source).context(UnknownComponentSnafu {
                name: &request.component,
            });
        }
        Err(source) => {
            return Err(source).context(GetClusterOperatorSnafu {
                name: &request.component,
            });
        }
    }

    let identity = identity
        .confirm(client)
        .await
        .context(ResolveDeploymentSnafu)?;
    let target = identity.to_string();

    let key = OverrideKey::deployment(&identity.namespace, &identity.deployment);
    let override_edit = overrides::commit_override(client, &key, !request.managed, &settings.backoff)
        .await
        .context(CommitOverrideSnafu { identity: &target })?;
    tracing::info!(%key, unmanaged = !request.managed, ?override_edit, "override committed");

    if request.managed {
        writeln!(out, "-> Operator {target:?} now managed ...").context(WriteOutputSnafu)?;
        return Ok(Outcome {
            identity,
            override_edit,
            patch: None,
        });
    }

    writeln!(out, "-> Operator {target:?} is not managed ...").context(WriteOutputSnafu)?;

    tracing::debug!(
        delay = ?settings.settle_delay,
        "waiting for the cluster version operator to observe the override"
    );
    tokio::time::sleep(settings.settle_delay).await;

    let patch_outcome = workload::patch_workload(
        client,
        &identity.namespace,
        &identity.deployment,
        &request.patch,
        &settings.backoff,
    )
    .await
    .context(PatchWorkloadSnafu { identity: &target })?;

    if let Some(image) = &request.patch.image {
        writeln!(out, "-> Operator {target:?} image changed to {image:?} ...")
            .context(WriteOutputSnafu)?;
    }
    if let Some(operand_image) = &request.patch.operand_image {
        writeln!(out, "-> Operand of {target:?} image changed to {operand_image:?} ...")
            .context(WriteOutputSnafu)?;
    }
    if let Some(verbosity) = &request.patch.verbosity {
        writeln!(out, "-> Operator {target:?} verbosity set to {verbosity} ...")
            .context(WriteOutputSnafu)?;
    }

    Ok(Outcome {
        identity,
        override_edit,
        patch: Some(patch_outcome),
    })
}
