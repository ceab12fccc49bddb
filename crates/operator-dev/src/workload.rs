//! Points an operator deployment at custom images.
//!
//! Two behaviours are kept on purpose because callers rely on them:
//!
//! - Init containers receive the operator image whenever one is given, regardless of what they
//!   ran before or whether they carry an `OPERATOR_IMAGE` env var.
//! - The verbosity flag is appended on every run, so repeated runs accumulate `-v=` arguments.
use k8s_openapi::api::{apps::v1::Deployment, core::v1::Container};
use snafu::{ResultExt, Snafu, ensure};

use crate::{
    client::{self, ClusterClient},
    retry::{self, Backoff, Conflict},
};

/// Env var an operator reads its own image from.
pub const OPERATOR_IMAGE_ENV: &str = "OPERATOR_IMAGE";

/// Env var an operator reads its operand's image from.
pub const OPERAND_IMAGE_ENV: &str = "IMAGE";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to get deployment {namespace}/{name}"))]
    GetDeployment {
        source: client::Error,
        namespace: String,
        name: String,
    },

    #[snafu(display("failed to update deployment {namespace}/{name}"))]
    ReplaceDeployment {
        source: client::Error,
        namespace: String,
        name: String,
    },

    #[snafu(display(
        "no {OPERAND_IMAGE_ENV} env var found in deployment {namespace}/{name}, the operand image \
        was not changed"
    ))]
    NoOperandImageEnv { namespace: String, name: String },
}

impl Conflict for Error {
    fn is_conflict(&self) -> bool {
        match self {
            Self::ReplaceDeployment { source, .. } => source.is_conflict(),
            _ => false,
        }
    }
}

/// The changes requested for an operator deployment.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkloadPatch {
    /// Replaces the image of all containers and the value of `OPERATOR_IMAGE`.
    pub image: Option<String>,

    /// Appended as `-v=<verbosity>` to the arguments of all (non-init) containers.
    pub verbosity: Option<String>,

    /// Replaces the value of `IMAGE`.
    pub operand_image: Option<String>,
}

/// What [`WorkloadPatch::apply`] changed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PatchOutcome {
    pub containers: usize,
    pub init_containers: usize,
    pub operator_image_env_updated: bool,
    pub operand_image_updated: bool,
}

impl WorkloadPatch {
    pub fn is_empty(&self) -> bool {
        self.image.is_none() && self.verbosity.is_none() && self.operand_image.is_none()
    }

    /// Applies the patch to the pod template of `deployment`.
    pub fn apply(&self, deployment: &mut Deployment) -> PatchOutcome {
        let mut outcome = PatchOutcome::default();

        let Some(pod_spec) = deployment
            .spec
            .as_mut()
            .and_then(|spec| spec.template.spec.as_mut())
        else {
            return outcome;
        };

        for container in &mut pod_spec.containers {
            self.apply_to_container(container, &mut outcome);
            outcome.containers += 1;
        }

        if let Some(image) = &self.image {
            for init_container in pod_spec.init_containers.iter_mut().flatten() {
                init_container.image = Some(image.clone());
                outcome.init_containers += 1;
            }
        }

        outcome
    }

    fn apply_to_container(&self, container: &mut Container, outcome: &mut PatchOutcome) {
        if let Some(image) = &self.image {
            container.image = Some(image.clone());
        }

        if let Some(verbosity) = &self.verbosity {
            container
                .args
                .get_or_insert_with(Vec::new)
                .push(format!("-v={verbosity}"));
        }

        for env in container.env.iter_mut().flatten() {
            let replacement = match env.name.as_str() {
                OPERATOR_IMAGE_ENV => self.image.as_ref().inspect(|_| {
                    outcome.operator_image_env_updated = true;
                }),
                OPERAND_IMAGE_ENV => self.operand_image.as_ref().inspect(|_| {
                    outcome.operand_image_updated = true;
                }),
                _ => None,
            };

            if let Some(value) = replacement {
                env.value = Some(value.clone());
                env.value_from = None;
            }
        }
    }
}

/// Applies `patch` to the deployment `namespace/name`, retrying on conflicting writes.
///
/// If an operand image was requested but no container carries an `IMAGE` env var, this fails
/// with [`Error::NoOperandImageEnv`] after the remaining changes were written.
pub async fn patch_workload<C>(
    client: &C,
    namespace: &str,
    name: &str,
    patch: &WorkloadPatch,
    backoff: &Backoff,
) -> Result<PatchOutcome, Error>
where
    C: ClusterClient + ?Sized,
{
    let outcome = retry::on_conflict(backoff, move || async move {
        let mut deployment = client
            .get_deployment(namespace, name)
            .await
            .context(GetDeploymentSnafu { namespace, name })?;

        let outcome = patch.apply(&mut deployment);
        tracing::debug!(
            namespace,
            name,
            ?outcome,
            resource_version = ?deployment.metadata.resource_version,
            "updating deployment"
        );

        client
            .replace_deployment(&deployment)
            .await
            .context(ReplaceDeploymentSnafu { namespace, name })?;

        Ok::<_, Error>(outcome)
    })
    .await?;

    ensure!(
        patch.operand_image.is_none() || outcome.operand_image_updated,
        NoOperandImageEnvSnafu { namespace, name }
    );

    Ok(outcome)
}
