//! Maps a cluster operator's short name to the namespace and deployment running it.
//!
//! OpenShift operators mostly follow the convention that the `foo` cluster operator runs as
//! deployment `foo-operator` in namespace `openshift-foo-operator`. Components deviating from that
//! convention are listed in [`KNOWN_OPERATORS`]. New irregular components are added there, not
//! as new control flow.
use itertools::Itertools;
use k8s_openapi::api::apps::v1::Deployment;
use kube::ResourceExt;
use snafu::{ResultExt, Snafu};

use crate::client::{self, ClusterClient};

const NAMESPACE_PREFIX: &str = "openshift-";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to get deployment {namespace}/{name}"))]
    GetDeployment {
        source: client::Error,
        namespace: String,
        name: String,
    },

    #[snafu(display("failed to list deployments in namespace {namespace}"))]
    ListDeployments {
        source: client::Error,
        namespace: String,
    },

    #[snafu(display(
        "deployment {namespace}/{name} not found and no single candidate in the namespace \
        (found: [{found}]), supply the deployment name with --deployment",
        found = candidates.join(", ")
    ))]
    DeploymentNotFound {
        namespace: String,
        name: String,
        candidates: Vec<String>,
    },
}

/// An operator whose namespace or deployment doesn't follow the default naming rules.
#[derive(Debug, PartialEq, Eq)]
pub struct KnownOperator {
    pub name: &'static str,
    pub namespace: &'static str,
    pub deployment: Option<&'static str>,
}

pub const KNOWN_OPERATORS: &[KnownOperator] = &[
    KnownOperator {
        name: "insights",
        namespace: "openshift-insights",
        deployment: None,
    },
    KnownOperator {
        name: "openshift-apiserver",
        namespace: "openshift-apiserver-operator",
        deployment: None,
    },
    KnownOperator {
        name: "image-registry",
        namespace: "openshift-image-registry",
        deployment: Some("cluster-image-registry-operator"),
    },
    KnownOperator {
        name: "monitoring",
        namespace: "openshift-monitoring",
        deployment: Some("cluster-monitoring-operator"),
    },
    KnownOperator {
        name: "machine-api",
        namespace: "openshift-machine-api",
        deployment: Some("machine-api-operator"),
    },
    KnownOperator {
        name: "marketplace",
        namespace: "openshift-marketplace",
        deployment: Some("marketplace-operator"),
    },
    KnownOperator {
        name: "storage",
        namespace: "openshift-cluster-storage-operator",
        deployment: Some("cluster-storage-operator"),
    },
    KnownOperator {
        name: "node-tuning",
        namespace: "openshift-cluster-node-tuning-operator",
        deployment: Some("cluster-node-tuning-operator"),
    },
    KnownOperator {
        name: "operator-lifecycle-manager",
        namespace: "openshift-operator-lifecycle-manager",
        deployment: Some("olm-operator"),
    },
];

fn known_operator(name: &str) -> Option<&'static KnownOperator> {
    let stripped = name.strip_prefix(NAMESPACE_PREFIX).unwrap_or(name);

    KNOWN_OPERATORS
        .iter()
        .find(|known| known.name == name)
        .or_else(|| KNOWN_OPERATORS.iter().find(|known| known.name == stripped))
}

/// Namespace the operator `name` runs in.
pub fn operator_namespace(name: &str) -> String {
    if let Some(known) = known_operator(name) {
        return known.namespace.to_owned();
    }

    let stripped = name.strip_prefix(NAMESPACE_PREFIX).unwrap_or(name);
    format!("{NAMESPACE_PREFIX}{stripped}-operator")
}

/// Name of the deployment running the operator `name`.
pub fn operator_deployment_name(name: &str) -> String {
    match known_operator(name).and_then(|known| known.deployment) {
        Some(deployment) => deployment.to_owned(),
        None => format!("{name}-operator"),
    }
}

/// Where a cluster operator runs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ComponentIdentity {
    /// The cluster operator name as given by the user.
    pub name: String,
    pub namespace: String,
    pub deployment: String,

    /// The deployment name was supplied explicitly and must not be guessed.
    pub explicit_deployment: bool,
}

impl ComponentIdentity {
    /// Derives the identity of `name`. A non-empty `deployment` takes precedence over the derived
    /// deployment name.
    pub fn resolve(name: &str, deployment: Option<&str>) -> Self {
        let explicit = deployment.filter(|deployment| !deployment.is_empty());

        Self {
            name: name.to_owned(),
            namespace: operator_namespace(name),
            deployment: explicit.map_or_else(|| operator_deployment_name(name), str::to_owned),
            explicit_deployment: explicit.is_some(),
        }
    }

    /// Confirms that the deployment exists.
    ///
    /// If a derived deployment name doesn't exist and the namespace contains exactly one
    /// deployment, that one is adopted instead. Errors other than not found are returned as is.
    pub async fn confirm<C>(self, client: &C) -> Result<Self, Error>
    where
        C: ClusterClient + ?Sized,
    {
        let result = client.get_deployment(&self.namespace, &self.deployment).await;
        let error = match result {
            Ok(_) => return Ok(self),
            Err(error) if error.is_not_found() && !self.explicit_deployment => error,
            Err(error) => {
                return Err(error).context(GetDeploymentSnafu {
                    namespace: self.namespace,
                    name: self.deployment,
                });
            }
        };

        tracing::debug!(
            namespace = %self.namespace,
            deployment = %self.deployment,
            %error,
            "derived deployment not found, looking for a single candidate"
        );

        let deployments = client
            .list_deployments(&self.namespace)
            .await
            .context(ListDeploymentsSnafu {
                namespace: self.namespace.clone(),
            })?;

        match deployments.as_slice() {
            [single] => {
                let adopted = single.name_any();
                tracing::info!(
                    namespace = %self.namespace,
                    derived = %self.deployment,
                    %adopted,
                    "adopting the only deployment in the operator namespace"
                );

                Ok(Self {
                    deployment: adopted,
                    ..self
                })
            }
            candidates => DeploymentNotFoundSnafu {
                candidates: candidates
                    .iter()
                    .map(Deployment::name_any)
                    .sorted()
                    .collect::<Vec<_>>(),
                namespace: self.namespace,
                name: self.deployment,
            }
            .fail(),
        }
    }
}

impl std::fmt::Display for ComponentIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.deployment)
    }
}
