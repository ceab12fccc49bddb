//! Access to the handful of remote objects the override workflow touches.
//!
//! [`ClusterClient`] is the seam between the reconciliation core and the Kubernetes API. The
//! kube-backed [`Client`] is used at runtime, tests substitute an in-memory implementation.
use std::path::PathBuf;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use kube::{
    Api,
    api::{ListParams, PostParams},
    config::{Config, InferConfigError, KubeConfigOptions, Kubeconfig, KubeconfigError},
    core::{ApiResource, DynamicObject, GroupVersionKind},
};
use snafu::{OptionExt, ResultExt, Snafu};

/// Name of the singleton `ClusterVersion` object.
pub const CLUSTER_VERSION_NAME: &str = "version";

const FIELD_MANAGER: &str = "operator-dev";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{kind} {name:?} not found"))]
    NotFound { kind: &'static str, name: String },

    #[snafu(display("{kind} {name:?} was modified concurrently: {message}"))]
    Conflict {
        kind: &'static str,
        name: String,
        message: String,
    },

    #[snafu(display("request for {kind} {name:?} failed"))]
    Request {
        source: kube::Error,
        kind: &'static str,
        name: String,
    },

    #[snafu(display("{kind} object has no name"))]
    MissingObjectName { kind: &'static str },

    #[snafu(display("{kind} object {name:?} has no namespace"))]
    MissingObjectNamespace { kind: &'static str, name: String },

    #[snafu(display("failed to read kubeconfig from {path:?}"))]
    ReadKubeconfig {
        source: KubeconfigError,
        path: PathBuf,
    },

    #[snafu(display("failed to load kubeconfig"))]
    LoadKubeconfig { source: KubeconfigError },

    #[snafu(display("failed to infer cluster connection configuration"))]
    InferConfig { source: InferConfigError },

    #[snafu(display("failed to create Kubernetes client"))]
    CreateClient { source: kube::Error },
}

impl Error {
    /// The object changed between read and write.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Sorts a [`kube::Error`] into the variants callers make decisions on.
    fn from_kube(source: kube::Error, kind: &'static str, name: &str) -> Self {
        match source {
            kube::Error::Api(ref response) if response.code == 404 => Self::NotFound {
                kind,
                name: name.to_owned(),
            },
            kube::Error::Api(ref response) if response.code == 409 => Self::Conflict {
                kind,
                name: name.to_owned(),
                message: response.message.clone(),
            },
            source => Self::Request {
                source,
                kind,
                name: name.to_owned(),
            },
        }
    }
}

/// The remote store primitives the override workflow is built on.
///
/// All writes are full replaces which carry the resource version of the object they were derived
/// from, so the API server rejects them with [`Error::Conflict`] if the object changed meanwhile.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Fails with [`Error::NotFound`] if no `ClusterOperator` with this name exists.
    async fn get_cluster_operator(&self, name: &str) -> Result<DynamicObject, Error>;

    async fn get_cluster_version(&self) -> Result<DynamicObject, Error>;

    async fn replace_cluster_version(
        &self,
        cluster_version: &DynamicObject,
    ) -> Result<DynamicObject, Error>;

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment, Error>;

    async fn list_deployments(&self, namespace: &str) -> Result<Vec<Deployment>, Error>;

    async fn replace_deployment(&self, deployment: &Deployment) -> Result<Deployment, Error>;
}

/// `config.openshift.io/v1` `ClusterOperator`.
pub fn cluster_operator_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk("config.openshift.io", "v1", "ClusterOperator"),
        "clusteroperators",
    )
}

/// `config.openshift.io/v1` `ClusterVersion`.
pub fn cluster_version_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk("config.openshift.io", "v1", "ClusterVersion"),
        "clusterversions",
    )
}

/// Selects how the connection to the cluster is configured.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub kubeconfig: Option<PathBuf>,
    pub context: Option<String>,
    pub cluster: Option<String>,
    pub user: Option<String>,
    pub namespace: Option<String>,
}

impl ConnectionSettings {
    fn kubeconfig_options(&self) -> KubeConfigOptions {
        KubeConfigOptions {
            context: self.context.clone(),
            cluster: self.cluster.clone(),
            user: self.user.clone(),
        }
    }

    fn selects_kubeconfig_entry(&self) -> bool {
        self.context.is_some() || self.cluster.is_some() || self.user.is_some()
    }
}

/// This `Client` can be used to access the cluster objects of the override workflow.
/// It wraps an underlying [`kube::Client`].
#[derive(Clone)]
pub struct Client {
    client: kube::Client,
    post_params: PostParams,
}

impl Client {
    pub fn new(client: kube::Client, field_manager: Option<String>) -> Self {
        Self {
            client,
            post_params: PostParams {
                field_manager,
                ..PostParams::default()
            },
        }
    }

    fn cluster_operators(&self) -> Api<DynamicObject> {
        Api::all_with(self.client.clone(), &cluster_operator_resource())
    }

    fn cluster_versions(&self) -> Api<DynamicObject> {
        Api::all_with(self.client.clone(), &cluster_version_resource())
    }

    fn deployments(&self, namespace: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ClusterClient for Client {
    async fn get_cluster_operator(&self, name: &str) -> Result<DynamicObject, Error> {
        self.cluster_operators()
            .get(name)
            .await
            .map_err(|source| Error::from_kube(source, "ClusterOperator", name))
    }

    async fn get_cluster_version(&self) -> Result<DynamicObject, Error> {
        self.cluster_versions()
            .get(CLUSTER_VERSION_NAME)
            .await
            .map_err(|source| Error::from_kube(source, "ClusterVersion", CLUSTER_VERSION_NAME))
    }

    async fn replace_cluster_version(
        &self,
        cluster_version: &DynamicObject,
    ) -> Result<DynamicObject, Error> {
        let name = cluster_version
            .metadata
            .name
            .as_deref()
            .context(MissingObjectNameSnafu {
                kind: "ClusterVersion",
            })?;

        self.cluster_versions()
            .replace(name, &self.post_params, cluster_version)
            .await
            .map_err(|source| Error::from_kube(source, "ClusterVersion", name))
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment, Error> {
        self.deployments(namespace)
            .get(name)
            .await
            .map_err(|source| Error::from_kube(source, "Deployment", &format!("{namespace}/{name}")))
    }

    async fn list_deployments(&self, namespace: &str) -> Result<Vec<Deployment>, Error> {
        let deployments = self
            .deployments(namespace)
            .list(&ListParams::default())
            .await
            .map_err(|source| Error::from_kube(source, "Deployment", namespace))?;

        Ok(deployments.items)
    }

    async fn replace_deployment(&self, deployment: &Deployment) -> Result<Deployment, Error> {
        let name = deployment
            .metadata
            .name
            .as_deref()
            .context(MissingObjectNameSnafu { kind: "Deployment" })?;
        let namespace =
            deployment
                .metadata
                .namespace
                .as_deref()
                .context(MissingObjectNamespaceSnafu {
                    kind: "Deployment",
                    name,
                })?;

        self.deployments(namespace)
            .replace(name, &self.post_params, deployment)
            .await
            .map_err(|source| Error::from_kube(source, "Deployment", &format!("{namespace}/{name}")))
    }
}

/// Builds a [`Client`] from the given connection settings.
///
/// An explicit kubeconfig path or entry selection (context, cluster, user) is honoured as given,
/// otherwise the configuration is inferred from the environment (in-cluster service account or
/// the default kubeconfig).
pub async fn create_client(settings: &ConnectionSettings) -> Result<Client, Error> {
    let mut config = match &settings.kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).context(ReadKubeconfigSnafu { path })?;
            Config::from_custom_kubeconfig(kubeconfig, &settings.kubeconfig_options())
                .await
                .context(LoadKubeconfigSnafu)?
        }
        None if settings.selects_kubeconfig_entry() => {
            Config::from_kubeconfig(&settings.kubeconfig_options())
                .await
                .context(LoadKubeconfigSnafu)?
        }
        None => Config::infer().await.context(InferConfigSnafu)?,
    };

    if let Some(namespace) = &settings.namespace {
        config.default_namespace.clone_from(namespace);
    }

    tracing::debug!(cluster_url = %config.cluster_url, "connecting to cluster");
    let client = kube::Client::try_from(config).context(CreateClientSnafu)?;

    Ok(Client::new(client, Some(FIELD_MANAGER.to_owned())))
}
