//! An in-memory [`ClusterClient`] with resource version semantics.
use std::{collections::BTreeMap, sync::Mutex};

use async_trait::async_trait;
use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentSpec},
        core::v1::{Container, EnvVar, PodSpec, PodTemplateSpec},
    },
    apimachinery::pkg::apis::meta::v1::ObjectMeta,
};
use kube::core::DynamicObject;
use serde_json::{Value, json};

use crate::client::{
    CLUSTER_VERSION_NAME, ClusterClient, Error, cluster_operator_resource,
    cluster_version_resource,
};

pub fn deployment(namespace: &str, name: &str, containers: &[&str]) -> Deployment {
    Deployment {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            namespace: Some(namespace.to_owned()),
            ..ObjectMeta::default()
        },
        spec: Some(DeploymentSpec {
            template: PodTemplateSpec {
                spec: Some(PodSpec {
                    containers: containers
                        .iter()
                        .map(|container| Container {
                            name: (*container).to_owned(),
                            image: Some(format!("registry/{container}:stock")),
                            ..Container::default()
                        })
                        .collect(),
                    ..PodSpec::default()
                }),
                ..PodTemplateSpec::default()
            },
            ..DeploymentSpec::default()
        }),
        ..Deployment::default()
    }
}

pub fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_owned(),
        value: Some(value.to_owned()),
        ..EnvVar::default()
    }
}

/// A `ClusterVersion` with some unrelated spec content and, if given, `spec.overrides`.
pub fn cluster_version(overrides: Option<Value>) -> DynamicObject {
    let mut object = DynamicObject::new(CLUSTER_VERSION_NAME, &cluster_version_resource());
    object.metadata.resource_version = Some("1".to_owned());
    object.data = json!({
        "spec": {
            "channel": "stable-4.18",
            "clusterID": "6b2a4c3e-0000-4000-8000-000000000000",
        }
    });

    if let Some(overrides) = overrides {
        object.data["spec"]["overrides"] = overrides;
    }

    object
}

fn bump(resource_version: Option<&str>) -> Option<String> {
    let current: u64 = resource_version.and_then(|rv| rv.parse().ok()).unwrap_or(0);
    Some((current + 1).to_string())
}

#[derive(Default)]
struct State {
    cluster_operators: Vec<String>,
    cluster_version: Option<DynamicObject>,
    deployments: BTreeMap<(String, String), Deployment>,

    cluster_version_conflicts: usize,
    deployment_conflicts: usize,
    concurrent_override: Option<Value>,
    deployments_unavailable: bool,

    calls: BTreeMap<&'static str, usize>,
}

impl State {
    fn record(&mut self, call: &'static str) {
        *self.calls.entry(call).or_default() += 1;
    }
}

pub struct FakeCluster {
    state: Mutex<State>,
}

impl FakeCluster {
    /// A cluster with a `ClusterVersion` without overrides and nothing else.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                cluster_version: Some(cluster_version(None)),
                ..State::default()
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("fake cluster state is not poisoned")
    }

    fn configure(mut self, f: impl FnOnce(&mut State)) -> Self {
        f(self
            .state
            .get_mut()
            .expect("fake cluster state is not poisoned"));
        self
    }

    pub fn with_cluster_operator(self, name: &str) -> Self {
        self.configure(|state| state.cluster_operators.push(name.to_owned()))
    }

    pub fn with_deployment(self, mut deployment: Deployment) -> Self {
        deployment.metadata.resource_version = Some("1".to_owned());
        let key = (
            deployment.metadata.namespace.clone().unwrap_or_default(),
            deployment.metadata.name.clone().unwrap_or_default(),
        );
        self.configure(|state| {
            state.deployments.insert(key, deployment);
        })
    }

    pub fn with_overrides(self, overrides: Value) -> Self {
        self.configure(|state| state.cluster_version = Some(cluster_version(Some(overrides))))
    }

    pub fn without_cluster_version(self) -> Self {
        self.configure(|state| state.cluster_version = None)
    }

    /// The next `count` cluster version writes are rejected as conflicts.
    pub fn with_cluster_version_conflicts(self, count: usize) -> Self {
        self.configure(|state| state.cluster_version_conflicts = count)
    }

    /// The next `count` deployment writes are rejected as conflicts.
    pub fn with_deployment_conflicts(self, count: usize) -> Self {
        self.configure(|state| state.deployment_conflicts = count)
    }

    /// Right after the next cluster version read, another writer appends `entry` to the
    /// overrides, invalidating the copy that was handed out.
    pub fn with_concurrent_override(self, entry: Value) -> Self {
        self.configure(|state| state.concurrent_override = Some(entry))
    }

    /// Deployment reads fail with a transport error.
    pub fn with_unavailable_deployments(self) -> Self {
        self.configure(|state| state.deployments_unavailable = true)
    }

    pub fn calls(&self, call: &str) -> usize {
        self.state().calls.get(call).copied().unwrap_or_default()
    }

    pub fn overrides(&self) -> Vec<Value> {
        self.state()
            .cluster_version
            .as_ref()
            .and_then(|object| object.data["spec"]["overrides"].as_array().cloned())
            .unwrap_or_default()
    }

    pub fn deployment(&self, namespace: &str, name: &str) -> Option<Deployment> {
        self.state()
            .deployments
            .get(&(namespace.to_owned(), name.to_owned()))
            .cloned()
    }
}

fn conflict(kind: &'static str, name: &str) -> Error {
    Error::Conflict {
        kind,
        name: name.to_owned(),
        message: "the object has been modified; please apply your changes to the latest version \
                  and try again"
            .to_owned(),
    }
}

fn not_found(kind: &'static str, name: &str) -> Error {
    Error::NotFound {
        kind,
        name: name.to_owned(),
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn get_cluster_operator(&self, name: &str) -> Result<DynamicObject, Error> {
        let mut state = self.state();
        state.record("get_cluster_operator");

        if state.cluster_operators.iter().any(|known| known == name) {
            Ok(DynamicObject::new(name, &cluster_operator_resource()))
        } else {
            Err(not_found("ClusterOperator", name))
        }
    }

    async fn get_cluster_version(&self) -> Result<DynamicObject, Error> {
        let mut state = self.state();
        state.record("get_cluster_version");

        let State {
            cluster_version,
            concurrent_override,
            ..
        } = &mut *state;
        let stored = cluster_version
            .as_mut()
            .ok_or_else(|| not_found("ClusterVersion", CLUSTER_VERSION_NAME))?;
        let handed_out = stored.clone();

        if let Some(entry) = concurrent_override.take() {
            let spec = &mut stored.data["spec"];
            match spec["overrides"].as_array_mut() {
                Some(overrides) => overrides.push(entry),
                None => spec["overrides"] = json!([entry]),
            }
            stored.metadata.resource_version = bump(stored.metadata.resource_version.as_deref());
        }

        Ok(handed_out)
    }

    async fn replace_cluster_version(
        &self,
        cluster_version: &DynamicObject,
    ) -> Result<DynamicObject, Error> {
        let mut state = self.state();
        state.record("replace_cluster_version");

        if state.cluster_version_conflicts > 0 {
            state.cluster_version_conflicts -= 1;
            return Err(conflict("ClusterVersion", CLUSTER_VERSION_NAME));
        }

        let stored = state
            .cluster_version
            .as_mut()
            .ok_or_else(|| not_found("ClusterVersion", CLUSTER_VERSION_NAME))?;
        if stored.metadata.resource_version != cluster_version.metadata.resource_version {
            return Err(conflict("ClusterVersion", CLUSTER_VERSION_NAME));
        }

        let mut updated = cluster_version.clone();
        updated.metadata.resource_version = bump(stored.metadata.resource_version.as_deref());
        *stored = updated.clone();

        Ok(updated)
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment, Error> {
        let mut state = self.state();
        state.record("get_deployment");

        if state.deployments_unavailable {
            return Err(Error::Request {
                source: kube::Error::Service(Box::new(std::io::Error::other(
                    "connection refused",
                ))),
                kind: "Deployment",
                name: format!("{namespace}/{name}"),
            });
        }

        state
            .deployments
            .get(&(namespace.to_owned(), name.to_owned()))
            .cloned()
            .ok_or_else(|| not_found("Deployment", &format!("{namespace}/{name}")))
    }

    async fn list_deployments(&self, namespace: &str) -> Result<Vec<Deployment>, Error> {
        let mut state = self.state();
        state.record("list_deployments");

        Ok(state
            .deployments
            .iter()
            .filter(|((deployment_namespace, _), _)| deployment_namespace == namespace)
            .map(|(_, deployment)| deployment.clone())
            .collect())
    }

    async fn replace_deployment(&self, deployment: &Deployment) -> Result<Deployment, Error> {
        let mut state = self.state();
        state.record("replace_deployment");

        let namespace = deployment.metadata.namespace.clone().unwrap_or_default();
        let name = deployment.metadata.name.clone().unwrap_or_default();
        let display_name = format!("{namespace}/{name}");

        if state.deployment_conflicts > 0 {
            state.deployment_conflicts -= 1;
            return Err(conflict("Deployment", &display_name));
        }

        let stored = state
            .deployments
            .get_mut(&(namespace, name))
            .ok_or_else(|| not_found("Deployment", &display_name))?;
        if stored.metadata.resource_version != deployment.metadata.resource_version {
            return Err(conflict("Deployment", &display_name));
        }

        let mut updated = deployment.clone();
        updated.metadata.resource_version = bump(stored.metadata.resource_version.as_deref());
        *stored = updated.clone();

        Ok(updated)
    }
}
