//! Editing the component overrides of the `ClusterVersion` singleton.
//!
//! The cluster version operator leaves every object listed with `unmanaged: true` in
//! `spec.overrides` alone. The list is shared with the cluster version operator and whoever else
//! edits the object, so it is edited with a read-modify-write cycle conditioned on the resource
//! version, and entries this tool doesn't understand are carried over verbatim.
use kube::core::DynamicObject;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use snafu::{OptionExt, ResultExt, Snafu};

use crate::{
    client::{self, ClusterClient},
    retry::{self, Backoff, Conflict},
};

pub const DEPLOYMENT_GROUP: &str = "apps/v1";
pub const DEPLOYMENT_KIND: &str = "Deployment";

const SPEC_FIELD: &str = "spec";
const OVERRIDES_FIELD: &str = "overrides";
const UNMANAGED_FIELD: &str = "unmanaged";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to get the cluster version"))]
    GetClusterVersion { source: client::Error },

    #[snafu(display("failed to update the cluster version"))]
    ReplaceClusterVersion { source: client::Error },

    #[snafu(display("cluster version field {field:?} is not an object"))]
    MalformedClusterVersion { field: &'static str },

    #[snafu(display("cluster version spec.overrides is not a list"))]
    MalformedOverrides,

    #[snafu(display("failed to serialize override for {key}"))]
    SerializeOverride {
        source: serde_json::Error,
        key: OverrideKey,
    },
}

impl Conflict for Error {
    fn is_conflict(&self) -> bool {
        match self {
            Self::ReplaceClusterVersion { source } => source.is_conflict(),
            _ => false,
        }
    }
}

/// One entry of `spec.overrides`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentOverride {
    pub group: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub unmanaged: bool,
}

/// Identifies the object an override applies to. At most one override per key is maintained.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct OverrideKey {
    pub group: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl OverrideKey {
    pub fn deployment(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            group: DEPLOYMENT_GROUP.to_owned(),
            kind: DEPLOYMENT_KIND.to_owned(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    fn matches(&self, entry: &ComponentOverride) -> bool {
        self.group == entry.group
            && self.kind == entry.kind
            && self.namespace == entry.namespace
            && self.name == entry.name
    }

    fn to_override(&self, unmanaged: bool) -> ComponentOverride {
        ComponentOverride {
            group: self.group.clone(),
            kind: self.kind.clone(),
            namespace: self.namespace.clone(),
            name: self.name.clone(),
            unmanaged,
        }
    }
}

impl std::fmt::Display for OverrideKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{kind}.{group} {namespace}/{name}",
            kind = self.kind,
            group = self.group,
            namespace = self.namespace,
            name = self.name
        )
    }
}

/// What [`set_override`] did to the list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OverrideEdit {
    Inserted,
    Updated,
    Unchanged,
}

/// Returns `entries` with the override for `key` set to `unmanaged`.
///
/// Matching entries only get their `unmanaged` field rewritten, all other entries are kept in
/// place. Entries that don't have the shape of a [`ComponentOverride`] never match. If nothing
/// matches, a new entry is appended.
pub fn set_override(
    entries: &[Value],
    key: &OverrideKey,
    unmanaged: bool,
) -> Result<(Vec<Value>, OverrideEdit), Error> {
    let mut edit = None;

    let mut updated: Vec<Value> = entries
        .iter()
        .map(|value| {
            let Ok(entry) = ComponentOverride::deserialize(value) else {
                return value.clone();
            };
            if !key.matches(&entry) {
                return value.clone();
            }

            if entry.unmanaged == unmanaged {
                edit.get_or_insert(OverrideEdit::Unchanged);
                return value.clone();
            }

            edit = Some(OverrideEdit::Updated);
            let mut value = value.clone();
            if let Some(object) = value.as_object_mut() {
                object.insert(UNMANAGED_FIELD.to_owned(), Value::Bool(unmanaged));
            }
            value
        })
        .collect();

    if let Some(edit) = edit {
        return Ok((updated, edit));
    }

    let entry = serde_json::to_value(key.to_override(unmanaged))
        .context(SerializeOverrideSnafu { key: key.clone() })?;
    updated.push(entry);

    Ok((updated, OverrideEdit::Inserted))
}

/// Applies [`set_override`] to `spec.overrides` of a cluster version object.
///
/// A missing list is treated as empty. A list field of any other type is rejected rather than
/// overwritten.
pub fn apply_override(
    cluster_version: &mut DynamicObject,
    key: &OverrideKey,
    unmanaged: bool,
) -> Result<OverrideEdit, Error> {
    if cluster_version.data.is_null() {
        cluster_version.data = Value::Object(Map::new());
    }

    let spec = cluster_version
        .data
        .as_object_mut()
        .context(MalformedClusterVersionSnafu { field: "." })?
        .entry(SPEC_FIELD)
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()
        .context(MalformedClusterVersionSnafu { field: SPEC_FIELD })?;

    let current = match spec.get(OVERRIDES_FIELD) {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(entries)) => entries.clone(),
        Some(_) => return MalformedOverridesSnafu.fail(),
    };

    let (updated, edit) = set_override(&current, key, unmanaged)?;
    spec.insert(OVERRIDES_FIELD.to_owned(), Value::Array(updated));

    Ok(edit)
}

/// Sets the override for `key` on the cluster, retrying on conflicting writes.
///
/// Every attempt starts from a freshly fetched cluster version. The object is written back even
/// if the flag already had the requested value.
pub async fn commit_override<C>(
    client: &C,
    key: &OverrideKey,
    unmanaged: bool,
    backoff: &Backoff,
) -> Result<OverrideEdit, Error>
where
    C: ClusterClient + ?Sized,
{
    retry::on_conflict(backoff, move || async move {
        let mut cluster_version = client
            .get_cluster_version()
            .await
            .context(GetClusterVersionSnafu)?;

        let edit = apply_override(&mut cluster_version, key, unmanaged)?;
        tracing::debug!(
            %key,
            unmanaged,
            ?edit,
            resource_version = ?cluster_version.metadata.resource_version,
            "updating cluster version overrides"
        );

        client
            .replace_cluster_version(&cluster_version)
            .await
            .context(ReplaceClusterVersionSnafu)?;

        Ok::<_, Error>(edit)
    })
    .await
}
