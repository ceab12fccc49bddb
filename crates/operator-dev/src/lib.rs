//! Development helper for OpenShift cluster operators.
//!
//! The cluster version operator keeps every cluster operator's deployment at the version shipped
//! with the release. To run a custom build in place, the operator has to be marked unmanaged in
//! the `ClusterVersion` overrides first, then its deployment can be pointed at another image.
//! Marking it managed again hands it back and the cluster version operator restores the release
//! deployment.
//!
//! The entry point is [`command::run`], driven by the `kubectl-operator_dev` binary.
pub mod cli;
pub mod client;
pub mod command;
pub mod logging;
pub mod names;
pub mod overrides;
pub mod retry;
pub mod workload;

#[cfg(test)]
mod test_support;
