//! Command line arguments of the `operator-dev` plugin.
//!
//! ```no_run
//! use clap::Parser;
//! use operator_dev::cli::{Command, Opts};
//!
//! # fn main() -> Result<(), operator_dev::cli::Error> {
//! let opts = Opts::parse();
//!
//! match opts.command {
//!     Command::Override(arguments) => {
//!         let request = arguments.validate()?;
//!         let settings = arguments.reconcile.settings()?;
//!         // Connect and run the override
//!     }
//! }
//! # Ok(())
//! # }
//! ```
use std::{num::ParseIntError, path::PathBuf, time::Duration};

use clap::{Args, Parser, Subcommand};
use snafu::{ResultExt, Snafu, ensure};

use crate::{
    client::ConnectionSettings,
    command::{OverrideRequest, Settings},
    retry::Backoff,
    workload::WorkloadPatch,
};

const OVERRIDE_EXAMPLES: &str = "\
Examples:
  # Stop the cluster version operator from managing the kube-apiserver operator and run a custom
  # image instead. The name must be a cluster operator (oc get clusteroperators).
  oc operator-dev override kube-apiserver --image=docker.io/foo/apiserver:debug

  # Also run a custom operand and raise the operator's log verbosity
  oc operator-dev override kube-apiserver --image=docker.io/foo/operator:debug \\
      --operand-image=docker.io/foo/apiserver:debug --verbosity=4

  # Make the openshift-apiserver operator managed again
  oc operator-dev override openshift-apiserver --managed";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("clusteroperator/name must be specified"))]
    MissingComponent,

    #[snafu(display("--image cannot be used together with --managed"))]
    ImageWithManaged,

    #[snafu(display("one of --image, --operand-image or --verbosity must be specified"))]
    NothingToOverride,

    #[snafu(display("verbosity {verbosity:?} is not a non-negative number"))]
    InvalidVerbosity {
        source: ParseIntError,
        verbosity: String,
    },

    #[snafu(display("--retry-steps must be at least 1"))]
    InvalidRetrySteps,

    #[snafu(display("--retry-factor must be at least 1.0, got {factor}"))]
    InvalidRetryFactor { factor: f64 },

    #[snafu(display("--retry-jitter must not be negative, got {jitter}"))]
    InvalidRetryJitter { jitter: f64 },

    #[snafu(display("--{option} must not exceed {max}, got {delay}"))]
    DelayTooLong {
        option: &'static str,
        delay: humantime::Duration,
        max: humantime::Duration,
    },
}

/// Upper bound for every delay option.
const MAX_DELAY: Duration = Duration::from_secs(60 * 60);

fn ensure_delay(option: &'static str, delay: humantime::Duration) -> Result<Duration, Error> {
    ensure!(*delay <= MAX_DELAY, DelayTooLongSnafu {
        option,
        delay,
        max: MAX_DELAY
    });
    Ok(*delay)
}

#[derive(Debug, PartialEq, Parser)]
#[command(
    name = "operator-dev",
    author,
    version,
    about = "Develop OpenShift cluster operators in place"
)]
pub struct Opts {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, PartialEq, Subcommand)]
pub enum Command {
    /// Override the target operator image.
    #[command(after_help = OVERRIDE_EXAMPLES)]
    Override(OverrideArguments),
}

#[derive(Debug, PartialEq, Args)]
pub struct OverrideArguments {
    /// Name of the cluster operator to override.
    #[arg(value_name = "CLUSTEROPERATOR")]
    pub component: String,

    /// Image to use for the given operator.
    #[arg(long)]
    pub image: Option<String>,

    /// Image to use for the operand of the given operator, set via its `IMAGE` env var.
    #[arg(long)]
    pub operand_image: Option<String>,

    /// Log verbosity level appended as `-v=<level>` to the operator arguments.
    #[arg(long, value_name = "LEVEL")]
    pub verbosity: Option<String>,

    /// Let the cluster version operator manage this operator again.
    #[arg(long)]
    pub managed: bool,

    /// Name of the operator deployment, if it can't be derived from the operator name.
    #[arg(long)]
    pub deployment: Option<String>,

    // IMPORTANT: All (flattened) sub structs should be placed at the end to ensure the help
    // headings are correct.
    #[command(flatten)]
    pub connection: ConnectionOptions,

    #[command(flatten)]
    pub reconcile: ReconcileOptions,
}

#[derive(Debug, Default, PartialEq, Eq, Args)]
#[command(next_help_heading = "Connection Options")]
pub struct ConnectionOptions {
    /// Path to the kubeconfig file to use. Defaults to `KUBECONFIG` or `~/.kube/config`.
    #[arg(long, value_name = "FILE")]
    pub kubeconfig: Option<PathBuf>,

    /// The name of the kubeconfig context to use.
    #[arg(long)]
    pub context: Option<String>,

    /// The name of the kubeconfig cluster to use.
    #[arg(long)]
    pub cluster: Option<String>,

    /// The name of the kubeconfig user to use.
    #[arg(long)]
    pub user: Option<String>,

    /// Default namespace of the connection.
    #[arg(long, short = 'n')]
    pub namespace: Option<String>,
}

impl From<ConnectionOptions> for ConnectionSettings {
    fn from(options: ConnectionOptions) -> Self {
        Self {
            kubeconfig: options.kubeconfig,
            context: options.context,
            cluster: options.cluster,
            user: options.user,
            namespace: options.namespace,
        }
    }
}

#[derive(Debug, PartialEq, Args)]
#[command(next_help_heading = "Reconcile Options")]
pub struct ReconcileOptions {
    /// Time given to the cluster version operator to observe the override before the deployment
    /// is changed.
    #[arg(
        long,
        env = "OPERATOR_DEV_SETTLE_DELAY",
        default_value_t = humantime::Duration::from(Settings::default().settle_delay)
    )]
    pub settle_delay: humantime::Duration,

    /// Maximum number of attempts for a conflicting write.
    #[arg(long, default_value_t = Backoff::default().steps)]
    pub retry_steps: u32,

    /// Delay after the first conflicting write.
    #[arg(long, default_value_t = humantime::Duration::from(Backoff::default().initial_delay))]
    pub retry_initial_delay: humantime::Duration,

    /// Multiplier applied to the delay after every conflicting write.
    #[arg(long, default_value_t = Backoff::default().factor)]
    pub retry_factor: f64,

    /// Random fraction of the delay added to every delay.
    #[arg(long, default_value_t = Backoff::default().jitter)]
    pub retry_jitter: f64,

    /// Upper bound of a single delay.
    #[arg(long, default_value_t = humantime::Duration::from(Backoff::default().max_delay))]
    pub retry_max_delay: humantime::Duration,
}

impl ReconcileOptions {
    pub fn settings(&self) -> Result<Settings, Error> {
        ensure!(self.retry_steps >= 1, InvalidRetryStepsSnafu);
        ensure!(self.retry_factor >= 1.0, InvalidRetryFactorSnafu {
            factor: self.retry_factor
        });
        ensure!(self.retry_jitter >= 0.0, InvalidRetryJitterSnafu {
            jitter: self.retry_jitter
        });

        Ok(Settings {
            settle_delay: ensure_delay("settle-delay", self.settle_delay)?,
            backoff: Backoff {
                initial_delay: ensure_delay("retry-initial-delay", self.retry_initial_delay)?,
                factor: self.retry_factor,
                jitter: self.retry_jitter,
                steps: self.retry_steps,
                max_delay: ensure_delay("retry-max-delay", self.retry_max_delay)?,
            },
        })
    }
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value.filter(|value| !value.is_empty()).cloned()
}

impl OverrideArguments {
    /// Checks the arguments for contradictions and turns them into an [`OverrideRequest`].
    pub fn validate(&self) -> Result<OverrideRequest, Error> {
        ensure!(!self.component.trim().is_empty(), MissingComponentSnafu);

        let patch = WorkloadPatch {
            image: non_empty(self.image.as_ref()),
            verbosity: non_empty(self.verbosity.as_ref()),
            operand_image: non_empty(self.operand_image.as_ref()),
        };

        if self.managed {
            ensure!(patch.image.is_none(), ImageWithManagedSnafu);
            if !patch.is_empty() {
                tracing::warn!("--operand-image and --verbosity are ignored together with --managed");
            }
        } else {
            ensure!(!patch.is_empty(), NothingToOverrideSnafu);
        }

        if let Some(verbosity) = &patch.verbosity {
            verbosity
                .parse::<u32>()
                .context(InvalidVerbositySnafu { verbosity })?;
        }

        Ok(OverrideRequest {
            component: self.component.clone(),
            deployment: non_empty(self.deployment.as_ref()),
            managed: self.managed,
            patch: if self.managed {
                WorkloadPatch::default()
            } else {
                patch
            },
        })
    }
}
