//! Error taxonomy for deployment runs.
//!
//! Most functions in this crate return [`anyhow::Result`]. The variants below are the
//! failures a caller may want to react to; they are wrapped in `anyhow::Error` and can be
//! recovered with `downcast_ref::<DeployError>()`.

use thiserror::Error;

/// Typed deployment failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeployError {
    /// Two arguments that cannot be combined were both supplied.
    #[error("'{first}' and '{second}' are mutually exclusive")]
    ConflictingArguments {
        first: &'static str,
        second: &'static str,
    },

    /// An argument that another argument depends on was not supplied.
    #[error("'{missing}' is required when '{requires}' is supplied")]
    MissingArgument {
        missing: &'static str,
        requires: &'static str,
    },

    /// A field was supplied but its value is unusable.
    #[error("invalid value for '{field}': {reason}")]
    InvalidArgument { field: &'static str, reason: String },

    /// An upscale request asked for fewer resources than currently exist.
    #[error("the desired {what} ({desired}) is smaller than the current count ({current})")]
    ShrinkNotSupported {
        what: &'static str,
        desired: u16,
        current: u16,
    },

    /// Non-genesis roles were about to be provisioned without a bootstrap peer.
    #[error("could not resolve a bootstrap peer or network contacts URL for the deployment")]
    BootstrapPeerUnresolved,

    /// The genesis service is registered but reports no public listen address.
    #[error("the genesis service on {0} reports no public listen address")]
    GenesisListenAddressMissing(String),

    /// A private node VM has no NAT gateway with the same ordinal.
    #[error("no NAT gateway is paired with private node VM '{0}'")]
    NatGatewayMissing(String),

    /// No state is stored for the named deployment.
    #[error("the '{0}' environment does not exist")]
    EnvironmentNotFound(String),

    /// The remote node registry or status output could not be parsed.
    #[error("malformed node registry on {host}: {reason}")]
    MalformedRegistry { host: String, reason: String },

    /// A phase failed on more hosts than the configured tolerance allows.
    #[error(
        "{phase} failed on {failed} of {total} hosts, above the {max_percentage}% threshold: {}",
        failed_hosts.join(", ")
    )]
    FailureThresholdExceeded {
        phase: String,
        failed: usize,
        total: usize,
        max_percentage: u8,
        failed_hosts: Vec<String>,
    },

    /// An external tool exited with a non-zero status.
    #[error("command '{binary}' exited with code {exit_code:?}")]
    ExternalCommandFailed {
        binary: String,
        exit_code: Option<i32>,
    },
}

impl DeployError {
    /// Whether the error was raised before any remote call was made.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::ConflictingArguments { .. }
                | Self::MissingArgument { .. }
                | Self::InvalidArgument { .. }
                | Self::ShrinkNotSupported { .. }
                | Self::NatGatewayMissing(_)
        )
    }
}
