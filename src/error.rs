//! Error types for the testclusters harness

use thiserror::Error;

/// Main error type for cluster harness operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// A required pod condition does not hold yet.
    ///
    /// This is the distinguished retry kind for the readiness gate: the
    /// gate's classifier retries it, while every other error class is
    /// terminal there.
    #[error("pod {pod} does not meet required condition {expected}: observed {observed}")]
    ConditionPending {
        /// Namespaced pod reference rendering
        pod: String,
        /// The condition the caller asked for
        expected: String,
        /// What the live status showed instead
        observed: String,
    },

    /// The readiness gate exhausted its backoff schedule
    #[error("timed out waiting for pod {pod} to reach {expected}; last observed: {last_observed}")]
    PreconditionTimeout {
        /// Namespaced pod reference rendering
        pod: String,
        /// The condition the caller asked for
        expected: String,
        /// Last status observed before giving up
        last_observed: String,
    },

    /// Opening the exec upgrade stream failed
    #[error("failed to establish exec stream to pod {pod}: {source}")]
    StreamEstablishment {
        /// Namespaced pod reference rendering
        pod: String,
        /// Underlying transport error
        #[source]
        source: kube::Error,
    },

    /// Driving the exec stream failed, after any dial-reset retries
    #[error("error streaming command to pod {pod}; out: '{stdout}': errOut: '{stderr}': {message}")]
    StreamExecution {
        /// Namespaced pod reference rendering
        pod: String,
        /// Stdout buffered before the failure
        stdout: String,
        /// Stderr buffered before the failure
        stderr: String,
        /// What went wrong
        message: String,
    },

    /// A list/get call against the cluster failed
    #[error("query failed: {0}")]
    Query(String),

    /// A convergence check found the live state short of the expectation.
    ///
    /// Not a true failure: polling helpers treat this as "try again".
    #[error("{0}")]
    NotSatisfied(String),

    /// The provisioning tool reported a failure
    #[error("provisioning cluster {cluster} failed: {message}")]
    Provisioning {
        /// Cluster identity the operation targeted
        cluster: String,
        /// Tool output or cause
        message: String,
    },

    /// Applying declarative manifests failed
    #[error("manifest apply failed: {0}")]
    Apply(String),

    /// A caller-supplied name prefix is not a valid DNS label
    #[error("invalid name prefix: {0}")]
    InvalidName(String),
}

impl Error {
    /// Create a query error with the given message
    pub fn query(msg: impl Into<String>) -> Self {
        Self::Query(msg.into())
    }

    /// Create a not-satisfied convergence result with the given message
    pub fn not_satisfied(msg: impl Into<String>) -> Self {
        Self::NotSatisfied(msg.into())
    }

    /// Create a provisioning error for the given cluster
    pub fn provisioning(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Provisioning {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create a manifest apply error with the given message
    pub fn apply(msg: impl Into<String>) -> Self {
        Self::Apply(msg.into())
    }

    /// Create an invalid-name error with the given message
    pub fn invalid_name(msg: impl Into<String>) -> Self {
        Self::InvalidName(msg.into())
    }
}

/// Convenience alias used throughout the crate
pub type Result<T, E = Error> = std::result::Result<T, E>;
