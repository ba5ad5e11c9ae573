use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Failed to get secret {namespace}/{name}, error: {source}"))]
    GetSecret { namespace: String, name: String, source: crate::cluster::Error },

    #[snafu(display("Failed to get config map {namespace}/{name}, error: {source}"))]
    GetConfigMap { namespace: String, name: String, source: crate::cluster::Error },

    #[snafu(display("Secret {namespace}/{name} does not exist"))]
    SourceSecretNotFound { namespace: String, name: String },

    #[snafu(display("Trusted CA config map {namespace}/{name} does not exist"))]
    TrustedCasNotFound { namespace: String, name: String },

    #[snafu(display("Failed to get namespace {namespace}, error: {source}"))]
    GetClusterNamespace { namespace: &'static str, source: crate::cluster::Error },

    #[snafu(display("Namespace {namespace} has no UID to identify the cluster by"))]
    ClusterUidMissing { namespace: &'static str },

    #[snafu(display("Failed to list DynaKubes, error: {source}"))]
    ListDynaKubes { source: crate::cluster::Error },

    #[snafu(display("Failed to render the init script, error: {source}"))]
    RenderInitScript { source: minijinja::Error },

    #[snafu(display("Failed to write secret {namespace}/{name}, error: {source}"))]
    WriteSecret { namespace: String, name: String, source: crate::cluster::Error },

    #[snafu(display("Failed to delete secret {namespace}/{name}, error: {source}"))]
    DeleteSecret { namespace: String, name: String, source: crate::cluster::Error },

    #[snafu(display(
        "Gave up writing secret {namespace}/{name} after {attempts} conflicting concurrent updates"
    ))]
    ConflictRetriesExhausted { namespace: String, name: String, attempts: usize },
}

impl Error {
    /// Whether the failure stems from missing source material rather than
    /// from the cluster.
    #[must_use]
    pub const fn is_source_missing(&self) -> bool {
        matches!(self, Self::SourceSecretNotFound { .. } | Self::TrustedCasNotFound { .. })
    }
}
