use snafu::Snafu;

use crate::mutator::Reason;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("DynaKube {dynakube} enables code modules but names no code modules image"))]
    NoCodeModulesImage { dynakube: String },

    #[snafu(display("Failed to get {kind} {name} owning a pod in {namespace}, error: {source}"))]
    GetOwner { namespace: String, kind: String, name: String, source: crate::cluster::Error },

    #[snafu(display("{kind} {name} owning a pod in {namespace} does not exist"))]
    OwnerNotFound { namespace: String, kind: String, name: String },

    #[snafu(display("Failed to read the cluster UID, error: {source}"))]
    GetClusterUid { source: crate::cluster::Error },

    #[snafu(display("Namespace {namespace} has no UID to identify the cluster by"))]
    ClusterUidMissing { namespace: &'static str },

    #[snafu(display("Failed to serialize {what} attributes, error: {source}"))]
    SerializeAttributes { what: String, source: serde_json::Error },

    #[snafu(display("Pod has no spec"))]
    MissingPodSpec,
}

impl Error {
    /// The reason recorded on the pod, for errors caused by configuration
    /// rather than by the cluster.
    #[must_use]
    pub const fn reason(&self) -> Option<Reason> {
        match self {
            Self::NoCodeModulesImage { .. } => Some(Reason::NoCodeModulesImage),
            Self::GetOwner { .. } | Self::OwnerNotFound { .. } => Some(Reason::OwnerLookupFailed),
            _ => None,
        }
    }
}
