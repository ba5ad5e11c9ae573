use snafu::Snafu;

use crate::mapper::MapKind;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Failed to list namespaces, error: {source}"))]
    ListNamespaces { source: crate::cluster::Error },

    #[snafu(display("Failed to list DynaKubes, error: {source}"))]
    ListDynaKubes { source: crate::cluster::Error },

    #[snafu(display("Failed to read config map {name}, error: {source}"))]
    ReadConfigMap { name: &'static str, source: crate::cluster::Error },

    #[snafu(display("Failed to write config map {name}, error: {source}"))]
    WriteConfigMap { name: &'static str, source: crate::cluster::Error },

    #[snafu(display("Config map {name} disappeared after it was created"))]
    ConfigMapVanished { name: &'static str },

    #[snafu(display(
        "Gave up writing config map {name} after {attempts} conflicting concurrent updates"
    ))]
    ConflictRetriesExhausted { name: &'static str, attempts: usize },

    #[snafu(display(
        "Failed to evaluate the {kind} namespace selector of DynaKube {dynakube}, error: {source}"
    ))]
    EvaluateSelector { kind: MapKind, dynakube: String, source: crate::selector::Error },

    #[snafu(display(
        "Namespace {namespace} matches the {kind} selectors of more than one DynaKube: {}",
        dynakubes.join(", ")
    ))]
    AmbiguousNamespace { kind: MapKind, namespace: String, dynakubes: Vec<String> },

    #[snafu(display("{}", errors.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")))]
    Multiple { errors: Vec<Error> },
}

impl Error {
    /// Folds the errors of independent steps into one.
    pub(crate) fn combine(mut errors: Vec<Self>) -> Option<Self> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(Self::Multiple { errors }),
        }
    }

    #[must_use]
    pub fn is_ambiguous(&self) -> bool {
        match self {
            Self::AmbiguousNamespace { .. } => true,
            Self::Multiple { errors } => errors.iter().any(Self::is_ambiguous),
            _ => false,
        }
    }
}
