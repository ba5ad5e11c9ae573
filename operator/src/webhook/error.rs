use std::{net::SocketAddr, path::PathBuf};

use snafu::Snafu;

use crate::mutator::Mutator;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Failed to decode admission review, error: {source}"))]
    DecodeReview { source: serde_json::Error },

    #[snafu(display("Admission review carries no request"))]
    MissingRequest,

    #[snafu(display("Admission request carries no object"))]
    MissingObject,

    #[snafu(display("Failed to decode pod, error: {source}"))]
    DecodePod { source: serde_json::Error },

    #[snafu(display("Failed to serialize pod, error: {source}"))]
    SerializePod { source: serde_json::Error },

    #[snafu(display("Failed to look up the mapping of namespace {namespace}, error: {source}"))]
    LookupMapping { namespace: String, source: crate::mapper::Error },

    #[snafu(display("Failed to get namespace {namespace}, error: {source}"))]
    GetNamespace { namespace: String, source: crate::cluster::Error },

    #[snafu(display("Failed to get DynaKube {dynakube}, error: {source}"))]
    GetDynaKube { dynakube: String, source: crate::cluster::Error },

    #[snafu(display("Failed to bootstrap namespace {namespace}, error: {source}"))]
    Bootstrap { namespace: String, source: crate::bootstrap::Error },

    #[snafu(display("Mutator {mutator} failed, error: {source}"))]
    Mutate { mutator: Mutator, source: crate::mutator::Error },

    #[snafu(display("Failed to finish the init container, error: {source}"))]
    FinishInitContainer { source: crate::mutator::Error },

    #[snafu(display(
        "Failed to load TLS certificate {} and key {}, error: {source}",
        cert.display(),
        key.display()
    ))]
    LoadCertificate { cert: PathBuf, key: PathBuf, source: std::io::Error },

    #[snafu(display("Failed to serve webhook on {listen_address}, error: {source}"))]
    Serve { listen_address: SocketAddr, source: std::io::Error },
}
