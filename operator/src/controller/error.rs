use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Failed to update the namespace maps of DynaKube {dynakube}, error: {source}"))]
    MapDynaKube { dynakube: String, source: crate::mapper::Error },

    #[snafu(display("Failed to update namespace maps for namespace {namespace}, error: {source}"))]
    MapNamespace { namespace: String, source: crate::mapper::Error },

    #[snafu(display("Failed to read the namespace maps of namespace {namespace}, error: {source}"))]
    LookupMapping { namespace: String, source: crate::mapper::Error },

    #[snafu(display("Failed to prepare the init secret of DynaKube {dynakube}, error: {source}"))]
    PrepareInitSecret { dynakube: String, source: crate::bootstrap::Error },

    #[snafu(display("Failed to write the init secret into namespace {namespace}, error: {source}"))]
    WriteInitSecret { namespace: String, source: crate::bootstrap::Error },

    #[snafu(display("Failed to remove init secret from namespace {namespace}, error: {source}"))]
    DeleteInitSecret { namespace: String, source: crate::bootstrap::Error },

    #[snafu(display("Failed to get namespace {namespace}, error: {source}"))]
    GetNamespace { namespace: String, source: crate::cluster::Error },

    #[snafu(display("Failed to label namespace {namespace}, error: {source}"))]
    LabelNamespace { namespace: String, source: crate::cluster::Error },

    #[snafu(display("Failed to get DynaKube {dynakube}, error: {source}"))]
    GetDynaKube { dynakube: String, source: crate::cluster::Error },

    #[snafu(display("Failed to read the tokens secret {secret}, error: {source}"))]
    GetTokens { secret: String, source: crate::cluster::Error },

    #[snafu(display("Failed to update the conditions of DynaKube {dynakube}, error: {source}"))]
    UpdateConditions { dynakube: String, source: crate::cluster::Error },

    #[snafu(display("Failed to update the finalizers of DynaKube {dynakube}, error: {source}"))]
    UpdateFinalizer { dynakube: String, source: crate::cluster::Error },

    #[snafu(display("{}", errors.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")))]
    Multiple { errors: Vec<Error> },
}

impl Error {
    /// Folds the errors of independent steps into one.
    pub(crate) fn combine(mut errors: Vec<Self>) -> Result<(), Self> {
        match errors.len() {
            0 => Ok(()),
            1 => errors.pop().map_or(Ok(()), Err),
            _ => Err(Self::Multiple { errors }),
        }
    }
}
