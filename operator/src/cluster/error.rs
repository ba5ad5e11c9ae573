use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Failed to get {kind} {key}, error: {source}"))]
    GetResource {
        kind: &'static str,
        key: String,
        #[snafu(source(from(kube::Error, Box::new)))]
        source: Box<kube::Error>,
    },

    #[snafu(display("Failed to list {kind}, error: {source}"))]
    ListResources {
        kind: &'static str,
        #[snafu(source(from(kube::Error, Box::new)))]
        source: Box<kube::Error>,
    },

    #[snafu(display("Failed to create {kind} {key}, error: {source}"))]
    CreateResource {
        kind: &'static str,
        key: String,
        #[snafu(source(from(kube::Error, Box::new)))]
        source: Box<kube::Error>,
    },

    #[snafu(display("Failed to replace {kind} {key}, error: {source}"))]
    ReplaceResource {
        kind: &'static str,
        key: String,
        #[snafu(source(from(kube::Error, Box::new)))]
        source: Box<kube::Error>,
    },

    #[snafu(display("Failed to patch {kind} {key}, error: {source}"))]
    PatchResource {
        kind: &'static str,
        key: String,
        #[snafu(source(from(kube::Error, Box::new)))]
        source: Box<kube::Error>,
    },

    #[snafu(display("Failed to delete {kind} {key}, error: {source}"))]
    DeleteResource {
        kind: &'static str,
        key: String,
        #[snafu(source(from(kube::Error, Box::new)))]
        source: Box<kube::Error>,
    },

    #[snafu(display("{kind} {key} already exists"))]
    AlreadyExists { kind: &'static str, key: String },

    #[snafu(display("{kind} {key} was modified concurrently"))]
    Conflict { kind: &'static str, key: String },

    #[snafu(display("Failed to serialize {kind} {key}, error: {source}"))]
    SerializeResource { kind: &'static str, key: String, source: serde_json::Error },
}

impl Error {
    #[must_use]
    pub const fn is_conflict(&self) -> bool { matches!(self, Self::Conflict { .. }) }

    #[must_use]
    pub const fn is_already_exists(&self) -> bool { matches!(self, Self::AlreadyExists { .. }) }
}
