use std::fmt;

use serde::Serialize;

/// A container image URI split into its parts.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct ImageReference {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub registry: String,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub repository: String,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub tag: String,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub digest: String,
}

impl ImageReference {
    /// Splits `uri` into registry, repository, tag and digest.
    ///
    /// The part before the first `/` is the registry only if it looks like a
    /// host (contains `.` or `:`, or is `localhost`); otherwise the whole
    /// URI is the repository of the default registry, left empty here.
    #[must_use]
    pub fn parse(uri: &str) -> Self {
        let (registry, rest) = match uri.split_once('/') {
            Some((host, rest)) if is_registry_host(host) => (host, rest),
            _ => ("", uri),
        };
        let (rest, digest) = rest.rsplit_once('@').unwrap_or((rest, ""));
        let (repository, tag) = rest.rsplit_once(':').unwrap_or((rest, ""));

        Self {
            registry: registry.to_string(),
            repository: repository.to_string(),
            tag: tag.to_string(),
            digest: digest.to_string(),
        }
    }
}

fn is_registry_host(host: &str) -> bool {
    host.contains('.') || host.contains(':') || host == "localhost"
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self { registry, repository, tag, digest } = self;
        if !registry.is_empty() {
            write!(f, "{registry}/")?;
        }
        f.write_str(repository)?;
        if !tag.is_empty() {
            write!(f, ":{tag}")?;
        }
        if !digest.is_empty() {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}
