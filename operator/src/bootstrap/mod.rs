//! Bootstrap material for injected pods.
//!
//! The init container of an injected pod reads the init secret of its
//! namespace: the rendered `init.sh`, the trusted CA bundle and the proxy.
//! The material is rendered from sources in the operator namespace and
//! replicated into every namespace a `DynaKube` injects into.

mod error;

use std::collections::BTreeMap;

use dynakube_base::consts::{
    CLUSTER_ID_NAMESPACE, CONTROLLER_NAME, labels, names, secret_keys,
};
use k8s_openapi::{
    ByteString, api::core::v1::Secret, apimachinery::pkg::apis::meta::v1::ObjectMeta,
};
use kube::{Resource, ResourceExt};
use minijinja::{Environment, UndefinedBehavior};
use serde::Serialize;
use snafu::{OptionExt, ResultExt};

pub use self::error::Error;
use crate::{cluster::ClusterApi, consts::MAX_CONFLICT_RETRIES, crd::DynaKube};

const INIT_SCRIPT_TEMPLATE: &str = include_str!("init.sh.j2");

const SECRET_TYPE_OPAQUE: &str = "Opaque";

/// Result of writing a secret.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WriteOutcome {
    Created,
    Updated,
    Unchanged,
}

/// Rendered content of an init secret, shared by all namespaces of one
/// `DynaKube`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InitSecretData(BTreeMap<String, ByteString>);

impl InitSecretData {
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.0.get(key).map(|ByteString(bytes)| bytes.as_slice())
    }
}

/// Values substituted into the init script.
#[derive(Debug, Default, Serialize)]
struct InitScript {
    api_url: String,
    skip_cert_check: bool,
    paas_token: String,
    proxy: String,
    cluster_id: String,
    tenant_uuid: String,
    has_host: bool,
    im_nodes: BTreeMap<String, String>,
}

impl InitScript {
    fn render(&self) -> Result<String, minijinja::Error> {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.add_filter("shell_quote", shell_quote);
        env.add_template(secret_keys::INIT_SCRIPT, INIT_SCRIPT_TEMPLATE)?;
        env.get_template(secret_keys::INIT_SCRIPT)?.render(self)
    }
}

/// Quotes a value for a POSIX shell.
fn shell_quote(value: &str) -> String { format!("'{}'", value.replace('\'', r"'\''")) }

pub struct Bootstrapper<'a, C> {
    cluster: &'a C,
}

impl<'a, C> Bootstrapper<'a, C>
where
    C: ClusterApi,
{
    pub const fn new(cluster: &'a C) -> Self { Self { cluster } }

    /// Copies secret `source_name` of the operator namespace to
    /// `target_namespace` as `target_name`.
    ///
    /// # Errors
    ///
    /// Fails with a source-missing error if the source does not exist.
    pub async fn replicate(
        &self,
        dynakube: &DynaKube,
        source_name: &str,
        target_name: &str,
        target_namespace: &str,
    ) -> Result<WriteOutcome, Error> {
        let source = self.get_source_secret(source_name).await?;
        let desired = Secret {
            metadata: managed_metadata(dynakube, target_name, target_namespace),
            data: source.data,
            type_: source.type_,
            ..Secret::default()
        };
        self.write_secret(desired).await
    }

    /// Renders the init secret content of `dynakube`.
    ///
    /// # Errors
    ///
    /// Fails when the tokens secret, the proxy secret or the trusted CA
    /// config map is missing, or when the cluster cannot be read.
    pub async fn prepare_init_secret(&self, dynakube: &DynaKube) -> Result<InitSecretData, Error> {
        let tokens = self.get_source_secret(&dynakube.tokens_secret_name()).await?;
        let paas_token = secret_value(&tokens, secret_keys::PAAS_TOKEN)
            .filter(|token| !token.is_empty())
            .or_else(|| secret_value(&tokens, secret_keys::API_TOKEN))
            .unwrap_or_default();

        let proxy = self.resolve_proxy(dynakube).await?;
        let trusted_cas = self.resolve_trusted_cas(dynakube).await?;
        let script = InitScript {
            api_url: dynakube.spec.api_url.clone(),
            skip_cert_check: dynakube.spec.skip_cert_check,
            paas_token,
            proxy: proxy.clone(),
            cluster_id: self.cluster_uid().await?,
            tenant_uuid: dynakube.tenant_uuid().unwrap_or_default().to_string(),
            has_host: dynakube.infra_monitoring_enabled(),
            im_nodes: self.infra_monitoring_nodes().await?,
        };
        let rendered = script.render().context(error::RenderInitScriptSnafu)?;

        let mut data = BTreeMap::from([(
            secret_keys::INIT_SCRIPT.to_string(),
            ByteString(rendered.into_bytes()),
        )]);
        if !trusted_cas.is_empty() {
            let _unused = data
                .insert(secret_keys::TRUSTED_CAS.to_string(), ByteString(trusted_cas.into_bytes()));
        }
        if !proxy.is_empty() {
            let _unused =
                data.insert(secret_keys::PROXY.to_string(), ByteString(proxy.into_bytes()));
        }
        Ok(InitSecretData(data))
    }

    /// Renders and writes the init secret of `dynakube` into `namespace`.
    ///
    /// # Errors
    ///
    /// See [`Self::prepare_init_secret`].
    pub async fn ensure_init_secret(
        &self,
        dynakube: &DynaKube,
        namespace: &str,
    ) -> Result<WriteOutcome, Error> {
        let data = self.prepare_init_secret(dynakube).await?;
        self.write_init_secret(dynakube, namespace, &data).await
    }

    /// Writes previously rendered init secret content into `namespace`.
    ///
    /// # Errors
    ///
    /// Fails when the cluster rejects the write.
    pub async fn write_init_secret(
        &self,
        dynakube: &DynaKube,
        namespace: &str,
        data: &InitSecretData,
    ) -> Result<WriteOutcome, Error> {
        let desired = Secret {
            metadata: managed_metadata(dynakube, names::INIT_SECRET, namespace),
            data: Some(data.0.clone()),
            type_: Some(SECRET_TYPE_OPAQUE.to_string()),
            ..Secret::default()
        };
        let outcome = self.write_secret(desired).await?;
        if outcome != WriteOutcome::Unchanged {
            tracing::info!(
                dynakube = %dynakube.name_any(),
                namespace,
                ?outcome,
                "Wrote init secret"
            );
        }
        Ok(outcome)
    }

    /// Removes the init secret and the replicated pull secret from
    /// `namespace`. Returns whether the init secret existed.
    ///
    /// # Errors
    ///
    /// Fails when the cluster rejects a deletion.
    pub async fn delete_init_secret(&self, namespace: &str) -> Result<bool, Error> {
        let mut deleted = false;
        for name in [names::INIT_SECRET, names::PULL_SECRET] {
            let existed = self.cluster.delete_secret(namespace, name).await.with_context(|_| {
                error::DeleteSecretSnafu {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                }
            })?;
            if existed {
                tracing::info!(namespace, secret = name, "Deleted replicated secret");
            }
            deleted |= existed && name == names::INIT_SECRET;
        }
        Ok(deleted)
    }

    /// Makes sure the material a pod in `namespace` needs is present,
    /// rendering the init secret only if it is absent.
    ///
    /// # Errors
    ///
    /// Fails with a source-missing error if a source does not exist.
    pub async fn ensure_bootstrap(
        &self,
        dynakube: &DynaKube,
        namespace: &str,
    ) -> Result<(), Error> {
        let existing = self.cluster.get_secret(namespace, names::INIT_SECRET).await.with_context(
            |_| error::GetSecretSnafu {
                namespace: namespace.to_string(),
                name: names::INIT_SECRET.to_string(),
            },
        )?;
        if existing.is_none() {
            let _outcome = self.ensure_init_secret(dynakube, namespace).await?;
        }

        if let Some(pull_secret) = dynakube.custom_pull_secret_name() {
            let _outcome =
                self.replicate(dynakube, pull_secret, names::PULL_SECRET, namespace).await?;
        }
        Ok(())
    }

    async fn get_source_secret(&self, name: &str) -> Result<Secret, Error> {
        let namespace = self.cluster.operator_namespace();
        self.cluster
            .get_secret(namespace, name)
            .await
            .with_context(|_| error::GetSecretSnafu {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })?
            .with_context(|| error::SourceSecretNotFoundSnafu {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
    }

    async fn resolve_proxy(&self, dynakube: &DynaKube) -> Result<String, Error> {
        let Some(proxy) = &dynakube.spec.proxy else {
            return Ok(String::new());
        };
        match proxy.value_from.as_deref().filter(|name| !name.is_empty()) {
            Some(secret_name) => {
                let secret = self.get_source_secret(secret_name).await?;
                Ok(secret_value(&secret, secret_keys::PROXY).unwrap_or_default())
            }
            None => Ok(proxy.value.clone().unwrap_or_default()),
        }
    }

    async fn resolve_trusted_cas(&self, dynakube: &DynaKube) -> Result<String, Error> {
        let Some(name) = dynakube.spec.trusted_cas.as_deref().filter(|name| !name.is_empty())
        else {
            return Ok(String::new());
        };
        let namespace = self.cluster.operator_namespace();
        let config_map = self
            .cluster
            .get_config_map(namespace, name)
            .await
            .with_context(|_| error::GetConfigMapSnafu {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })?
            .with_context(|| error::TrustedCasNotFoundSnafu {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })?;
        Ok(config_map
            .data
            .and_then(|mut data| data.remove(secret_keys::CERTIFICATES))
            .unwrap_or_default())
    }

    async fn cluster_uid(&self) -> Result<String, Error> {
        self.cluster
            .get_namespace(CLUSTER_ID_NAMESPACE)
            .await
            .context(error::GetClusterNamespaceSnafu { namespace: CLUSTER_ID_NAMESPACE })?
            .and_then(|namespace| namespace.metadata.uid)
            .context(error::ClusterUidMissingSnafu { namespace: CLUSTER_ID_NAMESPACE })
    }

    /// Maps node names to the tenant of the host agent running there, over
    /// all `DynaKube`s with infra monitoring and a known tenant.
    async fn infra_monitoring_nodes(&self) -> Result<BTreeMap<String, String>, Error> {
        let dynakubes = self.cluster.list_dynakubes().await.context(error::ListDynaKubesSnafu)?;
        let mut nodes = BTreeMap::new();
        for dynakube in dynakubes.iter().filter(|dynakube| dynakube.infra_monitoring_enabled()) {
            let (Some(tenant_uuid), Some(status)) = (dynakube.tenant_uuid(), &dynakube.status)
            else {
                continue;
            };
            for node in status.one_agent.instances.keys() {
                if !node.trim().is_empty() {
                    let _unused = nodes.insert(node.clone(), tenant_uuid.to_string());
                }
            }
        }
        Ok(nodes)
    }

    /// Creates or updates `desired`, comparing data byte-wise.
    async fn write_secret(&self, desired: Secret) -> Result<WriteOutcome, Error> {
        let namespace = desired.namespace().unwrap_or_default();
        let name = desired.name_any();
        let desired_data = desired.data.clone().unwrap_or_default();

        for attempt in 1..=MAX_CONFLICT_RETRIES {
            let current =
                self.cluster.get_secret(&namespace, &name).await.with_context(|_| {
                    error::GetSecretSnafu { namespace: namespace.clone(), name: name.clone() }
                })?;

            let result = match current {
                None => self.cluster.create_secret(&desired).await.map(|()| WriteOutcome::Created),
                Some(mut current) => {
                    if current.data.clone().unwrap_or_default() == desired_data
                        && current.type_ == desired.type_
                    {
                        return Ok(WriteOutcome::Unchanged);
                    }
                    current.data = Some(desired_data.clone());
                    current.type_.clone_from(&desired.type_);
                    current.labels_mut().extend(desired.labels().clone());
                    self.cluster.replace_secret(&current).await.map(|()| WriteOutcome::Updated)
                }
            };

            match result {
                Ok(outcome) => return Ok(outcome),
                Err(err) if err.is_conflict() || err.is_already_exists() => {
                    tracing::debug!(namespace, secret = name, attempt, "Retrying on conflict");
                }
                Err(source) => return Err(Error::WriteSecret { namespace, name, source }),
            }
        }
        error::ConflictRetriesExhaustedSnafu { namespace, name, attempts: MAX_CONFLICT_RETRIES }
            .fail()
    }
}

fn secret_value(secret: &Secret, key: &str) -> Option<String> {
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .map(|ByteString(bytes)| String::from_utf8_lossy(bytes).trim().to_string())
}

/// Metadata of a secret written on behalf of `dynakube`. The owner reference
/// is only set in the `DynaKube`'s own namespace.
fn managed_metadata(dynakube: &DynaKube, name: &str, namespace: &str) -> ObjectMeta {
    let owner_references = (dynakube.namespace().as_deref() == Some(namespace))
        .then(|| dynakube.controller_owner_ref(&()))
        .flatten()
        .map(|owner| vec![owner]);
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some(BTreeMap::from([
            (labels::MANAGED_BY.to_string(), CONTROLLER_NAME.to_string()),
            (labels::NAME.to_string(), dynakube.name_any()),
            (labels::VERSION.to_string(), dynakube_base::version_label_value()),
        ])),
        owner_references,
        ..ObjectMeta::default()
    }
}
