//! The `DynaKube` custom resource.
//!
//! A `DynaKube` declares the desired monitoring configuration of one tenant.
//! Only the parts read by the injection pipeline are modelled; the status
//! fields are published by sibling reconcilers.

mod condition;

use std::collections::BTreeMap;

use dynakube_base::consts::{annotations, feature_flags};
use k8s_openapi::{
    api::core::v1::ResourceRequirements, apimachinery::pkg::apis::meta::v1::LabelSelector,
};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub use self::condition::{
    Condition, ConditionStatus, ConditionType, TokenReason, upsert_condition,
};

#[derive(CustomResource, Clone, Debug, Default, Deserialize, PartialEq, Serialize, JsonSchema)]
#[kube(
    group = "dynatrace.com",
    version = "v1beta1",
    kind = "DynaKube",
    plural = "dynakubes",
    shortname = "dk",
    namespaced,
    status = "DynaKubeStatus",
    printcolumn = r#"{"name":"ApiUrl", "type":"string", "jsonPath":".spec.apiUrl"}"#,
    printcolumn = r#"{"name":"Tokens", "type":"string", "jsonPath":".spec.tokens"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DynaKubeSpec {
    /// Tenant endpoint, e.g. `https://tenant.example.com/api`.
    pub api_url: String,

    /// Name of the secret holding `apiToken`, `paasToken` and
    /// `dataIngestToken`. Defaults to the name of the `DynaKube`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxySpec>,

    /// Name of a `ConfigMap` whose `certs` key holds a PEM bundle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trusted_cas: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_zone: Option<String>,

    /// Pull secret for the tenant registry, replaced by the published
    /// `<name>-pull-secret` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_pull_secret: Option<String>,

    #[serde(default)]
    pub skip_cert_check: bool,

    #[serde(default)]
    pub infra_monitoring: InfraMonitoringSpec,

    #[serde(default)]
    pub code_modules: CodeModulesSpec,

    #[serde(default)]
    pub metadata_enrichment: MetadataEnrichmentSpec,
}

/// HTTP proxy, either literal or read from key `proxy` of a secret.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProxySpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_from: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InfraMonitoringSpec {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CodeModulesSpec {
    #[serde(default)]
    pub enabled: bool,

    /// Namespaces to inject into. Unset selects nothing, an empty selector
    /// selects every namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_selector: Option<LabelSelector>,

    /// Image the init container copies the code module from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_resources: Option<ResourceRequirements>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MetadataEnrichmentSpec {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_selector: Option<LabelSelector>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DynaKubeStatus {
    #[serde(default)]
    pub connection_info: ConnectionInfoStatus,

    #[serde(default)]
    pub one_agent: OneAgentStatus,

    /// Monitored-entity id of the cluster, assigned by the tenant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes_cluster_meid: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes_cluster_name: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfoStatus {
    #[serde(default, rename = "tenantUUID", skip_serializing_if = "Option::is_none")]
    pub tenant_uuid: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoints: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OneAgentStatus {
    /// Host agent instances keyed by node name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub instances: BTreeMap<String, OneAgentInstance>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OneAgentInstance {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
}

impl DynaKube {
    #[must_use]
    pub fn tokens_secret_name(&self) -> String {
        non_empty(self.spec.tokens.as_deref()).map_or_else(|| self.name_any(), str::to_string)
    }

    /// Name of the pull secret to replicate, only when a custom one is set.
    #[must_use]
    pub fn custom_pull_secret_name(&self) -> Option<&str> {
        non_empty(self.spec.custom_pull_secret.as_deref())
    }

    #[inline]
    #[must_use]
    pub const fn code_modules_enabled(&self) -> bool { self.spec.code_modules.enabled }

    #[inline]
    #[must_use]
    pub const fn metadata_enrichment_enabled(&self) -> bool {
        self.spec.metadata_enrichment.enabled
    }

    #[inline]
    #[must_use]
    pub const fn infra_monitoring_enabled(&self) -> bool { self.spec.infra_monitoring.enabled }

    #[must_use]
    pub fn code_modules_image(&self) -> Option<&str> {
        non_empty(self.spec.code_modules.image.as_deref())
    }

    #[must_use]
    pub fn tenant_uuid(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|status| non_empty(status.connection_info.tenant_uuid.as_deref()))
    }

    #[must_use]
    pub fn cluster_meid(&self) -> Option<&str> {
        self.status.as_ref().and_then(|status| non_empty(status.kubernetes_cluster_meid.as_deref()))
    }

    #[must_use]
    pub fn cluster_name(&self) -> Option<&str> {
        self.status.as_ref().and_then(|status| non_empty(status.kubernetes_cluster_name.as_deref()))
    }

    #[must_use]
    pub fn network_zone(&self) -> Option<&str> { non_empty(self.spec.network_zone.as_deref()) }

    #[must_use]
    pub fn has_proxy(&self) -> bool {
        self.spec.proxy.as_ref().is_some_and(|proxy| {
            non_empty(proxy.value.as_deref()).is_some()
                || non_empty(proxy.value_from.as_deref()).is_some()
        })
    }

    #[must_use]
    pub fn conditions(&self) -> &[Condition] {
        self.status.as_ref().map_or(&[], |status| status.conditions.as_slice())
    }

    /// Value of the `injection-failure-policy` feature flag.
    #[must_use]
    pub fn feature_failure_policy(&self) -> Option<&str> {
        self.annotations().get(feature_flags::INJECTION_FAILURE_POLICY).map(String::as_str)
    }

    #[must_use]
    pub fn feature_init_container_seccomp(&self) -> bool {
        self.annotations()
            .get(feature_flags::INIT_CONTAINER_SECCOMP)
            .is_some_and(|value| value.eq_ignore_ascii_case("true"))
    }

    /// Whether the `DynaKube` excludes the container from injection for
    /// every pod.
    #[must_use]
    pub fn excludes_container(&self, container_name: &str) -> bool {
        is_container_excluded(self.annotations(), container_name)
    }
}

/// Checks the `container.inject.dynatrace.com/<name>=false` annotation.
pub fn is_container_excluded(
    annotations: &BTreeMap<String, String>,
    container_name: &str,
) -> bool {
    annotations
        .get(&format!("{}{container_name}", annotations::CONTAINER_INJECT_PREFIX))
        .is_some_and(|value| value.eq_ignore_ascii_case("false"))
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}
