use dynakube_base::consts::labels;
use k8s_openapi::{
    api::admissionregistration::v1::{
        MutatingWebhook, MutatingWebhookConfiguration, RuleWithOperations, ServiceReference,
        WebhookClientConfig,
    },
    apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement, ObjectMeta},
};

use crate::{config::WebhookConfig, webhook::INJECT_PATH};

const WEBHOOK_NAME: &str = "webhook.pod.dynatrace.com";
const SERVICE_PORT: i32 = 443;

/// The `MutatingWebhookConfiguration` routing pod creation to the webhook.
///
/// The CA bundle is left to be injected by whatever issues the serving
/// certificate.
#[must_use]
pub fn webhook_configuration(
    config: &WebhookConfig,
    operator_namespace: &str,
) -> MutatingWebhookConfiguration {
    MutatingWebhookConfiguration {
        metadata: ObjectMeta {
            name: Some(config.configuration_name.clone()),
            labels: Some(
                [(labels::NAME.to_string(), config.configuration_name.clone())]
                    .into_iter()
                    .collect(),
            ),
            ..ObjectMeta::default()
        },
        webhooks: Some(vec![MutatingWebhook {
            name: WEBHOOK_NAME.to_string(),
            admission_review_versions: vec!["v1".to_string()],
            client_config: WebhookClientConfig {
                service: Some(ServiceReference {
                    name: config.service_name.clone(),
                    namespace: operator_namespace.to_string(),
                    path: Some(INJECT_PATH.to_string()),
                    port: Some(SERVICE_PORT),
                }),
                ..WebhookClientConfig::default()
            },
            rules: Some(vec![RuleWithOperations {
                api_groups: Some(vec![String::new()]),
                api_versions: Some(vec!["v1".to_string()]),
                operations: Some(vec!["CREATE".to_string()]),
                resources: Some(vec!["pods".to_string()]),
                scope: Some("Namespaced".to_string()),
            }]),
            namespace_selector: Some(LabelSelector {
                match_expressions: Some(vec![LabelSelectorRequirement {
                    key: labels::INSTANCE.to_string(),
                    operator: "Exists".to_string(),
                    values: None,
                }]),
                ..LabelSelector::default()
            }),
            reinvocation_policy: Some("IfNeeded".to_string()),
            failure_policy: Some("Ignore".to_string()),
            side_effects: "None".to_string(),
            timeout_seconds: i32::try_from(config.request_timeout_secs).ok(),
            ..MutatingWebhook::default()
        }]),
    }
}
