//! Admission of pods at `/inject`.
//!
//! The handler never rejects a pod. Anything that goes wrong ends in an
//! allowed response without patch, with the cause in `status.message`.

use std::{panic::AssertUnwindSafe, time::Duration};

use dynakube_base::consts::{annotations, crd};
use futures::FutureExt;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    Resource, ResourceExt,
    core::{
        DynamicObject,
        admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation},
    },
};
use snafu::{OptionExt, ResultExt};

use crate::{
    bootstrap::Bootstrapper,
    cluster::ClusterApi,
    crd::DynaKube,
    events::InjectionEvent,
    mapper::NamespaceMapper,
    mutator::{MutationRequest, Mutator, Reason, has_eligible_container, is_pod_injected},
    webhook::{Error, error},
};

const POD_KIND: &str = "Pod";

/// What a request did to the pod.
#[derive(Debug)]
enum Outcome {
    Unchanged(String),
    Mutated { original: Box<Pod>, mutated: Box<Pod> },
}

impl Outcome {
    fn unchanged(message: impl Into<String>) -> Self { Self::Unchanged(message.into()) }

    /// The pod let through untouched apart from the `injected=false` marker.
    fn not_injected(original: Pod, reason: Reason) -> Self {
        let mut mutated = original.clone();
        let pod_annotations = mutated.annotations_mut();
        let _unused =
            pod_annotations.insert(annotations::INJECTED.to_string(), "false".to_string());
        let _unused = pod_annotations.insert(annotations::REASON.to_string(), reason.to_string());
        Self::Mutated { original: Box::new(original), mutated: Box::new(mutated) }
    }
}

pub struct InjectionHandler<C> {
    cluster: C,
    request_timeout: Duration,
    incompatible_crd: bool,
}

impl<C> InjectionHandler<C>
where
    C: ClusterApi,
{
    /// Creates the handler, checking once whether the legacy custom resource
    /// definition is installed.
    pub async fn new(cluster: C, request_timeout: Duration) -> Self {
        let incompatible_crd =
            match cluster.custom_resource_definition_exists(crd::INCOMPATIBLE_CRD_NAME).await {
                Ok(exists) => exists,
                Err(err) => {
                    tracing::warn!(
                        "Failed to check for custom resource definition {}, error: {err}",
                        crd::INCOMPATIBLE_CRD_NAME
                    );
                    false
                }
            };
        if incompatible_crd {
            tracing::warn!(
                "Custom resource definition {} is installed, pods will not be injected",
                crd::INCOMPATIBLE_CRD_NAME
            );
        }
        Self { cluster, request_timeout, incompatible_crd }
    }

    #[cfg(test)]
    pub const fn cluster(&self) -> &C { &self.cluster }

    /// Answers a raw `AdmissionReview`.
    pub async fn review(&self, body: &[u8]) -> AdmissionReview<DynamicObject> {
        match decode_request(body) {
            Ok(request) => self.admit(&request).await.into_review(),
            Err(err) => {
                tracing::warn!("{err}");
                let mut response = AdmissionResponse::invalid(err.to_string());
                response.allowed = true;
                response.into_review()
            }
        }
    }

    /// Answers one admission request within the request deadline.
    pub async fn admit(&self, request: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
        let processing = AssertUnwindSafe(self.process(request)).catch_unwind();
        let outcome = match tokio::time::timeout(self.request_timeout, processing).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_panic)) => {
                tracing::error!(uid = request.uid, "Panicked while mutating pod");
                return with_message(request, "Internal error while mutating pod");
            }
            Err(_elapsed) => {
                tracing::warn!(
                    uid = request.uid,
                    "Mutating pod took longer than {}s",
                    self.request_timeout.as_secs()
                );
                return with_message(request, "Timed out while mutating pod");
            }
        };

        match outcome {
            Ok(Outcome::Unchanged(message)) => {
                tracing::debug!(uid = request.uid, "{message}");
                with_message(request, message)
            }
            Ok(Outcome::Mutated { original, mutated }) => {
                patch_response(request, &original, &mutated)
            }
            Err(err) => {
                tracing::warn!(uid = request.uid, "Failed to mutate pod, error: {err}");
                with_message(request, err.to_string())
            }
        }
    }

    async fn process(&self, request: &AdmissionRequest<DynamicObject>) -> Result<Outcome, Error> {
        if !matches!(request.operation, Operation::Create) || request.kind.kind != POD_KIND {
            return Ok(Outcome::unchanged("Only pod creation is mutated"));
        }
        let object = request.object.as_ref().context(error::MissingObjectSnafu)?;
        let original = serde_json::to_value(object)
            .and_then(serde_json::from_value::<Pod>)
            .context(error::DecodePodSnafu)?;
        let namespace_name = request
            .namespace
            .clone()
            .or_else(|| original.namespace())
            .unwrap_or_default();
        let pod_name = pod_display_name(&original);

        let mapping = NamespaceMapper::new(&self.cluster)
            .lookup(&namespace_name)
            .await
            .with_context(|_| error::LookupMappingSnafu { namespace: namespace_name.clone() })?;
        let Some(instance) = mapping.instance() else {
            return Ok(Outcome::unchanged(format!(
                "Namespace {namespace_name} is not mapped to a DynaKube"
            )));
        };
        let Some(namespace) = self
            .cluster
            .get_namespace(&namespace_name)
            .await
            .with_context(|_| error::GetNamespaceSnafu { namespace: namespace_name.clone() })?
        else {
            return Ok(Outcome::unchanged(format!("Namespace {namespace_name} does not exist")));
        };

        let Some(dynakube) = self
            .cluster
            .get_dynakube(instance)
            .await
            .with_context(|_| error::GetDynaKubeSnafu { dynakube: instance.to_string() })?
        else {
            self.cluster
                .publish_event(
                    &namespace.object_ref(&()),
                    &InjectionEvent::missing_dynakube(&namespace_name, instance),
                )
                .await;
            return Ok(Outcome::unchanged(format!(
                "DynaKube {instance} mapped to namespace {namespace_name} does not exist"
            )));
        };
        if self.incompatible_crd {
            self.cluster
                .publish_event(
                    &dynakube.object_ref(&()),
                    &InjectionEvent::incompatible_crd(crd::INCOMPATIBLE_CRD_NAME),
                )
                .await;
            return Ok(Outcome::unchanged(format!(
                "Custom resource definition {} is installed",
                crd::INCOMPATIBLE_CRD_NAME
            )));
        }
        if let Some(message) = skip_reason(&original, &dynakube) {
            return Ok(Outcome::unchanged(message));
        }

        let mut mutation = MutationRequest::new(original.clone(), &namespace, &dynakube, &mapping);
        let mutators: Vec<_> =
            Mutator::ALL.into_iter().filter(|mutator| mutator.is_enabled(&mutation)).collect();
        let reinvocation = is_pod_injected(&original);
        if mutators.is_empty() {
            if reinvocation {
                return Ok(Outcome::unchanged("No mutator is enabled for the pod"));
            }
            return Ok(Outcome::not_injected(original, Reason::NoMutationNeeded));
        }

        if mutators.contains(&Mutator::CodeModules) {
            let bootstrapper = Bootstrapper::new(&self.cluster);
            match bootstrapper.ensure_bootstrap(&dynakube, &namespace_name).await {
                Ok(()) => {}
                Err(err) if err.is_source_missing() && !reinvocation => {
                    tracing::warn!(
                        pod = pod_name,
                        namespace = namespace_name,
                        "Not injecting pod, error: {err}"
                    );
                    return Ok(Outcome::not_injected(original, Reason::NoBootstrapperConfig));
                }
                Err(err) if err.is_source_missing() => {
                    tracing::warn!(
                        pod = pod_name,
                        namespace = namespace_name,
                        "Failed to refresh bootstrap material, error: {err}"
                    );
                }
                Err(err) => {
                    return Err(err)
                        .context(error::BootstrapSnafu { namespace: namespace_name.clone() });
                }
            }
        }

        let mut changed = !reinvocation;
        for mutator in mutators {
            let result = if reinvocation && mutator.is_injected(&mutation) {
                mutator.reinvoke(&self.cluster, &mut mutation).await
            } else {
                mutator.mutate(&self.cluster, &mut mutation).await.map(|()| true)
            };
            match result {
                Ok(mutated) => changed |= mutated,
                Err(err) => match err.reason() {
                    Some(_reason) if reinvocation => {
                        tracing::warn!(
                            pod = pod_name,
                            namespace = namespace_name,
                            "Not updating injected pod, {mutator} failed: {err}"
                        );
                        return Ok(Outcome::unchanged(format!(
                            "Pod is already injected, {mutator} failed: {err}"
                        )));
                    }
                    Some(reason) => {
                        tracing::warn!(
                            pod = pod_name,
                            namespace = namespace_name,
                            "Not injecting pod, {mutator} failed: {err}"
                        );
                        return Ok(Outcome::not_injected(original, reason));
                    }
                    None => return Err(err).context(error::MutateSnafu { mutator }),
                },
            }
        }
        if !changed {
            return Ok(Outcome::unchanged("Pod is already injected"));
        }

        let mut mutated = mutation.finish().context(error::FinishInitContainerSnafu)?;
        let pod_annotations = mutated.annotations_mut();
        let _unused = pod_annotations.insert(annotations::INJECTED.to_string(), "true".to_string());
        let _unused = pod_annotations.remove(annotations::REASON);

        let event = if reinvocation {
            tracing::info!(pod = pod_name, namespace = namespace_name, "Updated injected pod");
            InjectionEvent::pod_updated(&namespace_name, &pod_name)
        } else {
            tracing::info!(pod = pod_name, namespace = namespace_name, "Injected pod");
            InjectionEvent::injected(&namespace_name, &pod_name)
        };
        self.cluster.publish_event(&dynakube.object_ref(&()), &event).await;

        Ok(Outcome::Mutated { original: Box::new(original), mutated: Box::new(mutated) })
    }
}

fn decode_request(body: &[u8]) -> Result<AdmissionRequest<DynamicObject>, Error> {
    let review: AdmissionReview<DynamicObject> =
        serde_json::from_slice(body).context(error::DecodeReviewSnafu)?;
    let request: Option<AdmissionRequest<DynamicObject>> = review.try_into().ok();
    request.context(error::MissingRequestSnafu)
}

/// Why a mapped pod is left alone, if it is.
fn skip_reason(pod: &Pod, dynakube: &DynaKube) -> Option<String> {
    let pod_annotations = pod.annotations();
    if pod_annotations
        .get(annotations::INJECT)
        .is_some_and(|value| value.eq_ignore_ascii_case("false"))
    {
        return Some("Injection is disabled for the pod".to_string());
    }
    if !has_eligible_container(pod, dynakube) {
        return Some("No container of the pod is eligible for injection".to_string());
    }
    if pod_annotations.contains_key(annotations::OPENSHIFT_DEBUG_SOURCE_CONTAINER)
        && pod_annotations.contains_key(annotations::OPENSHIFT_DEBUG_SOURCE_RESOURCE)
    {
        return Some("Pod is an OpenShift debug pod".to_string());
    }
    None
}

fn pod_display_name(pod: &Pod) -> String {
    pod.metadata
        .name
        .clone()
        .filter(|name| !name.is_empty())
        .or_else(|| pod.metadata.generate_name.clone())
        .unwrap_or_default()
}

fn with_message(
    request: &AdmissionRequest<DynamicObject>,
    message: impl Into<String>,
) -> AdmissionResponse {
    let mut response = AdmissionResponse::from(request);
    response.result.message = message.into();
    response
}

fn patch_response(
    request: &AdmissionRequest<DynamicObject>,
    original: &Pod,
    mutated: &Pod,
) -> AdmissionResponse {
    let documents = serde_json::to_value(original)
        .and_then(|original| serde_json::to_value(mutated).map(|mutated| (original, mutated)))
        .context(error::SerializePodSnafu);
    let (original, mutated) = match documents {
        Ok(documents) => documents,
        Err(err) => {
            tracing::warn!(uid = request.uid, "{err}");
            return with_message(request, err.to_string());
        }
    };
    let patch = json_patch::diff(&original, &mutated);
    if patch.0.is_empty() {
        return AdmissionResponse::from(request);
    }
    match AdmissionResponse::from(request).with_patch(patch) {
        Ok(response) => response,
        Err(err) => {
            tracing::warn!(uid = request.uid, "Failed to serialize patch, error: {err}");
            with_message(request, format!("Failed to serialize patch, error: {err}"))
        }
    }
}
