//! Metadata enrichment: workload identity as environment variables.

use dynakube_base::consts::annotations;
use k8s_openapi::api::core::v1::{Container, Pod};
use kube::ResourceExt;

use super::{
    MutationRequest, add_env, annotation_is_true, container_mut, eligible_container_names,
    env_value, has_env,
    owner::{Workload, resolve_workload},
    set_annotation,
};
use crate::{cluster::ClusterApi, consts::injection::env, mapper::MapKind, mutator::Error};

pub(super) fn is_enabled(request: &MutationRequest<'_>) -> bool {
    request.dynakube.metadata_enrichment_enabled()
        && request.is_mapped(MapKind::MetadataEnrichment)
}

pub(super) fn is_injected(pod: &Pod) -> bool {
    annotation_is_true(pod, annotations::METADATA_ENRICHMENT_INJECTED)
}

pub(super) async fn mutate<C>(cluster: &C, request: &mut MutationRequest<'_>) -> Result<(), Error>
where
    C: ClusterApi,
{
    let namespace = request.namespace_name();
    let workload = resolve_workload(cluster, &request.pod, &namespace).await?;

    set_annotation(&mut request.pod, annotations::WORKLOAD_KIND, workload.kind.as_str());
    set_annotation(&mut request.pod, annotations::WORKLOAD_NAME, workload.name.as_str());
    let enriched = enrich_containers(request, &workload, &namespace);
    if let Some(attributes) =
        request.install.as_mut().and_then(|install| install.pod_attributes.as_mut())
    {
        attributes.workload_kind = Some(workload.kind.clone());
        attributes.workload_name = Some(workload.name.clone());
    }
    set_annotation(&mut request.pod, annotations::METADATA_ENRICHMENT_INJECTED, "true");

    tracing::debug!(
        pod = request.pod.name_any(),
        namespace,
        workload_kind = workload.kind,
        workload_name = workload.name,
        containers = enriched,
        "Enriched pod with workload metadata"
    );
    Ok(())
}

pub(super) async fn reinvoke<C>(
    cluster: &C,
    request: &mut MutationRequest<'_>,
) -> Result<bool, Error>
where
    C: ClusterApi,
{
    if eligible_container_names(&request.pod, request.dynakube, is_new).is_empty() {
        return Ok(false);
    }

    let namespace = request.namespace_name();
    let workload = match Workload::from_annotations(&request.pod) {
        Some(workload) => workload,
        None => resolve_workload(cluster, &request.pod, &namespace).await?,
    };
    let enriched = enrich_containers(request, &workload, &namespace);
    tracing::debug!(
        pod = request.pod.name_any(),
        containers = enriched,
        "Enriched new containers with workload metadata"
    );
    Ok(enriched > 0)
}

fn is_new(container: &Container) -> bool { !has_env(container, env::WORKLOAD_KIND) }

/// Adds the workload variables to every eligible container lacking them.
/// Returns how many containers changed.
fn enrich_containers(
    request: &mut MutationRequest<'_>,
    workload: &Workload,
    namespace: &str,
) -> usize {
    let names = eligible_container_names(&request.pod, request.dynakube, is_new);
    for name in &names {
        if let Some(container) = container_mut(&mut request.pod, name) {
            add_env(container, env_value(env::WORKLOAD_KIND, workload.kind.as_str()));
            add_env(container, env_value(env::WORKLOAD_NAME, workload.name.as_str()));
            add_env(container, env_value(env::NAMESPACE_NAME, namespace));
        }
    }
    names.len()
}
