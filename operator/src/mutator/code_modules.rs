//! Code module injection: shared volumes, preload environment and the init
//! container that installs the agent.

use dynakube_base::consts::{CLUSTER_ID_NAMESPACE, annotations, names, secret_keys};
use k8s_openapi::{
    api::core::v1::{
        Container, EmptyDirVolumeSource, EnvVar, EnvVarSource, LocalObjectReference, Pod,
        SecretKeySelector, SecretVolumeSource, Volume, VolumeMount,
    },
    apimachinery::pkg::api::resource::Quantity,
};
use kube::ResourceExt;
use snafu::{OptionExt, ResultExt};

use super::{
    MutationRequest, add_env, annotation_is_true, container_mut, eligible_container_names,
    env_value, has_init_container,
    init_container::{ContainerAttributes, InstallContainer, PodAttributes, failure_policy, mount},
    set_annotation,
};
use crate::{
    cluster::ClusterApi,
    consts::injection::{INIT_CONTAINER_NAME, env, paths, volumes},
    crd::DynaKube,
    mapper::MapKind,
    mutator::{Error, error},
};

pub(super) fn is_enabled(request: &MutationRequest<'_>) -> bool {
    request.dynakube.code_modules_enabled() && request.is_mapped(MapKind::CodeModules)
}

pub(super) fn is_injected(pod: &Pod) -> bool {
    has_init_container(pod) || annotation_is_true(pod, annotations::CODE_MODULES_INJECTED)
}

pub(super) async fn mutate<C>(cluster: &C, request: &mut MutationRequest<'_>) -> Result<(), Error>
where
    C: ClusterApi,
{
    let dynakube = request.dynakube;
    let image = dynakube
        .code_modules_image()
        .with_context(|| error::NoCodeModulesImageSnafu { dynakube: dynakube.name_any() })?;
    let cluster_uid = cluster_uid(cluster).await?;
    let namespace = request.namespace_name();

    let mut install = InstallContainer::new(
        dynakube,
        &request.pod,
        image,
        PodAttributes::new(dynakube, &namespace, &cluster_uid),
    );
    add_volumes(&mut request.pod);
    add_pull_secret(&mut request.pod, dynakube);
    install.containers = inject_containers(&mut request.pod, dynakube, &cluster_uid);
    set_annotation(&mut request.pod, annotations::CODE_MODULES_INJECTED, "true");

    tracing::debug!(
        pod = request.pod.name_any(),
        namespace,
        containers = install.containers.len(),
        "Injected code modules"
    );
    request.install = Some(install);
    Ok(())
}

pub(super) async fn reinvoke<C>(
    cluster: &C,
    request: &mut MutationRequest<'_>,
) -> Result<bool, Error>
where
    C: ClusterApi,
{
    let Some(existing) = init_container(&request.pod).cloned() else {
        tracing::debug!(
            pod = request.pod.name_any(),
            "Pod is marked as injected but has no init container, injecting again"
        );
        mutate(cluster, request).await?;
        return Ok(true);
    };

    let dynakube = request.dynakube;
    if eligible_container_names(&request.pod, dynakube, |c| !has_config_mount(c)).is_empty() {
        return Ok(false);
    }

    let cluster_uid = cluster_uid(cluster).await?;
    let mut install = InstallContainer::existing(existing);
    install.containers = inject_containers(&mut request.pod, dynakube, &cluster_uid);
    tracing::debug!(
        pod = request.pod.name_any(),
        containers = install.containers.len(),
        "Added code modules to new containers"
    );
    request.install = Some(install);
    Ok(true)
}

async fn cluster_uid<C>(cluster: &C) -> Result<String, Error>
where
    C: ClusterApi,
{
    cluster
        .get_namespace(CLUSTER_ID_NAMESPACE)
        .await
        .context(error::GetClusterUidSnafu)?
        .and_then(|namespace| namespace.metadata.uid)
        .context(error::ClusterUidMissingSnafu { namespace: CLUSTER_ID_NAMESPACE })
}

fn init_container(pod: &Pod) -> Option<&Container> {
    pod.spec
        .as_ref()?
        .init_containers
        .as_ref()?
        .iter()
        .find(|container| container.name == INIT_CONTAINER_NAME)
}

/// Containers already injected carry the config mount.
fn has_config_mount(container: &Container) -> bool {
    container.volume_mounts.iter().flatten().any(|mount| mount.name == volumes::CONFIG)
}

/// Mounts and environment on every eligible container not injected yet.
/// Returns their attributes for the init container.
fn inject_containers(
    pod: &mut Pod,
    dynakube: &DynaKube,
    cluster_uid: &str,
) -> Vec<ContainerAttributes> {
    let app_env = app_env(pod, dynakube, cluster_uid);
    let names = eligible_container_names(pod, dynakube, |c| !has_config_mount(c));

    names
        .iter()
        .filter_map(|name| {
            let container = container_mut(pod, name)?;
            let mounts = container.volume_mounts.get_or_insert_with(Vec::new);
            mounts.push(VolumeMount {
                sub_path: Some(name.clone()),
                ..mount(volumes::CONFIG, paths::CONTAINER_CONFIG, false)
            });
            mounts.push(mount(volumes::INPUT, paths::CONTAINER_INSTALL, true));
            for var in &app_env {
                add_env(container, var.clone());
            }
            Some(ContainerAttributes::new(container))
        })
        .collect()
}

fn app_env(pod: &Pod, dynakube: &DynaKube, cluster_uid: &str) -> Vec<EnvVar> {
    let mut vars = vec![
        env_value(
            env::LD_PRELOAD,
            format!("{}/{}", paths::CONTAINER_INSTALL, paths::PRELOAD_LIBRARY),
        ),
        env_value(env::FAILURE_POLICY, failure_policy(pod, dynakube)),
        env_value(env::CLUSTER_ID, cluster_uid),
    ];
    if let Some(tenant) = dynakube.tenant_uuid() {
        vars.push(env_value(env::TENANT, tenant));
    }
    if let Some(zone) = dynakube.network_zone() {
        vars.push(env_value(env::NETWORK_ZONE, zone));
    }
    if dynakube.has_proxy() {
        vars.push(EnvVar {
            name: env::PROXY.to_string(),
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(SecretKeySelector {
                    name: names::INIT_SECRET.to_string(),
                    key: secret_keys::PROXY.to_string(),
                    ..SecretKeySelector::default()
                }),
                ..EnvVarSource::default()
            }),
            ..EnvVar::default()
        });
    }
    vars
}

fn add_volumes(pod: &mut Pod) {
    let spec = pod.spec.get_or_insert_with(Default::default);
    let pod_volumes = spec.volumes.get_or_insert_with(Vec::new);
    let wanted = [
        Volume {
            name: volumes::CONFIG.to_string(),
            empty_dir: Some(EmptyDirVolumeSource {
                size_limit: Some(Quantity(volumes::CONFIG_SIZE_LIMIT.to_string())),
                ..EmptyDirVolumeSource::default()
            }),
            ..Volume::default()
        },
        Volume {
            name: volumes::INPUT.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Volume::default()
        },
        Volume {
            name: volumes::INIT_SECRET.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(names::INIT_SECRET.to_string()),
                ..SecretVolumeSource::default()
            }),
            ..Volume::default()
        },
    ];
    for volume in wanted {
        if !pod_volumes.iter().any(|existing| existing.name == volume.name) {
            pod_volumes.push(volume);
        }
    }
}

fn add_pull_secret(pod: &mut Pod, dynakube: &DynaKube) {
    if dynakube.custom_pull_secret_name().is_none() {
        return;
    }
    let spec = pod.spec.get_or_insert_with(Default::default);
    let secrets = spec.image_pull_secrets.get_or_insert_with(Vec::new);
    if !secrets.iter().any(|secret| secret.name == names::PULL_SECRET) {
        secrets.push(LocalObjectReference { name: names::PULL_SECRET.to_string() });
    }
}
