//! Resolution of the workload a pod belongs to.

use dynakube_base::consts::annotations;
use k8s_openapi::{
    api::core::v1::Pod,
    apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference},
};
use kube::ResourceExt;
use snafu::{OptionExt, ResultExt};

use crate::{
    cluster::ClusterApi,
    mutator::{Error, error},
};

/// Controller `(apiVersion, kind)` pairs followed when chasing owner references.
const WORKLOAD_KINDS: &[(&str, &str)] = &[
    ("apps/v1", "ReplicaSet"),
    ("apps/v1", "Deployment"),
    ("v1", "ReplicationController"),
    ("apps/v1", "StatefulSet"),
    ("apps/v1", "DaemonSet"),
    ("batch/v1", "Job"),
    ("batch/v1", "CronJob"),
    ("apps.openshift.io/v1", "DeploymentConfig"),
];

/// Bound on the owner chain, against reference cycles.
const MAX_OWNER_DEPTH: usize = 8;

const POD_KIND: &str = "pod";

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Workload {
    /// Lower-cased kind.
    pub kind: String,
    pub name: String,
}

impl Workload {
    /// The workload recorded on a pod by an earlier pass.
    #[must_use]
    pub fn from_annotations(pod: &Pod) -> Option<Self> {
        let pod_annotations = pod.annotations();
        let kind = pod_annotations.get(annotations::WORKLOAD_KIND)?;
        let name = pod_annotations.get(annotations::WORKLOAD_NAME)?;
        Some(Self { kind: kind.clone(), name: name.clone() })
    }

    /// A pod without controller is its own workload.
    fn of_pod(pod: &Pod) -> Self {
        let name = pod
            .metadata
            .name
            .clone()
            .filter(|name| !name.is_empty())
            .or_else(|| {
                let base = pod.metadata.generate_name.as_deref()?;
                Some(base.trim_end_matches('-').to_string())
            })
            .unwrap_or_default();
        Self { kind: POD_KIND.to_string(), name }
    }

    fn of_owner(owner: &OwnerReference) -> Self {
        Self { kind: owner.kind.to_lowercase(), name: owner.name.clone() }
    }
}

/// Follows controller references of well-known workload kinds from `pod`
/// upwards; the last one reached is the workload.
///
/// # Errors
///
/// Fails when a referenced owner does not exist or cannot be fetched.
pub async fn resolve_workload<C>(cluster: &C, pod: &Pod, namespace: &str) -> Result<Workload, Error>
where
    C: ClusterApi,
{
    let mut workload = None;
    let mut metadata = pod.metadata.clone();
    for _depth in 0..MAX_OWNER_DEPTH {
        let Some(owner) = workload_controller(&metadata) else {
            break;
        };
        metadata = cluster
            .get_owner_metadata(namespace, &owner)
            .await
            .with_context(|_| error::GetOwnerSnafu {
                namespace: namespace.to_string(),
                kind: owner.kind.clone(),
                name: owner.name.clone(),
            })?
            .with_context(|| error::OwnerNotFoundSnafu {
                namespace: namespace.to_string(),
                kind: owner.kind.clone(),
                name: owner.name.clone(),
            })?;
        workload = Some(Workload::of_owner(&owner));
    }
    Ok(workload.unwrap_or_else(|| Workload::of_pod(pod)))
}

fn workload_controller(metadata: &ObjectMeta) -> Option<OwnerReference> {
    metadata
        .owner_references
        .iter()
        .flatten()
        .find(|owner| {
            owner.controller == Some(true)
                && WORKLOAD_KINDS.contains(&(owner.api_version.as_str(), owner.kind.as_str()))
        })
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{cluster::fake::FakeCluster, testing};

    fn controller(api_version: &str, kind: &str, name: &str) -> OwnerReference {
        OwnerReference {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
            uid: format!("uid-{name}"),
            controller: Some(true),
            ..OwnerReference::default()
        }
    }

    #[tokio::test]
    async fn test_deployment_pod() {
        let cluster = FakeCluster::new();
        cluster.add_owner(
            "app",
            "ReplicaSet",
            "web-7d9f",
            vec![controller("apps/v1", "Deployment", "web")],
        );
        cluster.add_owner("app", "Deployment", "web", Vec::new());

        let mut pod = testing::pod("app", "", &[("web", "nginx")]);
        pod.metadata.owner_references = Some(vec![controller("apps/v1", "ReplicaSet", "web-7d9f")]);

        let workload = resolve_workload(&cluster, &pod, "app").await.unwrap();
        assert_eq!(workload, Workload { kind: "deployment".to_string(), name: "web".to_string() });
    }

    #[tokio::test]
    async fn test_pod_without_controller() {
        let cluster = FakeCluster::new();
        let mut pod = testing::pod("app", "", &[("web", "nginx")]);
        pod.metadata.generate_name = Some("batch-".to_string());
        let mut owner = controller("example.com/v1", "Custom", "custom");
        owner.controller = None;
        pod.metadata.owner_references = Some(vec![owner]);

        let workload = resolve_workload(&cluster, &pod, "app").await.unwrap();
        assert_eq!(workload, Workload { kind: "pod".to_string(), name: "batch".to_string() });

        let pod = testing::pod("app", "standalone", &[("web", "nginx")]);
        let workload = resolve_workload(&cluster, &pod, "app").await.unwrap();
        assert_eq!(workload.name, "standalone");
    }

    #[tokio::test]
    async fn test_dangling_owner() {
        let cluster = FakeCluster::new();
        let mut pod = testing::pod("app", "job-abc", &[("job", "busybox")]);
        pod.metadata.owner_references = Some(vec![controller("batch/v1", "Job", "gone")]);

        let err = resolve_workload(&cluster, &pod, "app").await.unwrap_err();
        assert!(matches!(err, Error::OwnerNotFound { .. }));
        assert_eq!(err.reason(), Some(crate::mutator::Reason::OwnerLookupFailed));
    }

    #[tokio::test]
    async fn test_custom_resource_with_workload_kind_is_not_followed() {
        let cluster = FakeCluster::new();
        let mut pod = testing::pod("app", "runner-0", &[("runner", "busybox")]);
        pod.metadata.owner_references = Some(vec![controller("example.com/v1", "Job", "runner")]);

        let workload = resolve_workload(&cluster, &pod, "app").await.unwrap();
        assert_eq!(workload, Workload { kind: "pod".to_string(), name: "runner-0".to_string() });
    }
}
