//! The `install-oneagent` init container and its arguments.

use dynakube_base::consts::annotations;
use k8s_openapi::api::core::v1::{
    Capabilities, Container, EnvVar, EnvVarSource, ObjectFieldSelector, Pod, SeccompProfile,
    SecurityContext, VolumeMount,
};
use kube::ResourceExt;
use serde::Serialize;
use snafu::ResultExt;

use crate::{
    consts::injection::{
        DEFAULT_GROUP, DEFAULT_USER, FAILURE_POLICY_FAIL, FAILURE_POLICY_SILENT,
        INIT_CONTAINER_NAME, args, env, paths, volumes,
    },
    crd::DynaKube,
    mutator::{Error, error, image::ImageReference},
};

const SECCOMP_RUNTIME_DEFAULT: &str = "RuntimeDefault";

/// The init container being assembled during one admission request.
///
/// Arguments carrying pod and container attributes are appended by
/// [`InstallContainer::finish`] once all mutators have run.
#[derive(Clone, Debug)]
pub struct InstallContainer {
    pub container: Container,

    /// Set on the first pass only; a reinvocation keeps the existing
    /// `pod.` argument.
    pub pod_attributes: Option<PodAttributes>,

    pub containers: Vec<ContainerAttributes>,
}

impl InstallContainer {
    /// A new init container for `pod`.
    #[must_use]
    pub fn new(dynakube: &DynaKube, pod: &Pod, image: &str, pod_attributes: PodAttributes) -> Self {
        let mut container_args = vec![
            format!("--source={}", paths::IMAGE_SOURCE),
            format!("--target={}", paths::INIT_INPUT),
            format!("--config-directory={}", paths::INIT_CONFIG),
            format!("--input-directory={}", paths::INIT_SECRET),
        ];
        if failure_policy(pod, dynakube) != FAILURE_POLICY_FAIL {
            container_args.push(args::SUPPRESS_ERRORS.to_string());
        }

        let container = Container {
            name: INIT_CONTAINER_NAME.to_string(),
            image: Some(image.to_string()),
            image_pull_policy: Some("IfNotPresent".to_string()),
            args: Some(container_args),
            env: Some(vec![
                field_ref_env(env::POD_NAME, "metadata.name"),
                field_ref_env(env::POD_UID, "metadata.uid"),
                field_ref_env(env::NODE_NAME, "spec.nodeName"),
            ]),
            volume_mounts: Some(vec![
                mount(volumes::CONFIG, paths::INIT_CONFIG, false),
                mount(volumes::INPUT, paths::INIT_INPUT, false),
                mount(volumes::INIT_SECRET, paths::INIT_SECRET, true),
            ]),
            security_context: Some(security_context(dynakube, pod)),
            resources: dynakube.spec.code_modules.init_resources.clone(),
            ..Container::default()
        };
        Self { container, pod_attributes: Some(pod_attributes), containers: Vec::new() }
    }

    /// Wraps an init container found on a pod that was injected before.
    #[must_use]
    pub const fn existing(container: Container) -> Self {
        Self { container, pod_attributes: None, containers: Vec::new() }
    }

    /// Appends the accumulated attribute arguments and returns the container.
    ///
    /// # Errors
    ///
    /// Fails when the attributes cannot be serialized.
    pub fn finish(self) -> Result<Container, Error> {
        let Self { mut container, pod_attributes, containers } = self;
        let container_args = container.args.get_or_insert_with(Vec::new);
        if let Some(pod_attributes) = pod_attributes {
            container_args.push(pod_attributes.to_arg()?);
        }
        for attributes in containers {
            container_args.push(attributes.to_arg()?);
        }
        Ok(container)
    }
}

/// Pod information handed to the init container as `pod.<json>`.
///
/// Pod name, UID and node name are references to the downward API
/// variables of the init container.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct PodAttributes {
    #[serde(rename = "k8s.pod.name")]
    pub pod_name: String,

    #[serde(rename = "k8s.pod.uid")]
    pub pod_uid: String,

    #[serde(rename = "k8s.node.name")]
    pub node_name: String,

    #[serde(rename = "k8s.namespace.name")]
    pub namespace_name: String,

    #[serde(rename = "k8s.cluster.uid")]
    pub cluster_uid: String,

    #[serde(rename = "dt.entity.kubernetes_cluster", skip_serializing_if = "Option::is_none")]
    pub cluster_meid: Option<String>,

    #[serde(rename = "k8s.cluster.name", skip_serializing_if = "Option::is_none")]
    pub cluster_name: Option<String>,

    #[serde(rename = "k8s.workload.kind", skip_serializing_if = "Option::is_none")]
    pub workload_kind: Option<String>,

    #[serde(rename = "k8s.workload.name", skip_serializing_if = "Option::is_none")]
    pub workload_name: Option<String>,
}

impl PodAttributes {
    #[must_use]
    pub fn new(dynakube: &DynaKube, namespace: &str, cluster_uid: &str) -> Self {
        Self {
            pod_name: format!("$({})", env::POD_NAME),
            pod_uid: format!("$({})", env::POD_UID),
            node_name: format!("$({})", env::NODE_NAME),
            namespace_name: namespace.to_string(),
            cluster_uid: cluster_uid.to_string(),
            cluster_meid: dynakube.cluster_meid().map(str::to_string),
            cluster_name: dynakube.cluster_name().map(str::to_string),
            workload_kind: None,
            workload_name: None,
        }
    }

    fn to_arg(&self) -> Result<String, Error> {
        let json = serde_json::to_string(self)
            .context(error::SerializeAttributesSnafu { what: "pod".to_string() })?;
        Ok(format!("{}{json}", args::POD_PREFIX))
    }
}

/// Image information of one application container, handed to the init
/// container as `container.<name>=<json>`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ContainerAttributes {
    pub name: String,
    pub image: ImageReference,
}

impl ContainerAttributes {
    #[must_use]
    pub fn new(container: &Container) -> Self {
        Self {
            name: container.name.clone(),
            image: ImageReference::parse(container.image.as_deref().unwrap_or_default()),
        }
    }

    fn to_arg(&self) -> Result<String, Error> {
        let json = serde_json::to_string(&self.image).with_context(|_| {
            error::SerializeAttributesSnafu { what: format!("container {}", self.name) }
        })?;
        Ok(format!("{}{}={json}", args::CONTAINER_PREFIX, self.name))
    }
}

/// Failure policy of the pod: its own annotation, else the `DynaKube`
/// feature flag, else `silent`.
#[must_use]
pub fn failure_policy<'a>(pod: &'a Pod, dynakube: &'a DynaKube) -> &'a str {
    pod.annotations()
        .get(annotations::FAILURE_POLICY)
        .map(String::as_str)
        .or_else(|| dynakube.feature_failure_policy())
        .unwrap_or(FAILURE_POLICY_SILENT)
}

fn security_context(dynakube: &DynaKube, pod: &Pod) -> SecurityContext {
    let pod_context = pod.spec.as_ref().and_then(|spec| spec.security_context.as_ref());
    let user = pod_context.and_then(|context| context.run_as_user).unwrap_or(DEFAULT_USER);
    let group = pod_context.and_then(|context| context.run_as_group).unwrap_or(DEFAULT_GROUP);

    SecurityContext {
        read_only_root_filesystem: Some(true),
        allow_privilege_escalation: Some(false),
        privileged: Some(false),
        capabilities: Some(Capabilities {
            drop: Some(vec!["ALL".to_string()]),
            ..Capabilities::default()
        }),
        run_as_user: Some(user),
        run_as_group: Some(group),
        run_as_non_root: Some(user != 0),
        seccomp_profile: dynakube.feature_init_container_seccomp().then(|| SeccompProfile {
            type_: SECCOMP_RUNTIME_DEFAULT.to_string(),
            ..SeccompProfile::default()
        }),
        ..SecurityContext::default()
    }
}

fn field_ref_env(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_string(),
                ..ObjectFieldSelector::default()
            }),
            ..EnvVarSource::default()
        }),
        ..EnvVar::default()
    }
}

pub(crate) fn mount(volume: &str, path: &str, read_only: bool) -> VolumeMount {
    VolumeMount {
        name: volume.to_string(),
        mount_path: path.to_string(),
        read_only: read_only.then_some(true),
        ..VolumeMount::default()
    }
}

#[cfg(test)]
mod tests {
    use dynakube_base::consts::feature_flags;
    use k8s_openapi::api::core::v1::PodSecurityContext;

    use super::*;
    use crate::testing;

    fn build(dynakube: &DynaKube, pod: &Pod) -> Container {
        InstallContainer::new(
            dynakube,
            pod,
            "reg.example.com/agent:1.0",
            PodAttributes::new(dynakube, "app", "cluster-uid"),
        )
        .container
    }

    #[test]
    fn test_default_security_context() {
        let dynakube = testing::dynakube("dk1");
        let pod = testing::pod("app", "web-0", &[("web", "nginx")]);
        let context = build(&dynakube, &pod).security_context.unwrap();
        assert_eq!(context.run_as_user, Some(DEFAULT_USER));
        assert_eq!(context.run_as_group, Some(DEFAULT_GROUP));
        assert_eq!(context.run_as_non_root, Some(true));
        assert_eq!(context.read_only_root_filesystem, Some(true));
        assert_eq!(context.allow_privilege_escalation, Some(false));
        assert_eq!(context.privileged, Some(false));
        assert_eq!(context.capabilities.unwrap().drop, Some(vec!["ALL".to_string()]));
        assert!(context.seccomp_profile.is_none());
    }

    #[test]
    fn test_security_context_follows_pod() {
        let mut dynakube = testing::dynakube("dk1");
        let _unused = dynakube
            .annotations_mut()
            .insert(feature_flags::INIT_CONTAINER_SECCOMP.to_string(), "true".to_string());
        let mut pod = testing::pod("app", "web-0", &[("web", "nginx")]);
        pod.spec.as_mut().unwrap().security_context = Some(PodSecurityContext {
            run_as_user: Some(2000),
            ..PodSecurityContext::default()
        });
        let context = build(&dynakube, &pod).security_context.unwrap();
        assert_eq!(context.run_as_user, Some(2000));
        assert_eq!(context.run_as_group, Some(DEFAULT_GROUP));
        assert_eq!(context.run_as_non_root, Some(true));
        assert_eq!(context.seccomp_profile.unwrap().type_, SECCOMP_RUNTIME_DEFAULT);

        pod.spec.as_mut().unwrap().security_context = Some(PodSecurityContext {
            run_as_user: Some(0),
            run_as_group: Some(0),
            ..PodSecurityContext::default()
        });
        let context = build(&dynakube, &pod).security_context.unwrap();
        assert_eq!(context.run_as_user, Some(0));
        assert_eq!(context.run_as_non_root, Some(false));
    }

    #[test]
    fn test_failure_policy_resolution() {
        let mut dynakube = testing::dynakube("dk1");
        let mut pod = testing::pod("app", "web-0", &[("web", "nginx")]);
        assert_eq!(failure_policy(&pod, &dynakube), FAILURE_POLICY_SILENT);
        assert!(build(&dynakube, &pod).args.unwrap().contains(&args::SUPPRESS_ERRORS.to_string()));

        let _unused = dynakube
            .annotations_mut()
            .insert(feature_flags::INJECTION_FAILURE_POLICY.to_string(), "fail".to_string());
        assert_eq!(failure_policy(&pod, &dynakube), FAILURE_POLICY_FAIL);
        assert!(!build(&dynakube, &pod).args.unwrap().contains(&args::SUPPRESS_ERRORS.to_string()));

        let _unused = pod
            .annotations_mut()
            .insert(annotations::FAILURE_POLICY.to_string(), "silent".to_string());
        assert_eq!(failure_policy(&pod, &dynakube), FAILURE_POLICY_SILENT);
    }

    #[test]
    fn test_finish_appends_attribute_args() {
        let mut dynakube = testing::dynakube("dk1");
        dynakube.status = Some(crate::crd::DynaKubeStatus {
            kubernetes_cluster_meid: Some("KUBERNETES_CLUSTER-1".to_string()),
            ..crate::crd::DynaKubeStatus::default()
        });
        let pod = testing::pod("app", "web-0", &[("web", "docker.io/nginx:1.25")]);
        let mut install = InstallContainer::new(
            &dynakube,
            &pod,
            "reg.example.com/agent:1.0",
            PodAttributes::new(&dynakube, "app", "cluster-uid"),
        );
        install
            .containers
            .push(ContainerAttributes::new(&testing::container("web", "docker.io/nginx:1.25")));

        let container_args = install.finish().unwrap().args.unwrap();
        assert_eq!(container_args[0], "--source=/opt/dynatrace/oneagent");
        assert_eq!(container_args[4], args::SUPPRESS_ERRORS);
        let pod_json: serde_json::Value =
            serde_json::from_str(container_args[5].strip_prefix(args::POD_PREFIX).unwrap())
                .unwrap();
        assert_eq!(pod_json["k8s.pod.name"], "$(K8S_PODNAME)");
        assert_eq!(pod_json["k8s.namespace.name"], "app");
        assert_eq!(pod_json["k8s.cluster.uid"], "cluster-uid");
        assert_eq!(pod_json["dt.entity.kubernetes_cluster"], "KUBERNETES_CLUSTER-1");
        assert!(pod_json.get("k8s.cluster.name").is_none());
        assert_eq!(
            container_args[6],
            r#"container.web={"registry":"docker.io","repository":"nginx","tag":"1.25"}"#
        );
    }
}
