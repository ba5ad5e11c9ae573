//! Fixtures shared by unit tests.

use std::collections::BTreeMap;

use k8s_openapi::{
    api::core::v1::{Container, Pod, PodSpec},
    apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta},
};

use crate::{
    cluster::fake::OPERATOR_NAMESPACE,
    crd::{CodeModulesSpec, DynaKube, DynaKubeSpec, MetadataEnrichmentSpec},
};

pub fn label_selector(labels: &[(&str, &str)]) -> LabelSelector {
    LabelSelector {
        match_labels: (!labels.is_empty()).then(|| string_map(labels)),
        ..LabelSelector::default()
    }
}

pub fn string_map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect()
}

pub fn dynakube(name: &str) -> DynaKube {
    let mut dynakube = DynaKube::new(
        name,
        DynaKubeSpec {
            api_url: "https://tenant.example.com/api".to_string(),
            ..DynaKubeSpec::default()
        },
    );
    dynakube.metadata.namespace = Some(OPERATOR_NAMESPACE.to_string());
    dynakube.metadata.uid = Some(format!("uid-{name}"));
    dynakube
}

/// A `DynaKube` with code modules enabled for namespaces carrying `labels`.
pub fn code_modules_dynakube(name: &str, labels: &[(&str, &str)], image: Option<&str>) -> DynaKube {
    let mut dynakube = dynakube(name);
    dynakube.spec.code_modules = CodeModulesSpec {
        enabled: true,
        namespace_selector: Some(label_selector(labels)),
        image: image.map(str::to_string),
        init_resources: None,
    };
    dynakube
}

pub fn metadata_enrichment_dynakube(name: &str, labels: &[(&str, &str)]) -> DynaKube {
    let mut dynakube = dynakube(name);
    dynakube.spec.metadata_enrichment = MetadataEnrichmentSpec {
        enabled: true,
        namespace_selector: Some(label_selector(labels)),
    };
    dynakube
}

pub fn container(name: &str, image: &str) -> Container {
    Container { name: name.to_string(), image: Some(image.to_string()), ..Container::default() }
}

pub fn pod(namespace: &str, name: &str, containers: &[(&str, &str)]) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            uid: Some(format!("uid-{name}")),
            ..ObjectMeta::default()
        },
        spec: Some(PodSpec {
            containers: containers.iter().map(|(name, image)| container(name, image)).collect(),
            ..PodSpec::default()
        }),
        status: None,
    }
}
