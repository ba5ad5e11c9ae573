//! Well-known Kubernetes names shared by the operator components.

/// Namespace whose UID is used as the stable cluster identifier.
pub const CLUSTER_ID_NAMESPACE: &str = "kube-system";

/// Default namespace the operator runs in.
pub const DEFAULT_OPERATOR_NAMESPACE: &str = "dynatrace";

/// Name reported as the `reportingComponent` of emitted events and as the
/// field manager of server-side applies.
pub const CONTROLLER_NAME: &str = "dynakube-operator";

pub mod crd {
    //! Identity of the `DynaKube` custom resource.

    pub const GROUP: &str = "dynatrace.com";
    pub const VERSION: &str = "v1beta1";
    pub const KIND: &str = "DynaKube";
    pub const PLURAL: &str = "dynakubes";

    /// Finalizer used to clean up replicated secrets on `DynaKube` deletion.
    pub const FINALIZER: &str = "dynatrace.com/dynakube-cleanup";

    /// Legacy resource whose presence disables injection.
    pub const INCOMPATIBLE_CRD_NAME: &str = "oneagentapms.dynatrace.com";
}

pub mod labels {
    //! Kubernetes labels written by the operator.

    /// Marks a namespace as wired to a `DynaKube`; the webhook configuration's
    /// namespace selector filters on it.
    pub const INSTANCE: &str = "operator.dynatrace.com/instance";

    pub const NAME: &str = "app.kubernetes.io/name";
    pub const VERSION: &str = "app.kubernetes.io/version";
    pub const MANAGED_BY: &str = "app.kubernetes.io/managed-by";
}

pub mod annotations {
    //! Pod annotations read or written by the webhook.

    /// User input: `false` disables injection for the pod.
    pub const INJECT: &str = "dynatrace.com/inject";

    /// Written by the webhook: `true` iff all requested mutators succeeded.
    pub const INJECTED: &str = "dynakube.dynatrace.com/injected";

    /// Written by the webhook when `injected=false`.
    pub const REASON: &str = "dynakube.dynatrace.com/reason";

    pub const FAILURE_POLICY: &str = "injection.dynatrace.com/failure-policy";

    /// Prefix of per-container exclusion annotations, the suffix being the
    /// container name.
    pub const CONTAINER_INJECT_PREFIX: &str = "container.inject.dynatrace.com/";

    pub const CODE_MODULES_INJECTED: &str = "oneagent.dynatrace.com/injected";
    pub const METADATA_ENRICHMENT_INJECTED: &str = "metadata-enrichment.dynatrace.com/injected";

    pub const WORKLOAD_KIND: &str = "metadata.dynatrace.com/dt.kubernetes.workload.kind";
    pub const WORKLOAD_NAME: &str = "metadata.dynatrace.com/dt.kubernetes.workload.name";

    pub const OPENSHIFT_DEBUG_SOURCE_CONTAINER: &str = "debug.openshift.io/source-container";
    pub const OPENSHIFT_DEBUG_SOURCE_RESOURCE: &str = "debug.openshift.io/source-resource";
}

pub mod feature_flags {
    //! Annotations on the `DynaKube` that toggle injection behaviour.

    pub const INJECTION_FAILURE_POLICY: &str = "feature.dynatrace.com/injection-failure-policy";
    pub const INIT_CONTAINER_SECCOMP: &str = "feature.dynatrace.com/init-container-seccomp-profile";
}

pub mod names {
    //! Names of objects persisted or replicated by the operator.

    pub const CODE_MODULES_MAP: &str = "code-modules-map";
    pub const METADATA_ENRICHMENT_MAP: &str = "metadata-enrichment-map";

    /// Init secret replicated into every injected namespace.
    pub const INIT_SECRET: &str = "dynatrace-dynakube-config";

    /// Pull secret replicated into injected namespaces when the `DynaKube`
    /// names a custom one.
    pub const PULL_SECRET: &str = "dynatrace-dynakube-pull-secret";
}

pub mod secret_keys {
    //! Keys of the tokens secret and of the init secret.

    pub const API_TOKEN: &str = "apiToken";
    pub const PAAS_TOKEN: &str = "paasToken";
    pub const DATA_INGEST_TOKEN: &str = "dataIngestToken";

    pub const INIT_SCRIPT: &str = "init.sh";
    pub const TRUSTED_CAS: &str = "ca.pem";
    pub const PROXY: &str = "proxy";

    /// Key holding the bundle in the trusted-CA `ConfigMap`.
    pub const CERTIFICATES: &str = "certs";
}
