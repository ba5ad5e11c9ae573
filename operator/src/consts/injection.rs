//! Names, paths and environment variables of the injected pod layout.

/// Reserved name of the synthesised init container.
pub const INIT_CONTAINER_NAME: &str = "install-oneagent";

pub mod volumes {
    /// Per-container configuration written by the init container.
    pub const CONFIG: &str = "dynatrace-config";

    /// Size limit of the configuration volume.
    pub const CONFIG_SIZE_LIMIT: &str = "10Mi";

    /// Code module payload copied by the init container.
    pub const INPUT: &str = "dynatrace-input";

    /// The init secret, visible to the init container only.
    pub const INIT_SECRET: &str = "dynatrace-init-secret";
}

pub mod paths {
    pub const INIT_CONFIG: &str = "/mnt/config";
    pub const INIT_INPUT: &str = "/mnt/bin";
    pub const INIT_SECRET: &str = "/mnt/init";

    pub const CONTAINER_CONFIG: &str = "/var/lib/dynatrace/oneagent";
    pub const CONTAINER_INSTALL: &str = "/opt/dynatrace/oneagent-paas";

    /// Location of the code module inside the code module image.
    pub const IMAGE_SOURCE: &str = "/opt/dynatrace/oneagent";

    pub const PRELOAD_LIBRARY: &str = "agent/lib64/liboneagentproc.so";
}

pub mod env {
    pub const POD_NAME: &str = "K8S_PODNAME";
    pub const POD_UID: &str = "K8S_PODUID";
    pub const NODE_NAME: &str = "K8S_NODE_NAME";

    pub const LD_PRELOAD: &str = "LD_PRELOAD";
    pub const FAILURE_POLICY: &str = "DT_FAILURE_POLICY";
    pub const CLUSTER_ID: &str = "DT_CLUSTER_ID";
    pub const TENANT: &str = "DT_TENANT";
    pub const NETWORK_ZONE: &str = "DT_NETWORK_ZONE";
    pub const PROXY: &str = "DT_PROXY";

    pub const WORKLOAD_KIND: &str = "DT_WORKLOAD_KIND";
    pub const WORKLOAD_NAME: &str = "DT_WORKLOAD_NAME";
    pub const NAMESPACE_NAME: &str = "DT_NAMESPACE_NAME";
}

pub mod args {
    pub const SUPPRESS_ERRORS: &str = "--suppress-errors";
    pub const CONTAINER_PREFIX: &str = "container.";
    pub const POD_PREFIX: &str = "pod.";
}

/// User and group the init container runs as unless the pod says otherwise.
pub const DEFAULT_USER: i64 = 1001;
pub const DEFAULT_GROUP: i64 = 1001;

pub const FAILURE_POLICY_FAIL: &str = "fail";
pub const FAILURE_POLICY_SILENT: &str = "silent";
