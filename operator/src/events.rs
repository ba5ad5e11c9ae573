//! Kubernetes events emitted by the webhook.

use std::fmt;

/// Event reasons, as shown by `kubectl describe`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EventReason {
    /// A pod was injected on its first admission pass.
    Inject,
    /// A reinvocation changed an already injected pod.
    UpdatePod,
    /// The namespace is mapped to a `DynaKube` that does not exist.
    MissingDynakube,
    /// The legacy custom resource definition is installed.
    IncompatibleCrdPresent,
}

impl EventReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Inject => "Inject",
            Self::UpdatePod => "UpdatePod",
            Self::MissingDynakube => "MissingDynakube",
            Self::IncompatibleCrdPresent => "IncompatibleCRDPresent",
        }
    }

    #[must_use]
    pub const fn is_warning(self) -> bool {
        matches!(self, Self::MissingDynakube | Self::IncompatibleCrdPresent)
    }
}

impl fmt::Display for EventReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InjectionEvent {
    pub reason: EventReason,
    pub note: String,
}

impl InjectionEvent {
    pub fn new(reason: EventReason, note: impl Into<String>) -> Self {
        Self { reason, note: note.into() }
    }

    #[must_use]
    pub fn injected(namespace: &str, pod_name: &str) -> Self {
        Self::new(
            EventReason::Inject,
            format!("Injecting the necessary info into pod {namespace}/{pod_name}"),
        )
    }

    #[must_use]
    pub fn pod_updated(namespace: &str, pod_name: &str) -> Self {
        Self::new(
            EventReason::UpdatePod,
            format!("Updating pod {namespace}/{pod_name} with missing containers"),
        )
    }

    #[must_use]
    pub fn missing_dynakube(namespace: &str, dynakube: &str) -> Self {
        Self::new(
            EventReason::MissingDynakube,
            format!(
                "The dynakube {dynakube} mapped to namespace {namespace} is missing, verify \
                 that the dynakube exists and its namespace selector"
            ),
        )
    }

    #[must_use]
    pub fn incompatible_crd(crd_name: &str) -> Self {
        Self::new(
            EventReason::IncompatibleCrdPresent,
            format!(
                "Unsupported custom resource definition {crd_name} is installed, pods are not \
                 injected"
            ),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_reason_strings() {
        assert_eq!(EventReason::Inject.as_str(), "Inject");
        assert_eq!(EventReason::UpdatePod.as_str(), "UpdatePod");
        assert_eq!(EventReason::MissingDynakube.as_str(), "MissingDynakube");
        assert_eq!(EventReason::IncompatibleCrdPresent.as_str(), "IncompatibleCRDPresent");
        assert!(EventReason::MissingDynakube.is_warning());
        assert!(!EventReason::Inject.is_warning());
    }

    #[test]
    fn test_missing_dynakube_note() {
        let event = InjectionEvent::missing_dynakube("app", "dk1");
        assert_eq!(event.reason, EventReason::MissingDynakube);
        assert!(event.note.contains("dk1"));
        assert!(event.note.contains("app"));
    }
}
