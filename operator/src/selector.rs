//! Namespace label selector evaluation.
//!
//! A missing selector matches nothing, an empty selector matches everything.
//! `matchLabels` and `matchExpressions` are combined conjunctively.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};
use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Unsupported label selector operator '{operator}' for key '{key}'"))]
    UnsupportedOperator { key: String, operator: String },

    #[snafu(display("Label selector operator '{operator}' for key '{key}' requires values"))]
    MissingValues { key: String, operator: String },

    #[snafu(display("Label selector operator '{operator}' for key '{key}' must not have values"))]
    UnexpectedValues { key: String, operator: String },
}

/// Evaluates `selector` against `labels`.
///
/// # Errors
///
/// Returns an error if a `matchExpressions` entry is malformed.
pub fn matches(
    selector: Option<&LabelSelector>,
    labels: &BTreeMap<String, String>,
) -> Result<bool, Error> {
    let Some(selector) = selector else {
        return Ok(false);
    };

    let labels_match = selector
        .match_labels
        .iter()
        .flatten()
        .all(|(key, value)| labels.get(key).is_some_and(|actual| actual == value));
    if !labels_match {
        return Ok(false);
    }

    for requirement in selector.match_expressions.iter().flatten() {
        if !requirement_matches(requirement, labels)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn requirement_matches(
    requirement: &LabelSelectorRequirement,
    labels: &BTreeMap<String, String>,
) -> Result<bool, Error> {
    let LabelSelectorRequirement { key, operator, values } = requirement;
    let values = values.as_deref().unwrap_or_default();
    let actual = labels.get(key);

    match operator.as_str() {
        "In" | "NotIn" if values.is_empty() => {
            MissingValuesSnafu { key: key.clone(), operator: operator.clone() }.fail()
        }
        "Exists" | "DoesNotExist" if !values.is_empty() => {
            UnexpectedValuesSnafu { key: key.clone(), operator: operator.clone() }.fail()
        }
        "In" => Ok(actual.is_some_and(|actual| values.contains(actual))),
        "NotIn" => Ok(actual.is_none_or(|actual| !values.contains(actual))),
        "Exists" => Ok(actual.is_some()),
        "DoesNotExist" => Ok(actual.is_none()),
        _ => UnsupportedOperatorSnafu { key: key.clone(), operator: operator.clone() }.fail(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect()
    }

    fn expression(key: &str, operator: &str, values: &[&str]) -> LabelSelectorRequirement {
        LabelSelectorRequirement {
            key: key.to_string(),
            operator: operator.to_string(),
            values: (!values.is_empty())
                .then(|| values.iter().map(|value| (*value).to_string()).collect()),
        }
    }

    #[test]
    fn test_missing_selector_matches_nothing() {
        assert!(!matches(None, &labels(&[])).unwrap());
        assert!(!matches(None, &labels(&[("inject", "true")])).unwrap());
    }

    #[test]
    fn test_empty_selector_matches_everything() {
        let selector = LabelSelector::default();
        assert!(matches(Some(&selector), &labels(&[])).unwrap());
        assert!(matches(Some(&selector), &labels(&[("a", "b")])).unwrap());

        let selector = LabelSelector {
            match_labels: Some(BTreeMap::new()),
            match_expressions: Some(Vec::new()),
        };
        assert!(matches(Some(&selector), &labels(&[])).unwrap());
    }

    #[test]
    fn test_match_labels() {
        let selector =
            LabelSelector {
                match_labels: Some(labels(&[("inject", "true")])),
                ..LabelSelector::default()
            };
        assert!(matches(Some(&selector), &labels(&[("inject", "true"), ("x", "y")])).unwrap());
        assert!(!matches(Some(&selector), &labels(&[("inject", "false")])).unwrap());
        assert!(!matches(Some(&selector), &labels(&[])).unwrap());
    }

    #[test]
    fn test_match_expressions() {
        let selector = LabelSelector {
            match_labels: Some(labels(&[("team", "a")])),
            match_expressions: Some(vec![
                expression("env", "In", &["prod", "staging"]),
                expression("skip", "DoesNotExist", &[]),
            ]),
        };
        assert!(matches(Some(&selector), &labels(&[("team", "a"), ("env", "prod")])).unwrap());
        assert!(!matches(Some(&selector), &labels(&[("team", "b"), ("env", "prod")])).unwrap());
        assert!(!matches(Some(&selector), &labels(&[("team", "a"), ("env", "dev")])).unwrap());
        assert!(
            !matches(Some(&selector), &labels(&[("team", "a"), ("env", "prod"), ("skip", "")]))
                .unwrap()
        );

        let selector = LabelSelector {
            match_expressions: Some(vec![
                expression("env", "NotIn", &["dev"]),
                expression("owner", "Exists", &[]),
            ]),
            ..LabelSelector::default()
        };
        assert!(matches(Some(&selector), &labels(&[("owner", "me")])).unwrap());
        assert!(!matches(Some(&selector), &labels(&[("owner", "me"), ("env", "dev")])).unwrap());
    }

    #[test]
    fn test_malformed_expressions() {
        let selector = LabelSelector {
            match_expressions: Some(vec![expression("env", "Matches", &["x"])]),
            ..LabelSelector::default()
        };
        assert!(matches!(
            matches(Some(&selector), &labels(&[])),
            Err(Error::UnsupportedOperator { .. })
        ));

        let selector = LabelSelector {
            match_expressions: Some(vec![expression("env", "In", &[])]),
            ..LabelSelector::default()
        };
        assert!(matches!(matches(Some(&selector), &labels(&[])), Err(Error::MissingValues { .. })));
    }
}
