//! Token conditions of a `DynaKube`, derived from its tokens secret.

use chrono::{SecondsFormat, Utc};
use dynakube_base::consts::secret_keys;
use k8s_openapi::{ByteString, api::core::v1::Secret};

use crate::crd::{Condition, ConditionStatus, ConditionType, TokenReason, upsert_condition};

const fn secret_key(type_: ConditionType) -> &'static str {
    match type_ {
        ConditionType::ApiToken => secret_keys::API_TOKEN,
        ConditionType::PaasToken => secret_keys::PAAS_TOKEN,
        ConditionType::DataIngestToken => secret_keys::DATA_INGEST_TOKEN,
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum TokenState {
    Present,
    Blank,
    Missing,
}

fn token_state(secret: &Secret, key: &str) -> TokenState {
    match secret.data.as_ref().and_then(|data| data.get(key)) {
        None => TokenState::Missing,
        Some(ByteString(bytes)) if String::from_utf8_lossy(bytes).trim().is_empty() => {
            TokenState::Blank
        }
        Some(_) => TokenState::Present,
    }
}

/// The token conditions as seen in `secret`, without transition times.
///
/// A present token whose current condition carries a reason only the tenant
/// can establish keeps that condition.
pub fn token_conditions(
    secret_name: &str,
    secret: Option<&Secret>,
    current: &[Condition],
) -> Vec<Condition> {
    let Some(secret) = secret else {
        return ConditionType::TOKENS
            .into_iter()
            .map(|type_| {
                Condition::token(
                    type_,
                    ConditionStatus::False,
                    TokenReason::SecretNotFound,
                    format!("Secret {secret_name} not found"),
                )
            })
            .collect();
    };

    let api_token = token_state(secret, secret_keys::API_TOKEN);
    ConditionType::TOKENS
        .into_iter()
        .map(|type_| {
            let key = secret_key(type_);
            match token_state(secret, key) {
                TokenState::Present => current
                    .iter()
                    .find(|existing| {
                        existing.type_ == type_.as_str()
                            && existing
                                .token_reason()
                                .is_some_and(TokenReason::is_verified_by_tenant)
                    })
                    .cloned()
                    .unwrap_or_else(|| {
                        Condition::token(type_, ConditionStatus::True, TokenReason::Ready, "Ready")
                    }),
                TokenState::Blank => Condition::token(
                    type_,
                    ConditionStatus::False,
                    TokenReason::Error,
                    format!("Token {key} in secret {secret_name} is blank"),
                ),
                TokenState::Missing
                    if type_ == ConditionType::PaasToken && api_token == TokenState::Present =>
                {
                    Condition::token(
                        type_,
                        ConditionStatus::True,
                        TokenReason::Ready,
                        format!(
                            "Token {key} is missing in secret {secret_name}, {} is used instead",
                            secret_keys::API_TOKEN
                        ),
                    )
                }
                TokenState::Missing => Condition::token(
                    type_,
                    ConditionStatus::False,
                    TokenReason::Missing,
                    format!("Token {key} is missing in secret {secret_name}"),
                ),
            }
        })
        .collect()
}

/// Merges the token conditions into `current`, stamping transitions with
/// `now`. Returns the new list if anything changed.
pub fn merge_token_conditions(
    current: &[Condition],
    desired: Vec<Condition>,
    now: &str,
) -> Option<Vec<Condition>> {
    let mut conditions = current.to_vec();
    let mut changed = false;
    for condition in desired {
        changed |= upsert_condition(&mut conditions, condition, now);
    }
    changed.then_some(conditions)
}

pub fn now() -> String { Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true) }

#[cfg(test)]
mod tests {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::*;

    fn secret(data: &[(&str, &str)]) -> Secret {
        Secret {
            metadata: ObjectMeta { name: Some("dk1".to_string()), ..ObjectMeta::default() },
            data: Some(
                data.iter()
                    .map(|(key, value)| ((*key).to_string(), ByteString(value.as_bytes().to_vec())))
                    .collect(),
            ),
            ..Secret::default()
        }
    }

    fn reasons(conditions: &[Condition]) -> Vec<(&str, ConditionStatus, &str)> {
        conditions
            .iter()
            .map(|condition| {
                (condition.type_.as_str(), condition.status, condition.reason.as_str())
            })
            .collect()
    }

    #[test]
    fn test_missing_secret() {
        let conditions = token_conditions("dk1", None, &[]);
        assert_eq!(
            reasons(&conditions),
            vec![
                ("APIToken", ConditionStatus::False, "TokenSecretNotFound"),
                ("PaaSToken", ConditionStatus::False, "TokenSecretNotFound"),
                ("DataIngestToken", ConditionStatus::False, "TokenSecretNotFound"),
            ]
        );
    }

    #[test]
    fn test_all_tokens_present() {
        let secret = secret(&[("apiToken", "a"), ("paasToken", "p"), ("dataIngestToken", "d")]);
        let conditions = token_conditions("dk1", Some(&secret), &[]);
        assert!(conditions.iter().all(|condition| condition.status == ConditionStatus::True));
        assert!(conditions.iter().all(|condition| condition.reason == "TokenReady"));
    }

    #[test]
    fn test_paas_token_falls_back_to_api_token() {
        let secret = secret(&[("apiToken", "a")]);
        let conditions = token_conditions("dk1", Some(&secret), &[]);
        assert_eq!(
            reasons(&conditions),
            vec![
                ("APIToken", ConditionStatus::True, "TokenReady"),
                ("PaaSToken", ConditionStatus::True, "TokenReady"),
                ("DataIngestToken", ConditionStatus::False, "TokenMissing"),
            ]
        );
        assert!(conditions[1].message.contains("apiToken is used instead"));
    }

    #[test]
    fn test_missing_and_blank_tokens() {
        let secret = secret(&[("apiToken", "  "), ("dataIngestToken", "d")]);
        let conditions = token_conditions("dk1", Some(&secret), &[]);
        assert_eq!(
            reasons(&conditions),
            vec![
                ("APIToken", ConditionStatus::False, "TokenError"),
                ("PaaSToken", ConditionStatus::False, "TokenMissing"),
                ("DataIngestToken", ConditionStatus::True, "TokenReady"),
            ]
        );
    }

    #[test]
    fn test_tenant_verdict_is_kept() {
        let secret = secret(&[("apiToken", "a"), ("paasToken", "p"), ("dataIngestToken", "d")]);
        let unauthorized = Condition::token(
            ConditionType::ApiToken,
            ConditionStatus::False,
            TokenReason::Unauthorized,
            "401 from tenant",
        );
        let conditions = token_conditions("dk1", Some(&secret), &[unauthorized.clone()]);
        assert_eq!(conditions[0], unauthorized);
        assert_eq!(conditions[1].reason, "TokenReady");
    }

    #[test]
    fn test_merge_token_conditions() {
        let secret = secret(&[("apiToken", "a")]);
        let desired = token_conditions("dk1", Some(&secret), &[]);
        let merged =
            merge_token_conditions(&[], desired.clone(), "2024-01-01T00:00:00Z").unwrap();
        assert_eq!(merged.len(), 3);
        assert!(
            merged
                .iter()
                .all(|c| c.last_transition_time.as_deref() == Some("2024-01-01T00:00:00Z"))
        );

        assert!(merge_token_conditions(&merged, desired, "2024-01-02T00:00:00Z").is_none());
    }

    #[test]
    fn test_now_is_rfc3339() {
        let now = now();
        assert!(chrono::DateTime::parse_from_rfc3339(&now).is_ok());
        assert!(now.ends_with('Z'));
    }
}
