//! Submit requests and their validation.
//!
//! A [`SubmitRequest`] is whatever a front end collected; [`SubmitRequest::validate`]
//! turns it into a [`JobSpec`] once, before any worker starts, or rejects it.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use volley_smtp::{RelayEndpoint, client::Credentials};

use crate::{error::SubmitError, render::Catalog};

/// Bounds for the number of concurrent workers
pub const MIN_WORKERS: usize = 1;
pub const MAX_WORKERS: usize = 10;

/// Where a relay password comes from
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecretRef {
    Inline(String),
    /// Name of an environment variable, read during validation
    Env(String),
}

impl std::fmt::Debug for SecretRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inline(_) => f.write_str("Inline(<redacted>)"),
            Self::Env(name) => f.debug_tuple("Env").field(name).finish(),
        }
    }
}

impl SecretRef {
    /// # Errors
    ///
    /// `SubmitError::MissingSecret` if the environment variable is unset.
    pub fn resolve(&self) -> Result<String, SubmitError> {
        match self {
            Self::Inline(secret) => Ok(secret.clone()),
            Self::Env(name) => {
                std::env::var(name).map_err(|_| SubmitError::MissingSecret(name.clone()))
            }
        }
    }
}

/// One relay account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayCredential {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub secret: SecretRef,
}

/// Why a `host|port|username|password` line was rejected
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CredentialParseError {
    #[error("expected host|port|username|password, found {0} fields")]
    FieldCount(usize),
    #[error("invalid port '{0}'")]
    Port(String),
}

impl FromStr for RelayCredential {
    type Err = CredentialParseError;

    /// Parses `host|port|username|password`. The password is kept inline.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('|').collect();
        let [host, port, username, password] = parts.as_slice() else {
            return Err(CredentialParseError::FieldCount(parts.len()));
        };

        let port = port
            .trim()
            .parse::<u16>()
            .map_err(|_| CredentialParseError::Port((*port).to_string()))?;

        Ok(Self {
            host: host.trim().to_string(),
            port,
            username: username.trim().to_string(),
            secret: SecretRef::Inline((*password).to_string()),
        })
    }
}

/// Parses a relays file: one credential per line, blank lines and lines
/// starting with `#` ignored.
///
/// # Errors
///
/// The one-based line number and the reason of the first bad line.
pub fn parse_relays(text: &str) -> Result<Vec<RelayCredential>, (usize, CredentialParseError)> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| {
            let line = line.trim();
            !line.is_empty() && !line.starts_with('#')
        })
        .map(|(n, line)| line.parse().map_err(|e| (n + 1, e)))
        .collect()
}

/// A bulk send as submitted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitRequest {
    /// Who outcome events are addressed to
    #[serde(default)]
    pub owner: Option<String>,

    pub sender_display_name: String,
    pub subject: String,
    pub html_body: String,

    #[serde(default)]
    pub recipients: Vec<String>,

    #[serde(default)]
    pub relay_credentials: Vec<RelayCredential>,

    /// Clamped to `1..=10`
    #[serde(default = "default_worker_count")]
    pub worker_count: i64,

    #[serde(default)]
    pub template_catalog: Vec<String>,

    #[serde(default)]
    pub link_catalog: Vec<String>,
}

const fn default_worker_count() -> i64 {
    1
}

/// A validated request, ready to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    pub owner: Option<String>,
    pub sender_display_name: String,
    pub subject: String,
    pub html_body: String,
    /// In submission order; syntax is checked per recipient by the workers
    pub recipients: Vec<String>,
    pub relays: Vec<RelayEndpoint>,
    pub worker_count: usize,
    pub catalog: Catalog,
}

impl SubmitRequest {
    /// # Errors
    ///
    /// Returns the first problem found: a missing message field, no
    /// recipients, no relays, or a relay credential that is incomplete or
    /// whose secret cannot be resolved.
    pub fn validate(self) -> Result<JobSpec, SubmitError> {
        for (field, value) in [
            ("sender_display_name", &self.sender_display_name),
            ("subject", &self.subject),
            ("html_body", &self.html_body),
        ] {
            if value.trim().is_empty() {
                return Err(SubmitError::EmptyField(field));
            }
        }

        let recipients: Vec<String> = self
            .recipients
            .iter()
            .map(|r| r.trim())
            .filter(|r| !r.is_empty())
            .map(ToString::to_string)
            .collect();
        if recipients.is_empty() {
            return Err(SubmitError::NoRecipients);
        }

        if self.relay_credentials.is_empty() {
            return Err(SubmitError::NoRelays);
        }

        let relays = self
            .relay_credentials
            .iter()
            .enumerate()
            .map(|(index, credential)| resolve_credential(index, credential))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(JobSpec {
            owner: self.owner,
            sender_display_name: self.sender_display_name,
            subject: self.subject,
            html_body: self.html_body,
            recipients,
            relays,
            worker_count: clamp_workers(self.worker_count),
            catalog: Catalog {
                templates: self.template_catalog,
                links: self.link_catalog,
            },
        })
    }
}

fn resolve_credential(
    index: usize,
    credential: &RelayCredential,
) -> Result<RelayEndpoint, SubmitError> {
    let invalid = |reason: &str| SubmitError::InvalidCredential {
        index,
        reason: reason.to_string(),
    };

    if credential.host.trim().is_empty() {
        return Err(invalid("host is empty"));
    }
    if credential.port == 0 {
        return Err(invalid("port must not be 0"));
    }
    if credential.username.trim().is_empty() {
        return Err(invalid("username is empty"));
    }

    let password = credential.secret.resolve()?;
    if password.is_empty() {
        return Err(invalid("password is empty"));
    }

    Ok(RelayEndpoint::new(
        credential.host.trim(),
        credential.port,
        Credentials::new(credential.username.trim(), password),
    ))
}

fn clamp_workers(requested: i64) -> usize {
    usize::try_from(requested).map_or(MIN_WORKERS, |n| n.clamp(MIN_WORKERS, MAX_WORKERS))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn request() -> SubmitRequest {
        SubmitRequest {
            owner: Some("owner-7".to_string()),
            sender_display_name: "Acme".to_string(),
            subject: "Hello {n:3}".to_string(),
            html_body: "<p>Hi</p>".to_string(),
            recipients: vec!["a@example.com".to_string(), "  ".to_string()],
            relay_credentials: vec!["smtp.relay.test|587|user@relay.test|pw".parse().unwrap()],
            worker_count: 3,
            template_catalog: vec![],
            link_catalog: vec!["https://x.test".to_string()],
        }
    }

    #[test]
    fn test_credential_parsing() {
        let credential: RelayCredential = " mx.test | 587 |me@mx.test|secret ".parse().unwrap();

        assert_eq!(credential.host, "mx.test");
        assert_eq!(credential.port, 587);
        assert_eq!(credential.username, "me@mx.test");
        assert_eq!(credential.secret, SecretRef::Inline("secret".to_string()));
    }

    #[test]
    fn test_password_may_contain_spaces() {
        let credential: RelayCredential = "mx.test|587|me@mx.test|two words".parse().unwrap();
        assert_eq!(credential.secret, SecretRef::Inline("two words".to_string()));
    }

    #[test]
    fn test_credential_errors() {
        assert_eq!(
            "a|b|c".parse::<RelayCredential>().unwrap_err(),
            CredentialParseError::FieldCount(3)
        );
        assert_eq!(
            "a|99999|c|d".parse::<RelayCredential>().unwrap_err(),
            CredentialParseError::Port("99999".to_string())
        );
    }

    #[test]
    fn test_parse_relays_file() {
        let relays = parse_relays(
            "# primary\nsmtp1.test|587|a@x.test|pw1\n\n  \nsmtp2.test|465|b@x.test|pw2\n",
        )
        .unwrap();
        assert_eq!(relays.len(), 2);
        assert_eq!(relays[1].port, 465);

        let err = parse_relays("ok.test|25|u|p\nbroken\n").unwrap_err();
        assert_eq!(err, (2, CredentialParseError::FieldCount(1)));
    }

    #[test]
    fn test_secret_debug_is_redacted() {
        let secret = SecretRef::Inline("hunter2".to_string());
        assert!(!format!("{secret:?}").contains("hunter2"));

        let credential: RelayCredential = "h.test|25|u@h.test|hunter2".parse().unwrap();
        assert!(!format!("{credential:?}").contains("hunter2"));
    }

    #[test]
    fn test_validate() {
        let spec = request().validate().unwrap();
        assert_eq!(spec.recipients, vec!["a@example.com"]);
        assert_eq!(spec.worker_count, 3);
        assert_eq!(spec.relays[0].host, "smtp.relay.test");
        assert_eq!(spec.relays[0].credentials.username(), "user@relay.test");
        assert_eq!(spec.catalog.links, vec!["https://x.test"]);
        assert_eq!(spec.owner.as_deref(), Some("owner-7"));
    }

    #[test]
    fn test_worker_count_is_clamped() {
        for (requested, expected) in [(-4, 1), (0, 1), (1, 1), (7, 7), (10, 10), (64, 10)] {
            let spec = SubmitRequest {
                worker_count: requested,
                ..request()
            }
            .validate()
            .unwrap();
            assert_eq!(spec.worker_count, expected, "requested {requested}");
        }
    }

    #[test]
    fn test_malformed_requests_rejected() {
        assert_eq!(
            SubmitRequest {
                recipients: vec![" ".to_string()],
                ..request()
            }
            .validate(),
            Err(SubmitError::NoRecipients)
        );
        assert_eq!(
            SubmitRequest {
                relay_credentials: vec![],
                ..request()
            }
            .validate(),
            Err(SubmitError::NoRelays)
        );
        assert_eq!(
            SubmitRequest {
                subject: String::new(),
                ..request()
            }
            .validate(),
            Err(SubmitError::EmptyField("subject"))
        );
        assert!(matches!(
            SubmitRequest {
                relay_credentials: vec!["h.test|0|u|p".parse().unwrap()],
                ..request()
            }
            .validate(),
            Err(SubmitError::InvalidCredential { index: 0, .. })
        ));
    }

    #[test]
    fn test_env_secret() {
        let missing = RelayCredential {
            host: "h.test".to_string(),
            port: 587,
            username: "u@h.test".to_string(),
            secret: SecretRef::Env("VOLLEY_TEST_SECRET_THAT_IS_NOT_SET".to_string()),
        };

        assert_eq!(
            SubmitRequest {
                relay_credentials: vec![missing],
                ..request()
            }
            .validate(),
            Err(SubmitError::MissingSecret(
                "VOLLEY_TEST_SECRET_THAT_IS_NOT_SET".to_string()
            ))
        );
    }

    #[test]
    fn test_request_from_ron() {
        let request: SubmitRequest = ron::from_str(
            r#"(
                sender_display_name: "Acme",
                subject: "Hi",
                html_body: "<p>Hi</p>",
                recipients: ["a@example.com"],
                relay_credentials: [
                    (host: "smtp.relay.test", port: 587, username: "u@relay.test", secret: Env("RELAY_PW")),
                ],
                worker_count: 4,
            )"#,
        )
        .unwrap();

        assert_eq!(request.worker_count, 4);
        assert_eq!(request.owner, None);
        assert_eq!(
            request.relay_credentials[0].secret,
            SecretRef::Env("RELAY_PW".to_string())
        );
        assert!(request.template_catalog.is_empty());
    }
}
