//! Recognition of organization SSO-enforcement rejections.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::RemoteError;

/// Organization reported when none can be read from the message.
pub const PLACEHOLDER_ORGANIZATION: &str = "unknown";

const SSO_KEYWORDS: &[&str] = &["sso", "saml", "single sign-on"];
const ENFORCEMENT_KEYWORD: &str = "enforc";

// Words that can follow "organization" without being its name.
const NOT_A_NAME: &[&str] = &[
    "sso",
    "saml",
    "single",
    "has",
    "is",
    "requires",
    "enforces",
    "enforcement",
    "policy",
    "the",
    "this",
];

static ORGS_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\borgs/([a-z0-9][a-z0-9_.-]*)").expect("static regex")
});

static QUOTED_BEFORE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)["'`]([a-z0-9][a-z0-9_.-]*)["'`]\s+organization\b"#).expect("static regex")
});

static AFTER_KEYWORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\borganization\s*:?\s+["'`]?([a-z0-9][a-z0-9_-]*)"#).expect("static regex")
});

/// A classified SSO-enforcement rejection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SsoError {
    pub organization: String,
    pub message: String,
}

impl SsoError {
    pub fn has_placeholder_organization(&self) -> bool {
        self.organization == PLACEHOLDER_ORGANIZATION
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn new() -> Self {
        Self
    }

    /// `Some` only for a 403 whose message names both SSO and enforcement.
    pub fn classify(&self, error: &RemoteError) -> Option<SsoError> {
        if !error.is_forbidden() {
            return None;
        }

        let lower = error.message.to_lowercase();
        let mentions_sso = SSO_KEYWORDS.iter().any(|k| lower.contains(k));
        if !mentions_sso || !lower.contains(ENFORCEMENT_KEYWORD) {
            return None;
        }

        let organization = extract_organization(&error.message)
            .unwrap_or_else(|| PLACEHOLDER_ORGANIZATION.to_string());

        Some(SsoError {
            organization,
            message: error.message.clone(),
        })
    }

    pub fn is_sso_error(&self, error: &RemoteError) -> bool {
        self.classify(error).is_some()
    }
}

fn extract_organization(message: &str) -> Option<String> {
    if let Some(caps) = ORGS_PATH.captures(message) {
        return Some(trim_name(&caps[1]));
    }
    if let Some(caps) = QUOTED_BEFORE.captures(message) {
        return Some(caps[1].to_string());
    }
    AFTER_KEYWORD
        .captures_iter(message)
        .map(|caps| trim_name(&caps[1]))
        .find(|name| !NOT_A_NAME.contains(&name.to_lowercase().as_str()))
}

// Path captures may swallow trailing sentence punctuation.
fn trim_name(name: &str) -> String {
    name.trim_end_matches(['.', '-', '_']).to_string()
}
