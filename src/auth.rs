//! Authentication Pipeline: credential resolution and SSH auth-method
//! negotiation (spec §4.6).
//!
//! Grounded on the teacher's `DeviceHandler::read_need_write`
//! (`device.rs`): a match-against-the-current-line, then-answer idiom.
//! Keyboard-interactive auto-answer reuses that same shape — match a
//! prompt string against a pattern, then return the configured answer —
//! applied to SSH prompts instead of device CLI prompts.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::AuthMethodName;
use crate::error::AuthError;

static PASSWORD_PROMPT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)password").expect("static regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStatus {
    Pending,
    Authenticated,
    Failed,
}

#[derive(Debug, Clone)]
pub enum CredentialSource {
    PostBody,
    HttpBasic,
    Sso,
    ConfiguredDefault,
}

/// A resolved, canonical credential, tagged with where it came from so the
/// pipeline can log/audit the resolution path (spec §4.6).
#[derive(Debug, Clone)]
pub struct Credential {
    pub username: String,
    pub password: Option<String>,
    pub source: CredentialSource,
}

/// Inputs the pipeline may see a credential arrive on, in priority order
/// (spec §4.6: post-body, HTTP Basic, SSO headers, configured default).
#[derive(Debug, Clone, Default)]
pub struct CredentialCandidates {
    pub post_body: Option<(String, String)>,
    pub http_basic: Option<(String, String)>,
    pub sso_headers: Option<(String, String)>,
    pub configured_default: Option<(String, String)>,
}

/// Resolves the first populated source in priority order into a canonical
/// [`Credential`].
pub fn resolve_credential(candidates: &CredentialCandidates) -> Result<Credential, AuthError> {
    if let Some((username, password)) = &candidates.post_body {
        return Ok(Credential { username: username.clone(), password: Some(password.clone()), source: CredentialSource::PostBody });
    }
    if let Some((username, password)) = &candidates.http_basic {
        return Ok(Credential { username: username.clone(), password: Some(password.clone()), source: CredentialSource::HttpBasic });
    }
    if let Some((username, password)) = &candidates.sso_headers {
        return Ok(Credential { username: username.clone(), password: Some(password.clone()), source: CredentialSource::Sso });
    }
    if let Some((username, password)) = &candidates.configured_default {
        return Ok(Credential { username: username.clone(), password: Some(password.clone()), source: CredentialSource::ConfiguredDefault });
    }
    Err(AuthError::NoCredential)
}

/// Rejects a requested auth method before any network I/O if it is not in
/// the configured allowed set (spec §4.6 *AuthMethodDisabled*).
pub fn check_method_allowed(method: AuthMethodName, allowed: &[AuthMethodName]) -> Result<(), AuthError> {
    if allowed.contains(&method) {
        Ok(())
    } else {
        Err(AuthError::AuthMethodDisabled(format!("{method:?}")))
    }
}

/// Keyboard-interactive auto-answer mode: answers a prompt with the
/// resolved password only if the prompt text looks like a password
/// request, matching the teacher's `read_need_write` prompt-match idiom.
pub fn auto_answer_prompt(prompt_text: &str, password: &str) -> Option<String> {
    if PASSWORD_PROMPT.is_match(prompt_text) {
        Some(password.to_string())
    } else {
        None
    }
}

/// Whether every prompt in a keyboard-interactive challenge can be
/// auto-answered (spec §4.6: "auto-answer when every prompt text matches
/// `/password/i`"); if any prompt doesn't match, the pipeline should fall
/// back to forwarding prompts to the browser instead.
pub fn all_prompts_auto_answerable(prompts: &[String]) -> bool {
    prompts.iter().all(|p| PASSWORD_PROMPT.is_match(p))
}

/// `pending -> authenticated | failed` state machine driving one attempt.
pub struct AuthAttempt {
    pub status: AuthStatus,
    pub credential: Option<Credential>,
    pub error: Option<String>,
}

impl AuthAttempt {
    pub fn pending() -> Self {
        Self { status: AuthStatus::Pending, credential: None, error: None }
    }

    pub fn succeed(credential: Credential) -> Self {
        Self { status: AuthStatus::Authenticated, credential: Some(credential), error: None }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self { status: AuthStatus::Failed, credential: None, error: Some(error.into()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_in_priority_order() {
        let candidates = CredentialCandidates {
            post_body: None,
            http_basic: Some(("basic-user".into(), "pw".into())),
            sso_headers: Some(("sso-user".into(), "pw".into())),
            configured_default: Some(("default-user".into(), "pw".into())),
        };
        let credential = resolve_credential(&candidates).expect("resolve");
        assert_eq!(credential.username, "basic-user");
        assert!(matches!(credential.source, CredentialSource::HttpBasic));
    }

    #[test]
    fn no_candidate_is_no_credential_error() {
        let candidates = CredentialCandidates::default();
        let err = resolve_credential(&candidates).expect_err("should fail");
        assert!(matches!(err, AuthError::NoCredential));
    }

    #[test]
    fn disabled_method_fails_before_any_io() {
        let allowed = [AuthMethodName::Password];
        let err = check_method_allowed(AuthMethodName::Publickey, &allowed).expect_err("should be disabled");
        assert!(matches!(err, AuthError::AuthMethodDisabled(_)));
    }

    #[test]
    fn auto_answer_matches_password_prompt_only() {
        assert_eq!(auto_answer_prompt("Password: ", "hunter2"), Some("hunter2".to_string()));
        assert_eq!(auto_answer_prompt("Enter one-time code: ", "hunter2"), None);
    }

    #[test]
    fn all_prompts_auto_answerable_requires_unanimous_match() {
        assert!(all_prompts_auto_answerable(&["Password:".to_string()]));
        assert!(!all_prompts_auto_answerable(&["Password:".to_string(), "OTP:".to_string()]));
    }
}
