//! Bearer token acquisition and refresh for fabric-deploy.
//!
//! Tokens come from a pluggable [`TokenCredential`]:
//! - a fixed string ([`StaticTokenCredential`])
//! - an environment variable (`FABRIC_DEPLOY_TOKEN` by default)
//! - a file re-read on every refresh (for externally rotated tokens)
//!
//! The JWT payload is base64-decoded to read `exp` and the identity claims.
//! The signature is NOT verified: the credential provider is the trust
//! boundary, and the claims are only used for expiry tracking and logging.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use fabric_deploy_auth::{EnvTokenCredential, TokenManager, DEFAULT_SCOPE};
//! use fabric_deploy_types::{shared, ConsoleReporter};
//!
//! let tokens = TokenManager::new(
//!     Arc::new(EnvTokenCredential::default()),
//!     DEFAULT_SCOPE,
//!     shared(ConsoleReporter),
//!     true,
//! )?;
//! let bearer = tokens.bearer()?;
//! # Ok::<(), fabric_deploy_auth::AuthError>(())
//! ```

use std::env;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use anyhow::{Context, bail};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use fabric_deploy_types::{ReporterHandle, SharedReporter};
use serde::Deserialize;
use thiserror::Error;

/// Scope requested from the credential provider.
pub const DEFAULT_SCOPE: &str = "https://api.fabric.microsoft.com/.default";

/// Environment variable read by [`EnvTokenCredential::default`].
pub const TOKEN_ENV: &str = "FABRIC_DEPLOY_TOKEN";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("Failed to acquire AAD token. {0}")]
    Acquire(String),
    #[error("The token has an invalid JWT format")]
    MalformedToken,
    #[error("An unexpected error occurred while decoding the credential token. {0}")]
    Decode(String),
    #[error("Token does not contain expiration claim.")]
    MissingExpiry,
}

/// Source of bearer tokens.
pub trait TokenCredential: Send + Sync {
    fn get_token(&self, scope: &str) -> anyhow::Result<String>;
}

/// Always returns the same token.
#[derive(Clone)]
pub struct StaticTokenCredential {
    token: String,
}

impl StaticTokenCredential {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl fmt::Debug for StaticTokenCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticTokenCredential")
            .field("token", &"<redacted>")
            .finish()
    }
}

impl TokenCredential for StaticTokenCredential {
    fn get_token(&self, _scope: &str) -> anyhow::Result<String> {
        Ok(self.token.clone())
    }
}

/// Reads the token from an environment variable on every refresh.
#[derive(Debug, Clone)]
pub struct EnvTokenCredential {
    var: String,
}

impl EnvTokenCredential {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl Default for EnvTokenCredential {
    fn default() -> Self {
        Self::new(TOKEN_ENV)
    }
}

impl TokenCredential for EnvTokenCredential {
    fn get_token(&self, _scope: &str) -> anyhow::Result<String> {
        let token = env::var(&self.var)
            .with_context(|| format!("environment variable {} is not set", self.var))?;
        let token = token.trim();
        if token.is_empty() {
            bail!("environment variable {} is empty", self.var);
        }
        Ok(token.to_string())
    }
}

/// Reads the token from a file on every refresh.
#[derive(Debug, Clone)]
pub struct FileTokenCredential {
    path: PathBuf,
}

impl FileTokenCredential {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl TokenCredential for FileTokenCredential {
    fn get_token(&self, _scope: &str) -> anyhow::Result<String> {
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read token file {}", self.path.display()))?;
        let token = content.trim();
        if token.is_empty() {
            bail!("token file {} is empty", self.path.display());
        }
        Ok(token.to_string())
    }
}

/// Claims read from the JWT payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TokenClaims {
    pub exp: Option<i64>,
    pub upn: Option<String>,
    pub appid: Option<String>,
    pub oid: Option<String>,
}

impl TokenClaims {
    pub fn identity(&self) -> Identity {
        if let Some(upn) = &self.upn {
            Identity::User(upn.clone())
        } else if let Some(appid) = &self.appid {
            Identity::Application(appid.clone())
        } else if let Some(oid) = &self.oid {
            Identity::Object(oid.clone())
        } else {
            Identity::Unknown
        }
    }
}

/// Decode the JWT payload without verifying the signature.
pub fn decode_claims(token: &str) -> Result<TokenClaims, AuthError> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return Err(AuthError::MalformedToken);
    }

    let payload = parts[1].trim_end_matches('=');
    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| AuthError::Decode(e.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|e| AuthError::Decode(e.to_string()))
}

/// Kind of principal the token was issued to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    User(String),
    Application(String),
    Object(String),
    Unknown,
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::User(upn) => write!(f, "User '{upn}'"),
            Identity::Application(appid) => write!(f, "Application Id '{appid}'"),
            Identity::Object(oid) => write!(f, "Object Id '{oid}'"),
            Identity::Unknown => write!(f, "unknown identity"),
        }
    }
}

/// Cached token with its decoded expiry and identity.
#[derive(Clone)]
pub struct TokenState {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub identity: Identity,
}

impl TokenState {
    pub fn from_token(token: String) -> Result<Self, AuthError> {
        let claims = decode_claims(&token)?;
        let exp = claims.exp.ok_or(AuthError::MissingExpiry)?;
        let expires_at = DateTime::from_timestamp(exp, 0)
            .ok_or_else(|| AuthError::Decode(format!("exp claim {exp} is out of range")))?;
        Ok(Self {
            token,
            expires_at,
            identity: claims.identity(),
        })
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

impl fmt::Debug for TokenState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenState")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("identity", &self.identity)
            .finish()
    }
}

/// Owns the cached bearer token.
///
/// Refresh happens lazily: on construction, when the cached token is past its
/// expiry, or when forced after the server reports the token expired.
///
/// Workers share one manager. Two workers that observe expiry at the same time
/// may both refresh; the second refresh replaces an already valid token and is
/// otherwise harmless.
pub struct TokenManager {
    credential: Arc<dyn TokenCredential>,
    scope: String,
    state: RwLock<Option<TokenState>>,
    reporter: SharedReporter,
    print_identity: bool,
}

impl TokenManager {
    /// Create the manager and acquire the first token.
    pub fn new(
        credential: Arc<dyn TokenCredential>,
        scope: &str,
        reporter: SharedReporter,
        print_identity: bool,
    ) -> Result<Self, AuthError> {
        let manager = Self {
            credential,
            scope: scope.to_string(),
            state: RwLock::new(None),
            reporter,
            print_identity,
        };
        manager.refresh_if_expired()?;
        Ok(manager)
    }

    /// Current token, refreshed first if it has expired.
    pub fn bearer(&self) -> Result<String, AuthError> {
        self.refresh_if_expired()?;
        self.read_state()
            .map(|state| state.token)
            .ok_or_else(|| AuthError::Acquire("no token available".to_string()))
    }

    /// Refresh when no token is cached or the cached one has expired.
    /// Returns whether a refresh happened.
    pub fn refresh_if_expired(&self) -> Result<bool, AuthError> {
        let now = Utc::now();
        let stale = self
            .read_state()
            .is_none_or(|state| state.is_expired_at(now));
        if stale {
            self.force_refresh()?;
        }
        Ok(stale)
    }

    /// Acquire a new token unconditionally.
    pub fn force_refresh(&self) -> Result<(), AuthError> {
        let token = self
            .credential
            .get_token(&self.scope)
            .map_err(|e| AuthError::Acquire(format!("{e:#}")))?;
        let state = TokenState::from_token(token)?;

        if self.print_identity && state.identity != Identity::Unknown {
            self.reporter
                .info(&format!("Executing as {}", state.identity));
        }

        let mut guard = self.state.write().unwrap_or_else(|p| p.into_inner());
        *guard = Some(state);
        Ok(())
    }

    pub fn identity(&self) -> Option<Identity> {
        self.read_state().map(|state| state.identity)
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.read_state().map(|state| state.expires_at)
    }

    fn read_state(&self) -> Option<TokenState> {
        self.state
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

impl fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenManager")
            .field("scope", &self.scope)
            .field("state", &self.read_state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD;
    use fabric_deploy_types::Reporter;
    use serial_test::serial;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn jwt(payload: &str) -> String {
        format!(
            "{}.{}.{}",
            URL_SAFE_NO_PAD.encode(r#"{"alg":"none"}"#),
            URL_SAFE_NO_PAD.encode(payload),
            "signature"
        )
    }

    fn future_exp() -> i64 {
        Utc::now().timestamp() + 3600
    }

    #[derive(Default)]
    struct CollectingReporter {
        infos: Vec<String>,
    }

    impl Reporter for CollectingReporter {
        fn info(&mut self, msg: &str) {
            self.infos.push(msg.to_string());
        }

        fn warn(&mut self, _msg: &str) {}

        fn error(&mut self, _msg: &str) {}
    }

    struct CountingCredential {
        tokens: Vec<String>,
        calls: AtomicUsize,
    }

    impl TokenCredential for CountingCredential {
        fn get_token(&self, _scope: &str) -> anyhow::Result<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.tokens[n.min(self.tokens.len() - 1)].clone())
        }
    }

    struct FailingCredential;

    impl TokenCredential for FailingCredential {
        fn get_token(&self, _scope: &str) -> anyhow::Result<String> {
            bail!("no credential configured")
        }
    }

    fn manager_with(
        credential: Arc<dyn TokenCredential>,
        print_identity: bool,
    ) -> (Result<TokenManager, AuthError>, Arc<Mutex<CollectingReporter>>) {
        let collecting = Arc::new(Mutex::new(CollectingReporter::default()));
        let reporter: SharedReporter = collecting.clone();
        let manager = TokenManager::new(credential, DEFAULT_SCOPE, reporter, print_identity);
        (manager, collecting)
    }

    #[test]
    fn decode_reads_all_claims() {
        let token = jwt(r#"{"exp":1700000000,"upn":"a@b.com","appid":"app","oid":"obj"}"#);
        let claims = decode_claims(&token).expect("decode");
        assert_eq!(claims.exp, Some(1_700_000_000));
        assert_eq!(claims.upn.as_deref(), Some("a@b.com"));
        assert_eq!(claims.identity(), Identity::User("a@b.com".to_string()));
    }

    #[test]
    fn decode_accepts_padded_payload() {
        let payload = STANDARD.encode(r#"{"exp":12}"#);
        assert!(payload.ends_with('='));
        let payload = payload.replace('+', "-").replace('/', "_");
        let token = format!("h.{payload}.s");
        assert_eq!(decode_claims(&token).expect("decode").exp, Some(12));
    }

    #[test]
    fn decode_rejects_wrong_part_count() {
        assert_eq!(decode_claims("a.b"), Err(AuthError::MalformedToken));
        assert_eq!(decode_claims("a.b.c.d"), Err(AuthError::MalformedToken));
    }

    #[test]
    fn decode_rejects_non_json_payload() {
        let token = format!("h.{}.s", URL_SAFE_NO_PAD.encode("not json"));
        assert!(matches!(decode_claims(&token), Err(AuthError::Decode(_))));
    }

    #[test]
    fn identity_precedence() {
        let app = TokenClaims {
            appid: Some("app".into()),
            oid: Some("obj".into()),
            ..Default::default()
        };
        assert_eq!(app.identity().to_string(), "Application Id 'app'");

        let obj = TokenClaims {
            oid: Some("obj".into()),
            ..Default::default()
        };
        assert_eq!(obj.identity().to_string(), "Object Id 'obj'");
        assert_eq!(TokenClaims::default().identity(), Identity::Unknown);
    }

    #[test]
    fn missing_expiry_is_an_error() {
        let err = TokenState::from_token(jwt(r#"{"upn":"x"}"#)).expect_err("no exp");
        assert_eq!(err, AuthError::MissingExpiry);
        assert_eq!(err.to_string(), "Token does not contain expiration claim.");
    }

    #[test]
    fn manager_acquires_on_construction_and_logs_identity() {
        let credential = Arc::new(CountingCredential {
            tokens: vec![jwt(&format!(r#"{{"exp":{},"upn":"me@x.com"}}"#, future_exp()))],
            calls: AtomicUsize::new(0),
        });
        let (manager, collecting) = manager_with(credential.clone(), true);
        let manager = manager.expect("manager");

        assert_eq!(credential.calls.load(Ordering::SeqCst), 1);
        assert!(manager.bearer().expect("bearer").contains('.'));
        assert_eq!(credential.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            collecting.lock().expect("lock").infos,
            vec!["Executing as User 'me@x.com'"]
        );
    }

    #[test]
    fn identity_logging_can_be_disabled() {
        let credential = Arc::new(StaticTokenCredential::new(jwt(&format!(
            r#"{{"exp":{},"appid":"app"}}"#,
            future_exp()
        ))));
        let (manager, collecting) = manager_with(credential, false);
        assert!(manager.is_ok());
        assert!(collecting.lock().expect("lock").infos.is_empty());
    }

    #[test]
    fn expired_token_is_refreshed_on_bearer() {
        let past = Utc::now().timestamp() - 10;
        let credential = Arc::new(CountingCredential {
            tokens: vec![
                jwt(&format!(r#"{{"exp":{past}}}"#)),
                jwt(&format!(r#"{{"exp":{}}}"#, future_exp())),
            ],
            calls: AtomicUsize::new(0),
        });
        let (manager, _) = manager_with(credential.clone(), true);
        let manager = manager.expect("manager");

        manager.bearer().expect("bearer");
        assert_eq!(credential.calls.load(Ordering::SeqCst), 2);
        manager.bearer().expect("bearer");
        assert_eq!(credential.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn force_refresh_always_acquires() {
        let credential = Arc::new(CountingCredential {
            tokens: vec![jwt(&format!(r#"{{"exp":{}}}"#, future_exp()))],
            calls: AtomicUsize::new(0),
        });
        let (manager, _) = manager_with(credential.clone(), true);
        let manager = manager.expect("manager");
        manager.force_refresh().expect("refresh");
        assert_eq!(credential.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn credential_failure_surfaces_as_acquire_error() {
        let (manager, _) = manager_with(Arc::new(FailingCredential), true);
        let err = manager.expect_err("should fail");
        assert!(matches!(err, AuthError::Acquire(ref m) if m.contains("no credential configured")));
    }

    #[test]
    #[serial]
    fn env_credential_reads_variable() {
        temp_env::with_var(TOKEN_ENV, Some("  abc.def.ghi \n"), || {
            let token = EnvTokenCredential::default()
                .get_token(DEFAULT_SCOPE)
                .expect("token");
            assert_eq!(token, "abc.def.ghi");
        });
        temp_env::with_var_unset(TOKEN_ENV, || {
            assert!(EnvTokenCredential::default().get_token(DEFAULT_SCOPE).is_err());
        });
    }

    #[test]
    fn file_credential_reads_trimmed_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("token.txt");
        std::fs::write(&path, "tok.en.value\n").expect("write");
        let token = FileTokenCredential::new(&path)
            .get_token(DEFAULT_SCOPE)
            .expect("token");
        assert_eq!(token, "tok.en.value");

        std::fs::write(&path, "   ").expect("write");
        assert!(FileTokenCredential::new(&path).get_token(DEFAULT_SCOPE).is_err());
    }

    #[test]
    fn debug_output_redacts_token() {
        let debug = format!("{:?}", StaticTokenCredential::new("secret-token"));
        assert!(!debug.contains("secret-token"));
    }
}
