//! Join credentials and session tokens.
//!
//! A session token is an HS256 JWT signed with the account's SDK secret.
//! The client checks its shape before connecting; the server verifies the
//! signature.

use std::sync::LazyLock;

use chrono::{Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::errors::HuddleError;

const MAX_PASSWORD_LEN: usize = 10;
const TOKEN_LIFETIME_HOURS: i64 = 2;

/// Validity of tokens minted from a key and secret.
pub fn token_lifetime() -> Duration {
    Duration::hours(TOKEN_LIFETIME_HOURS)
}

static SESSION_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9 !#$%&()+\-:;<=>.?@\[\]^_{|}~,]+$").expect("session name pattern")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Participant,
    Host,
}

impl Role {
    pub fn role_type(self) -> u8 {
        match self {
            Role::Participant => 0,
            Role::Host => 1,
        }
    }

    pub fn from_role_type(value: u8) -> Option<Self> {
        match value {
            0 => Some(Role::Participant),
            1 => Some(Role::Host),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    /// A token minted by the application backend.
    Token(String),
    /// Mint the token locally from the SDK key and secret.
    KeySecret {
        key: String,
        secret: String,
        role: Role,
    },
}

/// Media to bring up right after joining.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JoinOptions {
    pub connect_audio: bool,
    pub mute_audio: bool,
    pub start_video: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequest {
    pub session_name: String,
    pub user_name: String,
    pub credentials: Credentials,
    pub password: Option<String>,
    pub custom_user_id: Option<String>,
    pub options: JoinOptions,
}

impl JoinRequest {
    pub fn with_token(
        session_name: impl Into<String>,
        user_name: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            session_name: session_name.into(),
            user_name: user_name.into(),
            credentials: Credentials::Token(token.into()),
            password: None,
            custom_user_id: None,
            options: JoinOptions::default(),
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_options(mut self, options: JoinOptions) -> Self {
        self.options = options;
        self
    }

    /// Synchronous checks done before any network activity.
    pub fn validate(&self, config: &EngineConfig) -> Result<(), HuddleError> {
        let name = self.session_name.trim();
        if name.is_empty() {
            return Err(HuddleError::NoSessionName);
        }
        if name.chars().count() > config.max_session_name_len {
            return Err(HuddleError::SessionNameTooLong);
        }
        if !SESSION_NAME.is_match(name) {
            return Err(HuddleError::InvalidSessionName);
        }
        if self.user_name.trim().is_empty() {
            return Err(HuddleError::NoUserName);
        }
        if let Some(pw) = &self.password {
            if pw.chars().count() > MAX_PASSWORD_LEN {
                return Err(HuddleError::InvalidPassword);
            }
        }
        match &self.credentials {
            Credentials::Token(token) => {
                if token.trim().is_empty() {
                    return Err(HuddleError::NoSessionToken);
                }
                let claims = peek_claims(token)?;
                check_claims(&claims, name, config)
            }
            Credentials::KeySecret { key, secret, .. } => {
                if key.is_empty() || secret.is_empty() {
                    return Err(HuddleError::AuthEmptyKeyOrSecret);
                }
                Ok(())
            }
        }
    }

    /// The token to present to the server, minting one if needed.
    pub fn resolve_token(&self) -> Result<String, HuddleError> {
        match &self.credentials {
            Credentials::Token(token) => Ok(token.clone()),
            Credentials::KeySecret { key, secret, role } => {
                let issuer = TokenIssuer::new(key, secret)?;
                issuer.issue(
                    self.session_name.trim(),
                    *role,
                    self.custom_user_id.as_deref(),
                    token_lifetime(),
                )
            }
        }
    }
}

/// Claims carried by a session token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    pub app_key: String,
    /// Session name ("topic").
    #[serde(default)]
    pub tpc: String,
    pub role_type: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_identity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    pub version: u8,
    pub iat: i64,
    pub exp: i64,
}

impl SessionClaims {
    pub fn role(&self) -> Option<Role> {
        Role::from_role_type(self.role_type)
    }
}

/// Decode claims without checking the signature or expiry.
pub fn peek_claims(token: &str) -> Result<SessionClaims, HuddleError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.required_spec_claims.clear();
    decode::<SessionClaims>(token, &DecodingKey::from_secret(&[]), &validation)
        .map(|data| data.claims)
        .map_err(|e| {
            tracing::debug!("unreadable session token: {e}");
            HuddleError::InvalidSessionToken
        })
}

/// Checks that do not need the secret.
pub fn check_claims(
    claims: &SessionClaims,
    session_name: &str,
    config: &EngineConfig,
) -> Result<(), HuddleError> {
    if claims.tpc.trim().is_empty() {
        return Err(HuddleError::TokenNoSessionName);
    }
    if claims.tpc != session_name {
        return Err(HuddleError::TokenMismatchedSessionName);
    }
    if claims.role().is_none() {
        return Err(HuddleError::TokenRoleTypeInvalid);
    }
    if let Some(identity) = &claims.user_identity {
        if identity.chars().count() > config.max_user_identity_len {
            return Err(HuddleError::TokenUserIdentityTooLong);
        }
    }
    Ok(())
}

/// Signs and verifies session tokens for one SDK key.
#[derive(Clone)]
pub struct TokenIssuer {
    key: String,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl std::fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenIssuer").field("key", &self.key).finish()
    }
}

impl TokenIssuer {
    pub fn new(key: &str, secret: &str) -> Result<Self, HuddleError> {
        if key.is_empty() || secret.is_empty() {
            return Err(HuddleError::AuthEmptyKeyOrSecret);
        }
        Ok(Self {
            key: key.to_string(),
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn issue(
        &self,
        session_name: &str,
        role: Role,
        user_identity: Option<&str>,
        ttl: Duration,
    ) -> Result<String, HuddleError> {
        let now = Utc::now();
        let claims = SessionClaims {
            app_key: self.key.clone(),
            tpc: session_name.to_string(),
            role_type: role.role_type(),
            user_identity: user_identity.map(str::to_string),
            session_key: None,
            version: 1,
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
        };
        self.sign(&claims)
    }

    pub fn sign(&self, claims: &SessionClaims) -> Result<String, HuddleError> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding_key)
            .map_err(|e| HuddleError::Internal(format!("failed to sign session token: {e}")))
    }

    /// Full verification: signature, expiry and key.
    pub fn verify(&self, token: &str) -> Result<SessionClaims, HuddleError> {
        let validation = Validation::new(Algorithm::HS256);
        let claims = decode::<SessionClaims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::InvalidSignature => {
                    HuddleError::AuthWrongKeyOrSecret
                }
                _ => HuddleError::InvalidSessionToken,
            })?;
        if claims.app_key != self.key {
            return Err(HuddleError::AuthWrongKeyOrSecret);
        }
        Ok(claims)
    }
}
