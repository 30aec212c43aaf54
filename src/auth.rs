//! Authentication tokens sent during the connection handshake.

use crate::error::{DriverError, DriverResult};
use crate::models::Params;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use subtle::ConstantTimeEq;

/// Credentials presented when a physical connection is opened.
#[derive(Clone, PartialEq)]
pub enum AuthToken {
    /// No authentication; only accepted by servers with auth disabled.
    None,
    Basic {
        username: String,
        password: String,
        realm: Option<String>,
    },
    /// Base64-encoded Kerberos ticket.
    Kerberos { ticket: String },
    /// Base64-encoded bearer token (e.g. an SSO access token).
    Bearer { token: String },
    Custom {
        principal: String,
        credentials: String,
        realm: String,
        scheme: String,
        parameters: Option<Params>,
    },
}

impl AuthToken {
    pub fn none() -> Self {
        Self::None
    }

    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Basic {
            username: username.into(),
            password: password.into(),
            realm: None,
        }
    }

    pub fn basic_with_realm(
        username: impl Into<String>,
        password: impl Into<String>,
        realm: impl Into<String>,
    ) -> Self {
        Self::Basic {
            username: username.into(),
            password: password.into(),
            realm: Some(realm.into()),
        }
    }

    /// Create a Kerberos token. The ticket must be valid base64.
    pub fn kerberos(base64_ticket: impl Into<String>) -> DriverResult<Self> {
        let ticket = validate_base64("Kerberos ticket", base64_ticket.into())?;
        Ok(Self::Kerberos { ticket })
    }

    /// Create a bearer token. The token must be valid base64.
    pub fn bearer(base64_token: impl Into<String>) -> DriverResult<Self> {
        let token = validate_base64("Bearer token", base64_token.into())?;
        Ok(Self::Bearer { token })
    }

    pub fn custom(
        principal: impl Into<String>,
        credentials: impl Into<String>,
        realm: impl Into<String>,
        scheme: impl Into<String>,
        parameters: Option<Params>,
    ) -> Self {
        Self::Custom {
            principal: principal.into(),
            credentials: credentials.into(),
            realm: realm.into(),
            scheme: scheme.into(),
            parameters,
        }
    }

    /// Scheme name as sent to the server.
    pub fn scheme(&self) -> &str {
        match self {
            Self::None => "none",
            Self::Basic { .. } => "basic",
            Self::Kerberos { .. } => "kerberos",
            Self::Bearer { .. } => "bearer",
            Self::Custom { scheme, .. } => scheme,
        }
    }

    /// Principal for logging. Never includes the secret.
    pub fn principal(&self) -> Option<&str> {
        match self {
            Self::Basic { username, .. } => Some(username),
            Self::Custom { principal, .. } => Some(principal),
            _ => None,
        }
    }

    /// Check basic credentials in constant time.
    pub fn matches_basic(&self, expected_username: &str, expected_password: &str) -> bool {
        match self {
            Self::Basic {
                username, password, ..
            } => {
                // Evaluate both comparisons so timing does not reveal which one failed.
                let user_ok = constant_time_eq(username.as_bytes(), expected_username.as_bytes());
                let pass_ok = constant_time_eq(password.as_bytes(), expected_password.as_bytes());
                user_ok & pass_ok
            }
            _ => false,
        }
    }
}

impl std::fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => f.write_str("AuthToken::None"),
            Self::Basic {
                username,
                password,
                realm,
            } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &mask_secret(password))
                .field("realm", realm)
                .finish(),
            Self::Kerberos { ticket } => f
                .debug_struct("Kerberos")
                .field("ticket", &mask_secret(ticket))
                .finish(),
            Self::Bearer { token } => f
                .debug_struct("Bearer")
                .field("token", &mask_secret(token))
                .finish(),
            Self::Custom {
                principal,
                credentials,
                realm,
                scheme,
                parameters,
            } => f
                .debug_struct("Custom")
                .field("principal", principal)
                .field("credentials", &mask_secret(credentials))
                .field("realm", realm)
                .field("scheme", scheme)
                .field("parameters", parameters)
                .finish(),
        }
    }
}

fn validate_base64(what: &str, value: String) -> DriverResult<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(DriverError::configuration(format!("{what} is empty")));
    }
    STANDARD
        .decode(trimmed)
        .map_err(|e| DriverError::configuration(format!("{what} is not valid base64: {e}")))?;
    Ok(trimmed.to_string())
}

pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

pub(crate) fn mask_secret(secret: &str) -> String {
    if secret.chars().count() <= 3 {
        "***".to_string()
    } else {
        format!("{}***", secret.chars().take(3).collect::<String>())
    }
}
