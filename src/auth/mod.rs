//! Upload credentials
//!
//! The uploader never signs anything itself. Tokens are produced by an
//! external signer and handed to the engine through [`TokenProvider`].
//!
//! # Implementations
//!
//! - `StaticToken` - A token passed in by the caller or the config file
//! - `EnvToken` - A token read from an environment variable
//!
//! # Example
//!
//! ```
//! use wcs_uploadr::auth::{StaticToken, TokenProvider};
//!
//! let provider = StaticToken::new("ak:sig:policy");
//! assert_eq!(provider.upload_token("movie.mp4").unwrap(), "ak:sig:policy");
//! ```

use thiserror::Error;

/// Default environment variable for [`EnvToken`]
pub const DEFAULT_TOKEN_ENV: &str = "WCS_UPLOAD_TOKEN";

/// Credential errors
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Missing upload token: {0}")]
    MissingToken(String),

    #[error("Invalid upload token: {0}")]
    InvalidToken(String),
}

/// Produces the `Authorization` value for one upload session.
///
/// The same credential is used for every mkblk, bput and mkfile call of the
/// session, so it must stay valid for the whole transfer.
pub trait TokenProvider: Send + Sync {
    /// Token authorizing an upload of `key`
    fn upload_token(&self, key: &str) -> Result<String, AuthError>;
}

/// A fixed token
#[derive(Debug, Clone)]
pub struct StaticToken {
    token: String,
}

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl TokenProvider for StaticToken {
    fn upload_token(&self, _key: &str) -> Result<String, AuthError> {
        validate_token(&self.token)?;
        Ok(self.token.clone())
    }
}

/// A token read from the environment on every call
#[derive(Debug, Clone)]
pub struct EnvToken {
    var: String,
}

impl EnvToken {
    /// Read the token from `var`
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl Default for EnvToken {
    fn default() -> Self {
        Self::new(DEFAULT_TOKEN_ENV)
    }
}

impl TokenProvider for EnvToken {
    fn upload_token(&self, _key: &str) -> Result<String, AuthError> {
        let token = std::env::var(&self.var)
            .map_err(|_| AuthError::MissingToken(format!("{} not set", self.var)))?;
        validate_token(&token)?;
        Ok(token)
    }
}

/// Tokens end up in an HTTP header, so they must be non-empty and free of
/// control characters.
pub fn validate_token(token: &str) -> Result<(), AuthError> {
    if token.trim().is_empty() {
        return Err(AuthError::MissingToken("token is empty".into()));
    }
    if token.chars().any(|c| c.is_control()) {
        return Err(AuthError::InvalidToken(
            "token contains control characters".into(),
        ));
    }
    Ok(())
}
