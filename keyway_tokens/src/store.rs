use std::{error, fmt, ptr, sync::Arc};

use arc_swap::ArcSwap;
use thiserror::Error;

use crate::{AccessToken, AccessTokenRef};

/// The result of a successful call to the identity service
///
/// The concrete payload is up to the authentication procedure; the store
/// only needs to know which token it carries.
pub trait AuthResult: fmt::Debug + Send + Sync {
    /// Extracts the identifier of the token that was issued
    fn extract_token_id(&self) -> Result<AccessToken, TokenExtractError>;
}

/// An error while extracting a token from an authentication result
#[derive(Debug, Error)]
pub enum TokenExtractError {
    /// The result does not carry a token
    #[error("authentication result does not contain a token")]
    Missing,
    /// The token carried by the result could not be read
    #[error("authentication result contains an unreadable token")]
    Invalid(#[source] Box<dyn error::Error + Send + Sync + 'static>),
}

/// A token together with the authentication result that produced it
#[derive(Debug, Default)]
pub struct TokenState {
    token: Option<AccessToken>,
    auth_result: Option<Arc<dyn AuthResult>>,
}

impl TokenState {
    /// Gets the current token, if any
    #[inline]
    pub fn token(&self) -> Option<&AccessTokenRef> {
        self.token.as_deref()
    }

    /// Gets the authentication result that issued the current token
    ///
    /// This is `None` before the first authentication, or when the token
    /// was installed directly with [`TokenStore::set_token()`].
    #[inline]
    pub fn auth_result(&self) -> Option<&Arc<dyn AuthResult>> {
        self.auth_result.as_ref()
    }
}

/// Shared storage for the current token and its authentication result
///
/// Reads never block. Every write replaces the token and the result together,
/// so a reader can never observe a token paired with another token's result.
pub struct TokenStore {
    current: ArcSwap<TokenState>,
}

impl TokenStore {
    /// Constructs an empty token store
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(TokenState::default()),
        }
    }

    /// Constructs a token store holding a known token
    pub fn with_token(token: AccessToken) -> Self {
        Self {
            current: ArcSwap::from_pointee(TokenState {
                token: Some(token),
                auth_result: None,
            }),
        }
    }

    /// Loads a consistent view of the token and its authentication result
    #[inline]
    pub fn current(&self) -> Arc<TokenState> {
        self.current.load_full()
    }

    /// Gets a copy of the current token
    pub fn token(&self) -> Option<AccessToken> {
        self.current.load().token.clone()
    }

    /// Gets the authentication result that issued the current token
    pub fn auth_result(&self) -> Option<Arc<dyn AuthResult>> {
        self.current.load().auth_result.clone()
    }

    /// Checks whether the current token is the given one
    pub fn holds(&self, token: &AccessTokenRef) -> bool {
        self.current.load().token.as_deref() == Some(token)
    }

    /// Replaces the current token, discarding any authentication result
    pub fn set_token(&self, token: AccessToken) {
        self.current.store(Arc::new(TokenState {
            token: Some(token),
            auth_result: None,
        }));
        tracing::debug!("token replaced");
    }

    /// Replaces the current token with the one carried by `result`
    ///
    /// If no token can be extracted, the store is left untouched.
    pub fn set_auth_result(&self, result: Arc<dyn AuthResult>) -> Result<(), TokenExtractError> {
        let token = result.extract_token_id()?;
        self.current.store(Arc::new(TokenState {
            token: Some(token),
            auth_result: Some(result),
        }));
        tracing::info!("installed token from new authentication result");
        Ok(())
    }

    /// Forgets the current token and authentication result
    pub fn clear(&self) {
        self.current.store(Arc::new(TokenState::default()));
    }

    /// Copies the token and authentication result held by `other`
    pub fn copy_from(&self, other: &TokenStore) {
        if ptr::eq(self, other) {
            return;
        }

        self.current.store(other.current.load_full());
    }
}

impl Default for TokenStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let current = self.current.load();
        f.debug_struct("TokenStore")
            .field("token", &current.token)
            .field("has_auth_result", &current.auth_result.is_some())
            .finish()
    }
}
