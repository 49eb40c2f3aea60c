use thiserror::Error;
use tracing::{info, warn};

use crate::api_client::{ApiClient, ApiError, AuthResponse, LoginRequest, SignupRequest};
use crate::cli::chat::session::clear_credentials;
use crate::cli::chat::store::{KeyValueStore, StoreError, TOKEN_KEY, USER_KEY};

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("{0} is required")]
    MissingField(&'static str),

    #[error("{0}")]
    Api(#[from] ApiError),

    #[error("signed in, but the session could not be saved: {0}")]
    Store(#[from] StoreError),
}

impl AuthError {
    /// Text shown to the user when an auth attempt fails.
    pub fn user_message(&self) -> String {
        match self {
            AuthError::Api(ApiError::Status { detail, .. }) => detail.clone(),
            AuthError::Api(ApiError::Transport(_)) => {
                "Could not reach the server. Please try again.".to_string()
            }
            other => other.to_string(),
        }
    }
}

fn require(field: &'static str, value: &str) -> Result<(), AuthError> {
    if value.trim().is_empty() {
        return Err(AuthError::MissingField(field));
    }
    Ok(())
}

pub async fn login(
    client: &ApiClient,
    store: &dyn KeyValueStore,
    email: &str,
    password: &str,
) -> Result<AuthResponse, AuthError> {
    require("email", email)?;
    require("password", password)?;

    let response = client
        .login(&LoginRequest {
            email: email.trim(),
            password,
        })
        .await?;

    save_session(store, &response)?;
    info!("Logged in as {}", email.trim());
    Ok(response)
}

pub async fn signup(
    client: &ApiClient,
    store: &dyn KeyValueStore,
    name: &str,
    email: &str,
    password: &str,
) -> Result<AuthResponse, AuthError> {
    require("name", name)?;
    require("email", email)?;
    require("password", password)?;

    let response = client
        .signup(&SignupRequest {
            name: name.trim(),
            email: email.trim(),
            password,
        })
        .await?;

    save_session(store, &response)?;
    info!("Signed up as {}", email.trim());
    Ok(response)
}

/// Forget the stored credentials. Chat history is left alone.
pub fn logout(store: &dyn KeyValueStore) {
    clear_credentials(store);
    info!("Logged out");
}

pub fn is_logged_in(store: &dyn KeyValueStore) -> bool {
    match store.get(TOKEN_KEY) {
        Ok(token) => token.is_some_and(|t| !t.is_empty()),
        Err(e) => {
            warn!("Failed to read auth token: {}", e);
            false
        }
    }
}

fn save_session(store: &dyn KeyValueStore, response: &AuthResponse) -> Result<(), StoreError> {
    store.set(TOKEN_KEY, &response.token)?;

    match &response.user {
        Some(user) => store.set(USER_KEY, &user.to_string())?,
        // Don't leave a previous account's record next to the new token
        None => store.remove(USER_KEY)?,
    }

    Ok(())
}
