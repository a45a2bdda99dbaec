use axum::{extract::FromRequestParts, http::request::Parts};
use tracing::{instrument, trace};

use crate::{
    AppState,
    api::models::users::CurrentUser,
    errors::{Error, Result},
};

/// Read the user id from the configured identity header.
fn user_id_from_header(parts: &Parts, header_name: &str) -> Result<String> {
    let value = parts.headers.get(header_name).ok_or_else(|| Error::Unauthenticated {
        message: Some(format!("Missing {header_name} header")),
    })?;
    let user_id = value.to_str().map_err(|_| Error::Unauthenticated {
        message: Some(format!("Invalid {header_name} header")),
    })?;
    let user_id = user_id.trim();
    if user_id.is_empty() {
        return Err(Error::Unauthenticated {
            message: Some(format!("Empty {header_name} header")),
        });
    }
    Ok(user_id.to_string())
}

impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = Error;

    #[instrument(skip(parts, state), err)]
    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self> {
        let id = user_id_from_header(parts, &state.config.auth.user_header)?;

        // Idempotent: grants the initial credits once, then just returns the account
        state.ledger.open_account(&id, state.config.credits.initial_credits).await?;
        trace!(user_id = %id, "Authenticated via identity header");

        Ok(CurrentUser { id })
    }
}
