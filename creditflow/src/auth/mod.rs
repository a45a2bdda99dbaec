//! Caller identity.
//!
//! Authentication happens upstream: an identity proxy in front of the service sets a header
//! (`auth.user_header`, default `x-user-id`) carrying the opaque user id. Handlers take a
//! [`CurrentUser`](crate::api::models::users::CurrentUser) argument, which rejects requests without
//! the header and opens the caller's credit account on first sight.

pub mod current_user;
