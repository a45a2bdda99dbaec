//! Inbound completion webhooks from the job provider.
//!
//! - [`signing`]: signature schemes shared with the payment gateway
//! - [`ingress`]: maps a notification onto the job it completes

pub mod ingress;
pub mod signing;
