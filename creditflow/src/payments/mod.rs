//! Payment orders and their conversion into credits.

pub mod reconciler;

pub use reconciler::{CreatedOrder, PaymentReconciler, VerifyOutcome};
