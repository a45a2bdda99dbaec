pub mod credits;
pub mod jobs;
pub mod payments;
pub mod webhooks;
