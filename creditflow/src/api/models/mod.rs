pub mod credits;
pub mod jobs;
pub mod pagination;
pub mod payments;
pub mod users;
pub mod webhooks;
