pub mod credits;
pub mod payments;
