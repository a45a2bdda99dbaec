use crate::types::UserId;

/// The caller, as asserted by the upstream identity layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentUser {
    pub id: UserId,
}
