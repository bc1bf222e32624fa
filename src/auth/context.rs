use uuid::Uuid;

/// The already-verified principal for the current request. Ownership and
/// role checks happen in the host's authorization layer before the core is
/// invoked; the core only carries the principal into audit fields and the
/// per-principal concurrency cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthContext {
    /// The ID of the authenticated user
    pub user_id: Uuid,
}

impl AuthContext {
    pub fn new(user_id: Uuid) -> Self {
        Self { user_id }
    }
}
