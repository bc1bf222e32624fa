//! The narrow contract fragments the embedding HTTP layer consumes. The
//! host owns routing, authentication, and wire formats beyond these.

pub mod error;

pub use error::ApiError;

use uuid::Uuid;

/// Path of an operation's status resource, used as the `Location` header on
/// the 202 returned from an accepted delete request.
pub fn operation_location(world_id: Uuid, op_id: Uuid) -> String {
    format!("/worlds/{}/delete-operations/{}", world_id, op_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_points_at_status_resource() {
        let world_id = Uuid::new_v4();
        let op_id = Uuid::new_v4();
        assert_eq!(
            operation_location(world_id, op_id),
            format!("/worlds/{}/delete-operations/{}", world_id, op_id)
        );
    }
}
