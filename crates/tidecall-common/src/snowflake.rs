//! Call ID generation.
//!
//! Call IDs are UUID v7: globally unique, time-sortable, and generated
//! without coordination between nodes.

use uuid::Uuid;

/// Identifies a call across the registry and the fallback controller.
pub type CallId = Uuid;

/// Identifies an authenticated user taking part in calls.
pub type UserId = Uuid;

/// Generate a new call ID.
pub fn generate_id() -> CallId {
    Uuid::now_v7()
}
