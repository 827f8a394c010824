//! ID generator port for session identifiers.

use uuid::Uuid;

/// Generates unique session identifiers.
///
/// Abstracting ID generation lets tests substitute a predictable sequence.
pub trait IdGenerator: Send + Sync {
    /// Generates a new unique identifier.
    fn generate_id(&self) -> Uuid;
}
