//! Random session ids.

use uuid::Uuid;

use crate::ports::IdGenerator;

/// Hands out v4 UUIDs for sessions started without an explicit id.
#[derive(Debug, Clone, Copy, Default)]
pub struct LiveIdGenerator;

impl IdGenerator for LiveIdGenerator {
    fn generate_id(&self) -> Uuid {
        Uuid::new_v4()
    }
}
