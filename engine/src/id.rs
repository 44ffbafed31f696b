//! Client-side record ids.

use crate::RecordId;
use uuid::Uuid;

/// Length of generated ids.
pub const ID_LENGTH: usize = 16;

/// A new random record id: 16 lowercase hexadecimal characters.
pub fn random_id() -> RecordId {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(ID_LENGTH);
    id
}
