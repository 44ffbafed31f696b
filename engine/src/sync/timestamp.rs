//! Persistence of the last pull timestamp.

use crate::action_queue::Action;
use crate::adapter::LocalStore;
use crate::database::Database;
use crate::{error::Result, Error, Timestamp};

/// Local storage key of the last pull timestamp.
pub const LAST_PULLED_AT_KEY: &str = "__tandem_last_pulled_at";

/// Server timestamp of the last pull whose changes were fully applied, or
/// `None` before the first sync.
pub async fn get_last_pulled_at<S: LocalStore>(db: &Database<S>) -> Result<Option<Timestamp>> {
    match db.get_local(LAST_PULLED_AT_KEY).await? {
        Some(value) => value.parse().map(Some).map_err(|_| {
            Error::Storage(format!("corrupt {LAST_PULLED_AT_KEY} value: {value:?}"))
        }),
        None => Ok(None),
    }
}

pub async fn set_last_pulled_at<S: LocalStore>(
    db: &Database<S>,
    action: &Action,
    timestamp: Timestamp,
) -> Result<()> {
    db.set_local(action, LAST_PULLED_AT_KEY, timestamp.to_string())
        .await
}
