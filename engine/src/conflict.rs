//! Conflict resolution between a locally modified record and the server's
//! version of it.
//!
//! The strategy is per-column client-wins: the server's version is taken,
//! except for the columns changed locally since the last sync, which keep
//! their local values and will be pushed again. The record keeps its local
//! status and changed set.

use crate::raw::{RawRecord, SyncStatus};
use tracing::error;

/// Merge `remote` into `local`.
///
/// A locally deleted record is returned unchanged: the deletion is pushed
/// regardless of what the server holds.
pub fn resolve_conflict(local: &RawRecord, remote: &RawRecord) -> RawRecord {
    if local.status == SyncStatus::Deleted {
        return local.clone();
    }

    let mut resolved = RawRecord {
        id: local.id.clone(),
        status: local.status,
        changed: local.changed.clone(),
        columns: local.columns.clone(),
        extra: local.extra.clone(),
    };
    resolved.columns.extend(
        remote
            .columns
            .iter()
            .map(|(k, v)| (k.clone(), v.clone())),
    );
    resolved
        .extra
        .extend(remote.extra.iter().map(|(k, v)| (k.clone(), v.clone())));

    for column in local.changed.iter() {
        if let Some(value) = local.get(column) {
            resolved.set(column, value.clone());
        }
    }

    if local.status == SyncStatus::Created {
        error!(
            record_id = %local.id,
            "server wants client to update a record marked as locally created; \
             most likely a server error, treating the record as synced"
        );
        resolved.status = SyncStatus::Synced;
    }

    resolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn record(status: SyncStatus, changed: &[&str], name: &str, age: i64) -> RawRecord {
        let mut raw = RawRecord::new("t1");
        raw.status = status;
        raw.changed = changed.iter().copied().collect();
        raw.columns.insert("name".into(), json!(name));
        raw.columns.insert("age".into(), json!(age));
        raw
    }

    #[test]
    fn changed_columns_keep_local_values() {
        let local = record(SyncStatus::Updated, &["name"], "local", 1);
        let remote = record(SyncStatus::Synced, &[], "remote", 2);

        let resolved = resolve_conflict(&local, &remote);

        assert_eq!(resolved.columns["name"], json!("local"));
        assert_eq!(resolved.columns["age"], json!(2));
        assert_eq!(resolved.status, SyncStatus::Updated);
        assert_eq!(resolved.changed.to_string(), "name");
        assert_eq!(resolved.id, "t1");
    }

    #[test]
    fn local_deletion_wins() {
        let local = record(SyncStatus::Deleted, &["name"], "local", 1);
        let remote = record(SyncStatus::Synced, &[], "remote", 2);

        assert_eq!(resolve_conflict(&local, &remote), local);
    }

    #[test]
    fn synced_local_takes_remote_wholesale() {
        let local = record(SyncStatus::Synced, &[], "local", 1);
        let remote = record(SyncStatus::Synced, &[], "remote", 2);

        let resolved = resolve_conflict(&local, &remote);
        assert!(resolved.content_eq(&remote));
        assert_eq!(resolved.status, SyncStatus::Synced);
    }

    // Assumption, not a guarantee: a server update for a locally created
    // record is treated as already reconciled.
    #[test]
    fn created_local_is_forced_to_synced() {
        let local = record(SyncStatus::Created, &[], "local", 1);
        let remote = record(SyncStatus::Synced, &[], "remote", 2);

        let resolved = resolve_conflict(&local, &remote);
        assert_eq!(resolved.status, SyncStatus::Synced);
        assert_eq!(resolved.columns["name"], json!("remote"));
    }

    #[test]
    fn extension_keys_merge_like_spread() {
        let mut local = record(SyncStatus::Updated, &["note"], "a", 1);
        local.extra.insert("note".into(), json!("mine"));
        local.extra.insert("local_only".into(), json!(true));
        let mut remote = record(SyncStatus::Synced, &[], "a", 1);
        remote.extra.insert("note".into(), json!("theirs"));
        remote.extra.insert("server_rev".into(), json!(3));

        let resolved = resolve_conflict(&local, &remote);
        assert_eq!(resolved.extra["note"], json!("mine"));
        assert_eq!(resolved.extra["local_only"], json!(true));
        assert_eq!(resolved.extra["server_rev"], json!(3));
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        fn arb_value() -> impl Strategy<Value = Value> {
            prop_oneof![
                any::<i64>().prop_map(Value::from),
                "[a-z]{0,8}".prop_map(Value::from),
                any::<bool>().prop_map(Value::from),
                Just(Value::Null),
            ]
        }

        proptest! {
            #[test]
            fn prop_local_name_remote_age(
                local_name in arb_value(),
                local_age in arb_value(),
                remote_name in arb_value(),
                remote_age in arb_value(),
            ) {
                let mut local = RawRecord::new("t1");
                local.status = SyncStatus::Updated;
                local.changed.insert("name");
                local.columns.insert("name".into(), local_name.clone());
                local.columns.insert("age".into(), local_age);

                let mut remote = RawRecord::new("t1");
                remote.status = SyncStatus::Synced;
                remote.columns.insert("name".into(), remote_name);
                remote.columns.insert("age".into(), remote_age.clone());

                let resolved = resolve_conflict(&local, &remote);
                prop_assert_eq!(&resolved.columns["name"], &local_name);
                prop_assert_eq!(&resolved.columns["age"], &remote_age);
                prop_assert_eq!(resolved.status, SyncStatus::Updated);
            }

            #[test]
            fn prop_resolve_is_deterministic(
                name in arb_value(),
                age in arb_value(),
            ) {
                let mut local = RawRecord::new("t1");
                local.status = SyncStatus::Updated;
                local.changed.insert("age");
                local.columns.insert("name".into(), name.clone());
                local.columns.insert("age".into(), age.clone());

                let mut remote = local.clone();
                remote.status = SyncStatus::Synced;
                remote.changed.clear();
                remote.columns.insert("name".into(), age);

                let first = resolve_conflict(&local, &remote);
                let second = resolve_conflict(&local, &remote);
                prop_assert_eq!(first.clone(), second);
                prop_assert_eq!(resolve_conflict(&first, &remote), first);
            }
        }
    }
}
