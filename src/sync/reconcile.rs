//! Read progress reconciliation
//!
//! Decides, for one (book, user), whether the replica or the server holds
//! the authoritative reading position. Newer `last_modified_date` wins and
//! ties go to the server.

use crate::db::models::{ReadProgress, Timestamp};

/// What to do with one book's progress after comparing both sides
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Both sides agree
    Unchanged,
    /// Store the server value. `conflict` is set when a local change that
    /// was never pushed gets overwritten.
    TakeRemote { conflict: bool },
    /// The local value is newer and must be sent to the server
    PushLocal,
    /// The server dropped the progress and the local row is not a pending change
    DeleteLocal,
}

/// Whether the local row changed after the last completed reconciliation
fn changed_since(local: &ReadProgress, last_sync: Option<Timestamp>) -> bool {
    last_sync.map_or(true, |at| local.last_modified_date > at)
}

fn same_position(a: &ReadProgress, b: &ReadProgress) -> bool {
    a.page == b.page && a.completed == b.completed && a.last_modified_date == b.last_modified_date
}

pub fn resolve(
    local: Option<&ReadProgress>,
    remote: Option<&ReadProgress>,
    last_sync: Option<Timestamp>,
) -> Resolution {
    match (local, remote) {
        (None, None) => Resolution::Unchanged,
        (None, Some(_)) => Resolution::TakeRemote { conflict: false },
        (Some(local), None) => {
            if changed_since(local, last_sync) {
                Resolution::PushLocal
            } else {
                Resolution::DeleteLocal
            }
        }
        (Some(local), Some(remote)) => {
            if local.last_modified_date > remote.last_modified_date {
                Resolution::PushLocal
            } else if same_position(local, remote) {
                Resolution::Unchanged
            } else {
                let diverged = local.page != remote.page || local.completed != remote.completed;
                Resolution::TakeRemote {
                    conflict: diverged && changed_since(local, last_sync),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repository::fixtures::{progress, ts};
    use proptest::prelude::*;

    #[test]
    fn test_newer_side_wins() {
        let local = progress("b1", "u1", 5, ts(10));
        let remote = progress("b1", "u1", 3, ts(9));
        assert_eq!(resolve(Some(&local), Some(&remote), Some(ts(8))), Resolution::PushLocal);

        let remote = progress("b1", "u1", 7, ts(11));
        assert_eq!(
            resolve(Some(&local), Some(&remote), Some(ts(8))),
            Resolution::TakeRemote { conflict: true }
        );
        assert_eq!(
            resolve(Some(&local), Some(&remote), Some(ts(10))),
            Resolution::TakeRemote { conflict: false }
        );
    }

    #[test]
    fn test_tie_goes_to_server() {
        let local = progress("b1", "u1", 5, ts(10));
        let remote = progress("b1", "u1", 6, ts(10));
        assert_eq!(
            resolve(Some(&local), Some(&remote), None),
            Resolution::TakeRemote { conflict: true }
        );
        assert_eq!(resolve(Some(&local), Some(&local.clone()), None), Resolution::Unchanged);
    }

    #[test]
    fn test_missing_sides() {
        let local = progress("b1", "u1", 5, ts(10));
        assert_eq!(resolve(None, None, None), Resolution::Unchanged);
        assert_eq!(resolve(None, Some(&local), None), Resolution::TakeRemote { conflict: false });
        assert_eq!(resolve(Some(&local), None, Some(ts(9))), Resolution::PushLocal);
        assert_eq!(resolve(Some(&local), None, Some(ts(11))), Resolution::DeleteLocal);
        assert_eq!(resolve(Some(&local), None, None), Resolution::PushLocal);
    }

    proptest! {
        #[test]
        fn prop_strictly_newer_remote_always_taken(
            local_day in 1u32..28,
            delta in 1u32..3,
            local_page in 1i32..50,
            remote_page in 1i32..50,
            sync_day in proptest::option::of(1u32..28),
        ) {
            let remote_day = (local_day + delta).min(28);
            prop_assume!(remote_day > local_day);
            let local = progress("b", "u", local_page, ts(local_day));
            let remote = progress("b", "u", remote_page, ts(remote_day));
            let resolution = resolve(Some(&local), Some(&remote), sync_day.map(ts));
            let taken = matches!(resolution, Resolution::TakeRemote { .. });
            prop_assert!(taken);
        }

        #[test]
        fn prop_resolution_is_deterministic(
            local_day in 1u32..28,
            remote_day in 1u32..28,
            page in 1i32..50,
        ) {
            let local = progress("b", "u", page, ts(local_day));
            let remote = progress("b", "u", page + 1, ts(remote_day));
            let first = resolve(Some(&local), Some(&remote), None);
            let second = resolve(Some(&local), Some(&remote), None);
            prop_assert_eq!(first, second);
            prop_assert_eq!(first == Resolution::PushLocal, local_day > remote_day);
        }
    }
}
