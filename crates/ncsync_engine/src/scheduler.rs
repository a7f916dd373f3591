//! Task selection for an active sync session.
//!
//! [`TaskScheduler`] owns the session's work lists and walks them with
//! cursors. It performs no I/O: the driver asks for the next task and
//! dispatches it.

use ncsync_protocol::{BlobList, BlobSummary, SyncEvent, SyncMode};
use std::collections::btree_map;
use std::iter::Peekable;

/// One unit of work for the peer connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
    /// Replay a local event to the peer.
    SendEvent(SyncEvent),
    /// Replay a peer event locally.
    FetchEvent(SyncEvent),
    /// Both sides hold `key` and the peer's copy wins.
    UpdateOurs {
        /// Blob key.
        key: String,
        /// Our copy.
        local: BlobSummary,
        /// The peer's copy.
        remote: BlobSummary,
    },
    /// Both sides hold `key` and our copy wins.
    UpdatePeer {
        /// Blob key.
        key: String,
        /// Our copy.
        local: BlobSummary,
        /// The peer's copy.
        remote: BlobSummary,
    },
    /// Only we hold `key`.
    SendBlob {
        /// Blob key.
        key: String,
    },
    /// Only the peer holds `key`.
    FetchBlob {
        /// Blob key.
        key: String,
        /// Version to fetch.
        create_time: u64,
    },
    /// No work left; commit or cancel the session.
    Finalize,
}

impl Task {
    /// Blob key the task works on.
    pub fn key(&self) -> Option<&str> {
        match self {
            Task::SendEvent(e) | Task::FetchEvent(e) => Some(&e.key),
            Task::UpdateOurs { key, .. }
            | Task::UpdatePeer { key, .. }
            | Task::SendBlob { key }
            | Task::FetchBlob { key, .. } => Some(key),
            Task::Finalize => None,
        }
    }
}

type BlobCursor = Peekable<btree_map::IntoIter<String, BlobSummary>>;

enum Work {
    Events {
        to_send: std::vec::IntoIter<SyncEvent>,
        to_fetch: std::vec::IntoIter<SyncEvent>,
    },
    Blobs {
        local: BlobCursor,
        remote: BlobCursor,
    },
}

/// Produces the tasks of one session in order.
pub struct TaskScheduler {
    work: Work,
}

impl TaskScheduler {
    /// Event mode: every send, then every fetch, then finalize.
    pub fn for_events(to_send: Vec<SyncEvent>, to_fetch: Vec<SyncEvent>) -> Self {
        Self {
            work: Work::Events {
                to_send: to_send.into_iter(),
                to_fetch: to_fetch.into_iter(),
            },
        }
    }

    /// Blob-list mode: merge-join of both lists in key order.
    pub fn for_blobs(local: BlobList, remote: BlobList) -> Self {
        Self {
            work: Work::Blobs {
                local: local.into_iter().peekable(),
                remote: remote.into_iter().peekable(),
            },
        }
    }

    /// Mode of the session.
    pub fn mode(&self) -> SyncMode {
        match self.work {
            Work::Events { .. } => SyncMode::Events,
            Work::Blobs { .. } => SyncMode::Blobs,
        }
    }

    /// Returns the next task and advances the cursors.
    ///
    /// A pending clean on the slot or an already failed session yields
    /// [`Task::Finalize`] right away. Once `Finalize` has been returned for
    /// exhausted lists, it is returned on every further call.
    pub fn next_task(&mut self, clean_required: bool, session_failed: bool) -> Task {
        if clean_required || session_failed {
            return Task::Finalize;
        }
        match &mut self.work {
            Work::Events { to_send, to_fetch } => {
                if let Some(event) = to_send.next() {
                    Task::SendEvent(event)
                } else if let Some(event) = to_fetch.next() {
                    Task::FetchEvent(event)
                } else {
                    Task::Finalize
                }
            }
            Work::Blobs { local, remote } => next_blob_task(local, remote),
        }
    }
}

fn next_blob_task(local: &mut BlobCursor, remote: &mut BlobCursor) -> Task {
    loop {
        let ordering = match (local.peek(), remote.peek()) {
            (None, None) => return Task::Finalize,
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (Some((l, _)), Some((r, _))) => l.cmp(r),
        };
        match ordering {
            std::cmp::Ordering::Less => {
                if let Some((key, _)) = local.next() {
                    return Task::SendBlob { key };
                }
            }
            std::cmp::Ordering::Greater => {
                if let Some((key, summary)) = remote.next() {
                    return Task::FetchBlob {
                        key,
                        create_time: summary.create_time,
                    };
                }
            }
            std::cmp::Ordering::Equal => {
                let (Some((key, ours)), Some((_, theirs))) = (local.next(), remote.next()) else {
                    return Task::Finalize;
                };
                if ours.is_equal(&theirs) {
                    continue;
                }
                return if ours.is_older(&theirs) {
                    Task::UpdateOurs {
                        key,
                        local: ours,
                        remote: theirs,
                    }
                } else {
                    Task::UpdatePeer {
                        key,
                        local: ours,
                        remote: theirs,
                    }
                };
            }
        }
    }
}
