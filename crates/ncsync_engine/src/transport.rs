//! Peer abstraction used by the sync engine.
//!
//! [`PeerControl`] is the long-lived view of one remote server: connection
//! backoff, active-session admission and access to a connection.
//! [`PeerConnection`] carries the individual sync verbs. Every verb must
//! return without blocking and eventually call
//! [`ActiveSession::cmd_finished`] exactly once, either inline or from
//! another task.

use crate::session::ActiveSession;
use ncsync_protocol::{BlobSummary, RecNo, ServerId};
use std::sync::Arc;
use tokio::time::Instant;

/// Per-peer control surface owned by the connection layer.
pub trait PeerControl: Send + Sync {
    /// Id of the remote server.
    fn server_id(&self) -> ServerId;

    /// Earliest time a new connection attempt is allowed, if backing off.
    fn connection_backoff_until(&self) -> Option<Instant>;

    /// Admits one more active session to this peer. Returning false makes
    /// the claim fail as busy.
    fn start_active_sync(&self) -> bool;

    /// Called whenever a session with this peer stops.
    fn register_sync_stop(&self, is_passive: bool);

    /// Called when the peer reached us, which clears connection backoff.
    fn register_conn_success(&self);

    /// Returns a connection, or `None` if the peer is unreachable.
    fn connection(&self) -> Option<Arc<dyn PeerConnection>>;
}

/// The sync verbs of one connection.
pub trait PeerConnection: Send + Sync {
    /// Asks the peer to start a passive session. The reply is delivered via
    /// [`ActiveSession::reply_events`] or [`ActiveSession::reply_blobs`].
    fn start_sync(&self, session: Arc<ActiveSession>, local_start: RecNo, remote_start: RecNo);

    /// Requests the peer's full blob list for the session slot.
    fn request_blob_list(&self, session: Arc<ActiveSession>);

    /// Sends our copy of `key`. `known_create_time` is set when the peer is
    /// known to lack exactly that version.
    fn send_blob(&self, session: Arc<ActiveSession>, key: &str, known_create_time: Option<u64>);

    /// Fetches the peer's copy of `key` created at `create_time`.
    fn fetch_blob(&self, session: Arc<ActiveSession>, key: &str, create_time: u64);

    /// Extends our copy of `key` to the peer's lifetime.
    fn prolong_local_copy(&self, session: Arc<ActiveSession>, key: &str, remote: &BlobSummary);

    /// Extends the peer's copy of `key` to our lifetime.
    fn prolong_peer_copy(&self, session: Arc<ActiveSession>, key: &str, local: &BlobSummary);

    /// Commits the session with the watermarks reached, from our side.
    fn commit(&self, session: Arc<ActiveSession>, local_synced: RecNo, remote_synced: RecNo);

    /// Cancels the session on the peer.
    fn cancel(&self, session: Arc<ActiveSession>);
}
