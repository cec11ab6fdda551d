//! Timeout defaults shared by the control plane and its listener.
//!
//! Requests may override the request timeouts per call; the listener values
//! only bound how long a connection thread waits on its socket.

use std::time::Duration;

/// Used when a control request carries a zero timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(3000);
/// Used when a compaction request carries a zero timeout.
pub const DEFAULT_COMPACTION_TIMEOUT: Duration = Duration::from_secs(30);
/// Upper bound on writing one response frame to a peer.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(1);
/// How often a blocked connection read wakes up to observe shutdown.
pub const READ_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Grace period granted to the listener when asked to shut down.
pub const SERVER_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
