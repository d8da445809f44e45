//! Replication state model: connection, disk, and pause flags.
//!
//! The discriminant ordering of [`ConnState`] is load-bearing: scheduling
//! and cancellation logic compares states with `<`/`>=` ("anything at least
//! Connected", "actively syncing", "before parameters were reported").

use bitflags::bitflags;

/// Connection-level replication state, ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnState {
    /// No network configuration
    StandAlone,
    /// Tearing the connection down
    Disconnecting,
    /// Connection lost, trying to reestablish
    Unconnected,
    /// Peer did not answer in time
    Timeout,
    /// Socket-level failure
    BrokenPipe,
    /// Hard failure escalated by the worker
    NetworkFailure,
    /// Peer violated the protocol
    ProtocolError,
    /// Administrative teardown
    TearDown,
    /// Waiting for the peer to show up
    WfConnection,
    /// Streams established, parameter exchange in progress
    WfReportParams,
    /// Fully connected, both copies up to date
    Connected,
    /// Starting a full sync as source
    StartingSyncS,
    /// Starting a full sync as target
    StartingSyncT,
    /// Sending the bitmap
    WfBitMapS,
    /// Receiving the bitmap
    WfBitMapT,
    /// Waiting for the sync UUID
    WfSyncUuid,
    /// Background resync, this node is the source
    SyncSource,
    /// Background resync, this node is the target
    SyncTarget,
    /// Online verify, this node drives
    VerifyS,
    /// Online verify, this node answers
    VerifyT,
    /// Resync paused, would be source
    PausedSyncS,
    /// Resync paused, would be target
    PausedSyncT,
    /// Congestion mode: primary stopped mirroring, marks out of sync
    Ahead,
    /// Congestion mode: peer of Ahead
    Behind,
}

impl ConnState {
    /// True while a resync or verify run owns the device (source, target,
    /// verify, or paused variants).
    pub fn is_syncing(self) -> bool {
        self >= ConnState::SyncSource && self <= ConnState::PausedSyncT
    }
}

/// Disk state of the local or peer backing device, ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DiskState {
    /// No backing device attached
    Diskless,
    /// Attach in progress
    Attaching,
    /// Backing device failed
    Failed,
    /// Disk parameters being negotiated with the peer
    Negotiating,
    /// Data is not current
    Inconsistent,
    /// Consistent but known stale
    Outdated,
    /// Peer disk state unknown
    DUnknown,
    /// Consistent, currency unknown
    Consistent,
    /// Fully current
    UpToDate,
}

/// Snapshot of one device's replication state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceState {
    /// Connection-level state
    pub conn: ConnState,
    /// Local disk state
    pub disk: DiskState,
    /// Peer disk state
    pub pdsk: DiskState,
    /// Paused because a resync-after ancestor is busy
    pub aftr_isp: bool,
    /// Paused by the peer
    pub peer_isp: bool,
    /// Paused by the administrator
    pub user_isp: bool,
}

impl DeviceState {
    /// Initial state of a standalone, diskless device.
    pub fn standalone() -> Self {
        Self {
            conn: ConnState::StandAlone,
            disk: DiskState::Diskless,
            pdsk: DiskState::DUnknown,
            aftr_isp: false,
            peer_isp: false,
            user_isp: false,
        }
    }

    /// True if any of the interrupt-sync pause flags is set.
    pub fn is_paused(self) -> bool {
        self.aftr_isp || self.peer_isp || self.user_isp
    }
}

bitflags! {
    /// Flags modifying a state-change request.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StateFlags: u32 {
        /// Log the transition
        const VERBOSE = 1 << 0;
        /// Force the transition even when it would normally be refused
        const HARD = 1 << 1;
    }
}

/// Subprocess hook invoked at well-defined replication events
/// (`before-resync-source`, `before-resync-target`, `out-of-sync`,
/// `after-resync-target`). Returns the handler's exit code; 0 when no
/// handler is installed.
pub trait Helper: Send + Sync {
    /// Run the named handler for the given device minor.
    fn invoke(&self, minor: u32, cmd: &str) -> i32;
}

/// Helper that runs the configured command as a subprocess, with the
/// device minor and handler name in the environment.
pub struct CommandHelper {
    program: String,
}

impl CommandHelper {
    /// Wrap the given handler program.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Helper for CommandHelper {
    fn invoke(&self, minor: u32, cmd: &str) -> i32 {
        let status = std::process::Command::new(&self.program)
            .arg(cmd)
            .env("AURORA_MINOR", minor.to_string())
            .env("AURORA_EVENT", cmd)
            .status();
        match status {
            Ok(status) => status.code().unwrap_or(-1),
            Err(e) => {
                tracing::warn!(helper = %self.program, cmd, error = %e, "helper failed to spawn");
                -1
            }
        }
    }
}

/// Helper that does nothing and reports success. Default when no handler
/// program is configured.
pub struct NullHelper;

impl Helper for NullHelper {
    fn invoke(&self, _minor: u32, _cmd: &str) -> i32 {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conn_state_ordering() {
        assert!(ConnState::WfReportParams < ConnState::Connected);
        assert!(ConnState::NetworkFailure < ConnState::WfReportParams);
        assert!(ConnState::SyncTarget > ConnState::Connected);
        assert!(ConnState::SyncSource.is_syncing());
        assert!(ConnState::VerifyT.is_syncing());
        assert!(ConnState::PausedSyncT.is_syncing());
        assert!(!ConnState::Ahead.is_syncing());
        assert!(!ConnState::Connected.is_syncing());
    }

    #[test]
    fn test_disk_state_ordering() {
        assert!(DiskState::Inconsistent >= DiskState::Inconsistent);
        assert!(DiskState::Failed < DiskState::Inconsistent);
        assert!(DiskState::UpToDate > DiskState::Consistent);
    }

    #[test]
    fn test_paused_flags() {
        let mut s = DeviceState::standalone();
        assert!(!s.is_paused());
        s.user_isp = true;
        assert!(s.is_paused());
    }
}
