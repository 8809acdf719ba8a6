//! `RemoteAgent`: bidirectional RPC to per-node agents. The phase tree
//! stays addressable over RPC: `execute(phasePath)` is a first-class call
//! instead of shelling out to the same binary with `--phase`.

use async_trait::async_trait;
use clusterup_common::{ClusterupError, PhasePath, ServerRef};

#[async_trait]
pub trait RemoteAgent: Send + Sync {
    /// Dispatch `execute --phase <path>` to the agent running on `server`,
    /// re-entering the identical FSM flow there. Returns once the remote
    /// phase reaches a terminal state (or errors transiently on RPC
    /// failure — the at-least-once RPC is made at-most-once-effective by
    /// changelog dedup on the remote side).
    async fn run(&self, server: &ServerRef, phase: &PhasePath, force: bool) -> Result<(), ClusterupError>;

    /// Shut down agents after a successful operation (the Updater's final
    /// step).
    async fn shutdown(&self, servers: &[ServerRef]) -> Result<(), ClusterupError>;
}

/// An in-process stand-in: "dispatch" just records the call so tests can
/// assert the engine delegated correctly instead of running locally.
#[derive(Default)]
pub struct RecordingRemoteAgent {
    calls: std::sync::Mutex<Vec<(String, String)>>,
}

impl RecordingRemoteAgent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteAgent for RecordingRemoteAgent {
    async fn run(&self, server: &ServerRef, phase: &PhasePath, _force: bool) -> Result<(), ClusterupError> {
        self.calls
            .lock()
            .unwrap()
            .push((server.hostname.clone(), phase.as_str().to_string()));
        Ok(())
    }

    async fn shutdown(&self, _servers: &[ServerRef]) -> Result<(), ClusterupError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clusterup_common::ServerRole;

    #[tokio::test]
    async fn recording_agent_tracks_dispatches() {
        let agent = RecordingRemoteAgent::new();
        let server = ServerRef {
            hostname: "node-1".into(),
            advertise_ip: "10.0.0.1".into(),
            role: ServerRole::Node,
        };
        let phase = PhasePath::parse("/nodes/node-1/drain").unwrap();
        agent.run(&server, &phase, false).await.unwrap();
        assert_eq!(agent.calls(), vec![("node-1".to_string(), "/nodes/node-1/drain".to_string())]);
    }
}
