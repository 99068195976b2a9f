//! Container readiness polling.
//!
//! Polls the engine health status and the in-container init files at roughly
//! 2 Hz until the container reports healthy, reports unhealthy, stops, or the
//! deadline passes. A single failed probe never fails the wait.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::error::Result;

use super::{HealthState, InitPhase, InstallProgress};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// The probes the ready-wait loop needs from the runtime adapter.
#[async_trait]
pub trait InitProbe: Send + Sync {
    async fn is_running(&self, name: &str) -> Result<bool>;
    async fn health(&self, name: &str) -> Result<HealthState>;
    async fn init_status(&self, name: &str) -> Result<(InitPhase, String)>;
    async fn install_progress(&self, name: &str) -> Result<InstallProgress>;
}

/// Live progress handed to the render callback on every tick.
#[derive(Debug, Clone)]
pub struct ReadyStatus {
    pub phase: InitPhase,
    pub details: String,
    pub progress: InstallProgress,
}

/// Wait until the container is healthy. Returns `true` on healthy, `false`
/// when the container stops, reports unhealthy, or the timeout passes.
pub async fn wait_for_container_ready(
    probe: &dyn InitProbe,
    name: &str,
    timeout: Duration,
    mut render: impl FnMut(&ReadyStatus) + Send,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut status = ReadyStatus {
        phase: InitPhase::Starting,
        details: String::new(),
        progress: InstallProgress::default(),
    };

    while tokio::time::Instant::now() < deadline {
        match probe.is_running(name).await {
            Ok(true) => {}
            Ok(false) => {
                debug!("Container {name} is not running");
                return false;
            }
            // Probe failure: keep waiting, only terminal states decide.
            Err(e) => {
                debug!("Probe error for {name}: {e}");
                tokio::time::sleep(POLL_INTERVAL).await;
                continue;
            }
        }

        if let Ok((phase, details)) = probe.init_status(name).await {
            if phase != status.phase {
                debug!("Container {name} init phase: {phase:?}");
            }
            status.phase = phase;
            status.details = details;
        }

        if let Ok(progress) = probe.install_progress(name).await {
            status.progress = progress;
        }

        render(&status);

        match probe.health(name).await {
            Ok(HealthState::Healthy) => return true,
            Ok(HealthState::Unhealthy) => return false,
            _ => {}
        }

        tokio::time::sleep(POLL_INTERVAL).await;
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DaemonError;
    use parking_lot::Mutex;

    /// Scripted probe: `is_running` (the first probe of each tick) advances
    /// to the next step; the other probes read the current one.
    struct ScriptedProbe {
        steps: Vec<(bool, HealthState, InitPhase)>,
        tick: Mutex<Option<usize>>,
    }

    impl ScriptedProbe {
        fn new(steps: Vec<(bool, HealthState, InitPhase)>) -> Self {
            Self {
                steps,
                tick: Mutex::new(None),
            }
        }

        fn current(&self) -> (bool, HealthState, InitPhase) {
            let tick = self.tick.lock().unwrap_or(0);
            self.steps[tick.min(self.steps.len() - 1)]
        }
    }

    #[async_trait]
    impl InitProbe for ScriptedProbe {
        async fn is_running(&self, _name: &str) -> Result<bool> {
            let mut tick = self.tick.lock();
            *tick = Some(match *tick {
                None => 0,
                Some(t) => (t + 1).min(self.steps.len() - 1),
            });
            Ok(self.steps[tick.unwrap()].0)
        }

        async fn health(&self, _name: &str) -> Result<HealthState> {
            Ok(self.current().1)
        }

        async fn init_status(&self, _name: &str) -> Result<(InitPhase, String)> {
            Ok((self.current().2, String::new()))
        }

        async fn install_progress(&self, _name: &str) -> Result<InstallProgress> {
            Err(DaemonError::Timeout)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_path_observes_final_phase() {
        let probe = ScriptedProbe::new(vec![
            (true, HealthState::Starting, InitPhase::Starting),
            (true, HealthState::Starting, InitPhase::McpPackages),
            (true, HealthState::Healthy, InitPhase::Ready),
        ]);

        let mut seen = Vec::new();
        let ready = wait_for_container_ready(&probe, "boxctl-x", Duration::from_secs(90), |s| {
            seen.push(s.phase)
        })
        .await;

        assert!(ready);
        assert_eq!(seen.first(), Some(&InitPhase::Starting));
        assert_eq!(seen.last(), Some(&InitPhase::Ready));
        assert!(seen.contains(&InitPhase::McpPackages));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unhealthy_is_terminal() {
        let probe = ScriptedProbe::new(vec![
            (true, HealthState::Starting, InitPhase::Starting),
            (true, HealthState::Unhealthy, InitPhase::ProjectPackages),
        ]);

        let ready =
            wait_for_container_ready(&probe, "boxctl-x", Duration::from_secs(90), |_| {}).await;
        assert!(!ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_container_fails_fast() {
        let probe = ScriptedProbe::new(vec![(false, HealthState::None, InitPhase::Starting)]);
        let ready =
            wait_for_container_ready(&probe, "boxctl-x", Duration::from_secs(90), |_| {}).await;
        assert!(!ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_without_health() {
        let probe = ScriptedProbe::new(vec![(true, HealthState::Starting, InitPhase::Starting)]);
        let ready =
            wait_for_container_ready(&probe, "boxctl-x", Duration::from_secs(3), |_| {}).await;
        assert!(!ready);
    }
}
