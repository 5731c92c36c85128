#![allow(missing_docs)]
//! Health monitoring for the managed services.
//!
//! Each query asks the service manager for the unit's state, pid, and last
//! exit code, then classifies health with rules that depend on whether the
//! service is keep-alive or run-once, softened by the warm-up window.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, warn};

use crate::command::{CommandRunner, args};
use crate::constants::SERVICE_MANAGER_TOOL;
use crate::descriptor::{ServiceId, ServiceKind};

pub mod parser;
pub mod warmup;

use parser::{LaunchctlStatusParser, ParsedServiceStatus, StatusParser};
use warmup::WarmupTracker;

/// Represents the overall health of the managed services.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OverallHealth {
    Healthy,
    Degraded,
    Failing,
}

/// Lifecycle phase of one service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ServicePhase {
    /// No unit is registered with the service manager.
    Unloaded,
    /// Loaded, not yet observed healthy, still inside the warm-up window.
    Starting,
    /// Observed running (or, for run-once services, exited cleanly).
    Healthy,
    /// Loaded but neither running nor warming up.
    Unhealthy,
}

/// Health of one service, computed fresh for every query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceStatus {
    pub id: ServiceId,
    pub loaded: bool,
    pub healthy: bool,
    pub warming_up: bool,
    pub phase: ServicePhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

impl ServiceStatus {
    /// Builds the status of a service that has no registered unit.
    pub fn unloaded(id: ServiceId) -> Self {
        Self {
            id,
            loaded: false,
            healthy: false,
            warming_up: false,
            phase: ServicePhase::Unloaded,
            pid: None,
            last_exit_code: None,
            state: None,
        }
    }

    /// Classifies a loaded service from its parsed status.
    pub fn from_parsed(id: ServiceId, parsed: ParsedServiceStatus, warming_up: bool) -> Self {
        let healthy = classify_health(id.kind(), &parsed, warming_up);
        let observed = classify_health(id.kind(), &parsed, false);
        let phase = if observed {
            ServicePhase::Healthy
        } else if healthy {
            ServicePhase::Starting
        } else {
            ServicePhase::Unhealthy
        };

        Self {
            id,
            loaded: true,
            healthy,
            warming_up,
            phase,
            pid: parsed.pid,
            last_exit_code: parsed.last_exit_code,
            state: parsed.state,
        }
    }
}

/// Pure health rule.
///
/// Run-once services are healthy after a clean exit, while running, or while
/// warming up. Keep-alive services must be observed running unless warming up.
pub fn classify_health(kind: ServiceKind, parsed: &ParsedServiceStatus, warming_up: bool) -> bool {
    let running = parsed.is_running() || parsed.pid.is_some();
    match kind {
        ServiceKind::RunOnce => parsed.last_exit_code == Some(0) || running || warming_up,
        ServiceKind::KeepAlive => running || warming_up,
    }
}

/// Statuses of all managed services at one instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceHealthSnapshot {
    pub captured_at: DateTime<Utc>,
    pub overall_health: OverallHealth,
    pub services: Vec<ServiceStatus>,
}

impl ServiceHealthSnapshot {
    pub fn new(services: Vec<ServiceStatus>) -> Self {
        let overall_health = compute_overall_health(&services);
        Self {
            captured_at: Utc::now(),
            overall_health,
            services,
        }
    }

    pub fn get(&self, id: ServiceId) -> Option<&ServiceStatus> {
        self.services.iter().find(|status| status.id == id)
    }

    /// Every service is loaded and healthy.
    pub fn all_healthy(&self) -> bool {
        self.services
            .iter()
            .all(|status| status.loaded && status.healthy)
    }

    /// Services without a registered unit.
    pub fn unloaded(&self) -> Vec<ServiceId> {
        self.services
            .iter()
            .filter(|status| !status.loaded)
            .map(|status| status.id)
            .collect()
    }

    /// Services that are not healthy, loaded or not.
    pub fn unhealthy(&self) -> Vec<ServiceId> {
        self.services
            .iter()
            .filter(|status| !status.healthy)
            .map(|status| status.id)
            .collect()
    }
}

pub fn compute_overall_health(services: &[ServiceStatus]) -> OverallHealth {
    if services
        .iter()
        .any(|status| matches!(status.phase, ServicePhase::Unloaded | ServicePhase::Unhealthy))
    {
        return OverallHealth::Failing;
    }

    if services
        .iter()
        .any(|status| matches!(status.phase, ServicePhase::Starting))
    {
        return OverallHealth::Degraded;
    }

    OverallHealth::Healthy
}

/// Queries the service manager and classifies service health.
pub struct HealthMonitor {
    runner: Arc<dyn CommandRunner>,
    parser: Box<dyn StatusParser>,
    warmup: WarmupTracker,
    timeout: Duration,
}

impl HealthMonitor {
    pub fn new(runner: Arc<dyn CommandRunner>, warmup: WarmupTracker, timeout: Duration) -> Self {
        Self {
            runner,
            parser: Box::new(LaunchctlStatusParser),
            warmup,
            timeout,
        }
    }

    /// Replaces the status-text parser.
    pub fn with_parser(mut self, parser: Box<dyn StatusParser>) -> Self {
        self.parser = parser;
        self
    }

    /// Raw status text for `id`, or `None` when no unit is registered or the
    /// query itself failed.
    pub async fn raw_status(&self, id: ServiceId) -> Option<String> {
        let argv = args(["print", id.target().as_str()]);
        match self.runner.run(SERVICE_MANAGER_TOOL, &argv, self.timeout).await {
            Ok(output) if output.is_success() => Some(output.stdout),
            Ok(output) => {
                debug!(
                    "{} is not loaded (exit {:?}): {}",
                    id.label(),
                    output.status,
                    output.combined().trim()
                );
                None
            }
            Err(err) => {
                warn!("Status query for {} failed: {err}", id.label());
                None
            }
        }
    }

    /// Current status of `id`.
    pub async fn status(&self, id: ServiceId) -> ServiceStatus {
        match self.raw_status(id).await {
            Some(text) => {
                let parsed = self.parser.parse(&text);
                ServiceStatus::from_parsed(id, parsed, self.warmup.is_warming_up(id))
            }
            None => ServiceStatus::unloaded(id),
        }
    }

    /// Statuses of every managed service, queried in install order.
    pub async fn snapshot(&self) -> ServiceHealthSnapshot {
        let mut services = Vec::with_capacity(ServiceId::ALL.len());
        for id in ServiceId::ALL {
            services.push(self.status(id).await);
        }
        ServiceHealthSnapshot::new(services)
    }

    /// Opens the warm-up window for each of `ids`.
    pub fn mark_restarted(&self, ids: &[ServiceId]) {
        for id in ids {
            self.warmup.mark_started(*id);
        }
    }

    /// Polls until every service in `ids` is observed healthy (warm-up grace
    /// does not count), or `timeout` elapses.
    pub async fn wait_until_healthy(
        &self,
        ids: &[ServiceId],
        timeout: Duration,
        interval: Duration,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let mut pending = Vec::new();
            for id in ids {
                if self.status(*id).await.phase != ServicePhase::Healthy {
                    pending.push(*id);
                }
            }

            if pending.is_empty() {
                info!("Services recovered: {ids:?}");
                return true;
            }

            if tokio::time::Instant::now() + interval > deadline {
                warn!("Services still not healthy after {timeout:?}: {pending:?}");
                return false;
            }

            debug!("Waiting {interval:?} for {pending:?} to recover");
            tokio::time::sleep(interval).await;
        }
    }
}
