//! Automatic locking on host sleep, screensaver and inactivity.
//!
//! Host lifecycle notifications arrive as [`HostEvent`]s on an injected
//! channel; the platform glue that observes the real OS session lives in
//! the application. The policy is re-read from the manifest at every
//! trigger, so changes made in settings apply without a restart.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::manifest::SecurityPolicy;
use crate::service::{UnmountFailure, VaultService};

/// Host session notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEvent {
    /// The host is about to sleep
    WillSleep,
    /// The host woke from sleep
    DidWake,
    /// The screensaver started
    ScreensaverStarted,
    /// The screensaver stopped
    ScreensaverStopped,
    /// The user interacted with the application
    UserActivity,
}

impl HostEvent {
    /// Events that restart the idle timer.
    fn is_activity(self) -> bool {
        matches!(
            self,
            HostEvent::DidWake | HostEvent::ScreensaverStopped | HostEvent::UserActivity
        )
    }
}

/// Why vaults are being locked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockTrigger {
    /// Host sleep
    Sleep,
    /// Screensaver activation
    Screensaver,
    /// No activity for the configured timeout
    IdleTimeout,
}

impl LockTrigger {
    /// Whether `policy` asks for a lock on this trigger.
    pub fn is_enabled(self, policy: &SecurityPolicy) -> bool {
        match self {
            LockTrigger::Sleep => policy.auto_lock_on_sleep,
            LockTrigger::Screensaver => policy.auto_lock_on_screensaver,
            LockTrigger::IdleTimeout => policy.lock_timeout.is_some(),
        }
    }
}

/// What one lock pass did.
#[derive(Debug)]
pub struct LockReport {
    /// What caused the pass
    pub trigger: LockTrigger,
    /// Enabled vaults the pass tried to unmount
    pub attempted: usize,
    /// Vaults that stayed mounted
    pub failures: Vec<UnmountFailure>,
}

/// Detaches every enabled vault in response to host events.
#[derive(Debug)]
pub struct AutoLockPolicy {
    service: Arc<VaultService>,
    reports: Option<mpsc::UnboundedSender<LockReport>>,
}

impl AutoLockPolicy {
    /// Policy acting on `service`'s vaults.
    pub fn new(service: Arc<VaultService>) -> Self {
        Self {
            service,
            reports: None,
        }
    }

    /// Send a [`LockReport`] after every lock pass.
    #[must_use]
    pub fn with_reports(mut self, reports: mpsc::UnboundedSender<LockReport>) -> Self {
        self.reports = Some(reports);
        self
    }

    /// Run [`run`](Self::run) on a new task.
    pub fn spawn(self, events: mpsc::Receiver<HostEvent>) -> JoinHandle<()> {
        tokio::spawn(self.run(events))
    }

    /// Process host events until the sender side is dropped.
    pub async fn run(self, mut events: mpsc::Receiver<HostEvent>) {
        let mut policy = self.current_policy().await;
        let mut deadline = policy.lock_timeout.map(|timeout| Instant::now() + timeout);
        tracing::debug!("Auto-lock started with {:?}", policy);

        loop {
            let event = match deadline {
                Some(at) => {
                    tokio::select! {
                        event = events.recv() => event,
                        () = tokio::time::sleep_until(at) => {
                            self.trigger(LockTrigger::IdleTimeout).await;
                            // Re-armed by the next activity
                            deadline = None;
                            continue;
                        }
                    }
                }
                None => events.recv().await,
            };
            let Some(event) = event else { break };
            tracing::trace!("Host event {:?}", event);

            match event {
                HostEvent::WillSleep => self.trigger(LockTrigger::Sleep).await,
                HostEvent::ScreensaverStarted => self.trigger(LockTrigger::Screensaver).await,
                _ => {}
            }

            policy = self.current_policy().await;
            deadline = match policy.lock_timeout {
                None => None,
                Some(timeout) if event.is_activity() || deadline.is_none() => {
                    Some(Instant::now() + timeout)
                }
                Some(_) => deadline,
            };
        }
        tracing::debug!("Auto-lock stopped");
    }

    async fn current_policy(&self) -> SecurityPolicy {
        match self.service.policy().await {
            Ok(policy) => policy,
            Err(e) => {
                tracing::warn!("Failed to read vault policy, using defaults: {}", e);
                SecurityPolicy::default()
            }
        }
    }

    async fn trigger(&self, trigger: LockTrigger) {
        let policy = self.current_policy().await;
        if !trigger.is_enabled(&policy) {
            tracing::debug!("Ignoring {:?}: disabled by policy", trigger);
            return;
        }
        let report = self.lock_now(trigger).await;
        if let Some(reports) = &self.reports {
            let _ = reports.send(report);
        }
    }

    /// Unmount every enabled vault now, best-effort.
    ///
    /// Failures are logged and reported but not retried; the next trigger
    /// or an explicit unmount retries them.
    pub async fn lock_now(&self, trigger: LockTrigger) -> LockReport {
        let mut report = LockReport {
            trigger,
            attempted: 0,
            failures: Vec::new(),
        };

        let manifest = match self.service.registry().load().await {
            Ok(manifest) => manifest,
            Err(e) => {
                tracing::error!("Auto-lock ({:?}) could not read the vault manifest: {}", trigger, e);
                return report;
            }
        };

        tracing::info!("Auto-locking vaults ({:?})", trigger);
        for config in manifest.vaults.iter().filter(|v| v.is_enabled()) {
            report.attempted += 1;
            if let Err(error) = self.service.unmount_vault(&config.id).await {
                tracing::warn!("Auto-lock failed to unmount vault '{}': {}", config.name, error);
                report.failures.push(UnmountFailure {
                    id: config.id.clone(),
                    name: config.name.clone(),
                    error,
                });
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_triggers_follow_policy() {
        let policy = SecurityPolicy::default();
        assert!(LockTrigger::Sleep.is_enabled(&policy));
        assert!(!LockTrigger::Screensaver.is_enabled(&policy));
        assert!(!LockTrigger::IdleTimeout.is_enabled(&policy));

        let policy = SecurityPolicy {
            auto_lock_on_sleep: false,
            auto_lock_on_screensaver: true,
            lock_timeout: Some(Duration::from_secs(60)),
            ..SecurityPolicy::default()
        };
        assert!(!LockTrigger::Sleep.is_enabled(&policy));
        assert!(LockTrigger::Screensaver.is_enabled(&policy));
        assert!(LockTrigger::IdleTimeout.is_enabled(&policy));
    }

    #[test]
    fn test_activity_events() {
        assert!(HostEvent::UserActivity.is_activity());
        assert!(HostEvent::DidWake.is_activity());
        assert!(!HostEvent::WillSleep.is_activity());
        assert!(!HostEvent::ScreensaverStarted.is_activity());
    }
}
