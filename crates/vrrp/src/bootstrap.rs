//! Connecting to the adapters the engine depends on before it starts.

use crate::adapter::Dependency;
use crate::error::AdapterError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{info, warn};

/// Backoff between connection rounds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Rounds before a dependency is declared failed
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            max_attempts: 30,
        }
    }
}

impl RetryPolicy {
    fn next_delay(&self, delay: Duration) -> Duration {
        (delay * 2).min(self.max_delay)
    }
}

/// Result of bootstrapping one dependency
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected { attempts: u32 },
    NotRequired,
    Failed { attempts: u32, error: String },
}

/// Whether the engine accepts protocol traffic yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    NotReady { pending: Vec<String> },
    Ready,
    Failed { dependencies: Vec<String> },
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootstrapReport {
    pub outcomes: Vec<(String, ConnectOutcome)>,
}

impl BootstrapReport {
    pub fn failed(&self) -> Vec<String> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| matches!(outcome, ConnectOutcome::Failed { .. }))
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn is_ready(&self) -> bool {
        self.failed().is_empty()
    }
}

/// Connect every dependency, retrying the unconnected ones with backoff.
///
/// `readiness` reflects the dependencies still pending after each round and
/// ends as `Ready` or `Failed`.
pub async fn connect_all(
    dependencies: &[Arc<dyn Dependency>],
    policy: &RetryPolicy,
    readiness: &watch::Sender<Readiness>,
) -> BootstrapReport {
    let mut report = BootstrapReport::default();
    let mut pending: Vec<(Arc<dyn Dependency>, String)> = dependencies
        .iter()
        .map(|dep| (dep.clone(), String::new()))
        .collect();
    let mut delay = policy.initial_delay;
    let mut attempt = 0;

    while !pending.is_empty() {
        attempt += 1;

        let mut still_pending = Vec::with_capacity(pending.len());
        for (dependency, _) in pending {
            match dependency.connect().await {
                Ok(()) => {
                    info!(dependency = dependency.name(), attempt, "Connected");
                    report.outcomes.push((
                        dependency.name().to_string(),
                        ConnectOutcome::Connected { attempts: attempt },
                    ));
                }
                Err(AdapterError::NotRequired) => {
                    info!(dependency = dependency.name(), "Connection not required");
                    report
                        .outcomes
                        .push((dependency.name().to_string(), ConnectOutcome::NotRequired));
                }
                Err(e) => {
                    warn!(dependency = dependency.name(), attempt, error = %e, "Connection failed");
                    still_pending.push((dependency, e.to_string()));
                }
            }
        }
        pending = still_pending;

        if pending.is_empty() {
            break;
        }

        if attempt >= policy.max_attempts {
            for (dependency, error) in pending.drain(..) {
                report.outcomes.push((
                    dependency.name().to_string(),
                    ConnectOutcome::Failed {
                        attempts: attempt,
                        error,
                    },
                ));
            }
            break;
        }

        readiness.send_replace(Readiness::NotReady {
            pending: pending.iter().map(|(dep, _)| dep.name().to_string()).collect(),
        });
        sleep(delay).await;
        delay = policy.next_delay(delay);
    }

    let failed = report.failed();
    if failed.is_empty() {
        info!("All dependencies connected");
        readiness.send_replace(Readiness::Ready);
    } else {
        warn!(?failed, "Giving up on dependencies");
        readiness.send_replace(Readiness::Failed { dependencies: failed });
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Succeeds on the given attempt, never if zero
    struct Flaky {
        name: String,
        succeed_on: u32,
        calls: AtomicU32,
        required: bool,
    }

    impl Flaky {
        fn new(name: &str, succeed_on: u32) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                succeed_on,
                calls: AtomicU32::new(0),
                required: true,
            })
        }
    }

    #[async_trait]
    impl Dependency for Flaky {
        fn name(&self) -> &str {
            &self.name
        }

        async fn connect(&self) -> Result<(), AdapterError> {
            if !self.required {
                return Err(AdapterError::NotRequired);
            }
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.succeed_on != 0 && call >= self.succeed_on {
                Ok(())
            } else {
                Err(AdapterError::Unreachable(format!("{} refused", self.name)))
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_connected() {
        let asicd = Flaky::new("asicd", 3);
        let deps: Vec<Arc<dyn Dependency>> = vec![asicd.clone()];
        let (tx, rx) = watch::channel(Readiness::NotReady { pending: vec![] });

        let start = tokio::time::Instant::now();
        let report = connect_all(&deps, &RetryPolicy::default(), &tx).await;

        assert_eq!(
            report.outcomes,
            vec![("asicd".to_string(), ConnectOutcome::Connected { attempts: 3 })]
        );
        // 500ms then 1s of backoff
        assert_eq!(start.elapsed(), Duration::from_millis(1500));
        assert_eq!(*rx.borrow(), Readiness::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_required_dependency() {
        let optional = Arc::new(Flaky {
            name: "ribd".to_string(),
            succeed_on: 0,
            calls: AtomicU32::new(0),
            required: false,
        });
        let deps: Vec<Arc<dyn Dependency>> = vec![optional, Flaky::new("asicd", 1)];
        let (tx, rx) = watch::channel(Readiness::NotReady { pending: vec![] });

        let report = connect_all(&deps, &RetryPolicy::default(), &tx).await;
        assert!(report.is_ready());
        assert!(report
            .outcomes
            .contains(&("ribd".to_string(), ConnectOutcome::NotRequired)));
        assert!(rx.borrow().is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let dead = Flaky::new("asicd", 0);
        let deps: Vec<Arc<dyn Dependency>> = vec![dead.clone()];
        let (tx, rx) = watch::channel(Readiness::NotReady { pending: vec![] });
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(400),
            max_attempts: 5,
        };

        let report = connect_all(&deps, &policy, &tx).await;
        assert_eq!(report.failed(), vec!["asicd".to_string()]);
        assert_eq!(dead.calls.load(Ordering::SeqCst), 5);
        assert_eq!(
            *rx.borrow(),
            Readiness::Failed {
                dependencies: vec!["asicd".to_string()]
            }
        );
    }
}
