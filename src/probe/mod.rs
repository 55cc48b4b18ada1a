//! Readiness probing
//!
//! A started instance is polled on a fixed interval until its wait
//! strategy holds or the readiness budget is spent. Probing only observes
//! the instance; state changes are left to the owning scope.
//!
//! Engine failures (`EngineUnavailable`, `InstanceNotFound`) end the probe
//! at once. Anything else is recorded as the last observed error and
//! retried; it is reported inside `ReadinessTimeout` if the budget runs out.

pub mod dialer;
pub mod strategy;

pub use dialer::{PortDialer, TcpDialer};
pub use strategy::WaitStrategy;

use crate::driver::{InspectInfo, RuntimeDriver};
use crate::error::{BerthError, Result};
use crate::service::ServiceInstance;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Outcome of a successful probe
#[derive(Debug, Clone)]
pub struct Ready {
    /// Engine view of the instance at the moment it was judged ready
    pub info: InspectInfo,
    /// Number of probe attempts
    pub attempts: u32,
    /// Time spent probing
    pub elapsed: Duration,
}

enum Check {
    Port(Option<u16>),
    Log(Regex, usize),
    Command(Vec<String>),
    Running,
}

impl Check {
    fn compile(strategy: &WaitStrategy) -> Result<Self> {
        Ok(match strategy {
            WaitStrategy::PortOpen { port } => Check::Port(*port),
            WaitStrategy::LogPatternMatch { pattern, times } => {
                let regex = Regex::new(pattern).map_err(|e| {
                    BerthError::InvalidSpec(format!("invalid log pattern {:?}: {}", pattern, e))
                })?;
                Check::Log(regex, *times)
            }
            WaitStrategy::CommandSucceeds { command } => Check::Command(command.clone()),
            WaitStrategy::Running => Check::Running,
        })
    }
}

/// Polls instances until they are usable
#[derive(Clone)]
pub struct ReadinessProbe {
    driver: Arc<dyn RuntimeDriver>,
    dialer: Arc<dyn PortDialer>,
    host: String,
    interval: Duration,
}

impl ReadinessProbe {
    /// Create a probe
    pub fn new(
        driver: Arc<dyn RuntimeDriver>,
        dialer: Arc<dyn PortDialer>,
        host: &str,
        interval: Duration,
    ) -> Self {
        Self {
            driver,
            dialer,
            host: host.to_string(),
            interval,
        }
    }

    /// Poll interval
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Wait until `strategy` holds for `instance`, or `timeout` elapses
    ///
    /// Returns no later than `timeout` plus one poll interval.
    pub async fn await_ready(
        &self,
        instance: &ServiceInstance,
        strategy: &WaitStrategy,
        timeout: Duration,
    ) -> Result<Ready> {
        let check = Check::compile(strategy)?;
        let started = Instant::now();
        let deadline = started + timeout;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let remaining = deadline.saturating_duration_since(Instant::now());

            let last_error = match tokio::time::timeout(remaining, self.check(instance, &check)).await {
                Ok(Ok(info)) => {
                    debug!(
                        "{} ready after {} attempt(s) ({})",
                        instance.name(),
                        attempts,
                        strategy
                    );
                    return Ok(Ready {
                        info,
                        attempts,
                        elapsed: started.elapsed(),
                    });
                }
                Ok(Err(e)) if e.is_fatal_for_probe() => return Err(e),
                Ok(Err(e)) => {
                    debug!("{} not ready (attempt {}): {}", instance.name(), attempts, e);
                    e.to_string()
                }
                Err(_) => format!("probe attempt {} did not finish in time", attempts),
            };

            let now = Instant::now();
            if now >= deadline {
                return Err(BerthError::ReadinessTimeout {
                    name: instance.name().to_string(),
                    timeout,
                    last_error,
                });
            }
            tokio::time::sleep(self.interval.min(deadline - now)).await;
        }
    }

    async fn check(&self, instance: &ServiceInstance, check: &Check) -> Result<InspectInfo> {
        let info = self.driver.inspect(instance.id()).await?;
        if !info.running {
            return Err(BerthError::Probe(format!(
                "instance {} is not running",
                instance.id()
            )));
        }

        match check {
            Check::Running => {}
            Check::Port(port) => {
                let declared = port
                    .or_else(|| instance.spec().primary_port())
                    .ok_or_else(|| BerthError::Probe("no port to probe".to_string()))?;
                let host_port = info.ports.get(&declared).copied().ok_or_else(|| {
                    BerthError::Probe(format!("port {} is not mapped yet", declared))
                })?;
                self.dialer.dial(&self.host, host_port).await?;
            }
            Check::Log(regex, times) => {
                let logs = self.driver.logs(instance.id()).await?;
                let seen = regex.find_iter(&logs).count();
                if seen < *times {
                    return Err(BerthError::Probe(format!(
                        "log pattern {:?} seen {} of {} time(s)",
                        regex.as_str(),
                        seen,
                        times
                    )));
                }
            }
            Check::Command(command) => {
                let output = self.driver.exec(instance.id(), command).await?;
                if !output.success() {
                    return Err(BerthError::Probe(format!(
                        "{:?} exited with {}",
                        command.join(" "),
                        output.exit_code
                    )));
                }
            }
        }

        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MemoryDriver;
    use crate::service::ServiceSpec;

    async fn started(driver: &Arc<MemoryDriver>, spec: ServiceSpec) -> ServiceInstance {
        let id = driver.create(&spec).await.unwrap();
        driver.start(&id).await.unwrap();
        ServiceInstance::new(&id, Arc::new(spec))
    }

    fn probe(driver: &Arc<MemoryDriver>, interval: Duration) -> ReadinessProbe {
        ReadinessProbe::new(driver.clone(), driver.clone(), "localhost", interval)
    }

    fn db_spec() -> ServiceSpec {
        ServiceSpec::builder("db", "postgres").port(5432).build().unwrap()
    }

    #[tokio::test]
    async fn test_port_open_ready_on_first_poll() {
        let driver = Arc::new(MemoryDriver::new().with_port_mapping(5432, 54321));
        let instance = started(&driver, db_spec()).await;

        let ready = probe(&driver, Duration::from_millis(250))
            .await_ready(&instance, &WaitStrategy::port_open(), Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(ready.attempts, 1);
        assert_eq!(ready.info.ports[&5432], 54321);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_carries_last_error() {
        let driver = Arc::new(MemoryDriver::new());
        let instance = started(&driver, db_spec()).await;
        driver.set_refuse_connections(true).unwrap();

        let interval = Duration::from_millis(250);
        let timeout = Duration::from_secs(2);
        let start = Instant::now();
        let err = probe(&driver, interval)
            .await_ready(&instance, &WaitStrategy::port_open(), timeout)
            .await
            .unwrap_err();

        assert!(start.elapsed() <= timeout + interval);
        match err {
            BerthError::ReadinessTimeout { name, last_error, .. } => {
                assert_eq!(name, "db");
                assert!(last_error.contains("refused"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_engine_unavailable_ends_probe_immediately() {
        let driver = Arc::new(MemoryDriver::new());
        let instance = started(&driver, db_spec()).await;
        driver
            .fail_inspect(BerthError::EngineUnavailable("socket closed".to_string()))
            .unwrap();

        let err = probe(&driver, Duration::from_millis(250))
            .await_ready(&instance, &WaitStrategy::port_open(), Duration::from_secs(30))
            .await
            .unwrap_err();

        assert!(matches!(err, BerthError::EngineUnavailable(_)));
        assert_eq!(driver.inspect_calls(), 1);
    }

    #[tokio::test]
    async fn test_log_pattern_counts_occurrences() {
        let driver = Arc::new(MemoryDriver::new().with_logs(
            "db",
            "database system is ready to accept connections\nshutting down\ndatabase system is ready to accept connections\n",
        ));
        let instance = started(&driver, db_spec()).await;
        let probe = probe(&driver, Duration::from_millis(10));

        let twice = WaitStrategy::log_message_times("ready to accept connections", 2);
        assert!(probe.await_ready(&instance, &twice, Duration::from_secs(1)).await.is_ok());

        let thrice = WaitStrategy::log_message_times("ready to accept connections", 3);
        let err = probe
            .await_ready(&instance, &thrice, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, BerthError::ReadinessTimeout { .. }));
    }

    #[tokio::test]
    async fn test_command_strategy() {
        let driver = Arc::new(MemoryDriver::new().with_exec_exit_code("db", 1));
        let instance = started(&driver, db_spec()).await;

        let err = probe(&driver, Duration::from_millis(10))
            .await_ready(
                &instance,
                &WaitStrategy::command(&["pg_isready", "-U", "postgres"]),
                Duration::from_millis(100),
            )
            .await
            .unwrap_err();

        match err {
            BerthError::ReadinessTimeout { last_error, .. } => {
                assert!(last_error.contains("exited with 1"))
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_probe_does_not_change_instance_state() {
        let driver = Arc::new(MemoryDriver::new());
        let instance = started(&driver, db_spec()).await;
        let before = instance.state();

        probe(&driver, Duration::from_millis(10))
            .await_ready(&instance, &WaitStrategy::Running, Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(instance.state(), before);
        assert!(instance.ports().is_empty());
    }
}
