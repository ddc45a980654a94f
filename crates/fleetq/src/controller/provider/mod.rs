pub mod ec2;

use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Map;
use crate::common::timeutils::now_monotonic;
use crate::controller::FleetResult;
use crate::controller::config::ProvisioningConfig;

pub type InstanceId = String;
pub type AllocationId = String;

pub type InstanceStateMap = Map<InstanceId, InstanceState>;
pub type LeaseMap = Map<InstanceId, AddressLease>;

/// State of an instance as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceState {
    Pending,
    Running,
    Stopping,
    Stopped,
    ShuttingDown,
    Terminated,
    Unknown(String),
}

impl InstanceState {
    pub fn from_name(name: &str) -> Self {
        match name {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "stopping" => Self::Stopping,
            "stopped" => Self::Stopped,
            "shutting-down" => Self::ShuttingDown,
            "terminated" => Self::Terminated,
            name => Self::Unknown(name.to_string()),
        }
    }

    /// Returns true if the instance cannot become running anymore.
    pub fn is_gone(&self) -> bool {
        matches!(
            self,
            Self::ShuttingDown | Self::Terminated | Self::Stopping | Self::Stopped
        )
    }
}

/// Instance launched by this controller, found by its tag.
#[derive(Debug, Clone)]
pub struct ManagedInstance {
    pub id: InstanceId,
    pub state: InstanceState,
    pub launched_at: Option<SystemTime>,
}

/// Public address bound to a single instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressLease {
    pub allocation_id: AllocationId,
    pub public_ip: IpAddr,
    pub association_id: Option<String>,
}

/// Handler that can launch and terminate worker instances.
pub trait WorkerProvisioner {
    /// Launches up to `count` instances from the worker template.
    ///
    /// The provider may launch fewer instances than requested, the caller should continue with
    /// the instances that were returned.
    fn launch(&self, count: u32) -> Pin<Box<dyn Future<Output = FleetResult<Vec<InstanceId>>>>>;

    /// Get states of a set of instances.
    /// Instances unknown to the provider are missing from the result.
    fn describe(
        &self,
        instances: &[InstanceId],
    ) -> Pin<Box<dyn Future<Output = FleetResult<InstanceStateMap>>>>;

    fn terminate(&self, instances: &[InstanceId]) -> Pin<Box<dyn Future<Output = FleetResult<()>>>>;

    /// Lists live (pending or running) instances launched by this controller, oldest first.
    fn list_managed(&self) -> Pin<Box<dyn Future<Output = FleetResult<Vec<ManagedInstance>>>>>;
}

/// Handler that can allocate public addresses for instances.
pub trait AddressAllocator {
    /// Allocates a new public address and associates it with the given instance.
    ///
    /// If the association fails, the allocated address is released before the error is
    /// returned.
    fn allocate_and_associate(
        &self,
        instance: &InstanceId,
    ) -> Pin<Box<dyn Future<Output = FleetResult<AddressLease>>>>;

    /// Returns the address back to the provider.
    fn release(&self, lease: &AddressLease) -> Pin<Box<dyn Future<Output = FleetResult<()>>>>;

    /// Finds addresses currently associated with the given instances.
    fn find_leases(
        &self,
        instances: &[InstanceId],
    ) -> Pin<Box<dyn Future<Output = FleetResult<LeaseMap>>>>;
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("Instances {pending:?} were not running after {elapsed:?} ({polls} checks)")]
    RunningTimeout {
        pending: Vec<InstanceId>,
        elapsed: Duration,
        polls: u32,
    },
    #[error("Instance {instance} entered state {state:?} before it was running")]
    InstanceLost {
        instance: InstanceId,
        state: InstanceState,
    },
}

/// Bounds of waiting for launched instances.
#[derive(Debug, Clone)]
pub struct RunningWait {
    pub poll_interval: Duration,
    pub timeout: Duration,
    pub max_polls: u32,
}

impl From<&ProvisioningConfig> for RunningWait {
    fn from(config: &ProvisioningConfig) -> Self {
        Self {
            poll_interval: config.running_poll_interval(),
            timeout: config.running_timeout(),
            max_polls: config.max_running_polls,
        }
    }
}

/// Periodically checks the state of the given instances until all of them are running.
///
/// The wait ends with [`ProvisionError::RunningTimeout`] when either the timeout or the maximum
/// number of checks is reached. Failed state queries are counted as checks.
pub async fn await_running(
    provisioner: &dyn WorkerProvisioner,
    instances: &[InstanceId],
    wait: &RunningWait,
) -> Result<(), ProvisionError> {
    let start = now_monotonic();
    let mut pending: Vec<InstanceId> = instances.to_vec();
    let mut polls = 0;

    while !pending.is_empty() {
        polls += 1;
        match provisioner.describe(&pending).await {
            Ok(states) => {
                for id in &pending {
                    if let Some(state) = states.get(id) {
                        if state.is_gone() {
                            return Err(ProvisionError::InstanceLost {
                                instance: id.clone(),
                                state: state.clone(),
                            });
                        }
                    }
                }
                pending.retain(|id| states.get(id) != Some(&InstanceState::Running));
            }
            Err(error) => {
                // Freshly launched instances might not be visible to the state query yet
                log::warn!("Cannot get state of instances {pending:?}: {error:?}");
            }
        }
        if pending.is_empty() {
            break;
        }

        let elapsed = now_monotonic().duration_since(start);
        if polls >= wait.max_polls || elapsed + wait.poll_interval > wait.timeout {
            return Err(ProvisionError::RunningTimeout {
                pending,
                elapsed,
                polls,
            });
        }
        log::debug!(
            "Waiting for instances {pending:?} to be running ({polls}/{} checks)",
            wait.max_polls
        );
        tokio::time::sleep(wait.poll_interval).await;
    }
    log::info!("All instances {instances:?} are now running");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{InstanceState, ProvisionError, RunningWait, await_running};
    use crate::tests::mocks::{CloudBuilder, MockCloud};
    use std::time::Duration;

    fn wait(max_polls: u32) -> RunningWait {
        RunningWait {
            poll_interval: Duration::from_millis(1),
            timeout: Duration::from_secs(10),
            max_polls,
        }
    }

    #[tokio::test]
    async fn wait_until_running() {
        let cloud = MockCloud::new(CloudBuilder::default().polls_until_running(3));
        let ids = cloud.launch_now(2).await;
        await_running(&cloud, &ids, &wait(10)).await.unwrap();
        assert_eq!(cloud.describe_calls(), 3);
    }

    #[tokio::test]
    async fn wait_is_bounded_by_poll_count() {
        let cloud = MockCloud::new(CloudBuilder::default().polls_until_running(100));
        let ids = cloud.launch_now(1).await;
        let result = await_running(&cloud, &ids, &wait(4)).await;
        match result {
            Err(ProvisionError::RunningTimeout { pending, polls, .. }) => {
                assert_eq!(pending, ids);
                assert_eq!(polls, 4);
            }
            result => panic!("Unexpected result {result:?}"),
        }
        assert_eq!(cloud.describe_calls(), 4);
    }

    #[tokio::test]
    async fn wait_is_bounded_by_timeout() {
        let cloud = MockCloud::new(CloudBuilder::default().polls_until_running(100));
        let ids = cloud.launch_now(1).await;
        let wait = RunningWait {
            poll_interval: Duration::from_millis(20),
            timeout: Duration::from_millis(50),
            max_polls: 1000,
        };
        assert!(matches!(
            await_running(&cloud, &ids, &wait).await,
            Err(ProvisionError::RunningTimeout { .. })
        ));
        assert!(cloud.describe_calls() < 5);
    }

    #[tokio::test]
    async fn fail_when_instance_terminates() {
        let cloud = MockCloud::new(CloudBuilder::default().polls_until_running(5));
        let ids = cloud.launch_now(2).await;
        cloud.set_state(&ids[1], InstanceState::Terminated);
        match await_running(&cloud, &ids, &wait(10)).await {
            Err(ProvisionError::InstanceLost { instance, state }) => {
                assert_eq!(instance, ids[1]);
                assert_eq!(state, InstanceState::Terminated);
            }
            result => panic!("Unexpected result {result:?}"),
        }
    }

    #[tokio::test]
    async fn tolerate_failed_state_query() {
        let cloud = MockCloud::new(
            CloudBuilder::default()
                .polls_until_running(1)
                .failing_describes(2),
        );
        let ids = cloud.launch_now(1).await;
        await_running(&cloud, &ids, &wait(10)).await.unwrap();
        assert_eq!(cloud.describe_calls(), 3);
    }

    #[test]
    fn parse_instance_state() {
        assert_eq!(InstanceState::from_name("running"), InstanceState::Running);
        assert!(InstanceState::from_name("shutting-down").is_gone());
        assert!(!InstanceState::from_name("pending").is_gone());
        assert_eq!(
            InstanceState::from_name("rebooting"),
            InstanceState::Unknown("rebooting".to_string())
        );
    }
}
