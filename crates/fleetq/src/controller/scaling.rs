use std::rc::Rc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::common::timeutils::now_monotonic;
use crate::controller::BacklogEstimator;
use crate::controller::provider::{
    AddressAllocator, InstanceId, RunningWait, WorkerProvisioner, await_running,
};
use crate::controller::registry::{Worker, WorkerRegistry};

/// What should happen with the fleet in the current cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScalingDecision {
    #[default]
    None,
    ScaleUp(u32),
    ScaleDown(u32),
}

/// Sizes the fleet to the number of pending jobs, capped by `max_fleet_size`.
pub fn compute_scaling_decision(
    current: u32,
    pending: u64,
    max_fleet_size: u32,
) -> ScalingDecision {
    let current_jobs = current as u64;
    if pending > current_jobs && current < max_fleet_size {
        let headroom = (max_fleet_size - current) as u64;
        let missing = pending - current_jobs;
        ScalingDecision::ScaleUp(headroom.min(missing) as u32)
    } else if current > 0 && current_jobs > pending {
        ScalingDecision::ScaleDown((current_jobs - pending) as u32)
    } else {
        ScalingDecision::None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LimiterStatus {
    Ok,
    /// Not enough time has passed since the last scaling event.
    Cooldown,
    /// Launches are delayed after recent provisioning failures.
    Backoff,
}

/// Limits how often can the fleet change.
///
/// A minimum interval is kept between any two scaling events. After a failed launch, the next
/// launch is delayed by an increasing amount of time, until a launch succeeds again.
pub struct ScalingLimiter {
    cooldown: Duration,
    delays: Vec<Duration>,
    /// Index into `delays`.
    current_delay: usize,
    last_event: Option<Instant>,
    last_failure: Option<Instant>,
}

impl ScalingLimiter {
    pub fn new(cooldown: Duration, delays: Vec<Duration>) -> Self {
        assert!(!delays.is_empty());
        Self {
            cooldown,
            delays,
            current_delay: 0,
            last_event: None,
            last_failure: None,
        }
    }

    /// Scaling will be attempted, reset the cooldown timer.
    pub fn on_scaling_event(&mut self) {
        self.last_event = Some(now_monotonic());
    }

    pub fn on_launch_success(&mut self) {
        self.current_delay = 0;
        self.last_failure = None;
    }

    pub fn on_launch_fail(&mut self) {
        if self.current_delay < self.delays.len() - 1 {
            self.current_delay += 1;
        }
        self.last_failure = Some(now_monotonic());
    }

    pub fn status(&self, decision: ScalingDecision) -> LimiterStatus {
        let now = now_monotonic();
        if let Some(last_event) = self.last_event {
            if now.duration_since(last_event) < self.cooldown {
                return LimiterStatus::Cooldown;
            }
        }
        if let (ScalingDecision::ScaleUp(_), Some(last_failure)) = (decision, self.last_failure) {
            if now.duration_since(last_failure) < self.delays[self.current_delay] {
                return LimiterStatus::Backoff;
            }
        }
        LimiterStatus::Ok
    }
}

/// Result of a single scaling pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScalingOutcome {
    pub backlog: u64,
    pub decision: ScalingDecision,
    /// Set when the decision was postponed by the limiter.
    pub limited: Option<LimiterStatus>,
    /// Workers that became running.
    pub added: Vec<InstanceId>,
    /// Workers that were terminated and removed from the fleet.
    pub removed: Vec<InstanceId>,
    /// Launched instances that were terminated because they could not be made running.
    pub rolled_back: Vec<InstanceId>,
    pub errors: Vec<String>,
}

impl ScalingOutcome {
    fn error(&mut self, error: String) {
        log::error!("{error}");
        self.errors.push(error);
    }

    pub fn changed_fleet(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty() || !self.rolled_back.is_empty()
    }
}

/// Grows and shrinks the fleet according to the observed backlog.
pub struct ScalingEngine {
    provisioner: Rc<dyn WorkerProvisioner>,
    allocator: Rc<dyn AddressAllocator>,
    estimator: Box<dyn BacklogEstimator>,
    limiter: ScalingLimiter,
    wait: RunningWait,
}

impl ScalingEngine {
    pub fn new(
        provisioner: Rc<dyn WorkerProvisioner>,
        allocator: Rc<dyn AddressAllocator>,
        estimator: Box<dyn BacklogEstimator>,
        limiter: ScalingLimiter,
        wait: RunningWait,
    ) -> Self {
        Self {
            provisioner,
            allocator,
            estimator,
            limiter,
            wait,
        }
    }

    pub fn provisioner(&self) -> &dyn WorkerProvisioner {
        self.provisioner.as_ref()
    }

    pub fn allocator(&self) -> &dyn AddressAllocator {
        self.allocator.as_ref()
    }

    pub fn running_wait(&self) -> &RunningWait {
        &self.wait
    }

    /// Runs one scaling pass for the given backlog sample.
    pub async fn run(&mut self, registry: &mut WorkerRegistry, sample: u64) -> ScalingOutcome {
        let mut outcome = ScalingOutcome::default();
        self.sweep_terminating(registry, &mut outcome).await;

        let backlog = self.estimator.estimate(sample);
        let decision = compute_scaling_decision(registry.size(), backlog, registry.max_size());
        outcome.backlog = backlog;
        outcome.decision = decision;
        if decision == ScalingDecision::None {
            return outcome;
        }

        let status = self.limiter.status(decision);
        if status != LimiterStatus::Ok {
            log::debug!("Scaling decision {decision:?} postponed: {status:?}");
            outcome.limited = Some(status);
            return outcome;
        }

        log::info!(
            "Scaling decision: {decision:?} (fleet size {}, backlog {backlog}, max {})",
            registry.size(),
            registry.max_size()
        );
        self.limiter.on_scaling_event();
        match decision {
            ScalingDecision::ScaleUp(count) => self.scale_up(registry, count, &mut outcome).await,
            ScalingDecision::ScaleDown(count) => {
                self.scale_down(registry, count, &mut outcome).await
            }
            ScalingDecision::None => {}
        }
        outcome
    }

    async fn scale_up(
        &mut self,
        registry: &mut WorkerRegistry,
        count: u32,
        outcome: &mut ScalingOutcome,
    ) {
        let count = count.min(registry.free_capacity());
        if count == 0 {
            return;
        }
        let mut launched = match self.provisioner.launch(count).await {
            Ok(launched) => launched,
            Err(error) => {
                self.limiter.on_launch_fail();
                outcome.error(format!("Launch of {count} instance(s) failed: {error:?}"));
                return;
            }
        };
        if launched.len() < count as usize {
            log::warn!(
                "Requested {count} instance(s), but only {} were launched",
                launched.len()
            );
        }
        if launched.len() > count as usize {
            let extra = launched.split_off(count as usize);
            log::warn!("Provider launched more instances than requested, terminating {extra:?}");
            self.rollback(registry, &extra, outcome).await;
        }
        if launched.is_empty() {
            self.limiter.on_launch_fail();
            return;
        }

        let mut pending = Vec::with_capacity(launched.len());
        for instance in launched {
            match registry.add(Worker::provisioning(instance.clone())) {
                Ok(()) => pending.push(instance),
                Err(error) => {
                    outcome.error(format!("Cannot register instance {instance}: {error}"));
                    self.rollback(registry, &[instance], outcome).await;
                }
            }
        }

        let provisioner = self.provisioner.as_ref();
        if let Err(error) = await_running(provisioner, &pending, &self.wait).await {
            self.limiter.on_launch_fail();
            outcome.error(format!("Launched instances did not start: {error}"));
            self.rollback(registry, &pending, outcome).await;
            return;
        }

        for instance in pending {
            match self.allocator.allocate_and_associate(&instance).await {
                Ok(lease) => {
                    let address = lease.public_ip;
                    match registry.mark_running(&instance, lease.clone()) {
                        Ok(()) => {
                            log::info!("Worker {instance} is running at {address}");
                            outcome.added.push(instance);
                        }
                        Err(error) => {
                            outcome.error(format!(
                                "Cannot register address of {instance}: {error}"
                            ));
                            if let Err(error) = self.allocator.release(&lease).await {
                                log::error!(
                                    "Cannot release address {address} of {instance}: {error:?}"
                                );
                            }
                            self.rollback(registry, &[instance], outcome).await;
                        }
                    }
                }
                Err(error) => {
                    outcome.error(format!(
                        "Cannot allocate address for instance {instance}: {error:?}"
                    ));
                    self.rollback(registry, &[instance], outcome).await;
                }
            }
        }

        if outcome.added.is_empty() {
            self.limiter.on_launch_fail();
        } else {
            self.limiter.on_launch_success();
        }
    }

    async fn scale_down(
        &mut self,
        registry: &mut WorkerRegistry,
        count: u32,
        outcome: &mut ScalingOutcome,
    ) {
        let mut to_terminate = Vec::new();
        for instance in registry.removal_candidates(count as usize) {
            let lease = registry.get(&instance).and_then(|w| w.lease.clone());
            if let Some(lease) = lease {
                if let Err(error) = self.allocator.release(&lease).await {
                    // Without a released address, the worker stays in the fleet
                    outcome.error(format!(
                        "Cannot release address {} of worker {instance}: {error:?}",
                        lease.public_ip
                    ));
                    continue;
                }
            }
            if let Err(error) = registry.begin_termination(&instance) {
                outcome.error(error.to_string());
                continue;
            }
            to_terminate.push(instance);
        }
        if to_terminate.is_empty() {
            return;
        }

        match self.provisioner.terminate(&to_terminate).await {
            Ok(()) => {
                registry.remove(&to_terminate);
                log::info!("Workers {to_terminate:?} were terminated");
                outcome.removed.extend(to_terminate);
            }
            Err(error) => {
                outcome.error(format!(
                    "Cannot terminate workers {to_terminate:?}, retrying in the next cycle: {error:?}"
                ));
            }
        }
    }

    /// Terminates instances that could not join the fleet.
    /// Instances whose termination fails stay in the fleet as terminating.
    async fn rollback(
        &mut self,
        registry: &mut WorkerRegistry,
        instances: &[InstanceId],
        outcome: &mut ScalingOutcome,
    ) {
        if instances.is_empty() {
            return;
        }
        match self.provisioner.terminate(instances).await {
            Ok(()) => {
                registry.remove(instances);
                log::warn!("Instances {instances:?} were terminated");
                outcome.rolled_back.extend_from_slice(instances);
            }
            Err(error) => {
                outcome.error(format!("Cannot terminate instances {instances:?}: {error:?}"));
                for instance in instances {
                    // Instances that were never registered cannot be tracked
                    if registry.begin_termination(instance).is_err() {
                        log::error!("Instance {instance} was leaked");
                    }
                }
            }
        }
    }

    /// Retries termination of workers whose termination has failed before.
    async fn sweep_terminating(
        &mut self,
        registry: &mut WorkerRegistry,
        outcome: &mut ScalingOutcome,
    ) {
        let terminating = registry.terminating();
        if terminating.is_empty() {
            return;
        }
        match self.provisioner.terminate(&terminating).await {
            Ok(()) => {
                registry.remove(&terminating);
                log::info!("Workers {terminating:?} were terminated");
                outcome.removed.extend(terminating);
            }
            Err(error) => {
                outcome.error(format!(
                    "Cannot terminate workers {terminating:?}: {error:?}"
                ));
            }
        }
    }

    /// Releases all addresses and terminates all workers.
    pub async fn drain(&mut self, registry: &mut WorkerRegistry) -> ScalingOutcome {
        let mut outcome = ScalingOutcome::default();
        let size = registry.size();
        log::info!("Draining fleet of {size} worker(s)");
        self.scale_down(registry, size, &mut outcome).await;
        self.sweep_terminating(registry, &mut outcome).await;
        outcome
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;
    use std::time::{Duration, Instant};

    use derive_builder::Builder;

    use super::{
        LimiterStatus, ScalingDecision, ScalingEngine, ScalingLimiter, compute_scaling_decision,
    };
    use crate::common::timeutils::mock_time::MockTime;
    use crate::controller::provider::RunningWait;
    use crate::controller::registry::{WorkerRegistry, WorkerState};
    use crate::controller::{ReactiveEstimator, SmoothedEstimator};
    use crate::tests::init_test_logging;
    use crate::tests::mocks::{CloudBuilder, CloudEvent, MockCloud};

    #[derive(Builder)]
    #[builder(pattern = "owned", build_fn(name = "finish"))]
    struct Engine {
        #[builder(default = "20")]
        max_fleet_size: u32,
        #[builder(default)]
        cooldown: Duration,
        #[builder(default = "vec![Duration::ZERO]")]
        limiter_delays: Vec<Duration>,
        #[builder(default)]
        smoothing_window: Option<usize>,
        #[builder(default = "10")]
        max_polls: u32,
    }

    impl EngineBuilder {
        fn build(self, cloud: &MockCloud) -> (ScalingEngine, WorkerRegistry) {
            init_test_logging();
            let Engine {
                max_fleet_size,
                cooldown,
                limiter_delays,
                smoothing_window,
                max_polls,
            } = self.finish().unwrap();
            let estimator: Box<dyn crate::controller::BacklogEstimator> = match smoothing_window {
                Some(window) => Box::new(SmoothedEstimator::new(window)),
                None => Box::new(ReactiveEstimator),
            };
            let engine = ScalingEngine::new(
                Rc::new(cloud.clone()),
                Rc::new(cloud.clone()),
                estimator,
                ScalingLimiter::new(cooldown, limiter_delays),
                RunningWait {
                    poll_interval: Duration::from_millis(1),
                    timeout: Duration::from_secs(10),
                    max_polls,
                },
            );
            (engine, WorkerRegistry::new(max_fleet_size))
        }
    }

    async fn grow(engine: &mut ScalingEngine, registry: &mut WorkerRegistry, size: u64) {
        let outcome = engine.run(registry, size).await;
        assert!(outcome.errors.is_empty());
        assert_eq!(registry.size() as u64, size);
    }

    #[test]
    fn decision_table() {
        let decide = |current, pending| compute_scaling_decision(current, pending, 20);
        assert_eq!(decide(0, 3), ScalingDecision::ScaleUp(3));
        assert_eq!(decide(0, 30), ScalingDecision::ScaleUp(20));
        assert_eq!(decide(18, 30), ScalingDecision::ScaleUp(2));
        assert_eq!(decide(20, 30), ScalingDecision::None);
        assert_eq!(decide(5, 2), ScalingDecision::ScaleDown(3));
        assert_eq!(decide(5, 0), ScalingDecision::ScaleDown(5));
        assert_eq!(decide(3, 3), ScalingDecision::None);
        assert_eq!(decide(0, 0), ScalingDecision::None);
    }

    #[tokio::test]
    async fn scale_up_from_empty_fleet() {
        let cloud = MockCloud::new(CloudBuilder::default().polls_until_running(2));
        let (mut engine, mut registry) = EngineBuilder::default().build(&cloud);

        let outcome = engine.run(&mut registry, 3).await;
        assert_eq!(outcome.decision, ScalingDecision::ScaleUp(3));
        assert_eq!(outcome.added.len(), 3);
        assert_eq!(registry.size(), 3);
        assert!(registry.all().iter().all(|w| w.is_running()));
        assert!(registry.all().iter().all(|w| w.lease.is_some()));
        assert_eq!(cloud.held_addresses(), 3);
        assert_eq!(cloud.events()[0], CloudEvent::Launch(3));
    }

    #[tokio::test]
    async fn scale_up_is_capped_by_max_fleet_size() {
        let cloud = MockCloud::new(CloudBuilder::default());
        let (mut engine, mut registry) = EngineBuilder::default()
            .max_fleet_size(4)
            .build(&cloud);

        for backlog in [3, 10, 100] {
            engine.run(&mut registry, backlog).await;
            assert!(registry.size() <= 4);
        }
        assert_eq!(registry.size(), 4);
        assert_eq!(
            cloud.events()
                .iter()
                .filter(|e| matches!(e, CloudEvent::Launch(_)))
                .cloned()
                .collect::<Vec<_>>(),
            vec![CloudEvent::Launch(3), CloudEvent::Launch(1)]
        );
    }

    #[tokio::test]
    async fn scale_down_from_tail() {
        let cloud = MockCloud::new(CloudBuilder::default());
        let (mut engine, mut registry) = EngineBuilder::default().build(&cloud);
        grow(&mut engine, &mut registry, 5).await;
        let ids: Vec<_> = registry
            .all()
            .iter()
            .map(|w| w.instance_id.clone())
            .collect();
        let tail_leases: Vec<_> = registry.all()[2..]
            .iter()
            .map(|w| w.lease.clone().unwrap().allocation_id)
            .collect();

        let outcome = engine.run(&mut registry, 2).await;
        assert_eq!(outcome.decision, ScalingDecision::ScaleDown(3));
        assert_eq!(registry.size(), 2);
        assert_eq!(registry.all()[0].instance_id, ids[0]);
        assert_eq!(registry.all()[1].instance_id, ids[1]);

        let mut released = cloud.released();
        released.sort();
        let mut expected = tail_leases.clone();
        expected.sort();
        assert_eq!(released, expected);
        assert_eq!(cloud.held_addresses(), 2);

        // Every address is released before its instance is terminated
        let events = cloud.events();
        let terminate_at = events
            .iter()
            .position(|e| matches!(e, CloudEvent::Terminate(_)))
            .unwrap();
        for allocation_id in &tail_leases {
            let release_at = events
                .iter()
                .position(|e| e == &CloudEvent::Release(allocation_id.clone()))
                .unwrap();
            assert!(release_at < terminate_at);
        }
        let mut terminated = cloud.terminated();
        terminated.sort();
        let mut expected: Vec<_> = ids[2..].to_vec();
        expected.sort();
        assert_eq!(terminated, expected);
    }

    #[tokio::test]
    async fn partial_launch_is_accepted() {
        let cloud = MockCloud::new(CloudBuilder::default().launch_limit(2));
        let (mut engine, mut registry) = EngineBuilder::default().build(&cloud);

        let outcome = engine.run(&mut registry, 5).await;
        assert_eq!(outcome.decision, ScalingDecision::ScaleUp(5));
        assert_eq!(outcome.added.len(), 2);
        assert_eq!(registry.size(), 2);

        // The shortfall is compensated in a later cycle
        engine.run(&mut registry, 5).await;
        assert_eq!(registry.size(), 4);
    }

    #[tokio::test]
    async fn failed_allocation_rolls_back_instance() {
        let cloud = MockCloud::new(CloudBuilder::default().failing_allocations(vec![1]));
        let (mut engine, mut registry) = EngineBuilder::default().build(&cloud);

        let outcome = engine.run(&mut registry, 3).await;
        assert_eq!(outcome.added.len(), 2);
        assert_eq!(outcome.rolled_back, vec!["i-1".to_string()]);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(registry.size(), 2);
        assert!(registry.get(&"i-1".to_string()).is_none());
        assert_eq!(cloud.terminated(), vec!["i-1".to_string()]);
        assert!(registry.all().iter().all(|w| w.lease.is_some()));
    }

    #[tokio::test]
    async fn instances_that_do_not_start_are_rolled_back() {
        let cloud = MockCloud::new(CloudBuilder::default().polls_until_running(100));
        let (mut engine, mut registry) = EngineBuilder::default().max_polls(3).build(&cloud);

        let outcome = engine.run(&mut registry, 2).await;
        assert!(outcome.added.is_empty());
        assert_eq!(outcome.rolled_back.len(), 2);
        assert_eq!(registry.size(), 0);
        assert_eq!(cloud.describe_calls(), 3);
        assert_eq!(cloud.held_addresses(), 0);
        assert!(cloud.live_instances().is_empty());
    }

    #[tokio::test]
    async fn failed_release_keeps_worker() {
        let cloud = MockCloud::new(CloudBuilder::default());
        let (mut engine, mut registry) = EngineBuilder::default().build(&cloud);
        grow(&mut engine, &mut registry, 3).await;

        cloud.set_fail_release(true);
        let outcome = engine.run(&mut registry, 1).await;
        assert_eq!(outcome.errors.len(), 2);
        assert_eq!(registry.size(), 3);
        assert_eq!(registry.running_count(), 3);
        assert!(
            !cloud
                .events()
                .iter()
                .any(|e| matches!(e, CloudEvent::Terminate(_)))
        );

        cloud.set_fail_release(false);
        engine.run(&mut registry, 1).await;
        assert_eq!(registry.size(), 1);
        assert_eq!(cloud.held_addresses(), 1);
    }

    #[tokio::test]
    async fn failed_termination_is_retried_without_second_release() {
        let cloud = MockCloud::new(CloudBuilder::default());
        let (mut engine, mut registry) = EngineBuilder::default().build(&cloud);
        grow(&mut engine, &mut registry, 2).await;

        cloud.set_fail_terminate(true);
        engine.run(&mut registry, 1).await;
        assert_eq!(registry.size(), 2);
        assert_eq!(registry.terminating().len(), 1);
        let worker = registry.get(&registry.terminating()[0]).unwrap();
        assert_eq!(worker.state, WorkerState::Terminating);
        assert!(worker.lease.is_none());

        cloud.set_fail_terminate(false);
        let outcome = engine.run(&mut registry, 1).await;
        assert_eq!(outcome.removed.len(), 1);
        assert_eq!(registry.size(), 1);
        assert_eq!(cloud.released().len(), 1);
    }

    #[tokio::test]
    async fn failed_launch_backs_off() {
        let mock = MockTime::mock(Instant::now());
        let cloud = MockCloud::new(CloudBuilder::default().fail_launch(true));
        let (mut engine, mut registry) = EngineBuilder::default()
            .limiter_delays(vec![Duration::ZERO, Duration::from_secs(10)])
            .build(&cloud);

        let outcome = engine.run(&mut registry, 2).await;
        assert_eq!(outcome.errors.len(), 1);
        let outcome = engine.run(&mut registry, 2).await;
        assert_eq!(outcome.limited, Some(LimiterStatus::Backoff));
        assert_eq!(cloud.events().len(), 1);

        mock.advance(Duration::from_secs(11));
        engine.run(&mut registry, 2).await;
        assert_eq!(cloud.events().len(), 2);
    }

    #[tokio::test]
    async fn cooldown_between_scaling_events() {
        let mock = MockTime::mock(Instant::now());
        let cloud = MockCloud::new(CloudBuilder::default());
        let (mut engine, mut registry) = EngineBuilder::default()
            .cooldown(Duration::from_secs(60))
            .build(&cloud);

        engine.run(&mut registry, 3).await;
        assert_eq!(registry.size(), 3);

        let outcome = engine.run(&mut registry, 0).await;
        assert_eq!(outcome.decision, ScalingDecision::ScaleDown(3));
        assert_eq!(outcome.limited, Some(LimiterStatus::Cooldown));
        assert_eq!(registry.size(), 3);

        mock.advance(Duration::from_secs(61));
        engine.run(&mut registry, 0).await;
        assert_eq!(registry.size(), 0);
    }

    #[tokio::test]
    async fn smoothed_backlog_dampens_flapping() {
        let cloud = MockCloud::new(CloudBuilder::default());
        let (mut engine, mut registry) = EngineBuilder::default()
            .smoothing_window(Some(4))
            .build(&cloud);

        for sample in [4, 0, 0, 4] {
            engine.run(&mut registry, sample).await;
        }
        assert_eq!(registry.size(), 2);
        assert_eq!(cloud.terminated().len(), 2);
        assert_eq!(
            cloud
                .events()
                .iter()
                .filter(|e| matches!(e, CloudEvent::Launch(_)))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn drain_releases_everything() {
        let cloud = MockCloud::new(CloudBuilder::default());
        let (mut engine, mut registry) = EngineBuilder::default().build(&cloud);
        grow(&mut engine, &mut registry, 4).await;

        let outcome = engine.drain(&mut registry).await;
        assert_eq!(outcome.removed.len(), 4);
        assert_eq!(registry.size(), 0);
        assert_eq!(cloud.held_addresses(), 0);
        assert!(cloud.live_instances().is_empty());
    }
}
