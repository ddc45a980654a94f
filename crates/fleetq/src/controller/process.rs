use std::rc::Rc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use tokio::sync::watch;

use crate::common::rpc::{ResponseToken, RpcReceiver};
use crate::controller::aws::AwsCli;
use crate::controller::config::{BacklogSignal, ControllerConfig};
use crate::controller::dispatch::{DispatchOutcome, Dispatcher, HttpJobIntake, JobIntake};
use crate::controller::estimator::create_estimator;
use crate::controller::job::Job;
use crate::controller::provider::ec2::Ec2Provider;
use crate::controller::provider::{AddressAllocator, RunningWait, WorkerProvisioner};
use crate::controller::queue::sqs::SqsQueue;
use crate::controller::queue::{JobQueue, acknowledge_job};
use crate::controller::reconcile::{ReconcileReport, reconcile_fleet};
use crate::controller::registry::WorkerRegistry;
use crate::controller::scaling::{ScalingDecision, ScalingEngine, ScalingLimiter};
use crate::controller::service::ControllerMessage;
use crate::controller::status::{ControllerState, ControllerStatus, ScalingEvent};
use crate::controller::{
    FleetResult, LAUNCH_FAILURE_DELAYS, get_drain_timeout, get_receive_error_delay,
};

/// What happened during a single cycle of the controller loop.
#[derive(Debug, Default)]
pub struct CycleReport {
    pub received: usize,
    pub completed: usize,
    pub failed: usize,
    pub unroutable: usize,
    pub receive_failed: bool,
}

/// Owns the fleet and drives the queue, the scaling engine and the dispatcher.
pub struct Controller {
    config: ControllerConfig,
    queue: Rc<dyn JobQueue>,
    registry: WorkerRegistry,
    scaling: ScalingEngine,
    dispatcher: Dispatcher,
    status: ControllerStatus,
}

impl Controller {
    pub fn new(
        config: ControllerConfig,
        queue: Rc<dyn JobQueue>,
        provisioner: Rc<dyn WorkerProvisioner>,
        allocator: Rc<dyn AddressAllocator>,
        intake: Rc<dyn JobIntake>,
    ) -> Self {
        let scaling = ScalingEngine::new(
            provisioner,
            allocator,
            create_estimator(&config.scaling),
            ScalingLimiter::new(config.scaling.cooldown(), LAUNCH_FAILURE_DELAYS.to_vec()),
            RunningWait::from(&config.provisioning),
        );
        let max_fleet_size = config.scaling.max_fleet_size;
        Self {
            status: ControllerStatus::new(config.name.clone(), max_fleet_size),
            registry: WorkerRegistry::new(max_fleet_size),
            dispatcher: Dispatcher::new(intake, config.dispatch.worker_port),
            scaling,
            queue,
            config,
        }
    }

    /// Creates a controller that uses SQS, EC2 and HTTP workers.
    pub fn from_config(config: ControllerConfig) -> anyhow::Result<Self> {
        let cli = AwsCli::new(&config.aws);
        let queue = SqsQueue::new(
            cli.clone(),
            config.queue.url.clone(),
            config.queue.visibility_timeout_secs.map(Duration::from_secs),
        );
        let provider = Ec2Provider::new(cli, config.template.clone(), config.name.clone())?;
        let intake = HttpJobIntake::new(&config.dispatch)?;
        Ok(Self::new(
            config,
            Rc::new(queue),
            Rc::new(provider.clone()),
            Rc::new(provider),
            Rc::new(intake),
        ))
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    pub fn status(&self) -> &ControllerStatus {
        &self.status
    }

    /// Adopts instances left behind by a previous run of a controller with the same name.
    pub async fn reconcile(&mut self) -> FleetResult<ReconcileReport> {
        let report = reconcile_fleet(
            self.scaling.provisioner(),
            self.scaling.allocator(),
            self.scaling.running_wait(),
            &mut self.registry,
        )
        .await?;
        self.refresh_status();
        Ok(report)
    }

    /// Receives a batch of jobs, resizes the fleet and dispatches the jobs to workers.
    /// Only jobs that were processed by a worker are acknowledged.
    pub async fn run_cycle(&mut self) -> CycleReport {
        let mut report = CycleReport::default();
        self.status.cycles += 1;

        let queue_config = &self.config.queue;
        let jobs = match self
            .queue
            .receive(queue_config.wait_time(), queue_config.batch_size)
            .await
        {
            Ok(jobs) => jobs,
            Err(error) => {
                log::error!("Cannot receive jobs: {error:?}");
                self.status
                    .record_error(format!("Cannot receive jobs: {error:#}"));
                report.receive_failed = true;
                self.refresh_status();
                return report;
            }
        };
        report.received = jobs.len();
        self.status.jobs.received += jobs.len() as u64;

        if let Some(sample) = self.backlog_sample(&jobs).await {
            let outcome = self.scaling.run(&mut self.registry, sample).await;
            if let Some(error) = outcome.errors.last() {
                self.status.record_error(error.clone());
            }
            if outcome.decision != ScalingDecision::None {
                self.status.last_scaling = Some(ScalingEvent {
                    at: Utc::now(),
                    outcome,
                });
            }
        }

        if !jobs.is_empty() {
            let outcomes = self.dispatcher.route(&self.registry, &jobs).await;
            for (job, outcome) in jobs.iter().zip(outcomes) {
                match outcome {
                    DispatchOutcome::Completed {
                        instance_id,
                        result,
                    } => {
                        log::info!(
                            "Job {} finished on worker {instance_id}: {}",
                            result.output_key,
                            result.prediction
                        );
                        report.completed += 1;
                        self.status.jobs.completed += 1;
                        self.status.last_result = Some(result);
                        if !acknowledge_job(self.queue.as_ref(), job).await {
                            self.status.jobs.unacknowledged += 1;
                        }
                    }
                    DispatchOutcome::Failed { error, .. } => {
                        report.failed += 1;
                        self.status.jobs.failed += 1;
                        self.status
                            .record_error(format!("Job {} failed: {error:#}", job.id));
                    }
                    DispatchOutcome::Unroutable => {
                        report.unroutable += 1;
                        self.status.jobs.unroutable += 1;
                    }
                }
            }
        }
        self.refresh_status();
        report
    }

    /// Returns `None` if the fleet should not be evaluated in this cycle.
    async fn backlog_sample(&mut self, jobs: &[Job]) -> Option<u64> {
        let received = jobs.len() as u64;
        match self.config.scaling.backlog_signal {
            // The fleet is only evaluated when there is something to dispatch
            BacklogSignal::Received => (received > 0).then_some(received),
            BacklogSignal::QueueDepth => match self.queue.approximate_depth().await {
                Ok(depth) => Some(received + depth),
                Err(error) => {
                    log::warn!("Cannot get queue depth, skipping scaling: {error:?}");
                    self.status
                        .record_error(format!("Cannot get queue depth: {error:#}"));
                    None
                }
            },
        }
    }

    /// Releases all addresses and terminates all workers.
    pub async fn drain(&mut self) {
        let outcome = self.scaling.drain(&mut self.registry).await;
        if let Some(error) = outcome.errors.last() {
            self.status.record_error(error.clone());
        }
        self.refresh_status();
    }

    fn refresh_status(&mut self) {
        self.status.workers = self.registry.all().to_vec();
        self.status.updated_at = Utc::now();
    }

    fn set_state(&mut self, state: ControllerState, sender: &watch::Sender<ControllerStatus>) {
        self.status.state = state;
        self.publish(sender);
    }

    fn publish(&mut self, sender: &watch::Sender<ControllerStatus>) {
        self.refresh_status();
        sender.send_replace(self.status.clone());
    }
}

/// This is the main controller loop. Each iteration runs a full cycle, then waits for the poll
/// interval. Messages received during a cycle are handled after the cycle finishes.
pub async fn controller_process(
    mut controller: Controller,
    mut receiver: RpcReceiver<ControllerMessage>,
    status: watch::Sender<ControllerStatus>,
) {
    if controller.config.scaling.reconcile {
        match controller.reconcile().await {
            Ok(report) => log::info!(
                "Reconciliation adopted {} and terminated {} instance(s)",
                report.adopted.len(),
                report.terminated.len()
            ),
            Err(error) => {
                log::error!("Reconciliation failed: {error:?}");
                controller
                    .status
                    .record_error(format!("Reconciliation failed: {error:#}"));
            }
        }
    }
    controller.set_state(ControllerState::Running, &status);

    let poll_interval = controller.config.queue.poll_interval();
    let mut stop_tokens: Vec<ResponseToken<()>> = vec![];
    let mut stopping = false;

    while !stopping {
        let report = controller.run_cycle().await;
        controller.publish(&status);
        log::debug!("Cycle {} finished: {report:?}", controller.status.cycles);

        while let Ok(message) = receiver.try_recv() {
            stopping |= handle_message(message, &mut stop_tokens);
        }
        if stopping {
            break;
        }

        let delay = if report.receive_failed {
            get_receive_error_delay()
        } else {
            poll_interval
        };
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            message = receiver.recv() => {
                stopping = match message {
                    Some(message) => handle_message(message, &mut stop_tokens),
                    None => {
                        log::debug!("All controller handles were dropped");
                        true
                    }
                };
            }
        }
    }

    log::info!("Stopping controller {}", controller.config.name);
    controller.set_state(ControllerState::Stopping, &status);
    if controller.config.scaling.drain_on_exit
        && tokio::time::timeout(get_drain_timeout(), controller.drain())
            .await
            .is_err()
    {
        log::error!("Draining of the fleet timed out");
    }
    controller.set_state(ControllerState::Stopped, &status);
    for token in stop_tokens {
        token.respond(());
    }
}

/// Returns true if the controller should stop.
fn handle_message(message: ControllerMessage, stop_tokens: &mut Vec<ResponseToken<()>>) -> bool {
    match message {
        ControllerMessage::Stop { response } => {
            log::debug!("Controller received a stop request");
            stop_tokens.extend(response);
            true
        }
    }
}

/// Checks that the queue is accessible and that an instance could be launched from the
/// configured template, without launching it.
pub async fn dry_run(config: &ControllerConfig) -> anyhow::Result<()> {
    let cli = AwsCli::new(&config.aws);
    let queue = SqsQueue::new(cli.clone(), config.queue.url.clone(), None);
    let depth = queue.check_access().await?;
    log::info!(
        "Queue {} is accessible, approximately {depth} message(s) waiting",
        config.queue.url
    );

    let provider = Ec2Provider::new(cli, config.template.clone(), config.name.clone())?;
    provider
        .dry_run()
        .await
        .context("Instance template cannot be launched")?;
    log::info!("Instance template {} can be launched", config.template.image_id);
    Ok(())
}
