use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::rc::Rc;

use anyhow::Context;
use futures::future::join_all;

use crate::controller::FleetResult;
use crate::controller::config::DispatchConfig;
use crate::controller::job::{IntakeError, IntakeResponse, Job, JobMessage, ResultMessage};
use crate::controller::provider::InstanceId;
use crate::controller::registry::WorkerRegistry;

/// Handler that can hand a job over to the intake endpoint of a worker.
pub trait JobIntake {
    fn submit(
        &self,
        address: SocketAddr,
        job: &Job,
    ) -> Pin<Box<dyn Future<Output = FleetResult<IntakeResponse>>>>;
}

/// Sends jobs to workers as `POST <path>` requests with a JSON body.
#[derive(Clone)]
pub struct HttpJobIntake {
    client: reqwest::Client,
    path: String,
}

impl HttpJobIntake {
    pub fn new(config: &DispatchConfig) -> FleetResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .context("Cannot create HTTP client")?;
        Ok(Self {
            client,
            path: config.path.clone(),
        })
    }
}

impl JobIntake for HttpJobIntake {
    fn submit(
        &self,
        address: SocketAddr,
        job: &Job,
    ) -> Pin<Box<dyn Future<Output = FleetResult<IntakeResponse>>>> {
        let client = self.client.clone();
        let url = format!("http://{address}{}", self.path);
        let body = JobMessage {
            s3_url: job.payload_ref.clone(),
        };

        Box::pin(async move {
            let response = client
                .post(&url)
                .json(&body)
                .send()
                .await
                .with_context(|| format!("Request to {url} failed"))?;
            let status = response.status();
            if status.is_success() {
                return response
                    .json::<IntakeResponse>()
                    .await
                    .with_context(|| format!("Invalid response from {url}"));
            }
            let text = response.text().await.unwrap_or_default();
            let error = serde_json::from_str::<IntakeError>(&text)
                .map(|e| e.error)
                .unwrap_or(text);
            Err(anyhow::anyhow!("Worker at {url} responded with {status}: {error}"))
        })
    }
}

#[derive(Debug)]
pub enum DispatchOutcome {
    /// The worker has processed the job, its message can be acknowledged.
    Completed {
        instance_id: InstanceId,
        result: ResultMessage,
    },
    /// The job stays in the queue and will be delivered again.
    Failed {
        instance_id: InstanceId,
        error: anyhow::Error,
    },
    /// There was no running worker.
    Unroutable,
}

/// Assigns jobs to running workers in round-robin order.
pub struct Dispatcher {
    intake: Rc<dyn JobIntake>,
    worker_port: u16,
}

impl Dispatcher {
    pub fn new(intake: Rc<dyn JobIntake>, worker_port: u16) -> Self {
        Self {
            intake,
            worker_port,
        }
    }

    /// Job `i` of the batch is sent to running worker `i mod k`.
    /// The requests of a batch run concurrently, outcomes are returned in job order.
    pub async fn route(&self, registry: &WorkerRegistry, jobs: &[Job]) -> Vec<DispatchOutcome> {
        let targets: Vec<(InstanceId, SocketAddr)> = registry
            .running()
            .filter_map(|worker| {
                let ip = worker.public_ip()?;
                let address = SocketAddr::new(ip, self.worker_port);
                Some((worker.instance_id.clone(), address))
            })
            .collect();
        if targets.is_empty() {
            if !jobs.is_empty() {
                log::warn!(
                    "No running worker, {} job(s) will stay in the queue",
                    jobs.len()
                );
            }
            return jobs.iter().map(|_| DispatchOutcome::Unroutable).collect();
        }

        let requests = jobs.iter().enumerate().map(|(index, job)| {
            let (instance_id, address) = targets[index % targets.len()].clone();
            let request = self.intake.submit(address, job);
            let job_id = job.id.clone();
            async move {
                log::debug!("Dispatching job {job_id} to worker {instance_id} ({address})");
                match request.await {
                    Ok(response) => {
                        log::debug!("Worker {instance_id} responded: {}", response.message);
                        DispatchOutcome::Completed {
                            instance_id,
                            result: ResultMessage {
                                output_key: job_id,
                                prediction: response.result,
                            },
                        }
                    }
                    Err(error) => {
                        log::error!("Job {job_id} failed on worker {instance_id}: {error:?}");
                        DispatchOutcome::Failed { instance_id, error }
                    }
                }
            }
        });
        join_all(requests).await
    }
}
