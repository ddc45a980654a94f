use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::controller::provider::{AddressLease, InstanceId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerState {
    /// The instance was launched, but it is not running yet or it has no address.
    Provisioning,
    /// The instance is running and reachable on its public address.
    Running,
    /// The address of the worker was released and the instance is being terminated.
    Terminating,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub instance_id: InstanceId,
    pub lease: Option<AddressLease>,
    pub state: WorkerState,
    pub added_at: DateTime<Utc>,
}

impl Worker {
    pub fn provisioning(instance_id: InstanceId) -> Self {
        Self {
            instance_id,
            lease: None,
            state: WorkerState::Provisioning,
            added_at: Utc::now(),
        }
    }

    pub fn running(instance_id: InstanceId, lease: AddressLease) -> Self {
        Self {
            instance_id,
            lease: Some(lease),
            state: WorkerState::Running,
            added_at: Utc::now(),
        }
    }

    pub fn public_ip(&self) -> Option<IpAddr> {
        self.lease.as_ref().map(|lease| lease.public_ip)
    }

    pub fn is_running(&self) -> bool {
        self.state == WorkerState::Running
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Fleet is full ({max_size} workers)")]
    FleetFull { max_size: u32 },
    #[error("Worker {0} is already registered")]
    DuplicateWorker(InstanceId),
    #[error("Address {address} is already leased by worker {owner}")]
    AddressInUse { address: IpAddr, owner: InstanceId },
    #[error("Running worker {0} has no address")]
    MissingAddress(InstanceId),
    #[error("Worker {0} is not registered")]
    UnknownWorker(InstanceId),
}

/// Ordered list of workers managed by the controller.
///
/// The order decides round-robin dispatch targets, workers added last are the first ones to be
/// removed when the fleet shrinks.
#[derive(Debug)]
pub struct WorkerRegistry {
    workers: Vec<Worker>,
    max_size: u32,
}

impl WorkerRegistry {
    pub fn new(max_size: u32) -> Self {
        Self {
            workers: Vec::new(),
            max_size,
        }
    }

    pub fn max_size(&self) -> u32 {
        self.max_size
    }

    pub fn size(&self) -> u32 {
        self.workers.len() as u32
    }

    /// Number of workers that can still be added.
    pub fn free_capacity(&self) -> u32 {
        self.max_size.saturating_sub(self.size())
    }

    pub fn add(&mut self, worker: Worker) -> Result<(), RegistryError> {
        if self.size() >= self.max_size {
            return Err(RegistryError::FleetFull {
                max_size: self.max_size,
            });
        }
        if self.get(&worker.instance_id).is_some() {
            return Err(RegistryError::DuplicateWorker(worker.instance_id));
        }
        if worker.is_running() && worker.lease.is_none() {
            return Err(RegistryError::MissingAddress(worker.instance_id));
        }
        if let Some(lease) = &worker.lease {
            self.check_address_free(lease)?;
        }
        self.workers.push(worker);
        Ok(())
    }

    /// Removes the given workers, returning the removed records.
    /// Unknown ids are ignored.
    pub fn remove(&mut self, instances: &[InstanceId]) -> Vec<Worker> {
        let (removed, kept): (Vec<Worker>, Vec<Worker>) = std::mem::take(&mut self.workers)
            .into_iter()
            .partition(|worker| instances.contains(&worker.instance_id));
        self.workers = kept;
        removed
    }

    pub fn get(&self, instance: &InstanceId) -> Option<&Worker> {
        self.workers.iter().find(|w| &w.instance_id == instance)
    }

    fn get_mut(&mut self, instance: &InstanceId) -> Result<&mut Worker, RegistryError> {
        self.workers
            .iter_mut()
            .find(|w| &w.instance_id == instance)
            .ok_or_else(|| RegistryError::UnknownWorker(instance.clone()))
    }

    pub fn worker_at(&self, index: usize) -> Option<&Worker> {
        self.workers.get(index)
    }

    pub fn all(&self) -> &[Worker] {
        &self.workers
    }

    /// Workers that can receive jobs, in fleet order.
    pub fn running(&self) -> impl Iterator<Item = &Worker> {
        self.workers.iter().filter(|w| w.is_running())
    }

    pub fn running_count(&self) -> usize {
        self.running().count()
    }

    /// Ids of workers whose termination has not been confirmed yet.
    pub fn terminating(&self) -> Vec<InstanceId> {
        self.workers
            .iter()
            .filter(|w| w.state == WorkerState::Terminating)
            .map(|w| w.instance_id.clone())
            .collect()
    }

    /// Selects up to `count` workers for removal, starting from the tail of the fleet.
    /// Workers that are already being terminated are skipped.
    pub fn removal_candidates(&self, count: usize) -> Vec<InstanceId> {
        self.workers
            .iter()
            .rev()
            .filter(|w| w.state != WorkerState::Terminating)
            .take(count)
            .map(|w| w.instance_id.clone())
            .collect()
    }

    /// Attaches an address to a provisioning worker and marks it as running.
    pub fn mark_running(
        &mut self,
        instance: &InstanceId,
        lease: AddressLease,
    ) -> Result<(), RegistryError> {
        self.check_address_free(&lease)?;
        let worker = self.get_mut(instance)?;
        worker.lease = Some(lease);
        worker.state = WorkerState::Running;
        Ok(())
    }

    /// Marks the worker as terminating and detaches its address.
    /// The detached lease must have been released by the caller already.
    pub fn begin_termination(
        &mut self,
        instance: &InstanceId,
    ) -> Result<Option<AddressLease>, RegistryError> {
        let worker = self.get_mut(instance)?;
        worker.state = WorkerState::Terminating;
        Ok(worker.lease.take())
    }

    fn check_address_free(&self, lease: &AddressLease) -> Result<(), RegistryError> {
        match self.workers.iter().find(|w| {
            w.lease.as_ref().is_some_and(|l| {
                l.public_ip == lease.public_ip || l.allocation_id == lease.allocation_id
            })
        }) {
            Some(owner) => Err(RegistryError::AddressInUse {
                address: lease.public_ip,
                owner: owner.instance_id.clone(),
            }),
            None => Ok(()),
        }
    }
}
