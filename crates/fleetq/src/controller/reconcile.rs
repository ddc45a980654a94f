//! Rebuilds the fleet from instances that were launched by a previous run of the controller.
use anyhow::Context;

use crate::controller::FleetResult;
use crate::controller::provider::{
    AddressAllocator, InstanceId, InstanceState, LeaseMap, RunningWait, WorkerProvisioner,
    await_running,
};
use crate::controller::registry::{Worker, WorkerRegistry};

#[derive(Debug, Default)]
pub struct ReconcileReport {
    /// Instances that joined the fleet.
    pub adopted: Vec<InstanceId>,
    /// Instances that were terminated, either because they did not fit into the fleet or because
    /// they could not be made running.
    pub terminated: Vec<InstanceId>,
}

pub async fn reconcile_fleet(
    provisioner: &dyn WorkerProvisioner,
    allocator: &dyn AddressAllocator,
    wait: &RunningWait,
    registry: &mut WorkerRegistry,
) -> FleetResult<ReconcileReport> {
    let mut report = ReconcileReport::default();
    let mut managed = provisioner
        .list_managed()
        .await
        .context("Cannot list instances of the controller")?;
    managed.retain(|instance| registry.get(&instance.id).is_none());
    if managed.is_empty() {
        log::info!("No instances to reconcile");
        return Ok(report);
    }

    let ids: Vec<InstanceId> = managed.iter().map(|i| i.id.clone()).collect();
    let mut leases = allocator
        .find_leases(&ids)
        .await
        .context("Cannot find addresses of controller instances")?;
    log::info!(
        "Found {} instance(s) of a previous run, {} with an address",
        managed.len(),
        leases.len()
    );

    // The oldest instances are kept
    let capacity = registry.free_capacity() as usize;
    let excess = if managed.len() > capacity {
        managed.split_off(capacity)
    } else {
        vec![]
    };
    if !excess.is_empty() {
        let excess: Vec<InstanceId> = excess.into_iter().map(|i| i.id).collect();
        log::warn!("Fleet is full, terminating instances {excess:?}");
        terminate(provisioner, allocator, &mut leases, excess, &mut report).await;
    }

    let pending: Vec<InstanceId> = managed
        .iter()
        .filter(|i| i.state != InstanceState::Running)
        .map(|i| i.id.clone())
        .collect();
    if !pending.is_empty() {
        if let Err(error) = await_running(provisioner, &pending, wait).await {
            log::error!("Instances of a previous run did not start: {error}");
            managed.retain(|i| !pending.contains(&i.id));
            terminate(provisioner, allocator, &mut leases, pending, &mut report).await;
        }
    }

    for instance in managed {
        let lease = match leases.remove(&instance.id) {
            Some(lease) => lease,
            None => match allocator.allocate_and_associate(&instance.id).await {
                Ok(lease) => lease,
                Err(error) => {
                    log::error!(
                        "Cannot allocate address for instance {}: {error:?}",
                        instance.id
                    );
                    terminate(
                        provisioner,
                        allocator,
                        &mut leases,
                        vec![instance.id],
                        &mut report,
                    )
                    .await;
                    continue;
                }
            },
        };
        match registry.add(Worker::running(instance.id.clone(), lease.clone())) {
            Ok(()) => {
                log::info!("Adopted worker {} at {}", instance.id, lease.public_ip);
                report.adopted.push(instance.id);
            }
            Err(error) => {
                log::error!("Cannot adopt instance {}: {error}", instance.id);
                leases.insert(instance.id.clone(), lease);
                terminate(
                    provisioner,
                    allocator,
                    &mut leases,
                    vec![instance.id],
                    &mut report,
                )
                .await;
            }
        }
    }
    Ok(report)
}

/// Releases addresses of the given instances and terminates them.
async fn terminate(
    provisioner: &dyn WorkerProvisioner,
    allocator: &dyn AddressAllocator,
    leases: &mut LeaseMap,
    instances: Vec<InstanceId>,
    report: &mut ReconcileReport,
) {
    if instances.is_empty() {
        return;
    }
    for instance in &instances {
        if let Some(lease) = leases.remove(instance) {
            if let Err(error) = allocator.release(&lease).await {
                log::error!(
                    "Cannot release address {} of instance {instance}: {error:?}",
                    lease.public_ip
                );
            }
        }
    }
    match provisioner.terminate(&instances).await {
        Ok(()) => report.terminated.extend(instances),
        Err(error) => log::error!("Cannot terminate instances {instances:?}: {error:?}"),
    }
}
