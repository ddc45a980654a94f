use std::future::Future;
use std::net::IpAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::rc::Rc;
use std::time::SystemTime;

use anyhow::Context;
use serde::Deserialize;
use tempfile::NamedTempFile;

use crate::controller::aws::{AwsCli, DRY_RUN_SUCCESS_CODE, is_provider_error};
use crate::controller::config::TemplateConfig;
use crate::controller::provider::{
    AddressAllocator, AddressLease, InstanceId, InstanceState, InstanceStateMap, LeaseMap,
    ManagedInstance, WorkerProvisioner,
};
use crate::controller::{CONTROLLER_TAG_KEY, FleetResult};
use crate::WrappedRcRefCell;

const INSTANCE_NOT_FOUND_CODE: &str = "InvalidInstanceID.NotFound";
const ASSOCIATION_NOT_FOUND_CODE: &str = "InvalidAssociationID.NotFound";
const ALLOCATION_NOT_FOUND_CODE: &str = "InvalidAllocationID.NotFound";

/// Launches workers as EC2 instances and binds Elastic IPs to them.
#[derive(Clone)]
pub struct Ec2Provider {
    cli: AwsCli,
    template: Rc<TemplateConfig>,
    controller_name: String,
    /// Boot script written to disk when it was configured inline.
    user_data: Option<Rc<UserData>>,
    launch_counter: WrappedRcRefCell<u64>,
}

enum UserData {
    File(PathBuf),
    Temporary(NamedTempFile),
}

impl UserData {
    fn path(&self) -> &std::path::Path {
        match self {
            UserData::File(path) => path,
            UserData::Temporary(file) => file.path(),
        }
    }
}

impl Ec2Provider {
    pub fn new(
        cli: AwsCli,
        template: TemplateConfig,
        controller_name: String,
    ) -> anyhow::Result<Self> {
        let user_data = match (&template.user_data_file, &template.user_data) {
            (Some(path), _) => {
                anyhow::ensure!(path.is_file(), "User data file {} not found", path.display());
                Some(UserData::File(path.clone()))
            }
            (None, Some(script)) => {
                let mut file = tempfile::Builder::new()
                    .prefix("fleetq-user-data")
                    .tempfile()
                    .context("Cannot create user data file")?;
                std::io::Write::write_all(&mut file, script.as_bytes())
                    .context("Cannot write user data file")?;
                Some(UserData::Temporary(file))
            }
            (None, None) => None,
        };
        Ok(Self {
            cli,
            template: Rc::new(template),
            controller_name,
            user_data: user_data.map(Rc::new),
            launch_counter: WrappedRcRefCell::wrap(0),
        })
    }

    fn run_instances_args(&self, count: u32, name: &str, dry_run: bool) -> Vec<String> {
        let template = &self.template;
        let mut args = vec![
            "--image-id".to_string(),
            template.image_id.clone(),
            "--instance-type".to_string(),
            template.instance_type.clone(),
            // Accept a partial launch instead of failing the whole request
            "--count".to_string(),
            format!("1:{count}"),
        ];
        if let Some(key_name) = &template.key_name {
            args.extend(["--key-name".to_string(), key_name.clone()]);
        }
        if !template.security_group_ids.is_empty() {
            args.push("--security-group-ids".to_string());
            args.extend(template.security_group_ids.iter().cloned());
        }
        if let Some(subnet_id) = &template.subnet_id {
            args.extend(["--subnet-id".to_string(), subnet_id.clone()]);
        }
        if let Some(user_data) = &self.user_data {
            args.extend([
                "--user-data".to_string(),
                format!("file://{}", user_data.path().display()),
            ]);
        }
        let tags = serde_json::json!([{
            "ResourceType": "instance",
            "Tags": [
                {"Key": "Name", "Value": name},
                {"Key": CONTROLLER_TAG_KEY, "Value": self.controller_name},
            ]
        }]);
        args.push("--tag-specifications".to_string());
        args.push(tags.to_string());
        if dry_run {
            args.push("--dry-run".to_string());
        }
        args
    }

    /// Checks that an instance could be launched from the template, without launching it.
    pub async fn dry_run(&self) -> FleetResult<()> {
        let name = format!("{}-dry-run", self.template.name_prefix);
        let args = self.run_instances_args(1, &name, true);
        match self.cli.run("ec2", "run-instances", args).await {
            Ok(_) => Ok(()),
            Err(error) if is_provider_error(&error, DRY_RUN_SUCCESS_CODE) => Ok(()),
            Err(error) => Err(error.context("Dry run of instance launch failed")),
        }
    }

    async fn terminate_instances(cli: AwsCli, instances: Vec<InstanceId>) -> FleetResult<()> {
        let mut args = vec!["--instance-ids".to_string()];
        args.extend(instances.iter().cloned());
        match cli.run("ec2", "terminate-instances", args).await {
            Ok(_) => Ok(()),
            Err(error) if is_provider_error(&error, INSTANCE_NOT_FOUND_CODE) => {
                if instances.len() == 1 {
                    log::warn!("Instance {} does not exist anymore", instances[0]);
                    return Ok(());
                }
                // A single unknown instance fails the whole request, terminate them one by one
                for instance in instances {
                    let terminate = Self::terminate_instances(cli.clone(), vec![instance]);
                    Box::pin(terminate).await?;
                }
                Ok(())
            }
            Err(error) => Err(error.context("Cannot terminate instances")),
        }
    }
}

impl WorkerProvisioner for Ec2Provider {
    fn launch(&self, count: u32) -> Pin<Box<dyn Future<Output = FleetResult<Vec<InstanceId>>>>> {
        let batch = {
            let mut counter = self.launch_counter.get_mut();
            *counter += 1;
            *counter
        };
        let name = format!("{}-{batch}", self.template.name_prefix);
        let args = self.run_instances_args(count, &name, false);
        let cli = self.cli.clone();

        Box::pin(async move {
            let output: RunInstancesOutput = cli.run_json("ec2", "run-instances", args).await?;
            let ids: Vec<InstanceId> = output
                .instances
                .into_iter()
                .map(|instance| instance.instance_id)
                .collect();
            Ok(ids)
        })
    }

    fn describe(
        &self,
        instances: &[InstanceId],
    ) -> Pin<Box<dyn Future<Output = FleetResult<InstanceStateMap>>>> {
        let mut args = vec!["--instance-ids".to_string()];
        args.extend(instances.iter().cloned());
        let cli = self.cli.clone();

        Box::pin(async move {
            let output: DescribeInstancesOutput =
                cli.run_json("ec2", "describe-instances", args).await?;
            let states: InstanceStateMap = output
                .into_instances()
                .map(|instance| {
                    let state = InstanceState::from_name(&instance.state.name);
                    (instance.instance_id, state)
                })
                .collect();
            Ok(states)
        })
    }

    fn terminate(
        &self,
        instances: &[InstanceId],
    ) -> Pin<Box<dyn Future<Output = FleetResult<()>>>> {
        let cli = self.cli.clone();
        let instances = instances.to_vec();
        Box::pin(async move {
            if instances.is_empty() {
                return Ok(());
            }
            Self::terminate_instances(cli, instances).await
        })
    }

    fn list_managed(&self) -> Pin<Box<dyn Future<Output = FleetResult<Vec<ManagedInstance>>>>> {
        let args = vec![
            "--filters".to_string(),
            format!("Name=tag:{CONTROLLER_TAG_KEY},Values={}", self.controller_name),
            "Name=instance-state-name,Values=pending,running".to_string(),
        ];
        let cli = self.cli.clone();

        Box::pin(async move {
            let output: DescribeInstancesOutput =
                cli.run_json("ec2", "describe-instances", args).await?;
            Ok(parse_managed_instances(output))
        })
    }
}

impl AddressAllocator for Ec2Provider {
    fn allocate_and_associate(
        &self,
        instance: &InstanceId,
    ) -> Pin<Box<dyn Future<Output = FleetResult<AddressLease>>>> {
        let cli = self.cli.clone();
        let instance = instance.clone();

        Box::pin(async move {
            let allocation: AllocateAddressOutput = cli
                .run_json(
                    "ec2",
                    "allocate-address",
                    vec!["--domain".to_string(), "vpc".to_string()],
                )
                .await
                .context("Cannot allocate address")?;
            let mut lease = AddressLease {
                allocation_id: allocation.allocation_id,
                public_ip: allocation.public_ip,
                association_id: None,
            };

            let association: FleetResult<AssociateAddressOutput> = cli
                .run_json(
                    "ec2",
                    "associate-address",
                    vec![
                        "--instance-id".to_string(),
                        instance.clone(),
                        "--allocation-id".to_string(),
                        lease.allocation_id.clone(),
                    ],
                )
                .await;
            match association {
                Ok(association) => {
                    lease.association_id = association.association_id;
                    log::debug!(
                        "Address {} ({}) associated with instance {instance}",
                        lease.public_ip,
                        lease.allocation_id
                    );
                    Ok(lease)
                }
                Err(error) => {
                    if let Err(release_error) = release_address(&cli, &lease).await {
                        log::error!(
                            "Cannot release address {} after a failed association: {release_error:?}",
                            lease.allocation_id
                        );
                    }
                    Err(error.context(format!("Cannot associate address with instance {instance}")))
                }
            }
        })
    }

    fn release(&self, lease: &AddressLease) -> Pin<Box<dyn Future<Output = FleetResult<()>>>> {
        let cli = self.cli.clone();
        let lease = lease.clone();
        Box::pin(async move { release_address(&cli, &lease).await })
    }

    fn find_leases(
        &self,
        instances: &[InstanceId],
    ) -> Pin<Box<dyn Future<Output = FleetResult<LeaseMap>>>> {
        let cli = self.cli.clone();
        let filter = format!("Name=instance-id,Values={}", instances.join(","));
        let empty = instances.is_empty();

        Box::pin(async move {
            if empty {
                return Ok(LeaseMap::new());
            }
            let output: DescribeAddressesOutput = cli
                .run_json(
                    "ec2",
                    "describe-addresses",
                    vec!["--filters".to_string(), filter],
                )
                .await?;
            Ok(parse_leases(output))
        })
    }
}

async fn release_address(cli: &AwsCli, lease: &AddressLease) -> FleetResult<()> {
    // An associated address cannot be released
    if let Some(association_id) = &lease.association_id {
        let result = cli
            .run(
                "ec2",
                "disassociate-address",
                vec!["--association-id".to_string(), association_id.clone()],
            )
            .await;
        if let Err(error) = result {
            if !is_provider_error(&error, ASSOCIATION_NOT_FOUND_CODE) {
                let message = format!("Cannot disassociate address {}", lease.public_ip);
                return Err(error.context(message));
            }
        }
    }
    let result = cli
        .run(
            "ec2",
            "release-address",
            vec!["--allocation-id".to_string(), lease.allocation_id.clone()],
        )
        .await;
    match result {
        Ok(_) => {
            log::info!("Released address {} ({})", lease.public_ip, lease.allocation_id);
            Ok(())
        }
        Err(error) if is_provider_error(&error, ALLOCATION_NOT_FOUND_CODE) => {
            log::warn!("Address {} was already released", lease.allocation_id);
            Ok(())
        }
        Err(error) => {
            let message = format!("Cannot release address {}", lease.public_ip);
            Err(error.context(message))
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RunInstancesOutput {
    #[serde(default)]
    instances: Vec<Ec2Instance>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeInstancesOutput {
    #[serde(default)]
    reservations: Vec<Reservation>,
}

impl DescribeInstancesOutput {
    fn into_instances(self) -> impl Iterator<Item = Ec2Instance> {
        self.reservations
            .into_iter()
            .flat_map(|reservation| reservation.instances)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Reservation {
    #[serde(default)]
    instances: Vec<Ec2Instance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Ec2Instance {
    instance_id: InstanceId,
    #[serde(default)]
    state: Ec2InstanceState,
    #[serde(default)]
    launch_time: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Ec2InstanceState {
    name: String,
}

impl Default for Ec2InstanceState {
    fn default() -> Self {
        Self {
            name: "pending".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AllocateAddressOutput {
    allocation_id: String,
    public_ip: IpAddr,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AssociateAddressOutput {
    #[serde(default)]
    association_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeAddressesOutput {
    #[serde(default)]
    addresses: Vec<Ec2Address>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Ec2Address {
    #[serde(default)]
    instance_id: Option<InstanceId>,
    public_ip: IpAddr,
    allocation_id: String,
    #[serde(default)]
    association_id: Option<String>,
}

fn parse_launch_time(value: &str) -> Option<SystemTime> {
    chrono::DateTime::parse_from_rfc3339(value)
        .map(SystemTime::from)
        .map_err(|e| log::warn!("Cannot parse instance launch time `{value}`: {e}"))
        .ok()
}

fn parse_managed_instances(output: DescribeInstancesOutput) -> Vec<ManagedInstance> {
    let mut instances: Vec<ManagedInstance> = output
        .into_instances()
        .map(|instance| ManagedInstance {
            state: InstanceState::from_name(&instance.state.name),
            launched_at: instance.launch_time.as_deref().and_then(parse_launch_time),
            id: instance.instance_id,
        })
        .collect();
    instances.sort_by(|a, b| a.launched_at.cmp(&b.launched_at).then(a.id.cmp(&b.id)));
    instances
}

fn parse_leases(output: DescribeAddressesOutput) -> LeaseMap {
    output
        .addresses
        .into_iter()
        .filter_map(|address| {
            let instance = address.instance_id?;
            Some((
                instance,
                AddressLease {
                    allocation_id: address.allocation_id,
                    public_ip: address.public_ip,
                    association_id: address.association_id,
                },
            ))
        })
        .collect()
}
