//! EC2 instances with results in S3.
//!
//! Clients are built lazily from the default AWS credential and region
//! chain on first use, so constructing the backend never blocks.

use aws_config::BehaviorVersion;
use aws_sdk_ec2::error::{DisplayErrorContext, ProvideErrorMetadata};
use aws_sdk_ec2::types::{
    IamInstanceProfileSpecification, InstanceInterruptionBehavior, InstanceMarketOptionsRequest,
    InstanceStateName, InstanceType, MarketType, ResourceType, ShutdownBehavior,
    SpotInstanceType, SpotMarketOptions, Tag, TagSpecification,
};
use async_trait::async_trait;
use base64::Engine;
use tokio::sync::OnceCell;
use tracing::debug;

use super::vm::{InstanceBackend, InstanceRequest, InstanceState, VmFleetConfig};
use crate::error::{CancelError, LaunchError, ProbeError};

struct Clients {
    ec2: aws_sdk_ec2::Client,
    s3: aws_sdk_s3::Client,
}

/// [`InstanceBackend`] over the EC2 and S3 APIs.
pub struct Ec2Backend {
    config: VmFleetConfig,
    clients: OnceCell<Clients>,
}

impl Ec2Backend {
    pub fn new(config: VmFleetConfig) -> Self {
        Self {
            config,
            clients: OnceCell::new(),
        }
    }

    async fn clients(&self) -> &Clients {
        self.clients
            .get_or_init(|| async {
                let mut loader = aws_config::defaults(BehaviorVersion::latest());
                if let Some(region) = &self.config.region {
                    loader = loader.region(aws_config::Region::new(region.clone()));
                }
                let shared = loader.load().await;
                debug!(region = ?shared.region(), "Loaded AWS configuration");
                Clients {
                    ec2: aws_sdk_ec2::Client::new(&shared),
                    s3: aws_sdk_s3::Client::new(&shared),
                }
            })
            .await
    }
}

fn tag(key: &str, value: &str) -> Tag {
    Tag::builder().key(key).value(value).build()
}

fn instance_state(name: &InstanceStateName) -> InstanceState {
    match name {
        InstanceStateName::Pending => InstanceState::Pending,
        InstanceStateName::Running => InstanceState::Running,
        InstanceStateName::ShuttingDown => InstanceState::ShuttingDown,
        InstanceStateName::Terminated => InstanceState::Terminated,
        InstanceStateName::Stopping => InstanceState::Stopping,
        InstanceStateName::Stopped => InstanceState::Stopped,
        // Unknown states keep the poll going.
        _ => InstanceState::Pending,
    }
}

#[async_trait]
impl InstanceBackend for Ec2Backend {
    async fn run_instance(&self, request: &InstanceRequest) -> Result<String, LaunchError> {
        let clients = self.clients().await;
        let tags = TagSpecification::builder()
            .resource_type(ResourceType::Instance)
            .tags(tag("Name", &request.name))
            .tags(tag("Task", &request.task_id))
            .tags(tag("Batch", &request.batch_id))
            .tags(tag("AutoTerminate", "true"))
            .build();

        let mut call = clients
            .ec2
            .run_instances()
            .image_id(&self.config.image_id)
            .instance_type(InstanceType::from(self.config.instance_type.as_str()))
            .min_count(1)
            .max_count(1)
            .user_data(base64::engine::general_purpose::STANDARD.encode(&request.user_data))
            .tag_specifications(tags);

        if self.config.spot {
            call = call.instance_market_options(
                InstanceMarketOptionsRequest::builder()
                    .market_type(MarketType::Spot)
                    .spot_options(
                        SpotMarketOptions::builder()
                            .spot_instance_type(SpotInstanceType::OneTime)
                            .instance_interruption_behavior(InstanceInterruptionBehavior::Terminate)
                            .build(),
                    )
                    .build(),
            );
        } else {
            // `shutdown -h` at the end of the boot script then terminates.
            call = call.instance_initiated_shutdown_behavior(ShutdownBehavior::Terminate);
        }
        if let Some(profile) = &self.config.iam_instance_profile {
            call = call.iam_instance_profile(
                IamInstanceProfileSpecification::builder()
                    .name(profile)
                    .build(),
            );
        }
        if let Some(subnet) = &self.config.subnet_id {
            call = call.subnet_id(subnet);
        }
        for group in &self.config.security_group_ids {
            call = call.security_group_ids(group);
        }

        let output = call
            .send()
            .await
            .map_err(|e| LaunchError::Rejected(DisplayErrorContext(&e).to_string()))?;
        output
            .instances()
            .first()
            .and_then(|instance| instance.instance_id())
            .map(str::to_string)
            .ok_or_else(|| LaunchError::Rejected("RunInstances returned no instance".to_string()))
    }

    async fn describe_instance(
        &self,
        instance_id: &str,
    ) -> Result<Option<InstanceState>, ProbeError> {
        let clients = self.clients().await;
        match clients
            .ec2
            .describe_instances()
            .instance_ids(instance_id)
            .send()
            .await
        {
            Ok(output) => Ok(output
                .reservations()
                .iter()
                .flat_map(|reservation| reservation.instances())
                .find(|instance| instance.instance_id() == Some(instance_id))
                .and_then(|instance| instance.state())
                .and_then(|state| state.name())
                .map(instance_state)),
            Err(e)
                if e.as_service_error().and_then(|se| se.code())
                    == Some("InvalidInstanceID.NotFound") =>
            {
                Ok(None)
            }
            Err(e) => Err(ProbeError::Transport(DisplayErrorContext(&e).to_string())),
        }
    }

    async fn terminate_instance(&self, instance_id: &str) -> Result<(), CancelError> {
        let clients = self.clients().await;
        clients
            .ec2
            .terminate_instances()
            .instance_ids(instance_id)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| CancelError::Failed(DisplayErrorContext(&e).to_string()))
    }

    async fn fetch_object(&self, key: &str) -> Result<Option<Vec<u8>>, ProbeError> {
        let clients = self.clients().await;
        let object = match clients
            .s3
            .get_object()
            .bucket(&self.config.results_bucket)
            .key(key)
            .send()
            .await
        {
            Ok(object) => object,
            Err(e) if e.as_service_error().is_some_and(|se| se.is_no_such_key()) => {
                return Ok(None)
            }
            Err(e) => {
                return Err(ProbeError::Transport(
                    aws_sdk_s3::error::DisplayErrorContext(&e).to_string(),
                ))
            }
        };
        let bytes = object
            .body
            .collect()
            .await
            .map_err(|e| ProbeError::Transport(e.to_string()))?
            .into_bytes();
        Ok(Some(bytes.to_vec()))
    }
}
