//! Production [`Ec2Api`] implementation on the AWS SDK

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_ec2::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_ec2::types::{
    HttpTokensState, Instance, InstanceMetadataEndpointState, InstanceMetadataOptionsRequest,
    InstanceType, Placement, ResourceType, Tag, TagSpecification,
};
use tracing::info;

use super::{ApiFailure, Ec2Api, InstanceDescription, LaunchSpec, PlacementGroupInfo};
use crate::error::CloudError;
use crate::models::LifecycleState;

/// EC2 + SSM clients bound to one region and credentials profile.
pub struct AwsEc2 {
    ec2: aws_sdk_ec2::Client,
    ssm: aws_sdk_ssm::Client,
}

impl AwsEc2 {
    /// Resolve credentials via the default provider chain (or a named
    /// profile) and bind clients to the requested region. Credentials are
    /// never read or logged by this crate.
    pub async fn connect(region: &str, profile: Option<&str>) -> Result<Self, CloudError> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_string()));
        if let Some(profile) = profile {
            info!(profile = %profile, "Using named credentials profile");
            loader = loader.profile_name(profile);
        }
        let config = loader.load().await;

        if config.credentials_provider().is_none() {
            return Err(CloudError::Auth(
                "no credentials available from the provider chain".into(),
            ));
        }

        info!(region = %region, "Cloud clients initialized");
        Ok(Self {
            ec2: aws_sdk_ec2::Client::new(&config),
            ssm: aws_sdk_ssm::Client::new(&config),
        })
    }
}

#[async_trait]
impl Ec2Api for AwsEc2 {
    async fn run_instance(&self, spec: &LaunchSpec) -> Result<InstanceDescription, ApiFailure> {
        let mut tags = TagSpecification::builder().resource_type(ResourceType::Instance);
        for (key, value) in &spec.tags {
            tags = tags.tags(Tag::builder().key(key).value(value).build());
        }

        let mut request = self
            .ec2
            .run_instances()
            .image_id(&spec.image_id)
            .instance_type(InstanceType::from(spec.instance_type.as_str()))
            .key_name(&spec.key_name)
            .subnet_id(&spec.subnet_id)
            .min_count(1)
            .max_count(1)
            .metadata_options(
                InstanceMetadataOptionsRequest::builder()
                    .http_tokens(HttpTokensState::Required)
                    .http_put_response_hop_limit(1)
                    .http_endpoint(InstanceMetadataEndpointState::Enabled)
                    .build(),
            )
            .tag_specifications(tags.build());

        if let Some(security_group) = &spec.security_group_id {
            request = request.security_group_ids(security_group);
        }
        if let Some(group) = &spec.placement_group {
            request = request.placement(Placement::builder().group_name(group).build());
        }

        let response = request.send().await.map_err(api_failure)?;
        let instance = response.instances().first().ok_or_else(|| {
            ApiFailure::new("EmptyReservation", "run_instances returned no instances", false)
        })?;
        Ok(description_from(instance))
    }

    async fn describe_instance(
        &self,
        instance_id: &str,
    ) -> Result<InstanceDescription, ApiFailure> {
        let response = self
            .ec2
            .describe_instances()
            .instance_ids(instance_id)
            .send()
            .await
            .map_err(api_failure)?;

        let instance = response
            .reservations()
            .first()
            .and_then(|r| r.instances().first())
            .ok_or_else(|| {
                ApiFailure::new(
                    "InvalidInstanceID.NotFound",
                    format!("instance {instance_id} not found"),
                    false,
                )
            })?;
        Ok(description_from(instance))
    }

    async fn terminate_instance(&self, instance_id: &str) -> Result<(), ApiFailure> {
        self.ec2
            .terminate_instances()
            .instance_ids(instance_id)
            .send()
            .await
            .map_err(api_failure)?;
        Ok(())
    }

    async fn describe_placement_group(
        &self,
        name: &str,
    ) -> Result<Option<PlacementGroupInfo>, ApiFailure> {
        let response = match self
            .ec2
            .describe_placement_groups()
            .group_names(name)
            .send()
            .await
        {
            Ok(response) => response,
            Err(error) => {
                let failure = api_failure(error);
                if failure.code == "InvalidPlacementGroup.Unknown" {
                    return Ok(None);
                }
                return Err(failure);
            }
        };

        Ok(response.placement_groups().first().map(|group| {
            PlacementGroupInfo {
                name: group.group_name().unwrap_or(name).to_string(),
                strategy: group
                    .strategy()
                    .map(|s| s.as_str().to_string())
                    .unwrap_or_else(|| "unknown".into()),
                state: group
                    .state()
                    .map(|s| s.as_str().to_string())
                    .unwrap_or_else(|| "unknown".into()),
            }
        }))
    }

    async fn get_image_parameter(&self, name: &str) -> Result<String, ApiFailure> {
        let response = self
            .ssm
            .get_parameter()
            .name(name)
            .send()
            .await
            .map_err(api_failure)?;

        response
            .parameter()
            .and_then(|p| p.value())
            .map(str::to_string)
            .ok_or_else(|| {
                ApiFailure::new("ParameterNotFound", format!("{name} has no value"), false)
            })
    }
}

fn description_from(instance: &Instance) -> InstanceDescription {
    let placement = instance.placement();
    InstanceDescription {
        instance_id: instance.instance_id().unwrap_or_default().to_string(),
        instance_type: instance
            .instance_type()
            .map(|t| t.as_str().to_string())
            .unwrap_or_default(),
        availability_zone: placement
            .and_then(|p| p.availability_zone())
            .unwrap_or_default()
            .to_string(),
        subnet_id: instance.subnet_id().unwrap_or_default().to_string(),
        private_ip: instance.private_ip_address().map(str::to_string),
        public_ip: instance.public_ip_address().map(str::to_string),
        placement_group: placement
            .and_then(|p| p.group_name())
            .filter(|name| !name.is_empty())
            .map(str::to_string),
        state: instance
            .state()
            .and_then(|s| s.name())
            .map(|name| LifecycleState::parse(name.as_str()))
            .unwrap_or(LifecycleState::Unknown),
    }
}

fn api_failure<E, R>(error: SdkError<E, R>) -> ApiFailure
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug,
{
    match &error {
        SdkError::ServiceError(context) => {
            let meta = context.err().meta();
            let code = meta.code().unwrap_or("Unknown").to_string();
            let message = meta
                .message()
                .map(str::to_string)
                .unwrap_or_else(|| format!("{}", DisplayErrorContext(&error)));
            let retryable = matches!(
                code.as_str(),
                "RequestLimitExceeded"
                    | "Throttling"
                    | "ThrottlingException"
                    | "ServiceUnavailable"
                    | "InternalError"
            );
            ApiFailure::new(code, message, retryable)
        }
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => ApiFailure::new(
            "Transport",
            format!("{}", DisplayErrorContext(&error)),
            true,
        ),
        _ => ApiFailure::new(
            "Sdk",
            format!("{}", DisplayErrorContext(&error)),
            false,
        ),
    }
}
