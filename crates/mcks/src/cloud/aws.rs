//! AWS adapter: metadata lookup and cloud-controller-manager wiring.
//!
//! The cloud-controller-manager refuses to adopt instances it cannot
//! attribute to a cluster, so every worker addition on a `SINGLE` AWS
//! cluster associates an IAM instance profile with the instance and tags
//! the instance, its security groups and its subnet with
//! `kubernetes.io/cluster/<name> = owned`. Freshly created EC2 resources
//! are only eventually taggable, hence the backoff loop.

use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_ec2::types::{IamInstanceProfileSpecification, Tag};
use tracing::{info, warn};

use super::CloudError;
use crate::broker::Vm;
use crate::config::AwsCcmConfig;
use crate::ssh::{RemoteExecutor, SshTarget};

/// Instance metadata endpoint, reachable from the instance only.
const IMDS_LOCAL_HOSTNAME_URL: &str =
    "http://169.254.169.254/latest/meta-data/local-hostname";

/// Tag key prefix distinguishing logically independent clusters.
/// Format: `kubernetes.io/cluster/<cluster> = owned`.
pub const TAG_KUBERNETES_CLUSTER_PREFIX: &str = "kubernetes.io/cluster/";

/// Tag value marking a resource whose lifecycle is tied to the cluster.
pub const RESOURCE_LIFECYCLE_OWNED: &str = "owned";

/// Resolve the hostname AWS assigned to an instance by querying the
/// metadata service *from the instance* over SSH.
pub async fn local_hostname(
    exec: &dyn RemoteExecutor,
    target: &SshTarget,
) -> Result<String, CloudError> {
    let output = exec
        .execute(target, &format!("curl -s {IMDS_LOCAL_HOSTNAME_URL}"))
        .await
        .map_err(|e| CloudError::Lookup {
            node: target.name.clone(),
            cause: e.to_string(),
        })?;
    if output.is_empty() {
        return Err(CloudError::Lookup {
            node: target.name.clone(),
            cause: "metadata service returned no hostname".to_string(),
        });
    }
    Ok(output)
}

/// The slice of the EC2 API the core touches.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Ec2Api: Send + Sync {
    async fn associate_iam_instance_profile(
        &self,
        instance_id: &str,
        profile_name: &str,
    ) -> Result<(), CloudError>;

    async fn create_tags(
        &self,
        resource_id: &str,
        tags: &[(String, String)],
    ) -> Result<(), CloudError>;
}

/// [`Ec2Api`] backed by the AWS SDK with ambient credentials.
pub struct Ec2Sdk {
    client: aws_sdk_ec2::Client,
}

impl Ec2Sdk {
    /// Load SDK configuration from the environment.
    pub async fn load() -> Self {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self {
            client: aws_sdk_ec2::Client::new(&config),
        }
    }
}

#[async_trait]
impl Ec2Api for Ec2Sdk {
    async fn associate_iam_instance_profile(
        &self,
        instance_id: &str,
        profile_name: &str,
    ) -> Result<(), CloudError> {
        let profile = IamInstanceProfileSpecification::builder()
            .name(profile_name)
            .build();
        self.client
            .associate_iam_instance_profile()
            .iam_instance_profile(profile)
            .instance_id(instance_id)
            .send()
            .await
            .map_err(|e| CloudError::Api(e.to_string()))?;
        Ok(())
    }

    async fn create_tags(
        &self,
        resource_id: &str,
        tags: &[(String, String)],
    ) -> Result<(), CloudError> {
        let mut request = self.client.create_tags().resources(resource_id);
        for (key, value) in tags {
            request = request.tags(Tag::builder().key(key).value(value).build());
        }
        request
            .send()
            .await
            .map_err(|e| CloudError::Api(e.to_string()))?;
        Ok(())
    }
}

/// Exponential backoff applied to `CreateTags` calls.
///
/// Starting at one second and doubling for nine steps gives ~255 seconds
/// of total waiting, enough for EC2's eventual consistency to catch up.
#[derive(Debug, Clone, Copy)]
pub struct TagBackoff {
    pub initial: Duration,
    pub factor: f64,
    pub steps: u32,
}

impl Default for TagBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            factor: 2.0,
            steps: 9,
        }
    }
}

/// Tags AWS resources with the cluster ownership marker.
pub struct AwsTagging {
    cluster_name: String,
    backoff: TagBackoff,
}

impl AwsTagging {
    pub fn new(cluster_name: impl Into<String>) -> Result<Self, CloudError> {
        let cluster_name = cluster_name.into();
        if cluster_name.is_empty() {
            return Err(CloudError::Api(
                "no cluster name to tag resources with".to_string(),
            ));
        }
        Ok(Self {
            cluster_name,
            backoff: TagBackoff::default(),
        })
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: TagBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    fn build_tags(&self, lifecycle: &str) -> Vec<(String, String)> {
        vec![(
            format!("{TAG_KUBERNETES_CLUSTER_PREFIX}{}", self.cluster_name),
            lifecycle.to_string(),
        )]
    }

    /// Tag one resource, retrying on any error. The error code varies
    /// with the resource kind while it is still materializing, so the
    /// loop does not try to distinguish retryable failures. On
    /// exhaustion the last observed EC2 error is returned, not a
    /// timeout.
    pub async fn create_tags(
        &self,
        ec2: &dyn Ec2Api,
        resource_id: &str,
        lifecycle: &str,
    ) -> Result<(), CloudError> {
        let tags = self.build_tags(lifecycle);
        let mut delay = self.backoff.initial;
        let mut last_err = None;

        for step in 0..self.backoff.steps {
            match ec2.create_tags(resource_id, &tags).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    info!(resource = %resource_id, error = %e, "failed to create tags; will retry");
                    last_err = Some(e);
                    if step + 1 < self.backoff.steps {
                        tokio::time::sleep(delay).await;
                        delay = Duration::from_secs_f64(delay.as_secs_f64() * self.backoff.factor);
                    }
                }
            }
        }

        Err(last_err.unwrap_or_else(|| CloudError::Api("tagging never attempted".to_string())))
    }
}

/// Prepare every VM of a worker/control-plane addition for the AWS
/// cloud-controller-manager: associate the role-appropriate instance
/// profile, then tag the instance, its security groups and its subnet as
/// owned by the cluster.
pub async fn prepare_ccm(
    ec2: &dyn Ec2Api,
    tagging: &AwsTagging,
    roles: &AwsCcmConfig,
    vms: &[Vm],
    control_plane_names: &[String],
) -> Result<(), CloudError> {
    for vm in vms {
        let role = if control_plane_names.iter().any(|n| n == &vm.name) {
            &roles.control_plane_role
        } else {
            &roles.worker_role
        };
        let detail = &vm.csp_view_vm_detail;

        ec2.associate_iam_instance_profile(&detail.iid.system_id, role)
            .await?;
        info!(vm = %vm.name, instance = %detail.iid.system_id, profile = %role,
              "associated iam instance profile");

        tagging
            .create_tags(ec2, &detail.iid.system_id, RESOURCE_LIFECYCLE_OWNED)
            .await?;
        for sg in &detail.security_group_iids {
            tagging
                .create_tags(ec2, &sg.system_id, RESOURCE_LIFECYCLE_OWNED)
                .await?;
        }
        if detail.subnet_iid.system_id.is_empty() {
            warn!(vm = %vm.name, "vm has no subnet id to tag");
        } else {
            tagging
                .create_tags(ec2, &detail.subnet_iid.system_id, RESOURCE_LIFECYCLE_OWNED)
                .await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;

    fn fast_backoff(steps: u32) -> TagBackoff {
        TagBackoff {
            initial: Duration::from_millis(1),
            factor: 2.0,
            steps,
        }
    }

    fn is_owned_tag(tags: &[(String, String)], cluster: &str) -> bool {
        tags == [(
            format!("kubernetes.io/cluster/{cluster}"),
            "owned".to_string(),
        )]
    }

    #[tokio::test]
    async fn test_create_tags_retries_until_success() {
        let mut ec2 = MockEc2Api::new();
        let mut calls = 0;
        ec2.expect_create_tags()
            .times(3)
            .returning(move |_, _| {
                calls += 1;
                if calls < 3 {
                    Err(CloudError::Api("InvalidGroup.NotFound".to_string()))
                } else {
                    Ok(())
                }
            });

        let tagging = AwsTagging::new("c1").unwrap().with_backoff(fast_backoff(9));
        tagging.create_tags(&ec2, "sg-1", "owned").await.unwrap();
    }

    #[tokio::test]
    async fn test_create_tags_surfaces_last_error() {
        let mut ec2 = MockEc2Api::new();
        let mut calls = 0;
        ec2.expect_create_tags().times(3).returning(move |_, _| {
            calls += 1;
            Err(CloudError::Api(format!("attempt-{calls}")))
        });

        let tagging = AwsTagging::new("c1").unwrap().with_backoff(fast_backoff(3));
        let err = tagging.create_tags(&ec2, "i-1", "owned").await.unwrap_err();
        assert_eq!(err.to_string(), "Cloud API error: attempt-3");
    }

    #[tokio::test]
    async fn test_create_tags_idempotent_on_success() {
        let mut ec2 = MockEc2Api::new();
        ec2.expect_create_tags()
            .withf(|resource, tags| resource == "i-1" && is_owned_tag(tags, "c1"))
            .times(2)
            .returning(|_, _| Ok(()));

        let tagging = AwsTagging::new("c1").unwrap().with_backoff(fast_backoff(9));
        tagging.create_tags(&ec2, "i-1", "owned").await.unwrap();
        tagging.create_tags(&ec2, "i-1", "owned").await.unwrap();
    }

    #[tokio::test]
    async fn test_prepare_ccm_tags_all_resources() {
        use crate::broker::{CspViewVmDetail, Iid, Vm};

        let vm = Vm {
            name: "worker-2".to_string(),
            csp_view_vm_detail: CspViewVmDetail {
                iid: Iid {
                    name_id: "worker-2".to_string(),
                    system_id: "i-0abc".to_string(),
                },
                vm_spec_name: "t3.medium".to_string(),
                subnet_iid: Iid {
                    system_id: "subnet-1".to_string(),
                    ..Iid::default()
                },
                security_group_iids: vec![
                    Iid {
                        system_id: "sg-1".to_string(),
                        ..Iid::default()
                    },
                    Iid {
                        system_id: "sg-2".to_string(),
                        ..Iid::default()
                    },
                ],
            },
            ..Vm::default()
        };

        let mut ec2 = MockEc2Api::new();
        ec2.expect_associate_iam_instance_profile()
            .with(eq("i-0abc"), eq("k8s-worker-role-for-ccm"))
            .times(1)
            .returning(|_, _| Ok(()));
        for resource in ["i-0abc", "sg-1", "sg-2", "subnet-1"] {
            ec2.expect_create_tags()
                .withf(move |r, tags| r == resource && is_owned_tag(tags, "c1"))
                .times(1)
                .returning(|_, _| Ok(()));
        }

        let tagging = AwsTagging::new("c1").unwrap().with_backoff(fast_backoff(2));
        prepare_ccm(
            &ec2,
            &tagging,
            &AwsCcmConfig::default(),
            std::slice::from_ref(&vm),
            &[],
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_prepare_ccm_uses_control_plane_role() {
        use crate::broker::{CspViewVmDetail, Iid, Vm};

        let vm = Vm {
            name: "control-plane-2".to_string(),
            csp_view_vm_detail: CspViewVmDetail {
                iid: Iid {
                    system_id: "i-0cp".to_string(),
                    ..Iid::default()
                },
                subnet_iid: Iid {
                    system_id: "subnet-1".to_string(),
                    ..Iid::default()
                },
                ..CspViewVmDetail::default()
            },
            ..Vm::default()
        };

        let mut ec2 = MockEc2Api::new();
        ec2.expect_associate_iam_instance_profile()
            .with(eq("i-0cp"), eq("k8s-control-plane-role-for-ccm"))
            .times(1)
            .returning(|_, _| Ok(()));
        ec2.expect_create_tags().returning(|_, _| Ok(()));

        let tagging = AwsTagging::new("c1").unwrap().with_backoff(fast_backoff(2));
        prepare_ccm(
            &ec2,
            &tagging,
            &AwsCcmConfig::default(),
            std::slice::from_ref(&vm),
            &["control-plane-2".to_string()],
        )
        .await
        .unwrap();
    }

    #[test]
    fn test_empty_cluster_name_rejected() {
        assert!(AwsTagging::new("").is_err());
    }
}
