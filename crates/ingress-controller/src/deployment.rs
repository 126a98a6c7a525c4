use crate::Error;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::{Api, ObjectMeta, PostParams};
use kube::Client;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, info};

pub const DEPLOYMENT_NAME: &str = "cloudflare-tunnel-cloudflared";
const COMPONENT: &str = "cloudflared";
const PART_OF: &str = "cloudflare-tunnel-ingress-controller";
const METRICS_ADDRESS: &str = "0.0.0.0:9090";

/// How the cloudflared workload is run.
#[derive(Debug, Clone)]
pub struct CloudflaredConfig {
    pub image: String,
    pub image_pull_policy: String,
    pub namespace: String,
}

/// The tag of an image reference. Untagged, digest-only and `latest` images are rejected so
/// the version label stays meaningful.
pub fn image_tag(image: &str) -> Result<&str, Error> {
    let invalid = |reason| Error::InvalidImage(image.to_string(), reason);

    let reference = image.split('@').next().unwrap_or_default();
    let name = reference.rsplit('/').next().unwrap_or_default();
    match name.split_once(':') {
        Some((_, "")) | None => Err(invalid("an explicit tag is required")),
        Some((_, "latest")) => Err(invalid("the latest tag is not allowed")),
        Some((_, tag)) => Ok(tag),
    }
}

fn selector_labels() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app.kubernetes.io/name".to_string(), DEPLOYMENT_NAME.to_string()),
        ("app.kubernetes.io/component".to_string(), COMPONENT.to_string()),
        ("app.kubernetes.io/part-of".to_string(), PART_OF.to_string()),
    ])
}

fn labels(version: &str) -> BTreeMap<String, String> {
    let mut labels = selector_labels();
    labels.insert("app.kubernetes.io/managed-by".into(), PART_OF.into());
    labels.insert("app.kubernetes.io/version".into(), version.into());
    labels
}

pub fn build(config: &CloudflaredConfig, tunnel_token: &str) -> Result<Deployment, Error> {
    let labels = labels(image_tag(&config.image)?);

    let command = [
        "cloudflared",
        "--no-autoupdate",
        "tunnel",
        "--metrics",
        METRICS_ADDRESS,
        "run",
        "--token",
        tunnel_token,
    ]
    .into_iter()
    .map(str::to_string)
    .collect();

    Ok(Deployment {
        metadata: ObjectMeta {
            name: Some(DEPLOYMENT_NAME.to_owned()),
            namespace: Some(config.namespace.clone()),
            labels: Some(labels.clone()),
            ..ObjectMeta::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            // NOTE: Selectors are immutable, so the version label stays out of it.
            selector: LabelSelector {
                match_labels: Some(selector_labels()),
                ..LabelSelector::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..ObjectMeta::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: COMPONENT.to_owned(),
                        image: Some(config.image.clone()),
                        image_pull_policy: Some(config.image_pull_policy.clone()),
                        command: Some(command),
                        ..Container::default()
                    }],
                    restart_policy: Some("Always".to_owned()),
                    ..PodSpec::default()
                }),
            },
            ..DeploymentSpec::default()
        }),
        ..Deployment::default()
    })
}

/// Whether every label, annotation and spec field we set is already live. Fields defaulted by
/// the API server are not compared.
pub fn is_up_to_date(desired: &Deployment, live: &Deployment) -> bool {
    let pairs = [
        (
            serde_json::to_value(&desired.metadata.labels),
            serde_json::to_value(&live.metadata.labels),
        ),
        (
            serde_json::to_value(&desired.metadata.annotations),
            serde_json::to_value(&live.metadata.annotations),
        ),
        (
            serde_json::to_value(&desired.spec),
            serde_json::to_value(&live.spec),
        ),
    ];

    pairs.iter().all(|pair| match pair {
        (Ok(want), Ok(have)) => is_subset(want, have),
        _ => false,
    })
}

fn is_subset(want: &Value, have: &Value) -> bool {
    match (want, have) {
        (Value::Null, _) => true,
        (Value::Object(want), Value::Object(have)) => {
            want.iter().all(|(key, want)| match have.get(key) {
                Some(have) => is_subset(want, have),
                None => want.is_null(),
            })
        }
        (Value::Array(want), Value::Array(have)) => {
            want.len() == have.len()
                && want
                    .iter()
                    .zip(have)
                    .all(|(want, have)| is_subset(want, have))
        }
        (want, have) => want == have,
    }
}

/// Creates the cloudflared deployment, or replaces it when it drifted from what we run.
pub async fn ensure(
    kubernetes_client: &Client,
    config: &CloudflaredConfig,
    tunnel_token: &str,
) -> Result<(), Error> {
    let desired = build(config, tunnel_token)?;
    let deployment_api: Api<Deployment> =
        Api::namespaced(kubernetes_client.clone(), &config.namespace);

    match deployment_api.get_opt(DEPLOYMENT_NAME).await? {
        None => {
            info!(namespace = %config.namespace, "creating cloudflared deployment");
            deployment_api
                .create(&PostParams::default(), &desired)
                .await?;
        }
        Some(live) if is_up_to_date(&desired, &live) => {
            debug!(namespace = %config.namespace, "cloudflared deployment up to date");
        }
        Some(live) => {
            info!(namespace = %config.namespace, "updating cloudflared deployment");
            let mut replacement = desired;
            replacement.metadata.resource_version = live.metadata.resource_version;
            deployment_api
                .replace(DEPLOYMENT_NAME, &PostParams::default(), &replacement)
                .await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(image: &str) -> CloudflaredConfig {
        CloudflaredConfig {
            image: image.to_string(),
            image_pull_policy: "IfNotPresent".to_string(),
            namespace: "cloudflare".to_string(),
        }
    }

    #[test]
    fn requires_an_explicit_non_latest_tag() {
        assert_eq!(image_tag("cloudflare/cloudflared:2024.6.1").unwrap(), "2024.6.1");
        assert_eq!(
            image_tag("registry.local:5000/cloudflare/cloudflared:2024.6.1").unwrap(),
            "2024.6.1"
        );
        assert!(matches!(
            image_tag("cloudflare/cloudflared"),
            Err(Error::InvalidImage(..))
        ));
        assert!(matches!(
            image_tag("registry.local:5000/cloudflared"),
            Err(Error::InvalidImage(..))
        ));
        assert!(matches!(
            image_tag("cloudflare/cloudflared:latest"),
            Err(Error::InvalidImage(..))
        ));
    }

    #[test]
    fn runs_cloudflared_with_the_tunnel_token() {
        let deployment = build(&config("cloudflare/cloudflared:2024.6.1"), "secret").unwrap();

        let labels = deployment.metadata.labels.as_ref().unwrap();
        assert_eq!(labels["app.kubernetes.io/version"], "2024.6.1");
        assert_eq!(labels["app.kubernetes.io/managed-by"], PART_OF);

        let spec = deployment.spec.as_ref().unwrap();
        assert_eq!(spec.replicas, Some(1));
        let pod = spec.template.spec.as_ref().unwrap();
        assert_eq!(pod.restart_policy.as_deref(), Some("Always"));
        let container = &pod.containers[0];
        assert_eq!(container.image_pull_policy.as_deref(), Some("IfNotPresent"));
        assert_eq!(
            container.command.as_ref().unwrap().join(" "),
            "cloudflared --no-autoupdate tunnel --metrics 0.0.0.0:9090 run --token secret"
        );
    }

    #[test]
    fn server_defaults_do_not_count_as_drift() {
        let desired = build(&config("cloudflare/cloudflared:2024.6.1"), "secret").unwrap();

        let mut live = desired.clone();
        live.metadata.resource_version = Some("42".into());
        let live_spec = live.spec.as_mut().unwrap();
        live_spec.revision_history_limit = Some(10);
        live_spec.progress_deadline_seconds = Some(600);
        let pod = live_spec.template.spec.as_mut().unwrap();
        pod.dns_policy = Some("ClusterFirst".into());
        pod.containers[0].termination_message_path = Some("/dev/termination-log".into());
        live.metadata
            .labels
            .as_mut()
            .unwrap()
            .insert("extra".into(), "label".into());

        assert!(is_up_to_date(&desired, &live));
    }

    #[test]
    fn new_token_or_image_is_drift() {
        let desired = build(&config("cloudflare/cloudflared:2024.6.1"), "secret").unwrap();
        let rotated = build(&config("cloudflare/cloudflared:2024.6.1"), "rotated").unwrap();
        let upgraded = build(&config("cloudflare/cloudflared:2024.7.0"), "secret").unwrap();

        assert!(!is_up_to_date(&desired, &rotated));
        assert!(!is_up_to_date(&desired, &upgraded));
    }
}
