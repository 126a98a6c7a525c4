use clap::Parser;
use ingress_controller::{CloudflaredConfig, ControllerConfig, KubeApiTunnel};
use std::fs;
use std::path::Path;

const SERVICE_ACCOUNT_NAMESPACE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/namespace";
const DEFAULT_NAMESPACE: &str = "default";

#[derive(Parser, Debug)]
#[command(version, about = "Exposes Kubernetes ingresses through a Cloudflare tunnel")]
pub struct Config {
    #[arg(long, env = "INGRESS_CLASS_NAME", default_value = "cloudflare-tunnel")]
    pub ingress_class_name: String,

    #[arg(
        long,
        env = "CONTROLLER_CLASS_NAME",
        default_value = "clbs.io/cloudflare-tunnel-ingress-controller"
    )]
    pub controller_class_name: String,

    /// Must carry an explicit tag other than `latest`.
    #[arg(long, env = "CLOUDFLARED_IMAGE")]
    pub cloudflared_image: String,

    #[arg(long, env = "CLOUDFLARED_IMAGE_PULL_POLICY")]
    pub cloudflared_image_pull_policy: String,

    #[arg(long, env = "CLOUDFLARE_API_TOKEN", hide_env_values = true)]
    pub cloudflare_api_token: String,

    #[arg(long, env = "CLOUDFLARE_ACCOUNT_ID")]
    pub cloudflare_account_id: String,

    #[arg(long, env = "CLOUDFLARE_TUNNEL_NAME")]
    pub cloudflare_tunnel_name: String,

    /// Namespace of the cloudflared deployment.
    #[arg(long, env = "POD_NAMESPACE")]
    pub namespace: Option<String>,

    #[arg(long, env = "KUBE_API_TUNNEL_ENABLED", default_value_t = false)]
    pub kube_api_tunnel_enabled: bool,

    #[arg(
        long,
        env = "KUBE_API_TUNNEL_SERVER",
        required_if_eq("kube_api_tunnel_enabled", "true")
    )]
    pub kube_api_tunnel_server: Option<String>,

    #[arg(
        long,
        env = "KUBE_API_TUNNEL_DOMAIN",
        required_if_eq("kube_api_tunnel_enabled", "true")
    )]
    pub kube_api_tunnel_domain: Option<String>,

    #[arg(long, env = "KUBE_API_TUNNEL_ACCESS_APP_NAME", default_value = "kube-api")]
    pub kube_api_tunnel_access_app_name: String,

    #[arg(long, env = "LOG_JSON", default_value_t = false)]
    pub log_json: bool,
}

impl Config {
    pub fn namespace(&self) -> String {
        resolve_namespace(self.namespace.clone(), Path::new(SERVICE_ACCOUNT_NAMESPACE))
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            ingress_class_name: self.ingress_class_name.clone(),
            controller_class_name: self.controller_class_name.clone(),
            tunnel_name: self.cloudflare_tunnel_name.clone(),
            cloudflared: CloudflaredConfig {
                image: self.cloudflared_image.clone(),
                image_pull_policy: self.cloudflared_image_pull_policy.clone(),
                namespace: self.namespace(),
            },
            kube_api_tunnel: KubeApiTunnel {
                enabled: self.kube_api_tunnel_enabled,
                server: self.kube_api_tunnel_server.clone().unwrap_or_default(),
                domain: self.kube_api_tunnel_domain.clone().unwrap_or_default(),
                access_app_name: self.kube_api_tunnel_access_app_name.clone(),
            },
        }
    }
}

fn resolve_namespace(flag: Option<String>, service_account_file: &Path) -> String {
    flag.filter(|namespace| !namespace.is_empty())
        .or_else(|| {
            fs::read_to_string(service_account_file)
                .ok()
                .map(|namespace| namespace.trim().to_string())
                .filter(|namespace| !namespace.is_empty())
        })
        .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    const REQUIRED: [&str; 11] = [
        "controller",
        "--cloudflared-image",
        "cloudflare/cloudflared:2024.6.1",
        "--cloudflared-image-pull-policy",
        "IfNotPresent",
        "--cloudflare-api-token",
        "token",
        "--cloudflare-account-id",
        "account",
        "--cloudflare-tunnel-name",
        "cluster",
    ];

    #[test]
    fn command_is_well_formed() {
        Config::command().debug_assert();
    }

    #[test]
    fn applies_class_defaults() {
        let config = Config::try_parse_from(REQUIRED).unwrap();
        assert_eq!(config.ingress_class_name, "cloudflare-tunnel");
        assert_eq!(
            config.controller_class_name,
            "clbs.io/cloudflare-tunnel-ingress-controller"
        );
        assert!(!config.controller_config().kube_api_tunnel.enabled);
    }

    #[test]
    fn kube_api_tunnel_needs_server_and_domain() {
        let mut args = REQUIRED.to_vec();
        args.push("--kube-api-tunnel-enabled");
        assert!(Config::try_parse_from(&args).is_err());

        args.extend([
            "--kube-api-tunnel-server",
            "kubernetes.default:443",
            "--kube-api-tunnel-domain",
            "kube.example.com",
        ]);
        let tunnel = Config::try_parse_from(&args)
            .unwrap()
            .controller_config()
            .kube_api_tunnel;
        assert!(tunnel.enabled);
        assert_eq!(tunnel.server, "kubernetes.default:443");
        assert_eq!(tunnel.access_app_name, "kube-api");
    }

    #[test]
    fn namespace_falls_back_to_default() {
        let missing = Path::new("/nonexistent/serviceaccount/namespace");
        assert_eq!(resolve_namespace(Some("edge".into()), missing), "edge");
        assert_eq!(resolve_namespace(Some(String::new()), missing), "default");
        assert_eq!(resolve_namespace(None, missing), "default");
    }
}
