use clap::Parser;
use cloudflare::framework::auth::Credentials;
use cloudflarext::AuthlessClient;
use ingress_controller::{CloudflareTunnelService, IngressController};
use kube::Client as K8sClient;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);

    if json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = config::Config::parse();
    init_tracing(config.log_json);

    let kubernetes_client = K8sClient::try_default().await?;
    let cloudflare_client = AuthlessClient::try_default()?;
    let credentials = Credentials::UserAuthToken {
        token: config.cloudflare_api_token.clone(),
    };

    let tunnel_service = Arc::new(CloudflareTunnelService::new(
        cloudflare_client,
        credentials,
        config.cloudflare_account_id.clone(),
    ));

    let ingress_controller =
        IngressController::try_new(kubernetes_client, tunnel_service, config.controller_config())?;

    info!(tunnel = %config.cloudflare_tunnel_name, "bootstrapping tunnel");
    ingress_controller.bootstrap().await?;

    ingress_controller.await
}
