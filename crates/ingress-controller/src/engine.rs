use crate::aggregate::DesiredState;
use crate::model::{tunnel_target, KubeApiTunnel, ResourceId, TunnelRule};
use crate::sync;
use crate::tunnel_service::{TunnelService, Zone};
use crate::Error;
use async_trait::async_trait;
use rand::RngCore;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info};
use uuid::Uuid;

const TUNNEL_SECRET_LEN: usize = 64;

/// Lists the harvested rules of every class-matching, non-deleting ingress. Used once per
/// process to seed the desired state.
#[async_trait]
pub trait DesiredStateSource: Send + Sync {
    async fn list_desired(&self) -> Result<Vec<(ResourceId, Vec<TunnelRule>)>, Error>;
}

#[derive(Default)]
struct TunnelHandle {
    id: Option<Uuid>,
    token: Option<String>,
}

#[derive(Default)]
struct EngineState {
    desired: DesiredState,
    seeded: bool,
}

/// Owns the desired state and serializes every convergence against the remote tunnel.
pub struct Engine {
    tunnel_service: Arc<dyn TunnelService>,
    tunnel_name: String,
    kube_api_tunnel: KubeApiTunnel,
    tunnel: Mutex<TunnelHandle>,
    // NOTE: Held across the whole read, diff and write sequence of a convergence.
    state: Mutex<EngineState>,
}

impl Engine {
    pub fn new(
        tunnel_service: Arc<dyn TunnelService>,
        tunnel_name: impl Into<String>,
        kube_api_tunnel: KubeApiTunnel,
    ) -> Self {
        Self {
            tunnel_service,
            tunnel_name: tunnel_name.into(),
            kube_api_tunnel,
            tunnel: Mutex::new(TunnelHandle::default()),
            state: Mutex::new(EngineState::default()),
        }
    }

    /// Finds the tunnel by name or creates it, then caches its id for the process lifetime. A
    /// cached tunnel whose name no longer matches is reported but kept.
    pub async fn ensure_tunnel(&self) -> Result<Uuid, Error> {
        let mut tunnel = self.tunnel.lock().await;

        if let Some(tunnel_id) = tunnel.id {
            let remote = self.tunnel_service.get_tunnel(tunnel_id).await?;
            if remote.name != self.tunnel_name {
                error!(
                    %tunnel_id,
                    expected = %self.tunnel_name,
                    actual = %remote.name,
                    "tunnel name mismatch, please review the configuration"
                );
            }
            return Ok(tunnel_id);
        }

        let remote = match self.tunnel_service.find_tunnel(&self.tunnel_name).await? {
            Some(remote) => {
                info!(tunnel_id = %remote.id, name = %remote.name, "found cloudflare tunnel");
                remote
            }
            None => {
                info!(name = %self.tunnel_name, "cloudflare tunnel not found, creating it");
                let remote = self
                    .tunnel_service
                    .create_tunnel(&self.tunnel_name, &tunnel_secret())
                    .await?;
                info!(tunnel_id = %remote.id, "created cloudflare tunnel");
                remote
            }
        };

        tunnel.id = Some(remote.id);
        Ok(remote.id)
    }

    pub async fn tunnel_id(&self) -> Result<Uuid, Error> {
        self.tunnel.lock().await.id.ok_or(Error::TunnelNotReady)
    }

    /// Token cloudflared authenticates with, fetched once unless set during bootstrap.
    pub async fn tunnel_token(&self) -> Result<String, Error> {
        let mut tunnel = self.tunnel.lock().await;
        if let Some(token) = &tunnel.token {
            return Ok(token.clone());
        }

        let tunnel_id = tunnel.id.ok_or(Error::TunnelNotReady)?;
        let token = self.tunnel_service.tunnel_token(tunnel_id).await?;
        tunnel.token = Some(token.clone());
        Ok(token)
    }

    pub async fn set_tunnel_token(&self, token: String) {
        self.tunnel.lock().await.token = Some(token);
    }

    /// Records the rules of one ingress and converges the tunnel configuration, DNS records and
    /// the cluster API access application. Returns every hostname now served, for status.
    pub async fn sync(
        &self,
        source: &dyn DesiredStateSource,
        id: ResourceId,
        rules: Vec<TunnelRule>,
    ) -> Result<BTreeSet<String>, Error> {
        let tunnel_id = self.tunnel_id().await?;

        let mut state = self.state.lock().await;
        self.seed(&mut state, source).await?;

        debug!(ingress = %id, rules = rules.len(), "updating desired state");
        let released = state
            .desired
            .insert(id, rules)
            .unwrap_or_default()
            .into_iter()
            .map(|rule| rule.hostname)
            .filter(|hostname| !hostname.is_empty())
            .collect::<BTreeSet<_>>();

        let kube_api_rule = self.kube_api_tunnel.rule();
        sync::tunnel::sync(
            self.tunnel_service.as_ref(),
            tunnel_id,
            &state.desired,
            kube_api_rule.as_ref(),
        )
        .await?;

        let zones = self.tunnel_service.zones().await?;
        let mut hostnames = state.desired.hostnames();
        hostnames.extend(self.kube_api_tunnel.hostname().map(str::to_string));
        sync::dns::sync(
            self.tunnel_service.as_ref(),
            &zones,
            &tunnel_target(&tunnel_id),
            &hostnames,
            &released,
        )
        .await?;

        if self.kube_api_tunnel.enabled {
            self.ensure_access_application(&zones).await?;
        }

        Ok(state.desired.hostnames())
    }

    /// Drops one ingress from the desired state and removes its tunnel rules and DNS records.
    /// `routes` stands in for its rules when the ingress was never recorded.
    pub async fn finalize(
        &self,
        source: &dyn DesiredStateSource,
        id: &ResourceId,
        routes: Vec<TunnelRule>,
    ) -> Result<(), Error> {
        let tunnel_id = self.tunnel_id().await?;

        let mut state = self.state.lock().await;
        self.seed(&mut state, source).await?;

        let prior = state.desired.remove(id).unwrap_or(routes);
        let kube_api_rule = self.kube_api_tunnel.rule();
        let removed = prior
            .into_iter()
            .filter(|rule| !state.desired.routes(rule))
            .filter(|rule| {
                !kube_api_rule
                    .as_ref()
                    .is_some_and(|kube_api_rule| kube_api_rule.same_route(rule))
            })
            .collect::<Vec<_>>();

        info!(ingress = %id, rules = removed.len(), "finalizing ingress");
        sync::tunnel::remove(self.tunnel_service.as_ref(), tunnel_id, &removed).await?;

        let still_served = state.desired.hostnames();
        let hostnames = removed
            .iter()
            .map(|rule| rule.hostname.clone())
            .filter(|hostname| !hostname.is_empty() && !still_served.contains(hostname))
            .filter(|hostname| self.kube_api_tunnel.hostname() != Some(hostname.as_str()))
            .collect::<BTreeSet<_>>();

        if !hostnames.is_empty() {
            let zones = self.tunnel_service.zones().await?;
            sync::dns::delete(
                self.tunnel_service.as_ref(),
                &zones,
                &tunnel_target(&tunnel_id),
                &hostnames,
            )
            .await?;
        }

        Ok(())
    }

    async fn seed(
        &self,
        state: &mut EngineState,
        source: &dyn DesiredStateSource,
    ) -> Result<(), Error> {
        if state.seeded {
            return Ok(());
        }

        let entries = source.list_desired().await?;
        info!(ingresses = entries.len(), "seeding desired state");
        for (id, rules) in entries {
            state.desired.insert(id, rules);
        }
        state.seeded = true;
        Ok(())
    }

    async fn ensure_access_application(&self, zones: &[Zone]) -> Result<(), Error> {
        let domain = self.kube_api_tunnel.domain.as_str();
        if sync::dns::owning_zone(domain, zones).is_none() {
            return Err(Error::MissingZone(domain.to_string()));
        }

        let applications = self.tunnel_service.access_applications().await?;
        if applications
            .iter()
            .any(|application| application.domain.as_deref() == Some(domain))
        {
            debug!(domain, "access application already exists");
            return Ok(());
        }

        self.tunnel_service
            .create_access_application(&self.kube_api_tunnel.access_app_name, domain)
            .await
    }
}

fn tunnel_secret() -> [u8; TUNNEL_SECRET_LEN] {
    let mut secret = [0u8; TUNNEL_SECRET_LEN];
    rand::thread_rng().fill_bytes(&mut secret);
    secret
}
