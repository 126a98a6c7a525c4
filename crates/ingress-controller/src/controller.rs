use crate::class::ClassFilter;
use crate::deployment::{self, CloudflaredConfig};
use crate::engine::{DesiredStateSource, Engine};
use crate::finalizer::{add_finalizer, has_finalizer, remove_finalizer};
use crate::harvest::{self, KubeServicePorts};
use crate::model::{KubeApiTunnel, ResourceId, TunnelRule};
use crate::status;
use crate::tunnel_service::TunnelService;
use crate::Error;
use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::networking::v1::{Ingress, IngressClass};
use kube::api::ListParams;
use kube::runtime::controller::{self, Action};
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::watcher::{self, watcher};
use kube::runtime::{Controller, WatchStreamExt};
use kube::{Api, Client, ResourceExt};
use std::collections::HashMap;
use std::future::{ready, Future, IntoFuture};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Successful reconciles are repeated to catch remote drift.
const RECONCILE_INTERVAL: Duration = Duration::from_secs(10 * 60);
const BACKOFF_BASE_SECS: u64 = 5;
const BACKOFF_MAX: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub ingress_class_name: String,
    pub controller_class_name: String,
    pub tunnel_name: String,
    pub cloudflared: CloudflaredConfig,
    pub kube_api_tunnel: KubeApiTunnel,
}

pub struct IngressController {
    kubernetes_client: Client,
    tunnel_service: Arc<dyn TunnelService>,
    engine: Arc<Engine>,
    class_filter: ClassFilter,
    cloudflared: CloudflaredConfig,
}

pub struct Context {
    kubernetes_client: Client,
    engine: Arc<Engine>,
    class_filter: ClassFilter,
    cloudflared: CloudflaredConfig,
    ingress_class_store: Store<IngressClass>,
    service_ports: KubeServicePorts,
    failures: FailureCounter,
}

/// Consecutive reconcile failures per ingress, driving the retry backoff.
#[derive(Default)]
struct FailureCounter(Mutex<HashMap<ObjectRef<Ingress>, u32>>);

#[derive(Debug, PartialEq, Eq)]
enum IngressAction {
    Finalize,
    Sync,
    Ignore,
}

impl From<&Ingress> for IngressAction {
    fn from(ingress: &Ingress) -> IngressAction {
        match (ingress.metadata.deletion_timestamp.is_some(), has_finalizer(ingress)) {
            (true, true) => IngressAction::Finalize,
            (true, false) => IngressAction::Ignore,
            (false, _) => IngressAction::Sync,
        }
    }
}

impl IntoFuture for IngressController {
    type Output = anyhow::Result<()>;
    type IntoFuture = Pin<Box<dyn Future<Output = Self::Output>>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.start())
    }
}

pub fn resource_id(ingress: &Ingress) -> Result<ResourceId, Error> {
    Ok(ResourceId {
        namespace: ingress.namespace().ok_or(Error::MissingNamespace("Ingress"))?,
        name: ingress.name_any(),
        uid: ingress.uid().unwrap_or_default(),
    })
}

async fn reconcile(ingress: Arc<Ingress>, ctx: Arc<Context>) -> Result<Action, Error> {
    let action = reconcile_ingress(&ingress, &ctx).await?;
    ctx.failures.clear(&ObjectRef::from_obj(ingress.as_ref()));
    Ok(action)
}

async fn reconcile_ingress(ingress: &Ingress, ctx: &Arc<Context>) -> Result<Action, Error> {
    let namespace = ingress.namespace().ok_or(Error::MissingNamespace("Ingress"))?;
    let name = ingress.name_any();

    // INFO: Tunnel and workload checks run outside the convergence lock.
    ctx.engine.ensure_tunnel().await?;
    let tunnel_token = ctx.engine.tunnel_token().await?;
    deployment::ensure(&ctx.kubernetes_client, &ctx.cloudflared, &tunnel_token).await?;

    let ingress_api: Api<Ingress> = Api::namespaced(ctx.kubernetes_client.clone(), &namespace);
    let Some(ingress) = ingress_api.get_opt(&name).await? else {
        debug!(%namespace, %name, "ingress no longer exists");
        ctx.failures.forget(&name, Some(&namespace));
        return Ok(Action::await_change());
    };

    match IngressAction::from(&ingress) {
        IngressAction::Finalize => finalize_ingress(&ingress, &ingress_api, ctx).await,
        IngressAction::Sync
            if ctx
                .class_filter
                .matches(&ingress, &ctx.ingress_class_store.state()) =>
        {
            sync_ingress(ingress, &ingress_api, ctx).await
        }
        IngressAction::Sync | IngressAction::Ignore => {
            debug!(%namespace, %name, "ingress not handled by this controller");
            Ok(Action::await_change())
        }
    }
}

async fn sync_ingress(
    ingress: Ingress,
    ingress_api: &Api<Ingress>,
    ctx: &Arc<Context>,
) -> Result<Action, Error> {
    let ingress = if has_finalizer(&ingress) {
        ingress
    } else {
        info!(ingress = %ingress.name_any(), "adding finalizer");
        add_finalizer(ingress_api, &ingress).await?
    };

    let rules = harvest::harvest(&ingress, &ctx.service_ports).await?;
    let served = ctx
        .engine
        .sync(ctx.as_ref(), resource_id(&ingress)?, rules)
        .await?;
    status::update(ingress_api, &ingress, &served).await?;

    Ok(Action::requeue(RECONCILE_INTERVAL))
}

async fn finalize_ingress(
    ingress: &Ingress,
    ingress_api: &Api<Ingress>,
    ctx: &Arc<Context>,
) -> Result<Action, Error> {
    let routes = harvest::route_rules(ingress);
    ctx.engine
        .finalize(ctx.as_ref(), &resource_id(ingress)?, routes)
        .await?;

    // NOTE: This must be the last step, the ingress is gone once the finalizer is removed.
    remove_finalizer(ingress_api, ingress).await?;
    info!(ingress = %ingress.name_any(), "removed finalizer");
    ctx.failures.clear(&ObjectRef::from_obj(ingress));
    Ok(Action::await_change())
}

fn error_policy(ingress: Arc<Ingress>, error: &Error, ctx: Arc<Context>) -> Action {
    let object = ObjectRef::from_obj(ingress.as_ref());
    let failures = ctx.failures.record(&object);
    let retry_in = backoff(failures);
    warn!(ingress = %object, %error, failures, ?retry_in, "reconcile failed");
    Action::requeue(retry_in)
}

/// `5s * 2^(failures - 1)`, capped at five minutes.
fn backoff(failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    Duration::from_secs(BACKOFF_BASE_SECS.saturating_mul(1 << exponent)).min(BACKOFF_MAX)
}

impl FailureCounter {
    fn record(&self, object: &ObjectRef<Ingress>) -> u32 {
        match self.0.lock() {
            Ok(mut failures) => {
                let count = failures.entry(object.clone()).or_insert(0);
                *count += 1;
                *count
            }
            Err(_) => 1,
        }
    }

    fn clear(&self, object: &ObjectRef<Ingress>) {
        if let Ok(mut failures) = self.0.lock() {
            failures.remove(object);
        }
    }

    /// Drops the count of an ingress known only by name, e.g. once it left the cluster.
    fn forget(&self, name: &str, namespace: Option<&str>) {
        if let Ok(mut failures) = self.0.lock() {
            failures.retain(|object, _| {
                object.name != name || object.namespace.as_deref() != namespace
            });
        }
    }

    #[cfg(test)]
    fn count(&self, object: &ObjectRef<Ingress>) -> u32 {
        self.0
            .lock()
            .map(|failures| failures.get(object).copied().unwrap_or_default())
            .unwrap_or_default()
    }
}

#[async_trait]
impl DesiredStateSource for Context {
    async fn list_desired(&self) -> Result<Vec<(ResourceId, Vec<TunnelRule>)>, Error> {
        let ingress_api: Api<Ingress> = Api::all(self.kubernetes_client.clone());
        let ingress_classes = self.ingress_class_store.state();

        let mut entries = Vec::new();
        for ingress in ingress_api.list(&ListParams::default()).await?.items {
            if ingress.metadata.deletion_timestamp.is_some()
                || !self.class_filter.matches(&ingress, &ingress_classes)
            {
                continue;
            }

            match harvest::harvest(&ingress, &self.service_ports).await {
                Ok(rules) => entries.push((resource_id(&ingress)?, rules)),
                Err(err) => {
                    warn!(ingress = %ingress.name_any(), error = %err, "skipping ingress while seeding")
                }
            }
        }

        Ok(entries)
    }
}

impl IngressController {
    pub fn try_new(
        kubernetes_client: Client,
        tunnel_service: Arc<dyn TunnelService>,
        config: ControllerConfig,
    ) -> Result<IngressController, Error> {
        // INFO: Reject a bad image before anything touches the cluster.
        deployment::image_tag(&config.cloudflared.image)?;

        let engine = Arc::new(Engine::new(
            tunnel_service.clone(),
            config.tunnel_name,
            config.kube_api_tunnel,
        ));

        Ok(IngressController {
            kubernetes_client,
            tunnel_service,
            engine,
            class_filter: ClassFilter {
                ingress_class_name: config.ingress_class_name,
                controller_class_name: config.controller_class_name,
            },
            cloudflared: config.cloudflared,
        })
    }

    /// Ensures the tunnel, hands its token to the engine and starts cloudflared, before any
    /// ingress is reconciled.
    pub async fn bootstrap(&self) -> Result<(), Error> {
        let tunnel_id = self.engine.ensure_tunnel().await?;
        let tunnel_token = self.tunnel_service.tunnel_token(tunnel_id).await?;
        self.engine.set_tunnel_token(tunnel_token.clone()).await;

        deployment::ensure(&self.kubernetes_client, &self.cloudflared, &tunnel_token).await?;
        info!(%tunnel_id, "bootstrap complete");
        Ok(())
    }

    pub async fn start(self) -> anyhow::Result<()> {
        let ingress_class_api: Api<IngressClass> = Api::all(self.kubernetes_client.clone());
        let ingress_api: Api<Ingress> = Api::all(self.kubernetes_client.clone());

        let (ingress_class_store, ingress_class_writer) = reflector::store();

        // NOTE: This needs to be started before the controller or class lookups see nothing.
        let ingress_class_watcher = watcher(ingress_class_api, watcher::Config::default())
            .default_backoff()
            .reflect(ingress_class_writer)
            .touched_objects()
            .for_each(|_| ready(()));
        tokio::spawn(ingress_class_watcher);
        ingress_class_store.wait_until_ready().await?;

        let ctx = Arc::new(Context {
            service_ports: KubeServicePorts::new(self.kubernetes_client.clone()),
            kubernetes_client: self.kubernetes_client,
            engine: self.engine,
            class_filter: self.class_filter,
            cloudflared: self.cloudflared,
            ingress_class_store,
            failures: FailureCounter::default(),
        });

        info!("starting ingress controller");
        Controller::new(ingress_api, watcher::Config::default())
            .shutdown_on_signal()
            .run(reconcile, error_policy, ctx.clone())
            .for_each(|result| {
                match result {
                    Ok((object, action)) => debug!(ingress = %object, ?action, "reconciled"),
                    // Requeues of ingresses deleted while backing off never reach the reconciler.
                    Err(controller::Error::ObjectNotFound(object)) => {
                        debug!(ingress = %object, "ingress left the cluster");
                        ctx.failures
                            .forget(&object.name, object.namespace.as_deref());
                    }
                    Err(err) => warn!(error = %err, "reconcile error"),
                }
                ready(())
            })
            .await;

        info!("ingress controller stopped");
        Ok(())
    }
}
