use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{Api, Patch, PatchParams};
use kube::ResourceExt;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use tracing::info;

pub fn load_balancer_hostnames(ingress: &Ingress) -> Vec<String> {
    ingress
        .status
        .as_ref()
        .and_then(|status| status.load_balancer.as_ref())
        .and_then(|load_balancer| load_balancer.ingress.as_ref())
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| entry.hostname.clone())
                .collect()
        })
        .unwrap_or_default()
}

/// The status hostname list serving exactly `served`, or `None` when `current` already does.
/// Hostnames already listed keep their position, new ones are appended.
pub fn updated_hostnames(current: &[String], served: &BTreeSet<String>) -> Option<Vec<String>> {
    let listed = current.iter().cloned().collect::<BTreeSet<_>>();
    if listed == *served && listed.len() == current.len() {
        return None;
    }

    let mut hostnames = Vec::with_capacity(served.len());
    for hostname in current {
        if served.contains(hostname) && !hostnames.contains(hostname) {
            hostnames.push(hostname.clone());
        }
    }
    for hostname in served {
        if !listed.contains(hostname) {
            hostnames.push(hostname.clone());
        }
    }
    Some(hostnames)
}

/// Publishes `served` as the load balancer hostnames of the ingress. Writes only on change.
pub async fn update(
    ingress_api: &Api<Ingress>,
    ingress: &Ingress,
    served: &BTreeSet<String>,
) -> Result<bool, kube::Error> {
    let Some(hostnames) = updated_hostnames(&load_balancer_hostnames(ingress), served) else {
        return Ok(false);
    };

    let entries = hostnames
        .iter()
        .map(|hostname| json!({ "hostname": hostname }))
        .collect::<Vec<_>>();
    let patch: Value = json!({
        "status": {
            "loadBalancer": {
                "ingress": entries
            }
        }
    });

    let name = ingress.name_any();
    info!(ingress = %name, hostnames = ?hostnames, "updating ingress status");
    ingress_api
        .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(true)
}
