use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{Api, Patch, PatchParams};
use kube::ResourceExt;
use serde_json::{json, Value};

pub const FINALIZER_NAME: &str = "finalizer.cloudflare-tunnel-ingress-controller.clbs.io";

pub fn has_finalizer(ingress: &Ingress) -> bool {
    ingress.finalizers().iter().any(|name| name == FINALIZER_NAME)
}

pub async fn add_finalizer(
    ingress_api: &Api<Ingress>,
    ingress: &Ingress,
) -> Result<Ingress, kube::Error> {
    let mut finalizers = ingress.finalizers().to_vec();
    finalizers.push(FINALIZER_NAME.to_string());
    patch_finalizers(ingress_api, ingress, finalizers).await
}

pub async fn remove_finalizer(
    ingress_api: &Api<Ingress>,
    ingress: &Ingress,
) -> Result<Ingress, kube::Error> {
    let finalizers = ingress
        .finalizers()
        .iter()
        .filter(|name| *name != FINALIZER_NAME)
        .cloned()
        .collect();
    patch_finalizers(ingress_api, ingress, finalizers).await
}

// NOTE: A merge patch replaces the whole list, the resource version guards against racing
// writers of other finalizers.
async fn patch_finalizers(
    ingress_api: &Api<Ingress>,
    ingress: &Ingress,
    finalizers: Vec<String>,
) -> Result<Ingress, kube::Error> {
    let patch: Value = json!({
        "metadata": {
            "resourceVersion": ingress.resource_version(),
            "finalizers": finalizers
        }
    });

    let patch: Patch<&Value> = Patch::Merge(&patch);
    ingress_api
        .patch(&ingress.name_any(), &PatchParams::default(), &patch)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;

    #[test]
    fn detects_own_finalizer_only() {
        let mut ingress = Ingress {
            metadata: ObjectMeta {
                finalizers: Some(vec!["other.io/finalizer".into()]),
                ..ObjectMeta::default()
            },
            ..Ingress::default()
        };
        assert!(!has_finalizer(&ingress));

        ingress
            .finalizers_mut()
            .push(FINALIZER_NAME.to_string());
        assert!(has_finalizer(&ingress));
    }
}
