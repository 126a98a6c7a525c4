use crate::annotations;
use crate::model::TunnelRule;
use crate::Error;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::{Ingress, IngressServiceBackend};
use kube::{Api, Client, ResourceExt};
use tracing::{debug, warn};

const PATH_TYPE_EXACT: &str = "Exact";

/// Resolves named service ports referenced by ingress backends.
#[async_trait]
pub trait ServicePortResolver: Send + Sync {
    /// Port number declared under `port_name`, `None` when the service has no such port. Fails
    /// when the service itself cannot be fetched.
    async fn named_port(
        &self,
        namespace: &str,
        service: &str,
        port_name: &str,
    ) -> Result<Option<i32>, Error>;
}

#[derive(Clone)]
pub struct KubeServicePorts {
    kubernetes_client: Client,
}

impl KubeServicePorts {
    pub fn new(kubernetes_client: Client) -> Self {
        Self { kubernetes_client }
    }
}

#[async_trait]
impl ServicePortResolver for KubeServicePorts {
    async fn named_port(
        &self,
        namespace: &str,
        service: &str,
        port_name: &str,
    ) -> Result<Option<i32>, Error> {
        let service_api: Api<Service> = Api::namespaced(self.kubernetes_client.clone(), namespace);
        let service = service_api.get(service).await?;

        Ok(service
            .spec
            .and_then(|spec| spec.ports)
            .unwrap_or_default()
            .into_iter()
            .find(|port| port.name.as_deref() == Some(port_name))
            .map(|port| port.port))
    }
}

/// Turns one ingress into its ordered tunnel rules, one per supported host/path pair, in
/// declaration order.
pub async fn harvest(
    ingress: &Ingress,
    ports: &dyn ServicePortResolver,
) -> Result<Vec<TunnelRule>, Error> {
    let namespace = ingress.namespace().ok_or(Error::MissingNamespace("Ingress"))?;
    let scheme = annotations::backend_scheme(ingress.annotations());
    let origin = annotations::origin_options(ingress.annotations());

    let mut rules = Vec::new();
    for (hostname, path, backend) in routes(ingress) {
        let port = match backend_port(&namespace, backend, ports).await {
            Ok(port) => port,
            Err(Error::MissingServicePort { service, port }) => {
                warn!(%hostname, %path, %service, %port, "skipping rule with unresolved backend port");
                continue;
            }
            Err(err) => return Err(err),
        };

        rules.push(TunnelRule {
            hostname: hostname.to_string(),
            path: path.to_string(),
            service: format!("{scheme}://{}.{namespace}:{port}", backend.name),
            origin: origin.clone(),
        });
    }

    Ok(rules)
}

/// The hostname and path of every rule the ingress routes, without resolving backends. Enough
/// to remove the ingress from the tunnel even when its services are gone.
pub fn route_rules(ingress: &Ingress) -> Vec<TunnelRule> {
    routes(ingress)
        .map(|(hostname, path, _)| TunnelRule {
            hostname: hostname.to_string(),
            path: path.to_string(),
            ..TunnelRule::default()
        })
        .collect()
}

fn routes(ingress: &Ingress) -> impl Iterator<Item = (&str, &str, &IngressServiceBackend)> {
    let name = ingress.metadata.name.as_deref().unwrap_or_default();
    ingress
        .spec
        .iter()
        .flat_map(|spec| spec.rules.iter().flatten())
        .filter_map(move |rule| {
            let Some(hostname) = rule.host.as_deref().filter(|host| !host.is_empty()) else {
                warn!(ingress = name, "skipping rule without host");
                return None;
            };
            rule.http
                .as_ref()
                .map(|http| http.paths.iter().map(move |path| (hostname, path)))
        })
        .flatten()
        .filter_map(move |(hostname, path)| {
            let route = path.path.as_deref().unwrap_or_default();
            if path.path_type == PATH_TYPE_EXACT {
                debug!(ingress = name, hostname, path = route, "skipping exact path");
                return None;
            }
            match path.backend.service.as_ref() {
                Some(backend) => Some((hostname, route, backend)),
                None => {
                    warn!(ingress = name, hostname, path = route, "skipping non-service backend");
                    None
                }
            }
        })
}

async fn backend_port(
    namespace: &str,
    backend: &IngressServiceBackend,
    ports: &dyn ServicePortResolver,
) -> Result<i32, Error> {
    let missing = |port: &str| Error::MissingServicePort {
        service: format!("{namespace}/{}", backend.name),
        port: port.to_string(),
    };

    let Some(port) = backend.port.as_ref() else {
        return Err(missing("<unset>"));
    };

    match (port.name.as_deref(), port.number) {
        (Some(port_name), _) if !port_name.is_empty() => ports
            .named_port(namespace, &backend.name, port_name)
            .await?
            .ok_or_else(|| missing(port_name)),
        (_, Some(number)) => Ok(number),
        _ => Err(missing("<unset>")),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use k8s_openapi::api::networking::v1::{
        HTTPIngressPath, HTTPIngressRuleValue, IngressBackend, IngressRule, IngressSpec,
        ServiceBackendPort,
    };
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    pub(crate) struct StaticPorts(pub BTreeMap<(String, String), i32>);

    #[async_trait]
    impl ServicePortResolver for StaticPorts {
        async fn named_port(
            &self,
            _namespace: &str,
            service: &str,
            port_name: &str,
        ) -> Result<Option<i32>, Error> {
            Ok(self
                .0
                .get(&(service.to_string(), port_name.to_string()))
                .copied())
        }
    }

    pub(crate) fn no_ports() -> StaticPorts {
        StaticPorts(BTreeMap::new())
    }

    pub(crate) fn path(path: &str, path_type: &str, service: &str, port: i32) -> HTTPIngressPath {
        HTTPIngressPath {
            path: Some(path.to_string()),
            path_type: path_type.to_string(),
            backend: IngressBackend {
                service: Some(IngressServiceBackend {
                    name: service.to_string(),
                    port: Some(ServiceBackendPort {
                        number: Some(port),
                        ..ServiceBackendPort::default()
                    }),
                }),
                ..IngressBackend::default()
            },
        }
    }

    pub(crate) fn ingress(
        name: &str,
        annotations: &[(&str, &str)],
        rules: Vec<(&str, Vec<HTTPIngressPath>)>,
    ) -> Ingress {
        Ingress {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                uid: Some(format!("uid-{name}")),
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(key, value)| (key.to_string(), value.to_string()))
                        .collect(),
                ),
                ..ObjectMeta::default()
            },
            spec: Some(IngressSpec {
                ingress_class_name: Some("cloudflare-tunnel".to_string()),
                rules: Some(
                    rules
                        .into_iter()
                        .map(|(host, paths)| IngressRule {
                            host: Some(host.to_string()),
                            http: Some(HTTPIngressRuleValue { paths }),
                        })
                        .collect(),
                ),
                ..IngressSpec::default()
            }),
            ..Ingress::default()
        }
    }

    #[tokio::test]
    async fn preserves_declaration_order() {
        let ingress = ingress(
            "web",
            &[],
            vec![
                ("c.example.com", vec![path("/", "Prefix", "c", 80)]),
                (
                    "a.example.com",
                    vec![
                        path("/api", "Prefix", "api", 8080),
                        path("/", "ImplementationSpecific", "a", 80),
                    ],
                ),
            ],
        );

        let rules = harvest(&ingress, &no_ports()).await.unwrap();
        let services = rules
            .iter()
            .map(|rule| rule.service.as_str())
            .collect::<Vec<_>>();
        assert_eq!(
            services,
            vec![
                "http://c.default:80",
                "http://api.default:8080",
                "http://a.default:80"
            ]
        );
        assert_eq!(rules[1].hostname, "a.example.com");
        assert_eq!(rules[1].path, "/api");
    }

    #[tokio::test]
    async fn skips_exact_paths() {
        let ingress = ingress(
            "web",
            &[],
            vec![(
                "a.example.com",
                vec![path("/exact", "Exact", "a", 80), path("/", "Prefix", "a", 80)],
            )],
        );

        let rules = harvest(&ingress, &no_ports()).await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].path, "/");
    }

    #[tokio::test]
    async fn resolves_named_ports_and_skips_unknown_ones() {
        let mut named = path("/", "Prefix", "web", 0);
        named.backend.service.as_mut().unwrap().port = Some(ServiceBackendPort {
            name: Some("https".to_string()),
            number: None,
        });
        let mut unknown = path("/other", "Prefix", "web", 0);
        unknown.backend.service.as_mut().unwrap().port = Some(ServiceBackendPort {
            name: Some("grpc".to_string()),
            number: None,
        });
        let ingress = ingress(
            "web",
            &[(annotations::BACKEND_PROTOCOL, "HTTPS")],
            vec![("a.example.com", vec![named, unknown])],
        );

        let ports = StaticPorts(BTreeMap::from([(
            ("web".to_string(), "https".to_string()),
            8443,
        )]));
        let rules = harvest(&ingress, &ports).await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].service, "https://web.default:8443");
    }

    #[tokio::test]
    async fn invalid_connect_timeout_keeps_the_rule() {
        let ingress = ingress(
            "web",
            &[
                (annotations::ORIGIN_CONNECT_TIMEOUT, "fast"),
                (annotations::ORIGIN_NO_TLS_VERIFY, "true"),
            ],
            vec![("a.example.com", vec![path("/", "Prefix", "a", 443)])],
        );

        let rules = harvest(&ingress, &no_ports()).await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].hostname, "a.example.com");
        assert_eq!(rules[0].service, "http://a.default:443");
        assert_eq!(rules[0].origin.connect_timeout, None);
        assert_eq!(rules[0].origin.no_tls_verify, Some(true));
    }

    #[test]
    fn route_rules_ignore_backends() {
        let mut orphan = path("/", "Prefix", "gone", 0);
        orphan.backend.service.as_mut().unwrap().port = Some(ServiceBackendPort {
            name: Some("http".to_string()),
            number: None,
        });
        let ingress = ingress("web", &[], vec![("a.example.com", vec![orphan])]);

        let routes = route_rules(&ingress);
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].hostname, "a.example.com");
        assert_eq!(routes[0].path, "/");
    }
}
