use crate::model::{OriginOptions, TunnelRule};
use crate::Error;
use async_trait::async_trait;
use cloudflare::endpoints::cfd_tunnel::{
    create_tunnel, get_tunnel::GetTunnel, get_tunnel_token, list_tunnels, ConfigurationSrc,
    Tunnel,
};
use cloudflare::endpoints::dns::{
    CreateDnsRecord, CreateDnsRecordParams, DeleteDnsRecord, DnsContent, ListDnsRecords,
    ListDnsRecordsParams,
};
use cloudflare::endpoints::zone::{self, ListZones, ListZonesParams};
use cloudflare::framework::auth::Credentials;
use cloudflarext::access::{
    create_application::CreateSelfHostedApplication, list_applications::ListAccessApplications,
    AccessApplication,
};
use cloudflarext::cfd_tunnel::{
    get_configuration::GetTunnelConfiguration, update_configuration, IngressRule, OriginRequest,
    TunnelConfiguration,
};
use cloudflarext::{AuthlessClient, PER_PAGE};
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

/// "Record already exists" as reported by the DNS API.
const RECORD_ALREADY_EXISTS: u32 = 81053;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTunnel {
    pub id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Zone {
    pub id: String,
    pub name: String,
}

/// A CNAME record reduced to what convergence compares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CnameRecord {
    pub id: String,
    pub name: String,
    pub content: String,
}

/// Everything the engine needs from the remote tunnel service, in terms of its own rule model.
#[async_trait]
pub trait TunnelService: Send + Sync {
    /// The non-deleted tunnel named exactly `name`.
    async fn find_tunnel(&self, name: &str) -> Result<Option<RemoteTunnel>, Error>;
    async fn create_tunnel(&self, name: &str, tunnel_secret: &[u8])
        -> Result<RemoteTunnel, Error>;
    async fn get_tunnel(&self, tunnel_id: Uuid) -> Result<RemoteTunnel, Error>;
    async fn tunnel_token(&self, tunnel_id: Uuid) -> Result<String, Error>;

    /// Live ordered ingress rules of the tunnel, catch-all included.
    async fn tunnel_rules(&self, tunnel_id: Uuid) -> Result<Vec<TunnelRule>, Error>;
    async fn replace_tunnel_rules(&self, tunnel_id: Uuid, rules: &[TunnelRule])
        -> Result<(), Error>;

    async fn zones(&self) -> Result<Vec<Zone>, Error>;
    /// CNAME records of a zone whose content is exactly `content`.
    async fn cname_records(&self, zone_id: &str, content: &str)
        -> Result<Vec<CnameRecord>, Error>;
    /// Fails with [`Error::RecordAlreadyExists`] when the hostname is already taken.
    async fn create_cname_record(
        &self,
        zone_id: &str,
        hostname: &str,
        content: &str,
    ) -> Result<(), Error>;
    async fn delete_dns_record(&self, zone_id: &str, record_id: &str) -> Result<(), Error>;

    async fn access_applications(&self) -> Result<Vec<AccessApplication>, Error>;
    async fn create_access_application(&self, name: &str, domain: &str) -> Result<(), Error>;
}

pub struct CloudflareTunnelService {
    cloudflare_client: AuthlessClient,
    credentials: Credentials,
    account_id: String,
}

impl CloudflareTunnelService {
    pub fn new(
        cloudflare_client: AuthlessClient,
        credentials: Credentials,
        account_id: impl Into<String>,
    ) -> Self {
        Self {
            cloudflare_client,
            credentials,
            account_id: account_id.into(),
        }
    }
}

#[async_trait]
impl TunnelService for CloudflareTunnelService {
    async fn find_tunnel(&self, name: &str) -> Result<Option<RemoteTunnel>, Error> {
        let endpoint = list_tunnels::ListTunnels {
            account_identifier: &self.account_id,
            params: list_tunnels::Params {
                name: Some(name.to_string()),
                is_deleted: Some(false),
                ..Default::default()
            },
        };
        let tunnels = self
            .cloudflare_client
            .request(&self.credentials, &endpoint)
            .await?
            .result;

        Ok(tunnels
            .into_iter()
            .find(|tunnel| tunnel.deleted_at.is_none() && tunnel.name == name)
            .map(RemoteTunnel::from))
    }

    async fn create_tunnel(
        &self,
        name: &str,
        tunnel_secret: &[u8],
    ) -> Result<RemoteTunnel, Error> {
        let params = create_tunnel::Params {
            name,
            tunnel_secret: Some(tunnel_secret),
            config_src: &ConfigurationSrc::Cloudflare,
            metadata: None,
        };
        let endpoint = create_tunnel::CreateTunnel {
            account_identifier: &self.account_id,
            params,
        };

        let tunnel = self
            .cloudflare_client
            .request(&self.credentials, &endpoint)
            .await?
            .result;
        Ok(tunnel.into())
    }

    async fn get_tunnel(&self, tunnel_id: Uuid) -> Result<RemoteTunnel, Error> {
        let tunnel_id = tunnel_id.to_string();
        let endpoint = GetTunnel {
            account_identifier: &self.account_id,
            tunnel_id: &tunnel_id,
        };

        let tunnel = self
            .cloudflare_client
            .request(&self.credentials, &endpoint)
            .await?
            .result;
        Ok(tunnel.into())
    }

    async fn tunnel_token(&self, tunnel_id: Uuid) -> Result<String, Error> {
        let tunnel_id = tunnel_id.to_string();
        let endpoint = get_tunnel_token::TunnelToken {
            account_identifier: &self.account_id,
            tunnel_id: &tunnel_id,
        };

        let token = self
            .cloudflare_client
            .request(&self.credentials, &endpoint)
            .await?
            .result;
        Ok(token.into())
    }

    async fn tunnel_rules(&self, tunnel_id: Uuid) -> Result<Vec<TunnelRule>, Error> {
        let configuration = self
            .cloudflare_client
            .request(
                &self.credentials,
                &GetTunnelConfiguration {
                    account_identifier: &self.account_id,
                    tunnel_id,
                },
            )
            .await?
            .result;

        Ok(configuration
            .config
            .map(|config| config.ingress)
            .unwrap_or_default()
            .into_iter()
            .map(TunnelRule::from)
            .collect())
    }

    async fn replace_tunnel_rules(
        &self,
        tunnel_id: Uuid,
        rules: &[TunnelRule],
    ) -> Result<(), Error> {
        let config = TunnelConfiguration {
            ingress: rules.iter().map(IngressRule::from).collect(),
        };

        self.cloudflare_client
            .request(
                &self.credentials,
                &update_configuration::UpdateTunnelConfiguration {
                    account_identifier: &self.account_id,
                    tunnel_id,
                    params: update_configuration::Params { config },
                },
            )
            .await?;
        Ok(())
    }

    async fn zones(&self) -> Result<Vec<Zone>, Error> {
        let zones = self
            .cloudflare_client
            .request_pages(&self.credentials, |page| ListZones {
                params: ListZonesParams {
                    page: Some(page),
                    per_page: Some(PER_PAGE),
                    ..Default::default()
                },
            })
            .await?;
        Ok(zones.into_iter().map(Zone::from).collect())
    }

    async fn cname_records(
        &self,
        zone_id: &str,
        content: &str,
    ) -> Result<Vec<CnameRecord>, Error> {
        let records = self
            .cloudflare_client
            .request_pages(&self.credentials, |page| ListDnsRecords {
                zone_identifier: zone_id,
                params: ListDnsRecordsParams {
                    page: Some(page),
                    per_page: Some(PER_PAGE),
                    ..Default::default()
                },
            })
            .await?;

        Ok(records
            .into_iter()
            .filter_map(|record| match record.content {
                DnsContent::CNAME { content: target } if target == content => Some(CnameRecord {
                    id: record.id,
                    name: record.name,
                    content: target,
                }),
                _ => None,
            })
            .collect())
    }

    async fn create_cname_record(
        &self,
        zone_id: &str,
        hostname: &str,
        content: &str,
    ) -> Result<(), Error> {
        let endpoint = CreateDnsRecord {
            zone_identifier: zone_id,
            params: CreateDnsRecordParams {
                name: hostname,
                content: DnsContent::CNAME {
                    content: content.to_string(),
                },
                proxied: Some(true),
                ttl: None,
                priority: None,
            },
        };

        match self.cloudflare_client.request(&self.credentials, &endpoint).await {
            Ok(_) => Ok(()),
            Err(err) if cloudflarext::is_api_error(&err, RECORD_ALREADY_EXISTS) => {
                Err(Error::RecordAlreadyExists(hostname.to_string()))
            }
            Err(err) => Err(Error::CloudflareApiFailure(err)),
        }
    }

    async fn delete_dns_record(&self, zone_id: &str, record_id: &str) -> Result<(), Error> {
        self.cloudflare_client
            .request(
                &self.credentials,
                &DeleteDnsRecord {
                    zone_identifier: zone_id,
                    identifier: record_id,
                },
            )
            .await?;
        Ok(())
    }

    async fn access_applications(&self) -> Result<Vec<AccessApplication>, Error> {
        let applications = self
            .cloudflare_client
            .request_pages(&self.credentials, |page| ListAccessApplications {
                account_identifier: &self.account_id,
                page,
            })
            .await?;
        Ok(applications)
    }

    async fn create_access_application(&self, name: &str, domain: &str) -> Result<(), Error> {
        let application = self
            .cloudflare_client
            .request(
                &self.credentials,
                &CreateSelfHostedApplication {
                    account_identifier: &self.account_id,
                    name,
                    domain,
                },
            )
            .await?
            .result;
        info!(
            name,
            domain,
            id = application.id.as_deref().unwrap_or_default(),
            "created access application"
        );
        Ok(())
    }
}

impl From<Tunnel> for RemoteTunnel {
    fn from(tunnel: Tunnel) -> Self {
        RemoteTunnel {
            id: tunnel.id,
            name: tunnel.name,
        }
    }
}

impl From<zone::Zone> for Zone {
    fn from(zone: zone::Zone) -> Self {
        Zone {
            id: zone.id,
            name: zone.name,
        }
    }
}

impl From<&TunnelRule> for IngressRule {
    fn from(rule: &TunnelRule) -> Self {
        IngressRule {
            hostname: rule.hostname.clone(),
            path: rule.path.clone(),
            service: rule.service.clone(),
            origin_request: (!rule.origin.is_empty()).then(|| OriginRequest::from(&rule.origin)),
        }
    }
}

impl From<IngressRule> for TunnelRule {
    fn from(rule: IngressRule) -> Self {
        TunnelRule {
            hostname: rule.hostname,
            path: rule.path,
            service: rule.service,
            origin: rule
                .origin_request
                .map(OriginOptions::from)
                .unwrap_or_default(),
        }
    }
}

impl From<&OriginOptions> for OriginRequest {
    fn from(origin: &OriginOptions) -> Self {
        let seconds = |duration: Option<Duration>| duration.map(|duration| duration.as_secs());
        OriginRequest {
            connect_timeout: seconds(origin.connect_timeout),
            tls_timeout: seconds(origin.tls_timeout),
            tcp_keep_alive: seconds(origin.tcp_keep_alive),
            no_happy_eyeballs: origin.no_happy_eyeballs,
            keep_alive_connections: origin.keep_alive_connections,
            keep_alive_timeout: seconds(origin.keep_alive_timeout),
            http_host_header: origin.http_host_header.clone(),
            origin_server_name: origin.origin_server_name.clone(),
            no_tls_verify: origin.no_tls_verify,
            disable_chunked_encoding: origin.disable_chunked_encoding,
            bastion_mode: origin.bastion_mode,
            proxy_address: origin.proxy_address.clone(),
            proxy_port: origin.proxy_port,
            proxy_type: origin.proxy_type.clone(),
            http2_origin: origin.http2_origin,
        }
    }
}

impl From<OriginRequest> for OriginOptions {
    fn from(origin: OriginRequest) -> Self {
        OriginOptions {
            connect_timeout: origin.connect_timeout.map(Duration::from_secs),
            tls_timeout: origin.tls_timeout.map(Duration::from_secs),
            tcp_keep_alive: origin.tcp_keep_alive.map(Duration::from_secs),
            no_happy_eyeballs: origin.no_happy_eyeballs,
            keep_alive_connections: origin.keep_alive_connections,
            keep_alive_timeout: origin.keep_alive_timeout.map(Duration::from_secs),
            http_host_header: origin.http_host_header,
            origin_server_name: origin.origin_server_name,
            no_tls_verify: origin.no_tls_verify,
            disable_chunked_encoding: origin.disable_chunked_encoding,
            proxy_type: origin.proxy_type,
            proxy_address: origin.proxy_address,
            proxy_port: origin.proxy_port,
            bastion_mode: origin.bastion_mode,
            http2_origin: origin.http2_origin,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudflare::framework::{Environment, HttpApiClientConfig};
    use reqwest::Url;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn service(server: &MockServer) -> CloudflareTunnelService {
        let base = Url::parse(&format!("{}/", server.uri())).unwrap();
        let client =
            AuthlessClient::try_new(HttpApiClientConfig::default(), Environment::Custom(base))
                .unwrap();
        CloudflareTunnelService::new(
            client,
            Credentials::UserAuthToken {
                token: "token".to_string(),
            },
            "account",
        )
    }

    fn tunnel(id: &str, deleted_at: Option<&str>) -> serde_json::Value {
        json!({
            "id": id,
            "account_tag": "account",
            "created_at": "2024-01-01T00:00:00Z",
            "deleted_at": deleted_at,
            "name": "edge",
            "connections": [],
            "conns_active_at": null,
            "conns_inactive_at": null,
            "tun_type": "cfd_tunnel",
            "metadata": {},
            "status": "inactive",
            "remote_config": true
        })
    }

    fn cname(id: &str, name: &str, content: &str) -> serde_json::Value {
        json!({
            "id": id,
            "zone_id": "z1",
            "zone_name": "example.com",
            "name": name,
            "type": "CNAME",
            "content": content,
            "proxiable": true,
            "proxied": true,
            "ttl": 1,
            "locked": false,
            "meta": { "auto_added": false, "managed_by_apps": false, "source": "primary" },
            "comment": null,
            "tags": [],
            "created_on": "2024-01-01T00:00:00.000000Z",
            "modified_on": "2024-01-01T00:00:00.000000Z"
        })
    }

    #[test]
    fn rules_survive_the_wire_translation() {
        let rule = TunnelRule {
            hostname: "a.example.com".into(),
            path: "/api".into(),
            service: "https://api.default:443".into(),
            origin: OriginOptions {
                connect_timeout: Some(Duration::from_secs(30)),
                no_tls_verify: Some(true),
                ..OriginOptions::default()
            },
        };

        let wire = IngressRule::from(&rule);
        assert_eq!(wire.origin_request.as_ref().unwrap().connect_timeout, Some(30));
        assert_eq!(TunnelRule::from(wire), rule);
    }

    #[test]
    fn empty_origin_is_omitted() {
        let wire = IngressRule::from(&TunnelRule::catch_all());
        assert!(wire.origin_request.is_none());
    }

    #[tokio::test]
    async fn duplicate_record_is_reported_as_already_existing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/zones/z1/dns_records"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "success": false,
                "errors": [{ "code": 81053, "message": "An A, AAAA, or CNAME record with that host already exists." }],
                "messages": [],
                "result": null
            })))
            .mount(&server)
            .await;

        let err = service(&server)
            .create_cname_record("z1", "a.example.com", "t.cfargotunnel.com")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RecordAlreadyExists(hostname) if hostname == "a.example.com"));
    }

    #[tokio::test]
    async fn other_record_failures_are_kept() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/zones/z1/dns_records"))
            .respond_with(ResponseTemplate::new(403).set_body_json(json!({
                "success": false,
                "errors": [{ "code": 10000, "message": "Authentication error" }],
                "messages": [],
                "result": null
            })))
            .mount(&server)
            .await;

        let err = service(&server)
            .create_cname_record("z1", "a.example.com", "t.cfargotunnel.com")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CloudflareApiFailure(_)));
    }

    #[tokio::test]
    async fn finds_only_live_tunnels_by_exact_name() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/accounts/account/cfd_tunnel"))
            .and(query_param("name", "edge"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "errors": [],
                "messages": [],
                "result": [
                    tunnel("c1744f8b-faa1-48a4-9e5c-02ac921467fa", Some("2024-02-01T00:00:00Z")),
                    tunnel("a1b2c3d4-faa1-48a4-9e5c-02ac921467fa", None)
                ],
                "result_info": { "page": 1, "per_page": 20, "count": 2, "total_count": 2 }
            })))
            .mount(&server)
            .await;

        let tunnel = service(&server).find_tunnel("edge").await.unwrap().unwrap();
        assert_eq!(
            tunnel.id,
            Uuid::parse_str("a1b2c3d4-faa1-48a4-9e5c-02ac921467fa").unwrap()
        );
    }

    #[tokio::test]
    async fn lists_only_cnames_pointing_at_the_tunnel() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/zones/z1/dns_records"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "errors": [],
                "messages": [],
                "result": [
                    cname("r1", "a.example.com", "t.cfargotunnel.com"),
                    cname("r2", "b.example.com", "elsewhere.example.net")
                ],
                "result_info": { "page": 1, "per_page": 50, "count": 2, "total_count": 2, "total_pages": 1 }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let records = service(&server)
            .cname_records("z1", "t.cfargotunnel.com")
            .await
            .unwrap();
        assert_eq!(
            records,
            vec![CnameRecord {
                id: "r1".into(),
                name: "a.example.com".into(),
                content: "t.cfargotunnel.com".into(),
            }]
        );
    }
}
