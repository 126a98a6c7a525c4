//! Remotely managed tunnel configuration, read and written through one model.

use cloudflare::framework::endpoint::{Endpoint, Method};
use cloudflare::framework::response::ApiResult;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Per-rule origin settings as the tunnel configuration stores them. Durations are in seconds.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct OriginRequest {
    #[serde(rename = "connectTimeout", skip_serializing_if = "Option::is_none")]
    pub connect_timeout: Option<u64>,
    #[serde(rename = "tlsTimeout", skip_serializing_if = "Option::is_none")]
    pub tls_timeout: Option<u64>,
    #[serde(rename = "tcpKeepAlive", skip_serializing_if = "Option::is_none")]
    pub tcp_keep_alive: Option<u64>,
    #[serde(rename = "noHappyEyeballs", skip_serializing_if = "Option::is_none")]
    pub no_happy_eyeballs: Option<bool>,
    #[serde(rename = "keepAliveConnections", skip_serializing_if = "Option::is_none")]
    pub keep_alive_connections: Option<u32>,
    #[serde(rename = "keepAliveTimeout", skip_serializing_if = "Option::is_none")]
    pub keep_alive_timeout: Option<u64>,
    #[serde(rename = "httpHostHeader", skip_serializing_if = "Option::is_none")]
    pub http_host_header: Option<String>,
    #[serde(rename = "originServerName", skip_serializing_if = "Option::is_none")]
    pub origin_server_name: Option<String>,
    #[serde(rename = "noTLSVerify", skip_serializing_if = "Option::is_none")]
    pub no_tls_verify: Option<bool>,
    #[serde(rename = "disableChunkedEncoding", skip_serializing_if = "Option::is_none")]
    pub disable_chunked_encoding: Option<bool>,
    #[serde(rename = "bastionMode", skip_serializing_if = "Option::is_none")]
    pub bastion_mode: Option<bool>,
    #[serde(rename = "proxyAddress", skip_serializing_if = "Option::is_none")]
    pub proxy_address: Option<String>,
    #[serde(rename = "proxyPort", skip_serializing_if = "Option::is_none")]
    pub proxy_port: Option<u16>,
    #[serde(rename = "proxyType", skip_serializing_if = "Option::is_none")]
    pub proxy_type: Option<String>,
    #[serde(rename = "http2Origin", skip_serializing_if = "Option::is_none")]
    pub http2_origin: Option<bool>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct IngressRule {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hostname: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    pub service: String,
    #[serde(
        rename = "originRequest",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub origin_request: Option<OriginRequest>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct TunnelConfiguration {
    #[serde(default)]
    pub ingress: Vec<IngressRule>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct TunnelConfigurationResult {
    #[serde(default)]
    pub version: Option<i64>,
    #[serde(default)]
    pub config: Option<TunnelConfiguration>,
}

impl ApiResult for TunnelConfigurationResult {}

pub mod get_configuration {
    use super::*;

    pub struct GetTunnelConfiguration<'a> {
        pub account_identifier: &'a str,
        pub tunnel_id: Uuid,
    }

    impl Endpoint<TunnelConfigurationResult> for GetTunnelConfiguration<'_> {
        fn method(&self) -> Method {
            Method::GET
        }
        fn path(&self) -> String {
            format!(
                "accounts/{}/cfd_tunnel/{}/configurations",
                self.account_identifier, self.tunnel_id
            )
        }
    }
}

pub mod update_configuration {
    use super::*;

    #[derive(Serialize, Debug)]
    pub struct Params {
        pub config: TunnelConfiguration,
    }

    /// Replaces the whole remotely managed configuration of a tunnel.
    pub struct UpdateTunnelConfiguration<'a> {
        pub account_identifier: &'a str,
        pub tunnel_id: Uuid,
        pub params: Params,
    }

    impl Endpoint<TunnelConfigurationResult> for UpdateTunnelConfiguration<'_> {
        fn method(&self) -> Method {
            Method::PUT
        }
        fn path(&self) -> String {
            format!(
                "accounts/{}/cfd_tunnel/{}/configurations",
                self.account_identifier, self.tunnel_id
            )
        }
        fn body(&self) -> Option<String> {
            serde_json::to_string(&self.params).ok()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn origin_request_uses_remote_field_names() {
        let rule = IngressRule {
            hostname: "app.example.com".into(),
            path: String::new(),
            service: "https://app.default:443".into(),
            origin_request: Some(OriginRequest {
                connect_timeout: Some(30),
                no_tls_verify: Some(true),
                http2_origin: Some(true),
                ..OriginRequest::default()
            }),
        };

        let value = serde_json::to_value(&rule).unwrap();
        assert_eq!(
            value,
            json!({
                "hostname": "app.example.com",
                "service": "https://app.default:443",
                "originRequest": {
                    "connectTimeout": 30,
                    "noTLSVerify": true,
                    "http2Origin": true
                }
            })
        );
    }

    #[test]
    fn catch_all_rule_has_only_a_service() {
        let value = serde_json::to_value(IngressRule {
            service: "http_status:404".into(),
            ..IngressRule::default()
        })
        .unwrap();
        assert_eq!(value, json!({ "service": "http_status:404" }));
    }

    #[test]
    fn decodes_configuration_with_unknown_fields() {
        let raw = json!({
            "tunnel_id": "c1744f8b-faa1-48a4-9e5c-02ac921467fa",
            "version": 7,
            "config": {
                "ingress": [
                    {
                        "hostname": "a.example.com",
                        "service": "http://a.default:80",
                        "originRequest": { "access": { "required": false } }
                    },
                    { "service": "http_status:404" }
                ],
                "warp-routing": { "enabled": false }
            }
        });

        let result: TunnelConfigurationResult = serde_json::from_value(raw).unwrap();
        let ingress = result.config.unwrap().ingress;
        assert_eq!(ingress.len(), 2);
        assert_eq!(ingress[0].origin_request, Some(OriginRequest::default()));
        assert_eq!(ingress[1].hostname, "");
    }

    #[test]
    fn update_sends_the_whole_configuration() {
        let endpoint = update_configuration::UpdateTunnelConfiguration {
            account_identifier: "acc",
            tunnel_id: Uuid::nil(),
            params: update_configuration::Params {
                config: TunnelConfiguration {
                    ingress: vec![IngressRule {
                        service: "http_status:404".into(),
                        ..IngressRule::default()
                    }],
                },
            },
        };

        assert_eq!(endpoint.method(), Method::PUT);
        assert_eq!(
            endpoint.path(),
            "accounts/acc/cfd_tunnel/00000000-0000-0000-0000-000000000000/configurations"
        );
        let body: serde_json::Value = serde_json::from_str(&endpoint.body().unwrap()).unwrap();
        assert_eq!(
            body,
            json!({ "config": { "ingress": [{ "service": "http_status:404" }] } })
        );
    }
}
