use std::time::Duration;

/// Service of the rule that terminates every rewritten tunnel configuration.
pub const CATCH_ALL_SERVICE: &str = "http_status:404";

/// Domain under which every tunnel is reachable as `<tunnel-id>.cfargotunnel.com`.
pub const TUNNEL_DOMAIN: &str = "cfargotunnel.com";

const SOCKS_PROXY_TYPE: &str = "socks";

/// Identity of a routing resource inside the desired state. Ordering is lexicographic by
/// namespace, then name, then uid, which fixes the flattened rule order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceId {
    pub namespace: String,
    pub name: String,
    pub uid: String,
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Connection settings cloudflared applies when dialing the origin of a single rule.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OriginOptions {
    pub connect_timeout: Option<Duration>,
    pub tls_timeout: Option<Duration>,
    pub tcp_keep_alive: Option<Duration>,
    pub no_happy_eyeballs: Option<bool>,
    pub keep_alive_connections: Option<u32>,
    pub keep_alive_timeout: Option<Duration>,
    pub http_host_header: Option<String>,
    pub origin_server_name: Option<String>,
    pub no_tls_verify: Option<bool>,
    pub disable_chunked_encoding: Option<bool>,
    pub proxy_type: Option<String>,
    pub proxy_address: Option<String>,
    pub proxy_port: Option<u16>,
    pub bastion_mode: Option<bool>,
    pub http2_origin: Option<bool>,
}

impl OriginOptions {
    pub fn is_empty(&self) -> bool {
        *self == OriginOptions::default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TunnelRule {
    pub hostname: String,
    pub path: String,
    pub service: String,
    pub origin: OriginOptions,
}

impl TunnelRule {
    pub fn catch_all() -> TunnelRule {
        TunnelRule {
            service: CATCH_ALL_SERVICE.to_string(),
            ..TunnelRule::default()
        }
    }

    pub fn is_catch_all(&self) -> bool {
        self.hostname.is_empty() && self.path.is_empty() && self.service == CATCH_ALL_SERVICE
    }

    /// Rules route the same traffic when hostname and path agree, whatever the target.
    pub fn same_route(&self, other: &TunnelRule) -> bool {
        self.hostname == other.hostname && self.path == other.path
    }
}

/// Optional extra rule exposing the cluster API server through the same tunnel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KubeApiTunnel {
    pub enabled: bool,
    pub server: String,
    pub domain: String,
    pub access_app_name: String,
}

impl KubeApiTunnel {
    pub fn service(&self) -> String {
        format!("tcp://{}", self.server)
    }

    pub fn hostname(&self) -> Option<&str> {
        self.enabled.then_some(self.domain.as_str())
    }

    pub fn rule(&self) -> Option<TunnelRule> {
        if !self.enabled {
            return None;
        }

        Some(TunnelRule {
            hostname: self.domain.clone(),
            path: String::new(),
            service: self.service(),
            origin: OriginOptions {
                proxy_type: Some(SOCKS_PROXY_TYPE.to_string()),
                ..OriginOptions::default()
            },
        })
    }
}

/// CNAME content every tunnel hostname points at.
pub fn tunnel_target(tunnel_id: &uuid::Uuid) -> String {
    format!("{tunnel_id}.{TUNNEL_DOMAIN}")
}
