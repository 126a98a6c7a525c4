use crate::model::OriginOptions;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::warn;

macro_rules! annotation {
    ($name:literal) => {
        concat!("cloudflare-tunnel-ingress-controller.clbs.io/", $name)
    };
}

pub const BACKEND_PROTOCOL: &str = annotation!("backend-protocol");
pub const ORIGIN_CONNECT_TIMEOUT: &str = annotation!("origin-connect-timeout");
pub const ORIGIN_TLS_TIMEOUT: &str = annotation!("origin-tls-timeout");
pub const ORIGIN_TCP_KEEPALIVE: &str = annotation!("origin-tcp-keepalive");
pub const ORIGIN_NO_HAPPY_EYEBALLS: &str = annotation!("origin-no-happy-eyeballs");
pub const ORIGIN_KEEPALIVE_CONNECTIONS: &str = annotation!("origin-keepalive-connections");
pub const ORIGIN_KEEPALIVE_TIMEOUT: &str = annotation!("origin-keepalive-timeout");
pub const ORIGIN_HTTP_HOST_HEADER: &str = annotation!("origin-http-host-header");
pub const ORIGIN_SERVER_NAME: &str = annotation!("origin-server-name");
pub const ORIGIN_NO_TLS_VERIFY: &str = annotation!("origin-no-tls-verify");
pub const ORIGIN_DISABLE_CHUNKED_ENCODING: &str = annotation!("origin-disable-chunked-encoding");
pub const ORIGIN_PROXY_TYPE: &str = annotation!("origin-proxy-type");
pub const ORIGIN_PROXY_ADDRESS: &str = annotation!("origin-proxy-address");
pub const ORIGIN_PROXY_PORT: &str = annotation!("origin-proxy-port");
pub const ORIGIN_BASTION_MODE: &str = annotation!("origin-bastion-mode");
pub const ORIGIN_HTTP2_ORIGIN: &str = annotation!("origin-http2origin");

const SUPPORTED_BACKEND_PROTOCOLS: [&str; 3] = ["HTTP", "HTTPS", "TCP"];
const DEFAULT_SCHEME: &str = "http";

/// Lowercased forwarding scheme from the backend-protocol annotation, `http` when absent or
/// unsupported.
pub fn backend_scheme(annotations: &BTreeMap<String, String>) -> String {
    let Some(value) = annotations.get(BACKEND_PROTOCOL) else {
        return DEFAULT_SCHEME.to_string();
    };

    let value = value.trim();
    match SUPPORTED_BACKEND_PROTOCOLS
        .iter()
        .find(|protocol| protocol.eq_ignore_ascii_case(value))
    {
        Some(protocol) => protocol.to_ascii_lowercase(),
        None => {
            warn!(
                annotation = BACKEND_PROTOCOL,
                value, "unsupported backend protocol, falling back to http"
            );
            DEFAULT_SCHEME.to_string()
        }
    }
}

pub fn origin_options(annotations: &BTreeMap<String, String>) -> OriginOptions {
    OriginOptions {
        connect_timeout: parse(annotations, ORIGIN_CONNECT_TIMEOUT, parse_duration),
        tls_timeout: parse(annotations, ORIGIN_TLS_TIMEOUT, parse_duration),
        tcp_keep_alive: parse(annotations, ORIGIN_TCP_KEEPALIVE, parse_duration),
        no_happy_eyeballs: parse(annotations, ORIGIN_NO_HAPPY_EYEBALLS, parse_bool),
        keep_alive_connections: parse(annotations, ORIGIN_KEEPALIVE_CONNECTIONS, |value| {
            value.parse::<u32>().map_err(|err| err.to_string())
        }),
        keep_alive_timeout: parse(annotations, ORIGIN_KEEPALIVE_TIMEOUT, parse_duration),
        http_host_header: parse(annotations, ORIGIN_HTTP_HOST_HEADER, parse_string),
        origin_server_name: parse(annotations, ORIGIN_SERVER_NAME, parse_string),
        no_tls_verify: parse(annotations, ORIGIN_NO_TLS_VERIFY, parse_bool),
        disable_chunked_encoding: parse(annotations, ORIGIN_DISABLE_CHUNKED_ENCODING, parse_bool),
        proxy_type: parse(annotations, ORIGIN_PROXY_TYPE, parse_string),
        proxy_address: parse(annotations, ORIGIN_PROXY_ADDRESS, parse_string),
        proxy_port: parse(annotations, ORIGIN_PROXY_PORT, |value| {
            value.parse::<u16>().map_err(|err| err.to_string())
        }),
        bastion_mode: parse(annotations, ORIGIN_BASTION_MODE, parse_bool),
        http2_origin: parse(annotations, ORIGIN_HTTP2_ORIGIN, parse_bool),
    }
}

// A malformed value only drops its own option.
fn parse<T>(
    annotations: &BTreeMap<String, String>,
    key: &'static str,
    parser: impl Fn(&str) -> Result<T, String>,
) -> Option<T> {
    let value = annotations.get(key)?;
    match parser(value.trim()) {
        Ok(parsed) => Some(parsed),
        Err(err) => {
            warn!(annotation = key, value = %value, error = %err, "ignoring malformed annotation");
            None
        }
    }
}

fn parse_string(value: &str) -> Result<String, String> {
    if value.is_empty() {
        return Err("empty value".to_string());
    }
    Ok(value.to_string())
}

fn parse_bool(value: &str) -> Result<bool, String> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Ok(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Ok(false),
        _ => Err(format!("invalid boolean {value:?}")),
    }
}

/// Parses durations such as `30s`, `1m30s`, `1.5h` or `500ms`. The remote configuration
/// stores whole seconds, so the result is truncated to the second.
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    if value == "0" {
        return Ok(Duration::ZERO);
    }
    if value.is_empty() {
        return Err("empty duration".to_string());
    }

    let mut rest = value;
    let mut total_nanos = 0f64;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| format!("missing unit in duration {value:?}"))?;
        if number_len == 0 {
            return Err(format!("invalid duration {value:?}"));
        }
        let number = rest[..number_len]
            .parse::<f64>()
            .map_err(|_| format!("invalid duration {value:?}"))?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let unit_nanos = match &rest[..unit_len] {
            "ns" => 1f64,
            "us" | "µs" | "μs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            unit => return Err(format!("unknown unit {unit:?} in duration {value:?}")),
        };
        rest = &rest[unit_len..];

        total_nanos += number * unit_nanos;
    }

    Ok(Duration::from_secs((total_nanos / 1e9).floor() as u64))
}
