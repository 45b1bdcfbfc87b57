//! Client IP extraction from HTTP headers with trust validation
//!
//! Anonymous visits are keyed by the caller's IP. Forwarding headers are only
//! believed as far as the proxy configuration allows:
//! - `Cloudflare` mode reads `CF-Connecting-IP`
//! - `Standard` mode walks `Forwarded` / `X-Forwarded-For` right to left,
//!   skipping hops that are trusted proxies
//! - `None` uses the socket address

use axum::http::HeaderMap;
use std::net::IpAddr;
use tracing::warn;

use crate::config::{ProxyConfig, TrustedProxyMode};

/// Extract the client IP address for a request.
pub fn extract_client_ip(headers: &HeaderMap, socket_addr: IpAddr, config: &ProxyConfig) -> IpAddr {
    match config.trusted_proxy_mode {
        TrustedProxyMode::Cloudflare => extract_cloudflare_ip(headers).unwrap_or_else(|| {
            warn!("CF-Connecting-IP header missing in Cloudflare mode, using socket address");
            socket_addr
        }),
        TrustedProxyMode::Standard => {
            if !is_trusted_hop(socket_addr, config) {
                return socket_addr;
            }
            let chain = forwarded_chain(headers);
            pick_from_chain(&chain, config).unwrap_or(socket_addr)
        }
        TrustedProxyMode::None => socket_addr,
    }
}

fn extract_cloudflare_ip(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("cf-connecting-ip")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.trim().parse::<IpAddr>().ok())
}

/// Forwarding chain, leftmost (original client) first. RFC 7239 `Forwarded`
/// wins over `X-Forwarded-For` when both are present.
fn forwarded_chain(headers: &HeaderMap) -> Vec<IpAddr> {
    let from_forwarded = parse_forwarded(headers);
    if !from_forwarded.is_empty() {
        return from_forwarded;
    }
    parse_x_forwarded_for(headers)
}

fn parse_forwarded(headers: &HeaderMap) -> Vec<IpAddr> {
    let Some(forwarded) = headers.get("forwarded").and_then(|h| h.to_str().ok()) else {
        return Vec::new();
    };

    // Forwarded: for=192.0.2.60;proto=http, for="[2001:db8::1]:4711"
    forwarded
        .split(',')
        .flat_map(|element| element.split(';'))
        .filter_map(|param| {
            let param = param.trim();
            let value = param
                .strip_prefix("for=")
                .or_else(|| param.strip_prefix("For="))?;
            parse_forwarded_node(value.trim_matches('"'))
        })
        .collect()
}

fn parse_forwarded_node(node: &str) -> Option<IpAddr> {
    if let Some(rest) = node.strip_prefix('[') {
        return rest.split(']').next()?.parse().ok();
    }
    if let Ok(ip) = node.parse::<IpAddr>() {
        return Some(ip);
    }
    // IPv4 with port
    node.rsplit_once(':')
        .and_then(|(host, _port)| host.parse::<IpAddr>().ok())
}

fn parse_x_forwarded_for(headers: &HeaderMap) -> Vec<IpAddr> {
    headers
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|h| h.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|s| s.trim().parse::<IpAddr>().ok())
        .collect()
}

fn is_trusted_hop(ip: IpAddr, config: &ProxyConfig) -> bool {
    if config.trusted_proxies.is_empty() {
        // Without a CIDR list every hop is assumed to be ours.
        return true;
    }
    config.trusted_proxies.iter().any(|net| net.contains(&ip))
}

fn pick_from_chain(chain: &[IpAddr], config: &ProxyConfig) -> Option<IpAddr> {
    if chain.is_empty() {
        return None;
    }

    if let Some(num_trusted) = config.num_trusted_proxies {
        // The socket peer is the last trusted hop; skip the rest from the right.
        let skip = num_trusted.saturating_sub(1);
        return if chain.len() > skip {
            Some(chain[chain.len() - skip - 1])
        } else {
            chain.first().copied()
        };
    }

    if !config.trusted_proxies.is_empty() {
        return chain
            .iter()
            .rev()
            .find(|ip| !is_trusted_hop(**ip, config))
            .or_else(|| chain.first())
            .copied();
    }

    chain.last().copied()
}
