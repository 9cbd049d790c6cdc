//! Client artifact rendering
//!
//! The artifact is the exact text a consumer tunnel app imports (and what a
//! QR encoder would carry). This is the one place platform-specific rules
//! live: Linux clients get their resolver rewritten through PostUp/PostDown
//! and IPv6 disabled, everything else gets a plain `DNS` key and dual-stack
//! allowed addresses.

use crate::registry::ClientOs;
use std::net::Ipv4Addr;

/// Server-side inputs common to every artifact
#[derive(Debug, Clone)]
pub struct ArtifactParams<'a> {
    /// The server's public key
    pub server_public_key: &'a str,
    /// Public endpoint clients dial, "host:port"
    pub endpoint: &'a str,
    /// DNS server pushed to clients
    pub dns: &'a str,
    /// Client-side MTU
    pub mtu: u16,
    /// PersistentKeepalive seconds
    pub keepalive: u16,
}

/// Render the client configuration for one peer
pub fn render_artifact(
    os: ClientOs,
    private_key: &str,
    address: Ipv4Addr,
    params: &ArtifactParams<'_>,
) -> String {
    match os {
        ClientOs::Linux => format!(
            "[Interface]\n\
             PrivateKey = {private_key}\n\
             Address = {address}/32\n\
             MTU = {mtu}\n\
             PostUp = cp /etc/resolv.conf /etc/resolv.conf.wgbak; printf 'nameserver {dns}\\n' > /etc/resolv.conf; sysctl -w net.ipv6.conf.all.disable_ipv6=1\n\
             PostDown = mv /etc/resolv.conf.wgbak /etc/resolv.conf; sysctl -w net.ipv6.conf.all.disable_ipv6=0\n\
             \n\
             [Peer]\n\
             PublicKey = {server}\n\
             Endpoint = {endpoint}\n\
             AllowedIPs = 0.0.0.0/0\n\
             PersistentKeepalive = {keepalive}\n",
            private_key = private_key,
            address = address,
            mtu = params.mtu,
            dns = params.dns,
            server = params.server_public_key,
            endpoint = params.endpoint,
            keepalive = params.keepalive,
        ),
        _ => format!(
            "[Interface]\n\
             PrivateKey = {private_key}\n\
             Address = {address}/32\n\
             DNS = {dns}\n\
             MTU = {mtu}\n\
             \n\
             [Peer]\n\
             PublicKey = {server}\n\
             Endpoint = {endpoint}\n\
             AllowedIPs = 0.0.0.0/0, ::/0\n\
             PersistentKeepalive = {keepalive}\n",
            private_key = private_key,
            address = address,
            dns = params.dns,
            mtu = params.mtu,
            server = params.server_public_key,
            endpoint = params.endpoint,
            keepalive = params.keepalive,
        ),
    }
}
