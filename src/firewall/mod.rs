//! Access-control enforcement
//!
//! A dedicated `VPN_ACL` chain hooked at the top of FORWARD carries both the
//! global DNS-enforcement invariants and one rule group per peer address.
//! Rule material is built by pure functions so the exact shapes are
//! testable; the runner executes them with `-C` existence guards and
//! swallows the known-benign error set, which makes every operation here
//! safe to repeat.

use crate::error::Result;
use crate::registry::AclProfile;
use async_trait::async_trait;
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

/// Chain holding every VPN forwarding decision
pub const ACL_CHAIN: &str = "VPN_ACL";

/// RFC1918 ranges used by the internet-only / intranet-only profiles
pub const PRIVATE_NETWORKS: [&str; 3] = ["10.0.0.0/8", "172.16.0.0/12", "192.168.0.0/16"];

/// Well-known public DoH resolver addresses; blocking 443 to these forces
/// clients back onto hijacked port 53
pub const DOH_RESOLVERS: [&str; 8] = [
    "1.1.1.1",
    "1.0.0.1",
    "8.8.8.8",
    "8.8.4.4",
    "9.9.9.9",
    "149.112.112.112",
    "94.140.14.14",
    "94.140.15.15",
];

/// Deadline for filter tool invocations
const FILTER_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors the filter tool reports for states we are moving towards anyway
const BENIGN_ERRORS: [&str; 5] = [
    "Bad rule",
    "does not exist",
    "No chain/target/match",
    "already exists",
    "Chain already exists",
];

/// Build the append rules implementing `profile` for one source address.
///
/// Returned vectors are iptables argument lists without the program name.
pub fn profile_rules(
    address: Ipv4Addr,
    profile: AclProfile,
    server_address: Ipv4Addr,
) -> Vec<Vec<String>> {
    let src = address.to_string();
    let mut rules = Vec::new();

    match profile {
        AclProfile::Full => {
            rules.push(vec![
                "-A".into(),
                ACL_CHAIN.into(),
                "-s".into(),
                src,
                "-j".into(),
                "ACCEPT".into(),
            ]);
        }
        AclProfile::InternetOnly => {
            // The server's own tunnel address stays reachable so hijacked
            // DNS keeps resolving.
            rules.push(vec![
                "-A".into(),
                ACL_CHAIN.into(),
                "-s".into(),
                src.clone(),
                "-d".into(),
                server_address.to_string(),
                "-j".into(),
                "ACCEPT".into(),
            ]);
            for network in PRIVATE_NETWORKS {
                rules.push(vec![
                    "-A".into(),
                    ACL_CHAIN.into(),
                    "-s".into(),
                    src.clone(),
                    "-d".into(),
                    network.into(),
                    "-j".into(),
                    "DROP".into(),
                ]);
            }
            rules.push(vec![
                "-A".into(),
                ACL_CHAIN.into(),
                "-s".into(),
                src,
                "-j".into(),
                "ACCEPT".into(),
            ]);
        }
        AclProfile::IntranetOnly => {
            for network in PRIVATE_NETWORKS {
                rules.push(vec![
                    "-A".into(),
                    ACL_CHAIN.into(),
                    "-s".into(),
                    src.clone(),
                    "-d".into(),
                    network.into(),
                    "-j".into(),
                    "ACCEPT".into(),
                ]);
            }
            rules.push(vec![
                "-A".into(),
                ACL_CHAIN.into(),
                "-s".into(),
                src,
                "-j".into(),
                "DROP".into(),
            ]);
        }
    }

    rules
}

/// Build the delete commands for every rule shape any profile could have
/// installed for `address`. Brute force, but the shape set is closed.
pub fn cleanup_rules(address: Ipv4Addr, server_address: Ipv4Addr) -> Vec<Vec<String>> {
    let src = address.to_string();
    let mut rules = Vec::new();

    for verdict in ["ACCEPT", "DROP"] {
        rules.push(vec![
            "-D".into(),
            ACL_CHAIN.into(),
            "-s".into(),
            src.clone(),
            "-j".into(),
            verdict.into(),
        ]);
    }
    rules.push(vec![
        "-D".into(),
        ACL_CHAIN.into(),
        "-s".into(),
        src.clone(),
        "-d".into(),
        server_address.to_string(),
        "-j".into(),
        "ACCEPT".into(),
    ]);
    for network in PRIVATE_NETWORKS {
        for verdict in ["ACCEPT", "DROP"] {
            rules.push(vec![
                "-D".into(),
                ACL_CHAIN.into(),
                "-s".into(),
                src.clone(),
                "-d".into(),
                network.into(),
                "-j".into(),
                verdict.into(),
            ]);
        }
    }

    rules
}

/// Extract the outgoing device from `ip route get` output
pub fn parse_uplink(route_output: &str) -> Option<String> {
    let mut words = route_output.split_whitespace();
    while let Some(word) = words.next() {
        if word == "dev" {
            return words.next().map(str::to_string);
        }
    }
    None
}

/// Seam between the lifecycle manager and the packet filter
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AccessController: Send + Sync {
    /// Install the rule set for `profile`, replacing whatever was there
    async fn apply(&self, address: Ipv4Addr, profile: AclProfile) -> Result<()>;

    /// Remove every rule keyed on `address`
    async fn clear(&self, address: Ipv4Addr) -> Result<()>;

    /// Install the once-per-process global invariants (chain, NAT, MSS
    /// clamping, DNS hijack)
    async fn init_global(&self) -> Result<()>;
}

/// Production enforcer shelling out to iptables/ip6tables
pub struct SystemFirewall {
    interface: String,
    subnet: Ipv4Net,
    server_address: Ipv4Addr,
}

impl SystemFirewall {
    /// Create an enforcer for one tunnel interface
    pub fn new(interface: impl Into<String>, subnet: Ipv4Net, server_address: Ipv4Addr) -> Self {
        Self {
            interface: interface.into(),
            subnet,
            server_address,
        }
    }

    /// Run a filter command; returns whether it succeeded. Failures are
    /// logged unless they match the benign set and never propagate; the
    /// next invocation reconverges the rule state.
    async fn run(&self, program: &str, args: &[String]) -> bool {
        debug!("Executing command: {} {:?}", program, args);

        let result = tokio::time::timeout(
            FILTER_TIMEOUT,
            Command::new(program)
                .args(args)
                .stdout(Stdio::null())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .output(),
        )
        .await;

        match result {
            Ok(Ok(output)) if output.status.success() => true,
            Ok(Ok(output)) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let benign = BENIGN_ERRORS.iter().any(|m| stderr.contains(m));
                if !benign {
                    error!("{} {:?} failed: {}", program, args, stderr.trim());
                }
                false
            }
            Ok(Err(e)) => {
                error!("Failed to execute {}: {}", program, e);
                false
            }
            Err(_) => {
                error!("{} {:?} timed out", program, args);
                false
            }
        }
    }

    async fn run_iptables(&self, args: &[String]) -> bool {
        self.run("iptables", args).await
    }

    /// `-C` probe for an append/insert rule
    async fn rule_exists(&self, rule: &[String]) -> bool {
        let mut check: Vec<String> = rule.to_vec();
        for arg in check.iter_mut() {
            if arg == "-A" || arg == "-I" {
                *arg = "-C".to_string();
                break;
            }
        }
        // Positional index is meaningless to -C.
        check.retain(|a| a != "1");
        self.run_iptables(&check).await
    }

    /// Append/insert unless the rule already exists
    async fn ensure_rule(&self, rule: Vec<String>) {
        if !self.rule_exists(&rule).await {
            self.run_iptables(&rule).await;
        }
    }

    async fn detect_uplink(&self) -> String {
        let output = tokio::time::timeout(
            FILTER_TIMEOUT,
            Command::new("ip")
                .args(["route", "get", "8.8.8.8"])
                .output(),
        )
        .await;

        if let Ok(Ok(output)) = output {
            if let Some(dev) = parse_uplink(&String::from_utf8_lossy(&output.stdout)) {
                return dev;
            }
        }
        warn!("Could not detect uplink interface, assuming eth0");
        "eth0".to_string()
    }
}

#[async_trait]
impl AccessController for SystemFirewall {
    async fn apply(&self, address: Ipv4Addr, profile: AclProfile) -> Result<()> {
        // Old rules first; apply is defined as replace, not append.
        self.clear(address).await?;

        info!("Applying ACL profile '{}' for {}", profile, address);
        for rule in profile_rules(address, profile, self.server_address) {
            self.run_iptables(&rule).await;
        }
        Ok(())
    }

    async fn clear(&self, address: Ipv4Addr) -> Result<()> {
        for rule in cleanup_rules(address, self.server_address) {
            self.run_iptables(&rule).await;
        }
        Ok(())
    }

    async fn init_global(&self) -> Result<()> {
        let uplink = self.detect_uplink().await;
        let wg = self.interface.as_str();
        let subnet = self.subnet.to_string();
        let dnat_target = format!("{}:53", self.server_address);
        info!("Initializing firewall (tunnel {}, uplink {})", wg, uplink);

        // Forwarding must be on for any of this to matter.
        self.run(
            "sysctl",
            &["-w".to_string(), "net.ipv4.ip_forward=1".to_string()],
        )
        .await;

        // Dedicated chain, hooked at the top of FORWARD.
        self.run_iptables(&["-N".to_string(), ACL_CHAIN.to_string()])
            .await;
        self.ensure_rule(
            ["-I", "FORWARD", "1", "-j", ACL_CHAIN]
                .map(str::to_string)
                .to_vec(),
        )
        .await;

        // Stateful return traffic.
        self.ensure_rule(
            [
                "-I", "FORWARD", "1", "-m", "conntrack", "--ctstate", "RELATED,ESTABLISHED",
                "-j", "ACCEPT",
            ]
            .map(str::to_string)
            .to_vec(),
        )
        .await;

        // NAT for the tunnel subnet out the uplink.
        self.ensure_rule(
            [
                "-t",
                "nat",
                "-I",
                "POSTROUTING",
                "1",
                "-s",
                subnet.as_str(),
                "-o",
                uplink.as_str(),
                "-j",
                "MASQUERADE",
            ]
            .map(str::to_string)
            .to_vec(),
        )
        .await;

        // MSS clamping; without it fragmented paths black-hole silently.
        self.ensure_rule(
            [
                "-t", "mangle", "-I", "FORWARD", "1", "-p", "tcp", "--tcp-flags", "SYN,RST",
                "SYN", "-j", "TCPMSS", "--clamp-mss-to-pmtu",
            ]
            .map(str::to_string)
            .to_vec(),
        )
        .await;

        // DNS hijack: everything a peer sends to port 53 lands on the server.
        for proto in ["udp", "tcp"] {
            self.ensure_rule(
                [
                    "-t",
                    "nat",
                    "-A",
                    "PREROUTING",
                    "-i",
                    wg,
                    "-p",
                    proto,
                    "--dport",
                    "53",
                    "-j",
                    "DNAT",
                    "--to-destination",
                    dnat_target.as_str(),
                ]
                .map(str::to_string)
                .to_vec(),
            )
            .await;

            // Port-53 traffic that still reaches FORWARD escaped the DNAT.
            self.ensure_rule(
                [
                    "-A", ACL_CHAIN, "-i", wg, "-p", proto, "--dport", "53", "-j", "REJECT",
                ]
                .map(str::to_string)
                .to_vec(),
            )
            .await;

            // No IPv6 DNS filtering yet, so v6 port 53 is dropped outright.
            self.run(
                "ip6tables",
                &["-A", "FORWARD", "-i", wg, "-p", proto, "--dport", "53", "-j", "DROP"]
                    .map(str::to_string)
                    .to_vec(),
            )
            .await;
        }

        // DoT would bypass the hijack entirely.
        self.ensure_rule(
            ["-A", ACL_CHAIN, "-i", wg, "-p", "tcp", "--dport", "853", "-j", "DROP"]
                .map(str::to_string)
                .to_vec(),
        )
        .await;

        // DoH to the well-known resolvers; rejecting 443 here forces the
        // fallback to port 53.
        for resolver in DOH_RESOLVERS {
            self.ensure_rule(
                [
                    "-A", ACL_CHAIN, "-i", wg, "-p", "tcp", "-d", resolver, "--dport", "443",
                    "-j", "REJECT",
                ]
                .map(str::to_string)
                .to_vec(),
            )
            .await;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server() -> Ipv4Addr {
        Ipv4Addr::new(10, 50, 0, 1)
    }

    fn join(rule: &[String]) -> String {
        rule.join(" ")
    }

    #[test]
    fn test_full_profile_is_single_accept() {
        let rules = profile_rules(Ipv4Addr::new(10, 50, 0, 4), AclProfile::Full, server());
        assert_eq!(rules.len(), 1);
        assert_eq!(join(&rules[0]), "-A VPN_ACL -s 10.50.0.4 -j ACCEPT");
    }

    #[test]
    fn test_internet_only_profile_shape() {
        let rules = profile_rules(
            Ipv4Addr::new(10, 50, 0, 4),
            AclProfile::InternetOnly,
            server(),
        );
        let flat: Vec<String> = rules.iter().map(|r| join(r)).collect();
        assert_eq!(
            flat,
            vec![
                "-A VPN_ACL -s 10.50.0.4 -d 10.50.0.1 -j ACCEPT",
                "-A VPN_ACL -s 10.50.0.4 -d 10.0.0.0/8 -j DROP",
                "-A VPN_ACL -s 10.50.0.4 -d 172.16.0.0/12 -j DROP",
                "-A VPN_ACL -s 10.50.0.4 -d 192.168.0.0/16 -j DROP",
                "-A VPN_ACL -s 10.50.0.4 -j ACCEPT",
            ]
        );
    }

    #[test]
    fn test_intranet_only_profile_shape() {
        let rules = profile_rules(
            Ipv4Addr::new(10, 50, 0, 5),
            AclProfile::IntranetOnly,
            server(),
        );
        let flat: Vec<String> = rules.iter().map(|r| join(r)).collect();
        assert_eq!(flat.first().unwrap(), "-A VPN_ACL -s 10.50.0.5 -d 10.0.0.0/8 -j ACCEPT");
        assert_eq!(flat.last().unwrap(), "-A VPN_ACL -s 10.50.0.5 -j DROP");
        assert_eq!(flat.len(), 4);
    }

    #[test]
    fn test_cleanup_covers_every_profile_shape() {
        let addr = Ipv4Addr::new(10, 50, 0, 4);
        let cleanup: Vec<String> = cleanup_rules(addr, server())
            .iter()
            .map(|r| join(r))
            .collect();

        for profile in [
            AclProfile::Full,
            AclProfile::InternetOnly,
            AclProfile::IntranetOnly,
        ] {
            for rule in profile_rules(addr, profile, server()) {
                let as_delete = join(&rule).replacen("-A", "-D", 1);
                assert!(
                    cleanup.contains(&as_delete),
                    "cleanup is missing: {}",
                    as_delete
                );
            }
        }
    }

    #[test]
    fn test_cleanup_rules_are_deletes_only() {
        let cleanup = cleanup_rules(Ipv4Addr::new(10, 50, 0, 4), server());
        assert!(cleanup.iter().all(|r| r[0] == "-D"));
    }

    #[test]
    fn test_parse_uplink() {
        let output = "8.8.8.8 via 192.0.2.1 dev ens5 src 192.0.2.20 uid 0";
        assert_eq!(parse_uplink(output).as_deref(), Some("ens5"));
        assert_eq!(parse_uplink("garbage"), None);
    }
}
