//! Camera discovery
//!
//! ## Responsibilities
//!
//! - WS-Discovery multicast probe for ONVIF-style cameras
//! - TCP connect sweep of configured subnets on the RTSP port
//! - Best-effort only: socket errors contribute no addresses and are
//!   never surfaced to the caller

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::Semaphore;
use tokio::time::{timeout, Instant};

use crate::error::{Error, Result};

const WS_DISCOVERY_ADDR: &str = "239.255.255.250:3702";
const RTSP_PORT: u16 = 554;
const PORT_PROBE_TIMEOUT: Duration = Duration::from_millis(300);
const SCAN_CONCURRENCY: usize = 16;

/// WS-Discovery Probe for NetworkVideoTransmitter devices.
const WS_PROBE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<e:Envelope xmlns:e="http://www.w3.org/2003/05/soap-envelope" xmlns:w="http://schemas.xmlsoap.org/ws/2004/09/mex" xmlns:d="http://schemas.xmlsoap.org/ws/2005/04/discovery" xmlns:dn="http://www.onvif.org/ver10/network/wsdl">
  <e:Header>
    <d:Probe xmlns:d="http://schemas.xmlsoap.org/ws/2005/04/discovery">
      <d:Types>dn:NetworkVideoTransmitter</d:Types>
    </d:Probe>
  </e:Header>
  <e:Body/>
</e:Envelope>"#;

/// One discovery pass producing a candidate camera IP set.
#[async_trait]
pub trait DiscoveryProbe: Send + Sync {
    /// Best effort; an empty set is a valid, silent result.
    async fn discover_ips(&self) -> HashSet<IpAddr>;
}

/// Network camera discovery over multicast and subnet scanning.
pub struct CameraDiscovery {
    scan_subnets: Vec<String>,
    ws_enabled: bool,
    timeout: Duration,
}

impl CameraDiscovery {
    pub fn new(scan_subnets: Vec<String>, ws_enabled: bool, timeout: Duration) -> Self {
        Self {
            scan_subnets,
            ws_enabled,
            timeout,
        }
    }

    /// Send one multicast probe and collect replies until the window closes.
    async fn ws_discovery(&self) -> HashSet<IpAddr> {
        let mut ips = HashSet::new();

        let sock = match UdpSocket::bind(("0.0.0.0", 0)).await {
            Ok(s) => s,
            Err(e) => {
                tracing::debug!(error = %e, "WS-Discovery socket bind failed");
                return ips;
            }
        };
        if let Err(e) = sock.set_multicast_ttl_v4(2) {
            tracing::debug!(error = %e, "Failed to set multicast TTL");
        }
        if let Err(e) = sock.send_to(WS_PROBE.as_bytes(), WS_DISCOVERY_ADDR).await {
            tracing::debug!(error = %e, "WS-Discovery probe send failed");
            return ips;
        }

        let deadline = Instant::now() + self.timeout;
        let mut buf = vec![0u8; 65535];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match timeout(remaining, sock.recv_from(&mut buf)).await {
                Ok(Ok((n, peer))) => {
                    let reply = String::from_utf8_lossy(&buf[..n]);
                    let found = parse_probe_reply(&reply);
                    tracing::debug!(peer = %peer, addresses = found.len(), "WS-Discovery reply");
                    ips.extend(found);
                }
                Ok(Err(e)) => {
                    tracing::debug!(error = %e, "WS-Discovery receive failed");
                    break;
                }
                Err(_) => break, // window closed
            }
        }
        ips
    }

    /// TCP sweep of one CIDR block on the RTSP port.
    async fn scan_subnet(&self, cidr: &str) -> HashSet<IpAddr> {
        let hosts = match parse_cidr(cidr) {
            Ok(hosts) => hosts,
            Err(e) => {
                tracing::warn!(cidr = %cidr, error = %e, "Skipping unparseable subnet");
                return HashSet::new();
            }
        };

        let semaphore = Arc::new(Semaphore::new(SCAN_CONCURRENCY));
        let mut handles = Vec::with_capacity(hosts.len());
        for ip in hosts {
            let permit = semaphore.clone().acquire_owned().await.unwrap();
            handles.push(tokio::spawn(async move {
                let open = port_open(ip, RTSP_PORT, PORT_PROBE_TIMEOUT).await;
                drop(permit);
                (ip, open)
            }));
        }

        let mut ips = HashSet::new();
        for handle in handles {
            if let Ok((ip, true)) = handle.await {
                ips.insert(ip);
            }
        }
        tracing::debug!(cidr = %cidr, hosts_found = ips.len(), "Subnet scan complete");
        ips
    }
}

#[async_trait]
impl DiscoveryProbe for CameraDiscovery {
    async fn discover_ips(&self) -> HashSet<IpAddr> {
        let mut ips = HashSet::new();
        if self.ws_enabled {
            ips.extend(self.ws_discovery().await);
        }
        for cidr in &self.scan_subnets {
            ips.extend(self.scan_subnet(cidr).await);
        }
        tracing::debug!(candidates = ips.len(), "Discovery pass complete");
        ips
    }
}

async fn port_open(ip: IpAddr, port: u16, window: Duration) -> bool {
    matches!(
        timeout(window, TcpStream::connect(SocketAddr::new(ip, port))).await,
        Ok(Ok(_))
    )
}

/// Parse CIDR notation to a host IP list.
///
/// A bare IP is its own single-host list. Network and broadcast
/// addresses are excluded for /24 and smaller blocks.
pub fn parse_cidr(cidr: &str) -> Result<Vec<IpAddr>> {
    if !cidr.contains('/') {
        return cidr
            .parse::<IpAddr>()
            .map(|ip| vec![ip])
            .map_err(|e| Error::Parse(format!("invalid IP {}: {}", cidr, e)));
    }

    let (base, prefix) = cidr
        .split_once('/')
        .ok_or_else(|| Error::Parse(format!("invalid CIDR format: {}", cidr)))?;

    let base_ip: Ipv4Addr = base
        .parse()
        .map_err(|e| Error::Parse(format!("invalid IP {}: {}", base, e)))?;
    let prefix: u8 = prefix
        .parse()
        .map_err(|e| Error::Parse(format!("invalid prefix {}: {}", prefix, e)))?;
    if prefix > 32 {
        return Err(Error::Parse(format!(
            "invalid prefix {} (must be 0-32)",
            prefix
        )));
    }

    let base_u32 = u32::from(base_ip);
    let mask = if prefix == 0 {
        0
    } else {
        !((1u32 << (32 - prefix)) - 1)
    };
    let network = base_u32 & mask;
    let broadcast = network | !mask;

    let start = if prefix >= 24 {
        network.saturating_add(1)
    } else {
        network
    };
    let end = if prefix >= 24 {
        broadcast.saturating_sub(1)
    } else {
        broadcast
    };

    let mut ips = Vec::new();
    for ip_u32 in start..=end {
        ips.push(IpAddr::V4(Ipv4Addr::from(ip_u32)));
    }
    Ok(ips)
}

/// Extract device addresses from a WS-Discovery reply.
///
/// Addresses show up two ways: as bare tokens anywhere in the body and
/// as hosts of the service URLs inside XAddrs elements.
fn parse_probe_reply(text: &str) -> HashSet<IpAddr> {
    let mut ips: HashSet<IpAddr> = text
        .split_whitespace()
        .filter_map(|token| token.parse().ok())
        .collect();

    for section in text.split("XAddrs").skip(1) {
        let Some(start) = section.find('>') else {
            continue;
        };
        let Some(end) = section[start + 1..].find('<') else {
            continue;
        };
        for url in section[start + 1..start + 1 + end].split_whitespace() {
            let host = url
                .split("//")
                .last()
                .unwrap_or("")
                .split('/')
                .next()
                .unwrap_or("")
                .split(':')
                .next()
                .unwrap_or("");
            if let Ok(ip) = host.parse() {
                ips.insert(ip);
            }
        }
    }
    ips
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_cidr_single_ip() {
        assert_eq!(parse_cidr("10.0.0.5").unwrap(), vec![v4("10.0.0.5")]);
    }

    #[test]
    fn test_parse_cidr_slash_30_excludes_network_and_broadcast() {
        let hosts = parse_cidr("192.168.1.0/30").unwrap();
        assert_eq!(hosts, vec![v4("192.168.1.1"), v4("192.168.1.2")]);
    }

    #[test]
    fn test_parse_cidr_slash_24_host_count() {
        let hosts = parse_cidr("192.168.1.0/24").unwrap();
        assert_eq!(hosts.len(), 254);
        assert!(!hosts.contains(&v4("192.168.1.0")));
        assert!(!hosts.contains(&v4("192.168.1.255")));
        assert!(hosts.contains(&v4("192.168.1.1")));
        assert!(hosts.contains(&v4("192.168.1.254")));
    }

    #[test]
    fn test_parse_cidr_rejects_bad_input() {
        assert!(parse_cidr("not-an-ip").is_err());
        assert!(parse_cidr("192.168.1.0/33").is_err());
        assert!(parse_cidr("192.168.1.0/abc").is_err());
    }

    #[test]
    fn test_parse_probe_reply_bare_tokens() {
        let reply = "some device at 192.168.1.50 responded";
        let ips = parse_probe_reply(reply);
        assert_eq!(ips, HashSet::from([v4("192.168.1.50")]));
    }

    #[test]
    fn test_parse_probe_reply_xaddrs() {
        let reply = r#"<d:XAddrs>http://192.168.1.60:2020/onvif/device_service</d:XAddrs>"#;
        let ips = parse_probe_reply(reply);
        assert!(ips.contains(&v4("192.168.1.60")));
    }

    #[test]
    fn test_parse_probe_reply_dedupes() {
        let reply = r#"
            192.168.1.70
            <d:XAddrs>http://192.168.1.70/onvif/device_service http://192.168.1.71/onvif</d:XAddrs>
        "#;
        let ips = parse_probe_reply(reply);
        assert_eq!(ips.len(), 2);
        assert!(ips.contains(&v4("192.168.1.70")));
        assert!(ips.contains(&v4("192.168.1.71")));
    }

    #[test]
    fn test_parse_probe_reply_ignores_non_addresses() {
        let ips = parse_probe_reply("<e:Envelope>no addresses here</e:Envelope>");
        assert!(ips.is_empty());
    }

    #[tokio::test]
    async fn test_scan_skips_unparseable_subnet() {
        let discovery = CameraDiscovery::new(
            vec!["bogus".to_string()],
            false,
            Duration::from_millis(10),
        );
        let ips = discovery.discover_ips().await;
        assert!(ips.is_empty());
    }
}
