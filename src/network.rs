use std::net::{IpAddr, Ipv4Addr};
use ipnet::IpNet;

use crate::error::TargetError;

const MAX_EXPANSION: usize = 10_000;

/// Expand a comma separated target specification into individual scan targets.
///
/// CIDR blocks and IPv4 ranges become one entry per host; hostnames and single
/// addresses are kept verbatim so the scanner resolves them per scan.
pub fn expand_targets(target_spec: &str) -> Result<Vec<String>, TargetError> {
    let mut targets = Vec::new();

    for part in target_spec.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }

        if part.contains('/') {
            targets.extend(parse_cidr(part)?.into_iter().map(|ip| ip.to_string()));
        } else if part.contains('-') && part.parse::<IpAddr>().is_err() && is_ipv4_range(part) {
            targets.extend(parse_ip_range(part)?.into_iter().map(|ip| ip.to_string()));
        } else {
            targets.push(part.to_string());
        }
    }

    if targets.is_empty() {
        return Err(TargetError::Empty);
    }

    let mut seen = std::collections::HashSet::new();
    targets.retain(|t| seen.insert(t.clone()));

    Ok(targets)
}

/// Resolve a target to the address every probe of a scan connects to.
pub async fn resolve_target(target: &str) -> Result<IpAddr, TargetError> {
    if let Ok(ip) = target.parse::<IpAddr>() {
        return Ok(ip);
    }

    let mut addrs = tokio::net::lookup_host((target, 0))
        .await
        .map_err(|e| TargetError::Unresolved {
            host: target.to_string(),
            reason: e.to_string(),
        })?;

    addrs
        .next()
        .map(|addr| addr.ip())
        .ok_or_else(|| TargetError::Unresolved {
            host: target.to_string(),
            reason: "no address found".to_string(),
        })
}

// Hostnames may contain '-' too, so only treat "a.b.c.d-e.f.g.h" as a range.
fn is_ipv4_range(part: &str) -> bool {
    match part.split_once('-') {
        Some((start, end)) => {
            start.trim().parse::<Ipv4Addr>().is_ok() && end.trim().parse::<Ipv4Addr>().is_ok()
        }
        None => false,
    }
}

fn parse_cidr(cidr: &str) -> Result<Vec<IpAddr>, TargetError> {
    let network: IpNet = cidr
        .parse()
        .map_err(|_| TargetError::InvalidCidr(cidr.to_string()))?;

    let ips: Vec<IpAddr> = match network {
        IpNet::V4(net) => net.hosts().take(MAX_EXPANSION + 1).map(IpAddr::V4).collect(),
        IpNet::V6(net) => net.hosts().take(MAX_EXPANSION + 1).map(IpAddr::V6).collect(),
    };

    if ips.len() > MAX_EXPANSION {
        return Err(TargetError::InvalidCidr(format!(
            "{cidr} (more than {MAX_EXPANSION} hosts)"
        )));
    }

    Ok(ips)
}

fn parse_ip_range(range: &str) -> Result<Vec<IpAddr>, TargetError> {
    let invalid = |reason: &str| TargetError::InvalidRange {
        range: range.to_string(),
        reason: reason.to_string(),
    };

    let (start, end) = range.split_once('-').ok_or_else(|| invalid("expected START-END"))?;
    let start: Ipv4Addr = start.trim().parse().map_err(|_| invalid("invalid start address"))?;
    let end: Ipv4Addr = end.trim().parse().map_err(|_| invalid("invalid end address"))?;

    let start_u32 = u32::from(start);
    let end_u32 = u32::from(end);

    if start_u32 > end_u32 {
        return Err(invalid("start must be less than or equal to end"));
    }

    if (end_u32 - start_u32) as usize >= MAX_EXPANSION {
        return Err(invalid("range too large"));
    }

    Ok((start_u32..=end_u32)
        .map(|ip| IpAddr::V4(Ipv4Addr::from(ip)))
        .collect())
}
