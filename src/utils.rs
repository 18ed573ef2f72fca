use anyhow::{anyhow, bail, Context, Result};
use std::collections::{HashSet, VecDeque};
use std::hash::Hash;

/// Ports probed when a scan request carries an empty port list.
pub const DEFAULT_PORTS: &[u16] = &[
    21, 22, 23, 25, 80, 110, 443, 445, 3306, 3389, 5432, 6379, 8080, 8443, 27017,
];

/// The 100 most commonly open TCP ports, in nmap's frequency order.
pub const TOP_100_PORTS: &[u16] = &[
    7, 9, 13, 21, 22, 23, 25, 26, 37, 53, 79, 80, 81, 88, 106, 110, 111, 113, 119, 135,
    139, 143, 144, 179, 199, 389, 427, 443, 444, 445, 465, 513, 514, 515, 543, 544, 548, 554,
    587, 631, 646, 873, 990, 993, 995, 1025, 1026, 1027, 1028, 1029, 1110, 1433, 1720, 1723,
    1755, 1900, 2000, 2001, 2049, 2121, 2717, 3000, 3128, 3306, 3389, 3986, 4899, 5000, 5009,
    5051, 5060, 5101, 5190, 5357, 5432, 5631, 5666, 5800, 5900, 6000, 6001, 6646, 7070, 8000,
    8008, 8009, 8080, 8081, 8443, 8888, 9100, 9999, 10000, 32768, 49152, 49153, 49154, 49155,
    49156, 49157,
];

/// Parse a port specification such as `22,80,8000-8010`, `top100` or `-` (all ports).
///
/// Duplicates are dropped, first occurrence wins the position.
pub fn parse_ports(spec: &str) -> Result<Vec<u16>> {
    let spec = spec.trim();
    if spec == "-" {
        return Ok((1..=65535).collect());
    }

    let mut ports = Vec::new();
    let mut seen = HashSet::new();

    for part in spec.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }

        if part.eq_ignore_ascii_case("top100") {
            for &port in TOP_100_PORTS {
                if seen.insert(port) {
                    ports.push(port);
                }
            }
            continue;
        }

        if let Some((start, end)) = part.split_once('-') {
            let start = parse_port(start.trim())
                .with_context(|| format!("invalid start of range: {part}"))?;
            let end = parse_port(end.trim())
                .with_context(|| format!("invalid end of range: {part}"))?;
            if start > end {
                bail!("invalid range {start}-{end} (start > end)");
            }
            for port in start..=end {
                if seen.insert(port) {
                    ports.push(port);
                }
            }
            continue;
        }

        let port = parse_port(part).with_context(|| format!("invalid port: {part}"))?;
        if seen.insert(port) {
            ports.push(port);
        }
    }

    if ports.is_empty() {
        bail!("no ports in specification: {spec:?}");
    }

    Ok(ports)
}

fn parse_port(s: &str) -> Result<u16> {
    let value: u32 = s.parse().map_err(|e| anyhow!("{e}"))?;
    if value == 0 || value > 65535 {
        bail!("port out of range: {value}");
    }
    Ok(value as u16)
}

/// Insertion-ordered set that forgets its oldest entries beyond `capacity`.
#[derive(Debug)]
pub struct RecentSet<K> {
    capacity: usize,
    order: VecDeque<K>,
    members: HashSet<K>,
}

impl<K: Eq + Hash + Clone> RecentSet<K> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            members: HashSet::new(),
        }
    }

    /// Returns false if `key` was already present.
    pub fn insert(&mut self, key: K) -> bool {
        if !self.members.insert(key.clone()) {
            return false;
        }
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.members.remove(&evicted);
            }
        }
        true
    }

    pub fn contains(&self, key: &K) -> bool {
        self.members.contains(key)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
