//! NUMA topology detection.
//!
//! Reads `/sys/devices/system/node/` to discover node count and the CPUs
//! belonging to each node. On single-node systems (or when sysfs is
//! unavailable) degrades to one node covering all online CPUs.
//!
//! The matmul engine consults this: on multi-node systems it prefers a
//! static per-thread split over work-stealing, which measured better there
//! (stolen chunks land on remote-node memory).

/// A single NUMA node.
#[derive(Debug, Clone)]
pub struct NumaNode {
    pub id: usize,
    pub cpus: Vec<usize>,
}

/// Complete NUMA topology of the system.
#[derive(Debug, Clone)]
pub struct NumaTopology {
    pub nodes: Vec<NumaNode>,
}

impl NumaTopology {
    pub fn detect() -> Self {
        #[cfg(target_os = "linux")]
        {
            if let Some(t) = detect_sysfs() {
                return t;
            }
        }
        Self::single_node()
    }

    fn single_node() -> Self {
        let n = std::thread::available_parallelism().map_or(1, |p| p.get());
        Self {
            nodes: vec![NumaNode {
                id: 0,
                cpus: (0..n).collect(),
            }],
        }
    }

    #[inline]
    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn is_multi_node(&self) -> bool {
        self.nodes.len() > 1
    }

    #[inline]
    pub fn total_cpus(&self) -> usize {
        self.nodes.iter().map(|n| n.cpus.len()).sum()
    }
}

#[cfg(target_os = "linux")]
fn detect_sysfs() -> Option<NumaTopology> {
    let online = std::fs::read_to_string("/sys/devices/system/node/online").ok()?;
    let ids = parse_cpu_list(online.trim())?;
    let mut nodes = Vec::with_capacity(ids.len());
    for id in ids {
        let list =
            std::fs::read_to_string(format!("/sys/devices/system/node/node{id}/cpulist")).ok()?;
        let cpus = parse_cpu_list(list.trim())?;
        nodes.push(NumaNode { id, cpus });
    }
    if nodes.is_empty() {
        return None;
    }
    Some(NumaTopology { nodes })
}

/// Parse a sysfs cpu list like `0-3,8,10-11`.
#[cfg(target_os = "linux")]
fn parse_cpu_list(s: &str) -> Option<Vec<usize>> {
    let mut out = Vec::new();
    if s.is_empty() {
        return Some(out);
    }
    for part in s.split(',') {
        match part.split_once('-') {
            Some((a, b)) => {
                let a: usize = a.trim().parse().ok()?;
                let b: usize = b.trim().parse().ok()?;
                out.extend(a..=b);
            }
            None => out.push(part.trim().parse().ok()?),
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_has_at_least_one_node() {
        let t = NumaTopology::detect();
        assert!(t.num_nodes() >= 1);
        assert!(t.total_cpus() >= 1);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn cpu_list_parsing() {
        assert_eq!(parse_cpu_list("0-3").unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(parse_cpu_list("0-1,4,6-7").unwrap(), vec![0, 1, 4, 6, 7]);
        assert_eq!(parse_cpu_list("5").unwrap(), vec![5]);
    }
}
