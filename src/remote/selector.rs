use std::sync::atomic::{AtomicUsize, Ordering};

use xxhash_rust::xxh3::xxh3_64;

/// Picks the node that owns a key.
#[derive(Debug)]
pub enum Selector {
    /// Stable 64-bit hash of the key modulo node count. Every process agrees
    /// on the owner as long as they share the node list.
    HashCode,
    /// Round-robin over the nodes, for roles without a key affinity.
    Rolling(AtomicUsize),
    /// Always the first node of the ordered list.
    ForeverFirst,
}

impl Selector {
    pub fn rolling() -> Self {
        Self::Rolling(AtomicUsize::new(0))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::HashCode => "hash_code",
            Self::Rolling(_) => "rolling",
            Self::ForeverFirst => "forever_first",
        }
    }

    /// Returns the owning node, or `None` for an empty topology.
    pub fn select<'a>(&self, key: &str, nodes: &'a [String]) -> Option<&'a String> {
        if nodes.is_empty() {
            return None;
        }
        let idx = match self {
            Self::HashCode => (xxh3_64(key.as_bytes()) % nodes.len() as u64) as usize,
            Self::Rolling(counter) => counter.fetch_add(1, Ordering::Relaxed) % nodes.len(),
            Self::ForeverFirst => 0,
        };
        nodes.get(idx)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn nodes(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("10.0.0.{i}:11800")).collect()
    }

    #[test]
    fn test_hash_code_is_deterministic() {
        let nodes = nodes(5);
        let a = Selector::HashCode;
        let b = Selector::HashCode;
        for i in 0..200 {
            let key = format!("2024010110_svc-{i}");
            assert_eq!(a.select(&key, &nodes), b.select(&key, &nodes));
        }
    }

    #[test]
    fn test_hash_code_spreads_keys() {
        for k in [2usize, 3, 5, 8] {
            let nodes = nodes(k);
            let mut counts: HashMap<&String, usize> = HashMap::new();
            for i in 0..1000 {
                let key = format!("202401011200_service-{i}_POST:/orders/{i}");
                let owner = Selector::HashCode.select(&key, &nodes).expect("owner");
                *counts.entry(owner).or_default() += 1;
            }
            let expected = 1000 / k;
            for (node, count) in counts {
                assert!(
                    count <= expected * 2,
                    "{node} got {count} of 1000 with {k} nodes"
                );
            }
        }
    }

    #[test]
    fn test_rolling_cycles() {
        let nodes = nodes(3);
        let selector = Selector::rolling();
        let picked: Vec<&String> = (0..6)
            .map(|_| selector.select("ignored", &nodes).expect("node"))
            .collect();
        assert_eq!(picked[0], &nodes[0]);
        assert_eq!(picked[1], &nodes[1]);
        assert_eq!(picked[2], &nodes[2]);
        assert_eq!(picked[3], &nodes[0]);
    }

    #[test]
    fn test_forever_first() {
        let nodes = nodes(4);
        for key in ["a", "b", "c"] {
            assert_eq!(Selector::ForeverFirst.select(key, &nodes), Some(&nodes[0]));
        }
    }

    #[test]
    fn test_empty_topology() {
        assert!(Selector::HashCode.select("a", &[]).is_none());
        assert!(Selector::rolling().select("a", &[]).is_none());
    }
}
