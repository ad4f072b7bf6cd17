//! Worker selection policies

use crate::config::SelectorKind;
use crate::dispatch::host_manager::WorkerHost;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub trait HostSelector: Send + Sync {
    fn select<'a>(&self, hosts: &'a [WorkerHost]) -> Option<&'a WorkerHost>;
}

#[derive(Default)]
pub struct RoundRobinSelector {
    next: AtomicUsize,
}

impl HostSelector for RoundRobinSelector {
    fn select<'a>(&self, hosts: &'a [WorkerHost]) -> Option<&'a WorkerHost> {
        if hosts.is_empty() {
            return None;
        }
        let i = self.next.fetch_add(1, Ordering::Relaxed);
        hosts.get(i % hosts.len())
    }
}

/// Picks the worker with the lowest reported utilisation
#[derive(Default)]
pub struct LowestLoadSelector;

impl HostSelector for LowestLoadSelector {
    fn select<'a>(&self, hosts: &'a [WorkerHost]) -> Option<&'a WorkerHost> {
        // Compare running/capacity as cross products to stay in integers
        hosts.iter().min_by(|a, b| {
            let lhs = a.running * b.capacity.max(1);
            let rhs = b.running * a.capacity.max(1);
            lhs.cmp(&rhs).then_with(|| a.host.cmp(&b.host))
        })
    }
}

pub fn selector_for(kind: SelectorKind) -> Arc<dyn HostSelector> {
    match kind {
        SelectorKind::RoundRobin => Arc::new(RoundRobinSelector::default()),
        SelectorKind::LowestLoad => Arc::new(LowestLoadSelector),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(name: &str, running: usize, capacity: usize) -> WorkerHost {
        WorkerHost {
            host: name.to_string(),
            address: format!("inproc://{}", name),
            groups: vec!["default".to_string()],
            running,
            capacity,
        }
    }

    #[test]
    fn test_round_robin_cycles() {
        let hosts = vec![host("a", 0, 1), host("b", 0, 1), host("c", 0, 1)];
        let selector = RoundRobinSelector::default();
        let picked: Vec<&str> = (0..4)
            .map(|_| selector.select(&hosts).unwrap().host.as_str())
            .collect();
        assert_eq!(picked, vec!["a", "b", "c", "a"]);
        assert!(selector.select(&[]).is_none());
    }

    #[test]
    fn test_lowest_load_uses_ratio() {
        // a: 2/4 = 0.5, b: 3/8 = 0.375, c: 1/2 = 0.5
        let hosts = vec![host("a", 2, 4), host("b", 3, 8), host("c", 1, 2)];
        assert_eq!(LowestLoadSelector.select(&hosts).unwrap().host, "b");

        let tied = vec![host("z", 1, 4), host("y", 1, 4)];
        assert_eq!(LowestLoadSelector.select(&tied).unwrap().host, "y");
    }
}
