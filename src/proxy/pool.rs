//! Configured upstream proxies and selection among them

use std::sync::Arc;

use rand::seq::SliceRandom;
use tracing::info;

use super::{DynamicProxy, Protocol, Proxy, ProxyResolver, RelayProxy};

/// Every upstream the relay can forward through
pub struct ProxyPool {
    dynamic: Vec<Arc<DynamicProxy>>,
    relays: Vec<Arc<RelayProxy>>,
    resolver: ProxyResolver,
}

impl ProxyPool {
    pub fn new(
        dynamic: Vec<Arc<DynamicProxy>>,
        relays: Vec<Arc<RelayProxy>>,
        resolver: ProxyResolver,
    ) -> Self {
        Self {
            dynamic,
            relays,
            resolver,
        }
    }

    pub fn dynamic(&self) -> &[Arc<DynamicProxy>] {
        &self.dynamic
    }

    pub fn relays(&self) -> &[Arc<RelayProxy>] {
        &self.relays
    }

    fn all(&self) -> impl Iterator<Item = Arc<dyn Proxy>> + '_ {
        let dynamic = self.dynamic.iter().map(|p| p.clone() as Arc<dyn Proxy>);
        let relays = self.relays.iter().map(|p| p.clone() as Arc<dyn Proxy>);
        dynamic.chain(relays)
    }

    /// Live proxies able to carry `protocol`, in random order
    pub fn candidates(&self, protocol: Protocol) -> Vec<Arc<dyn Proxy>> {
        let mut candidates: Vec<Arc<dyn Proxy>> = self
            .all()
            .filter(|p| !p.died() && p.is_protocol_supported(protocol))
            .collect();

        let mut rng = rand::thread_rng();
        candidates.shuffle(&mut rng);
        candidates
    }

    /// Number of proxies that are live and able to forward anything
    pub fn available_count(&self) -> usize {
        self.all()
            .filter(|p| {
                !p.died()
                    && (p.is_protocol_supported(Protocol::Http)
                        || p.is_protocol_supported(Protocol::Https))
            })
            .count()
    }

    /// Re-resolve dynamic proxies and reconnect relays
    ///
    /// The two batches run side by side; relays still connect one after another.
    pub async fn refresh(&self) -> bool {
        let (dynamic, relays) = tokio::join!(
            DynamicProxy::refresh(&self.dynamic, &self.resolver),
            RelayProxy::refresh(&self.relays),
        );
        info!(
            "Proxy pool refreshed: {} of {} proxies available",
            self.available_count(),
            self.dynamic.len() + self.relays.len()
        );
        dynamic && relays
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::{HttpConnectProxy, RelayEndpoint, ResolverConfig};
    use crate::tunnel::testing::StaticConnector;
    use crate::tunnel::TUNNEL_PROTOCOL;

    fn relay(host: &str, protocol: Option<&str>) -> Arc<RelayProxy> {
        let (connector, _fake) = StaticConnector::pair(protocol);
        Arc::new(RelayProxy::new(
            RelayEndpoint::new(host, 443),
            Arc::new(connector),
        ))
    }

    fn resolved(reference: &str, host: &str) -> Arc<DynamicProxy> {
        let proxy = Arc::new(DynamicProxy::new(reference));
        let delegate: Arc<dyn Proxy> = Arc::new(HttpConnectProxy::new(host, 8080));
        proxy.bind(Some(delegate));
        proxy
    }

    #[test]
    fn test_candidates_filter_by_liveness_and_protocol() {
        let dead_relay = relay("dead.test", None);
        dead_relay.set_died(true);

        let pool = ProxyPool::new(
            vec![
                resolved("a.test", "10.0.0.1"),
                Arc::new(DynamicProxy::new("unresolved.test")),
            ],
            vec![relay("live.test", None), dead_relay],
            ProxyResolver::new(ResolverConfig::default()),
        );

        let mut http: Vec<String> = pool
            .candidates(Protocol::Http)
            .iter()
            .map(|p| p.to_string())
            .collect();
        http.sort();
        assert_eq!(
            http,
            vec![
                "DynamicProxy[a.test=>HttpConnectProxy[10.0.0.1:8080]]".to_string(),
                "RelayProxy[live.test:443]".to_string(),
            ]
        );

        let https: Vec<String> = pool
            .candidates(Protocol::Https)
            .iter()
            .map(|p| p.to_string())
            .collect();
        assert_eq!(
            https,
            vec!["DynamicProxy[a.test=>HttpConnectProxy[10.0.0.1:8080]]".to_string()]
        );

        assert_eq!(pool.available_count(), 2);
    }

    #[test]
    fn test_empty_pool() {
        let pool = ProxyPool::new(
            Vec::new(),
            Vec::new(),
            ProxyResolver::new(ResolverConfig::default()),
        );
        assert!(pool.candidates(Protocol::Http).is_empty());
        assert_eq!(pool.available_count(), 0);
    }

    #[tokio::test]
    async fn test_refresh_connects_relays() {
        let good = relay("good.test", Some(TUNNEL_PROTOCOL));
        let bad = relay("bad.test", Some("h2"));
        let pool = ProxyPool::new(
            Vec::new(),
            vec![good.clone(), bad.clone()],
            ProxyResolver::new(ResolverConfig::default()),
        );

        assert!(pool.refresh().await);
        assert!(good.tunnel().is_some());
        assert!(bad.died());
        assert_eq!(pool.candidates(Protocol::Http).len(), 1);
    }
}
