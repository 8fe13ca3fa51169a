use std::sync::Arc;

use async_trait::async_trait;

/// Status a bridge protocol reports for an in-flight transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterStatus {
    Pending,
    Bridging,
    Completed,
    Failed,
    Refunded,
}

/// Seam for concrete bridge protocol clients (Stargate, Across, ...). The
/// core only asks what a router supports and where a transfer stands.
#[async_trait]
pub trait BridgeRouter: Send + Sync {
    fn protocol(&self) -> &str;

    fn supports(&self, src_chain: &str, dst_chain: &str, token: &str) -> bool;

    async fn get_status(&self, bridge_id: &str) -> anyhow::Result<RouterStatus>;
}

/// Registry of configured routers.
#[derive(Default)]
pub struct BridgeRouterFactory {
    routers: Vec<Arc<dyn BridgeRouter>>,
}

impl BridgeRouterFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, router: Arc<dyn BridgeRouter>) {
        self.routers.push(router);
    }

    /// First registered router claiming support for the route. None is not
    /// an error; router sets are config-driven and may lag deployments.
    pub fn find_supported_router(
        &self,
        src_chain: &str,
        dst_chain: &str,
        token: &str,
    ) -> Option<Arc<dyn BridgeRouter>> {
        self.routers
            .iter()
            .find(|router| router.supports(src_chain, dst_chain, token))
            .cloned()
    }

    pub fn find_by_protocol(&self, protocol: &str) -> Option<Arc<dyn BridgeRouter>> {
        self.routers
            .iter()
            .find(|router| router.protocol() == protocol)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.routers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticRouter {
        protocol: &'static str,
        src: &'static str,
        dst: &'static str,
    }

    #[async_trait]
    impl BridgeRouter for StaticRouter {
        fn protocol(&self) -> &str {
            self.protocol
        }
        fn supports(&self, src: &str, dst: &str, _token: &str) -> bool {
            src == self.src && dst == self.dst
        }
        async fn get_status(&self, _bridge_id: &str) -> anyhow::Result<RouterStatus> {
            Ok(RouterStatus::Completed)
        }
    }

    #[test]
    fn finds_first_supporting_router() {
        let mut factory = BridgeRouterFactory::new();
        factory.register(Arc::new(StaticRouter {
            protocol: "stargate",
            src: "ethereum",
            dst: "arbitrum",
        }));
        factory.register(Arc::new(StaticRouter {
            protocol: "across",
            src: "ethereum",
            dst: "optimism",
        }));

        let found = factory
            .find_supported_router("ethereum", "optimism", "WETH")
            .unwrap();
        assert_eq!(found.protocol(), "across");
        assert!(factory.find_supported_router("polygon", "bsc", "WETH").is_none());
    }
}
