use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use num_bigint::BigUint;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::lifecycle::{Lifecycle, ServiceState};
use crate::models::{now_ms, ChainBalance};

/// Native-balance source for one chain. Concrete RPC clients implement this.
#[async_trait]
pub trait BalanceProvider: Send + Sync {
    async fn get_balance(&self, address: &str) -> anyhow::Result<BigUint>;
}

/// Address source for the wallet funding a chain.
#[async_trait]
pub trait Wallet: Send + Sync {
    async fn get_address(&self) -> anyhow::Result<String>;
}

#[derive(Debug, Clone)]
pub struct BalanceMonitorConfig {
    pub enabled: bool,
    pub check_interval_ms: u64,
    pub low_balance_threshold_eth: f64,
}

impl Default for BalanceMonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_ms: 60_000,
            low_balance_threshold_eth: 0.01,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BalanceSnapshot {
    pub balances: HashMap<String, ChainBalance>,
    pub timestamp: i64,
    pub healthy_count: usize,
    pub failed_count: usize,
}

/// Polls native balances for every configured (chain, wallet) pair and logs
/// drift between cycles. Purely observational; it never blocks execution.
pub struct BalanceMonitor {
    config: BalanceMonitorConfig,
    providers: HashMap<String, Arc<dyn BalanceProvider>>,
    wallets: HashMap<String, Arc<dyn Wallet>>,
    lifecycle: Lifecycle,
    balances: Mutex<HashMap<String, ChainBalance>>,
    previous_wei: Mutex<HashMap<String, BigUint>>,
}

impl BalanceMonitor {
    pub fn new(
        config: BalanceMonitorConfig,
        providers: HashMap<String, Arc<dyn BalanceProvider>>,
        wallets: HashMap<String, Arc<dyn Wallet>>,
        lifecycle: Lifecycle,
    ) -> Self {
        Self {
            config,
            providers,
            wallets,
            lifecycle,
            balances: Mutex::new(HashMap::new()),
            previous_wei: Mutex::new(HashMap::new()),
        }
    }

    /// Immediate check, then the periodic loop. Disabled mode is a no-op.
    pub async fn run(self: Arc<Self>) {
        if !self.config.enabled {
            return;
        }
        info!(
            chains = self.wallets.len(),
            interval_ms = self.config.check_interval_ms,
            threshold_eth = self.config.low_balance_threshold_eth,
            "balance monitor starting"
        );
        self.check_once().await;
        loop {
            tokio::time::sleep(Duration::from_millis(self.config.check_interval_ms)).await;
            match self.lifecycle.state() {
                ServiceState::Stopping | ServiceState::Stopped | ServiceState::Error => break,
                ServiceState::Running => self.check_once().await,
                _ => {}
            }
        }
        debug!("balance monitor loop ended");
    }

    /// One polling cycle across all chains, concurrently. Individual chain
    /// failures produce unhealthy entries, never abort the cycle.
    pub async fn check_once(self: &Arc<Self>) {
        if !self.config.enabled {
            return;
        }
        let mut tasks = tokio::task::JoinSet::new();
        for (chain, wallet) in &self.wallets {
            let chain = chain.clone();
            let wallet = Arc::clone(wallet);
            let provider = self.providers.get(&chain).cloned();
            tasks.spawn(async move {
                let entry = fetch_balance(&chain, provider, wallet).await;
                (chain, entry)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let Ok((chain, entry)) = joined else {
                continue;
            };
            self.absorb(&chain, entry);
        }
    }

    fn absorb(&self, chain: &str, entry: ChainBalance) {
        if entry.healthy {
            if entry.balance_eth < self.config.low_balance_threshold_eth {
                warn!(
                    chain,
                    address = %entry.address,
                    balance_eth = entry.balance_eth,
                    threshold = self.config.low_balance_threshold_eth,
                    "low native balance"
                );
            }

            if let Ok(current) = entry.balance_wei.parse::<BigUint>() {
                let mut previous_map = self.previous_wei.lock();
                if let Some(previous) = previous_map.get(chain) {
                    if *previous != current {
                        let change = if current > *previous {
                            format!("increased by {:.6}", wei_to_eth(&(current.clone() - previous)))
                        } else {
                            format!("decreased by {:.6}", wei_to_eth(&(previous - current.clone())))
                        };
                        info!(
                            chain,
                            previous = %previous,
                            current = %current,
                            %change,
                            "balance drift"
                        );
                    }
                }
                previous_map.insert(chain.to_string(), current);
            }
        } else {
            warn!(
                chain,
                address = %entry.address,
                error = entry.error.as_deref().unwrap_or("unknown"),
                "balance check failed"
            );
        }

        self.balances.lock().insert(chain.to_string(), entry);
    }

    /// Copy of the current balance table; callers own the result.
    pub fn get_snapshot(&self) -> BalanceSnapshot {
        let balances = self.balances.lock().clone();
        let healthy_count = balances.values().filter(|b| b.healthy).count();
        let failed_count = balances.len() - healthy_count;
        BalanceSnapshot {
            balances,
            timestamp: now_ms(),
            healthy_count,
            failed_count,
        }
    }
}

async fn fetch_balance(
    chain: &str,
    provider: Option<Arc<dyn BalanceProvider>>,
    wallet: Arc<dyn Wallet>,
) -> ChainBalance {
    let unhealthy = |address: String, error: String| ChainBalance {
        chain: chain.to_string(),
        address,
        balance_wei: "0".to_string(),
        balance_eth: 0.0,
        last_checked_at: now_ms(),
        healthy: false,
        error: Some(error),
    };

    let Some(provider) = provider else {
        return unhealthy(String::new(), "No provider available".to_string());
    };
    let address = match wallet.get_address().await {
        Ok(address) => address,
        Err(e) => return unhealthy(String::new(), e.to_string()),
    };
    match provider.get_balance(&address).await {
        Ok(wei) => ChainBalance {
            chain: chain.to_string(),
            address,
            balance_eth: wei_to_eth(&wei),
            balance_wei: wei.to_string(),
            last_checked_at: now_ms(),
            healthy: true,
            error: None,
        },
        Err(e) => unhealthy(address, e.to_string()),
    }
}

fn wei_to_eth(wei: &BigUint) -> f64 {
    wei.to_string().parse::<f64>().unwrap_or(0.0) / 1e18
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedWallet(&'static str);

    #[async_trait]
    impl Wallet for FixedWallet {
        async fn get_address(&self) -> anyhow::Result<String> {
            Ok(self.0.to_string())
        }
    }

    struct StubProvider {
        wei: Mutex<BigUint>,
        fail: bool,
    }

    impl StubProvider {
        fn with_eth(eth: f64) -> Arc<Self> {
            Arc::new(Self {
                wei: Mutex::new(BigUint::from((eth * 1e18) as u128)),
                fail: false,
            })
        }
    }

    #[async_trait]
    impl BalanceProvider for StubProvider {
        async fn get_balance(&self, _address: &str) -> anyhow::Result<BigUint> {
            if self.fail {
                anyhow::bail!("rpc unreachable");
            }
            Ok(self.wei.lock().clone())
        }
    }

    fn running_lifecycle() -> Lifecycle {
        let lc = Lifecycle::new("balance-test");
        lc.transition(ServiceState::Starting).unwrap();
        lc.transition(ServiceState::Running).unwrap();
        lc
    }

    fn monitor(
        providers: HashMap<String, Arc<dyn BalanceProvider>>,
        wallets: HashMap<String, Arc<dyn Wallet>>,
    ) -> Arc<BalanceMonitor> {
        Arc::new(BalanceMonitor::new(
            BalanceMonitorConfig::default(),
            providers,
            wallets,
            running_lifecycle(),
        ))
    }

    #[tokio::test]
    async fn healthy_balances_are_recorded() {
        let provider = StubProvider::with_eth(1.5);
        let mut providers: HashMap<String, Arc<dyn BalanceProvider>> = HashMap::new();
        providers.insert("ethereum".into(), provider);
        let mut wallets: HashMap<String, Arc<dyn Wallet>> = HashMap::new();
        wallets.insert("ethereum".into(), Arc::new(FixedWallet("0xabc")));

        let monitor = monitor(providers, wallets);
        monitor.check_once().await;

        let snapshot = monitor.get_snapshot();
        assert_eq!(snapshot.healthy_count, 1);
        assert_eq!(snapshot.failed_count, 0);
        let entry = &snapshot.balances["ethereum"];
        assert!(entry.healthy);
        assert_eq!(entry.address, "0xabc");
        assert!((entry.balance_eth - 1.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn missing_provider_yields_unhealthy_entry() {
        let mut wallets: HashMap<String, Arc<dyn Wallet>> = HashMap::new();
        wallets.insert("polygon".into(), Arc::new(FixedWallet("0xabc")));

        let monitor = monitor(HashMap::new(), wallets);
        monitor.check_once().await;

        let snapshot = monitor.get_snapshot();
        assert_eq!(snapshot.failed_count, 1);
        assert_eq!(
            snapshot.balances["polygon"].error.as_deref(),
            Some("No provider available")
        );
    }

    #[tokio::test]
    async fn provider_error_yields_unhealthy_entry() {
        let provider = Arc::new(StubProvider {
            wei: Mutex::new(BigUint::from(0u32)),
            fail: true,
        });
        let mut providers: HashMap<String, Arc<dyn BalanceProvider>> = HashMap::new();
        providers.insert("ethereum".into(), provider);
        let mut wallets: HashMap<String, Arc<dyn Wallet>> = HashMap::new();
        wallets.insert("ethereum".into(), Arc::new(FixedWallet("0xabc")));

        let monitor = monitor(providers, wallets);
        monitor.check_once().await;

        let entry = &monitor.get_snapshot().balances["ethereum"];
        assert!(!entry.healthy);
        assert_eq!(entry.error.as_deref(), Some("rpc unreachable"));
        assert_eq!(entry.address, "0xabc");
    }

    #[tokio::test]
    async fn drift_updates_previous_balance() {
        let provider = StubProvider::with_eth(2.0);
        let mut providers: HashMap<String, Arc<dyn BalanceProvider>> = HashMap::new();
        providers.insert("ethereum".into(), provider.clone());
        let mut wallets: HashMap<String, Arc<dyn Wallet>> = HashMap::new();
        wallets.insert("ethereum".into(), Arc::new(FixedWallet("0xabc")));

        let monitor = monitor(providers, wallets);
        monitor.check_once().await;

        *provider.wei.lock() = BigUint::from((1.25e18) as u128);
        monitor.check_once().await;

        let entry = &monitor.get_snapshot().balances["ethereum"];
        assert!((entry.balance_eth - 1.25).abs() < 1e-9);
        assert_eq!(
            *monitor.previous_wei.lock().get("ethereum").unwrap(),
            BigUint::from((1.25e18) as u128)
        );
    }

    #[tokio::test]
    async fn disabled_monitor_is_a_no_op() {
        let mut wallets: HashMap<String, Arc<dyn Wallet>> = HashMap::new();
        wallets.insert("ethereum".into(), Arc::new(FixedWallet("0xabc")));
        let monitor = Arc::new(BalanceMonitor::new(
            BalanceMonitorConfig {
                enabled: false,
                ..BalanceMonitorConfig::default()
            },
            HashMap::new(),
            wallets,
            running_lifecycle(),
        ));
        monitor.check_once().await;
        assert!(monitor.get_snapshot().balances.is_empty());
    }

    #[test]
    fn wei_to_eth_conversion() {
        assert!((wei_to_eth(&BigUint::from(10u128.pow(18))) - 1.0).abs() < 1e-12);
        assert!((wei_to_eth(&BigUint::from(10u128.pow(16))) - 0.01).abs() < 1e-12);
        assert_eq!(wei_to_eth(&BigUint::from(0u32)), 0.0);
    }
}
