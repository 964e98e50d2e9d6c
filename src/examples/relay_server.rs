//! Runs the gateway as a standalone server configured from the environment.

use log::{info, warn};
use relay_guard::{
    router, Blacklist, BotDetector, Clock, CounterStore, Gatekeeper, GatewayConfig,
    HttpLeaseProvider, LeasePool, LeasePoolConfig, RateLimiter, Relay, RelayState,
    RestCounterStore, SystemClock,
};
use std::sync::Arc;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = GatewayConfig::from_env();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let blacklist = Arc::new(Blacklist::seeded(
        clock.clone(),
        config.permanent_blacklist.clone(),
        config.whitelist.clone(),
    ));
    let detector = BotDetector::new(blacklist.clone(), clock.clone());
    detector.start_cleanup();

    let store: Option<Arc<dyn CounterStore>> = match &config.counter_store {
        Some(store_config) => Some(Arc::new(RestCounterStore::new(store_config.clone())?)),
        None => None,
    };
    let limiter = RateLimiter::new(store, clock.clone())
        .fail_open(config.fail_open)
        .store_timeout(config.store_timeout);
    let gate = Arc::new(Gatekeeper::new(blacklist, limiter, detector.clone()));

    let relay = match &config.lease_api {
        Some(credentials) => {
            let provider = Arc::new(HttpLeaseProvider::new(credentials.clone())?);
            let pool = LeasePool::new(provider, clock.clone(), LeasePoolConfig::default());
            Some(Arc::new(Relay::new(pool)))
        }
        None => {
            warn!("EPHEMERAL_PROXIES_API_KEY/HOST not set, the relay will refuse downloads");
            None
        }
    };

    let app = router(RelayState { relay: relay.clone() }, gate);

    let listener = TcpListener::bind(config.listen_addr).await?;
    info!("Gateway listening on http://{}", config.listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    if let Some(relay) = relay {
        relay.pool().shutdown();
    }
    detector.shutdown();

    Ok(())
}
