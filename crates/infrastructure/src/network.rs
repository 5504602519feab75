use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;

use linkmux_core::traits::{AuthGate, NetworkInfoProvider};
use linkmux_core::NetworkInfo;

/// Network state pushed in by the host application.
#[derive(Debug)]
pub struct StaticNetworkInfo {
    info: RwLock<NetworkInfo>,
}

impl StaticNetworkInfo {
    pub fn new(info: NetworkInfo) -> Self {
        Self {
            info: RwLock::new(info),
        }
    }

    pub fn set(&self, info: NetworkInfo) {
        *self.info.write().unwrap_or_else(|e| e.into_inner()) = info;
    }
}

impl NetworkInfoProvider for StaticNetworkInfo {
    fn network_info(&self) -> NetworkInfo {
        self.info.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Authentication flag owned by the host application.
#[derive(Debug)]
pub struct StaticAuthGate {
    authed: AtomicBool,
}

impl StaticAuthGate {
    pub fn new(authed: bool) -> Self {
        Self {
            authed: AtomicBool::new(authed),
        }
    }

    pub fn set(&self, authed: bool) {
        self.authed.store(authed, Ordering::SeqCst);
    }
}

#[async_trait]
impl AuthGate for StaticAuthGate {
    async fn ensure_authenticated(&self) -> bool {
        self.authed.load(Ordering::SeqCst)
    }
}
