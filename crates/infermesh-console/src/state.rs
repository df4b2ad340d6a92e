//! Shared state for the console handlers.

use std::sync::Arc;

use proxy_core::ProxyServer;

pub struct ConsoleState {
    pub proxy: Arc<ProxyServer>,
}

impl ConsoleState {
    pub fn new(proxy: Arc<ProxyServer>) -> Self {
        Self { proxy }
    }
}
