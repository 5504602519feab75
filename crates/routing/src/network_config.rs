use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{error, info};

use linkmux_core::config::NetworkSettings;

#[derive(Debug, Default, Clone)]
struct Inner {
    long_link_hosts: Vec<String>,
    long_link_ports: Vec<u16>,
    long_link_debug_ip: String,
    low_priority_long_link_ports: Vec<u16>,
    short_link_port: u16,
    short_link_debug_ip: String,
    backup_ips: HashMap<String, Vec<String>>,
    host_debug_ips: HashMap<String, String>,
}

/// Hosts, ports and debug overrides shared by every address lookup.
#[derive(Debug, Default)]
pub struct NetworkConfig {
    inner: RwLock<Inner>,
}

impl NetworkConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_settings(settings: &NetworkSettings) -> Self {
        let inner = Inner {
            long_link_hosts: settings.long_link_hosts.clone(),
            long_link_ports: settings.long_link_ports.clone(),
            long_link_debug_ip: settings.long_link_debug_ip.clone().unwrap_or_default(),
            low_priority_long_link_ports: settings.long_link_low_priority_ports.clone(),
            short_link_port: settings.short_link_port,
            short_link_debug_ip: settings.short_link_debug_ip.clone().unwrap_or_default(),
            backup_ips: settings.backup_ips.clone(),
            host_debug_ips: HashMap::new(),
        };
        Self {
            inner: RwLock::new(inner),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// An empty host list is rejected and the previous hosts stay in place.
    pub fn set_long_link(&self, hosts: Vec<String>, ports: Vec<u16>, debug_ip: &str) {
        info!(?hosts, ?ports, debug_ip, "设置长链接服务器地址");
        let mut inner = self.write();
        inner.long_link_debug_ip = debug_ip.to_string();
        if hosts.is_empty() {
            error!("长链接域名列表不能为空");
        } else {
            inner.long_link_hosts = hosts;
        }
        inner.long_link_ports = ports;
    }

    pub fn set_short_link(&self, port: u16, debug_ip: &str) {
        info!(port, debug_ip, "设置短链接服务器地址");
        let mut inner = self.write();
        inner.short_link_port = port;
        inner.short_link_debug_ip = debug_ip.to_string();
    }

    pub fn set_backup_ips(&self, host: &str, ips: Vec<String>) {
        info!(host, ?ips, "设置备用IP");
        self.write().backup_ips.insert(host.to_string(), ips);
    }

    /// Pins `host` to `ip`. An empty ip removes the override.
    pub fn set_debug_ip(&self, host: &str, ip: &str) {
        info!(host, ip, "设置调试IP");
        let mut inner = self.write();
        if ip.is_empty() {
            inner.host_debug_ips.remove(host);
        } else {
            inner.host_debug_ips.insert(host.to_string(), ip.to_string());
        }
    }

    pub fn set_low_priority_long_link_ports(&self, ports: Vec<u16>) {
        self.write().low_priority_long_link_ports = ports;
    }

    pub fn long_link_hosts(&self) -> Vec<String> {
        self.read().long_link_hosts.clone()
    }

    pub fn long_link_ports(&self) -> Vec<u16> {
        self.read().long_link_ports.clone()
    }

    /// Ports used for backup ips, falling back to the normal long-link ports.
    pub fn backup_long_link_ports(&self) -> Vec<u16> {
        let inner = self.read();
        if inner.low_priority_long_link_ports.is_empty() {
            inner.long_link_ports.clone()
        } else {
            inner.low_priority_long_link_ports.clone()
        }
    }

    pub fn long_link_debug_ip(&self) -> String {
        self.read().long_link_debug_ip.clone()
    }

    pub fn short_link_port(&self) -> u16 {
        self.read().short_link_port
    }

    pub fn short_link_debug_ip(&self) -> String {
        self.read().short_link_debug_ip.clone()
    }

    pub fn backup_ips(&self, host: &str) -> Vec<String> {
        self.read().backup_ips.get(host).cloned().unwrap_or_default()
    }

    pub fn debug_ip_for(&self, host: &str) -> Option<String> {
        self.read().host_debug_ips.get(host).cloned()
    }

    pub fn has_short_link_debug_ip(&self, hosts: &[String]) -> bool {
        let inner = self.read();
        !inner.short_link_debug_ip.is_empty()
            || hosts.iter().any(|h| inner.host_debug_ips.contains_key(h))
    }

    /// Debug overrides for the long link: every port of the first host with a
    /// per-host override, else every port of the global debug ip.
    pub(crate) fn long_link_debug_ip_ports(&self) -> Option<Vec<(String, String, u16)>> {
        let inner = self.read();
        for host in &inner.long_link_hosts {
            if let Some(ip) = inner.host_debug_ips.get(host) {
                return Some(
                    inner
                        .long_link_ports
                        .iter()
                        .map(|port| (ip.clone(), host.clone(), *port))
                        .collect(),
                );
            }
        }
        if inner.long_link_debug_ip.is_empty() {
            return None;
        }
        let host = inner.long_link_hosts.first().cloned().unwrap_or_default();
        Some(
            inner
                .long_link_ports
                .iter()
                .map(|port| (inner.long_link_debug_ip.clone(), host.clone(), *port))
                .collect(),
        )
    }

    pub(crate) fn short_link_debug_ip_port(&self, hosts: &[String]) -> Option<(String, String, u16)> {
        let inner = self.read();
        for host in hosts {
            if let Some(ip) = inner.host_debug_ips.get(host) {
                return Some((ip.clone(), host.clone(), inner.short_link_port));
            }
        }
        if inner.short_link_debug_ip.is_empty() {
            return None;
        }
        let host = hosts.first().cloned().unwrap_or_default();
        Some((inner.short_link_debug_ip.clone(), host, inner.short_link_port))
    }
}
