use std::collections::HashSet;
use std::sync::Arc;

use rand::seq::SliceRandom;
use tokio::time::Instant;
use tracing::{debug, error, info};

use linkmux_core::traits::{DnsResolver, NetworkInfoProvider};
use linkmux_core::{dump_items, ActiveLogic, IPPortItem, IPSourceType};

use crate::health::AddressHealthTracker;
use crate::network_config::NetworkConfig;

/// Upper bound on candidates handed to one race connect.
pub const MAX_CANDIDATES: usize = 5;

/// Resolves configured hosts into ranked endpoints for both link types.
///
/// Lookup order per host is debug override, primary DNS, legacy DNS and
/// finally the backup ip list.
pub struct AddressSource {
    config: Arc<NetworkConfig>,
    tracker: AddressHealthTracker,
    active: Arc<ActiveLogic>,
    primary_dns: Arc<dyn DnsResolver>,
    legacy_dns: Arc<dyn DnsResolver>,
    network: Arc<dyn NetworkInfoProvider>,
}

impl AddressSource {
    pub fn new(
        config: Arc<NetworkConfig>,
        tracker: AddressHealthTracker,
        active: Arc<ActiveLogic>,
        primary_dns: Arc<dyn DnsResolver>,
        legacy_dns: Arc<dyn DnsResolver>,
        network: Arc<dyn NetworkInfoProvider>,
    ) -> Self {
        Self {
            config,
            tracker,
            active,
            primary_dns,
            legacy_dns,
            network,
        }
    }

    pub fn config(&self) -> &Arc<NetworkConfig> {
        &self.config
    }

    pub fn tracker(&self) -> &AddressHealthTracker {
        &self.tracker
    }

    /// Candidates for the long link. Empty means no usable address.
    pub async fn long_link_items(&self) -> Vec<IPPortItem> {
        if let Some(debug) = self.config.long_link_debug_ip_ports() {
            let items = debug
                .into_iter()
                .map(|(ip, host, port)| IPPortItem::new(ip, port, IPSourceType::Debug, host))
                .collect::<Vec<_>>();
            info!(items = %dump_items(&items), "长链接使用调试IP");
            return items;
        }

        let hosts = self.config.long_link_hosts();
        if hosts.is_empty() {
            error!("长链接域名为空");
            return Vec::new();
        }

        let items = self.ip_port_items(&hosts, true).await;
        debug!(items = %dump_items(&items), "长链接候选地址");
        items
    }

    /// Candidates for one short-link task. Empty means no usable address.
    pub async fn short_link_items(&self, hosts: &[String]) -> Vec<IPPortItem> {
        if let Some((ip, host, port)) = self.config.short_link_debug_ip_port(hosts) {
            return vec![IPPortItem::new(ip, port, IPSourceType::Debug, host)];
        }
        if hosts.is_empty() {
            return Vec::new();
        }

        let items = self.ip_port_items(hosts, false).await;
        debug!(items = %dump_items(&items), "短链接候选地址");
        items
    }

    async fn ip_port_items(&self, hosts: &[String], long_link: bool) -> Vec<IPPortItem> {
        let mut items = Vec::new();

        if self.active.is_active() {
            let mut merged_sources = 0usize;
            let mut make_count = MAX_CANDIDATES;
            for backup in [false, true] {
                for host in hosts {
                    if merged_sources == 1 && items.len() == MAX_CANDIDATES {
                        make_count = MAX_CANDIDATES + 1;
                    }
                    if self
                        .make_ip_ports(&mut items, host, make_count, backup, long_link)
                        .await
                        > 0
                    {
                        merged_sources += 1;
                    }
                }
            }
        } else {
            // Inactive: spread MAX_CANDIDATES - 1 resolved slots over the hosts,
            // the first `rem` hosts get one more, then top up from backup.
            let per_host = (MAX_CANDIDATES - 1) / hosts.len();
            let rem = (MAX_CANDIDATES - 1) % hosts.len();
            let mut count = 0;
            for (i, host) in hosts.iter().enumerate() {
                if count >= MAX_CANDIDATES - 1 {
                    break;
                }
                count += if i < rem { per_host + 1 } else { per_host };
                self.make_ip_ports(&mut items, host, count, false, long_link)
                    .await;
            }
            for host in hosts {
                self.make_ip_ports(&mut items, host, MAX_CANDIDATES, true, long_link)
                    .await;
            }
        }

        items
    }

    async fn resolve(&self, resolver: &dyn DnsResolver, host: &str) -> Vec<String> {
        match resolver.resolve(host).await {
            Ok(ips) => ips,
            Err(e) => {
                debug!(host, error = %e, "域名解析失败");
                Vec::new()
            }
        }
    }

    /// Appends candidates for `host` until `items` holds `count`. Returns the
    /// new length, or 0 when the host produced no ip at all.
    async fn make_ip_ports(
        &self,
        items: &mut Vec<IPPortItem>,
        host: &str,
        count: usize,
        backup: bool,
        long_link: bool,
    ) -> usize {
        let mut ips;
        let ports;
        let source_type;

        if !backup {
            ips = self.resolve(self.primary_dns.as_ref(), host).await;
            if ips.is_empty() {
                ips = self.resolve(self.legacy_dns.as_ref(), host).await;
                source_type = IPSourceType::Dns;
            } else {
                source_type = IPSourceType::NewDns;
            }
            ports = if long_link {
                self.config.long_link_ports()
            } else {
                vec![self.config.short_link_port()]
            };
        } else {
            ips = self.config.backup_ips(host);
            if ips.is_empty() {
                let resolved = self.resolve(self.legacy_dns.as_ref(), host).await;
                if !resolved.is_empty() {
                    self.config.set_backup_ips(host, resolved.clone());
                    ips = resolved;
                }
            }
            ports = if long_link {
                self.config.backup_long_link_ports()
            } else {
                vec![self.config.short_link_port()]
            };
            source_type = IPSourceType::Backup;

            if !ips.is_empty() && !ports.is_empty() {
                let known: HashSet<&str> = items.iter().map(|i| i.ip.as_str()).collect();
                let ports_count = ports.len();
                let mut required = count.saturating_sub(items.len());
                if required < ports_count {
                    required += ports_count;
                }
                let mut current = ips.len() * ports_count;
                let mut i = 0;
                while current > required && i < ips.len() {
                    if known.contains(ips[i].as_str()) {
                        ips.remove(i);
                        current -= ports_count;
                    } else {
                        i += 1;
                    }
                }
            }
        }

        if ips.is_empty() {
            return 0;
        }

        let len = items.len();
        let mut candidates: Vec<IPPortItem> = ips
            .iter()
            .flat_map(|ip| {
                ports
                    .iter()
                    .map(move |port| IPPortItem::new(ip.clone(), *port, source_type, host))
            })
            .collect();

        if !backup {
            candidates.retain(|c| !items.iter().any(|i| i.ip == c.ip && i.port == c.port));
            self.tracker
                .sort_and_filter(&mut candidates, count.saturating_sub(len), Instant::now());
            items.extend(candidates);
        } else {
            items.extend(candidates);
            items[len..].shuffle(&mut rand::rng());
            items.truncate(count);
        }

        items.len()
    }

    pub fn report_long_ip(&self, success: bool, ip: &str, port: u16) {
        if !success {
            info!(ip, port, "长链接地址上报失败");
        }
        if ip.is_empty() || port == 0 || !self.network.network_info().has_net() {
            return;
        }
        self.tracker.update(ip, port, success, Instant::now());
    }

    pub fn report_short_ip(&self, success: bool, ip: &str, host: &str, port: u16) {
        if !success {
            info!(ip, host, port, "短链接地址上报失败");
        }
        if ip.is_empty() || !self.network.network_info().has_net() {
            return;
        }
        self.tracker.update(ip, port, success, Instant::now());
    }

    pub fn remove_long_ban_ip(&self, ip: &str) {
        self.tracker.remove_banned(ip);
    }

    pub fn add_server_ban(&self, ip: &str) {
        self.tracker.add_server_ban(ip, Instant::now());
    }

    /// Persists history and reloads the ban window for the current network.
    pub fn clear_cache(&self) {
        info!("重置IP封禁缓存");
        self.tracker.init_history_to_banned_list(true);
    }
}
