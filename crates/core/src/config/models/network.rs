use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Host and port settings from which the runtime network config is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    pub long_link_hosts: Vec<String>,
    pub long_link_ports: Vec<u16>,
    pub long_link_low_priority_ports: Vec<u16>,
    pub short_link_hosts: Vec<String>,
    pub short_link_port: u16,
    pub backup_ips: HashMap<String, Vec<String>>,
    pub long_link_debug_ip: Option<String>,
    pub short_link_debug_ip: Option<String>,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            long_link_hosts: vec!["long.linkmux.local".to_string()],
            long_link_ports: vec![8080],
            long_link_low_priority_ports: Vec::new(),
            short_link_hosts: vec!["short.linkmux.local".to_string()],
            short_link_port: 80,
            backup_ips: HashMap::new(),
            long_link_debug_ip: None,
            short_link_debug_ip: None,
        }
    }
}

impl NetworkSettings {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.long_link_hosts.iter().any(|h| h.trim().is_empty()) {
            return Err(anyhow::anyhow!("长链接域名不能为空字符串"));
        }
        if !self.long_link_hosts.is_empty() && self.long_link_ports.is_empty() {
            return Err(anyhow::anyhow!("配置了长链接域名但未配置端口"));
        }
        if self.long_link_ports.contains(&0) || self.long_link_low_priority_ports.contains(&0) {
            return Err(anyhow::anyhow!("长链接端口不能为0"));
        }
        if self.short_link_port == 0 {
            return Err(anyhow::anyhow!("短链接端口不能为0"));
        }
        Ok(())
    }
}
