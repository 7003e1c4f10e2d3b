//! Scheduler groups and the DNS configuration, rendered from templates.

use std::path::Path;

use cluster_shared_types::{ClusterError, DnsConfig, Result, ServiceGroup};
use serde::de::DeserializeOwned;

pub const DNS_LB_TEMPLATE: &str = "marathon-dnslb.json";
pub const COMPONENTS_TEMPLATE: &str = "marathon-linkercomponents.json";
pub const DASHBOARD_TEMPLATE: &str = "marathon-dashboard.json";
pub const DNS_CONFIG_TEMPLATE: &str = "dns-config.json";

const MONGODB_NODES: &str = "MONGODB_NODES";
const MESOS_ZOOKEEPER: &str = "Mesos_Zookeeper";
const DEPLOYER_APP: &str = "deployer";

pub async fn load_template<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = tokio::fs::read(path).await.map_err(|e| {
        ClusterError::ConfigError(format!("cannot read template {}: {}", path.display(), e))
    })?;
    serde_json::from_slice(&raw).map_err(|e| {
        ClusterError::ConfigError(format!("invalid template {}: {}", path.display(), e))
    })
}

/// DNS and load balancer group. User clusters get their own group id and
/// run it on the DNS node.
pub fn dns_lb_group(
    mut group: ServiceGroup,
    user_name: &str,
    cluster_name: &str,
    dns_ip: &str,
    management: bool,
) -> ServiceGroup {
    if management {
        return group;
    }
    group.id = format!("/{}-{}-dns", user_name, cluster_name);
    for app in group.apps_mut() {
        app.pin_to_host(dns_ip);
    }
    group
}

/// Platform components of the management cluster.
pub fn components_group(
    mut group: ServiceGroup,
    master_private_ips: &[String],
    swarm_leader_ip: &str,
) -> ServiceGroup {
    let nodes = master_private_ips.join(",");
    for app in group.apps_mut() {
        if let Some(value) = app.env.get_mut(MONGODB_NODES) {
            if !value.is_empty() {
                *value = nodes.clone();
            }
        }
        if app.id == DEPLOYER_APP {
            app.pin_to_host(swarm_leader_ip);
        }
    }
    group
}

pub fn dashboard_group(
    mut group: ServiceGroup,
    master_public_ips: &[String],
    dns_ip: &str,
    management: bool,
) -> ServiceGroup {
    let zookeepers = zookeeper_hosts(master_public_ips);
    for app in group.apps_mut() {
        app.env
            .insert(MESOS_ZOOKEEPER.to_string(), zookeepers.clone());
        if !management {
            app.pin_to_host(dns_ip);
        }
    }
    group
}

pub fn dns_config(mut config: DnsConfig, master_public_ips: &[String]) -> DnsConfig {
    config.zk = format!("zk://{}/mesos", zookeeper_hosts(master_public_ips));
    config.masters = master_public_ips
        .iter()
        .map(|ip| format!("{}:5050", ip))
        .collect();
    config
}

fn zookeeper_hosts(ips: &[String]) -> String {
    ips.iter()
        .map(|ip| format!("{}:2181", ip))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use cluster_shared_types::{App, Group};

    fn group(apps: Vec<App>) -> ServiceGroup {
        ServiceGroup {
            id: "/template".into(),
            groups: vec![Group {
                id: "g".into(),
                apps,
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn app(id: &str, env: &[(&str, &str)]) -> App {
        App {
            id: id.into(),
            env: env
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Default::default()
        }
    }

    fn pin(ip: &str) -> Vec<Vec<String>> {
        vec![vec!["hostname".into(), "CLUSTER".into(), ip.into()]]
    }

    #[test]
    fn test_dns_lb_group() {
        let template = group(vec![app("mesos-dns", &[])]);
        let user = dns_lb_group(template.clone(), "alice", "web", "52.0.0.6", false);
        assert_eq!(user.id, "/alice-web-dns");
        assert_eq!(user.groups[0].apps[0].constraints, pin("52.0.0.6"));

        let mgmt = dns_lb_group(template.clone(), "admin", "Management", "52.0.0.3", true);
        assert_eq!(mgmt, template);
    }

    #[test]
    fn test_components_group() {
        let template = group(vec![
            app("usermgmt", &[("MONGODB_NODES", "placeholder")]),
            app("cluster", &[("MONGODB_NODES", "")]),
            app("deployer", &[]),
        ]);
        let ips = vec!["10.0.0.3".to_string(), "10.0.0.4".to_string()];
        let rendered = components_group(template, &ips, "52.0.0.3");
        let apps = &rendered.groups[0].apps;
        assert_eq!(apps[0].env["MONGODB_NODES"], "10.0.0.3,10.0.0.4");
        assert_eq!(apps[1].env["MONGODB_NODES"], "");
        assert!(apps[0].constraints.is_empty());
        assert_eq!(apps[2].constraints, pin("52.0.0.3"));
    }

    #[test]
    fn test_dashboard_group() {
        let template = group(vec![app("ui", &[])]);
        let ips = vec!["52.0.0.3".to_string(), "52.0.0.4".to_string()];

        let user = dashboard_group(template.clone(), &ips, "52.0.0.6", false);
        let ui = &user.groups[0].apps[0];
        assert_eq!(ui.env["Mesos_Zookeeper"], "52.0.0.3:2181,52.0.0.4:2181");
        assert_eq!(ui.constraints, pin("52.0.0.6"));

        let mgmt = dashboard_group(template, &ips, "52.0.0.3", true);
        assert!(mgmt.groups[0].apps[0].constraints.is_empty());
    }

    #[test]
    fn test_dns_config() {
        let ips = vec!["52.0.0.3".to_string(), "52.0.0.4".to_string(), "52.0.0.5".to_string()];
        let config = dns_config(DnsConfig::default(), &ips);
        assert_eq!(config.zk, "zk://52.0.0.3:2181,52.0.0.4:2181,52.0.0.5:2181/mesos");
        assert_eq!(config.masters[2], "52.0.0.5:5050");
    }

    #[tokio::test]
    async fn test_load_template() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DNS_CONFIG_TEMPLATE);
        tokio::fs::write(&path, r#"{"zk": "", "masters": [], "domain": "mesos"}"#)
            .await
            .unwrap();
        let config: DnsConfig = load_template(&path).await.unwrap();
        assert_eq!(config.extra["domain"], "mesos");

        let missing = load_template::<DnsConfig>(&dir.path().join("nope.json")).await;
        assert!(matches!(missing, Err(ClusterError::ConfigError(_))));
    }
}
