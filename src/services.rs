use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr};

use anyhow::Result;
use serde::Deserialize;

const DEFAULT_USER: &str = "devuser";
const DEFAULT_DATABASE: &str = "dev_database";
const DEFAULT_VHOST: &str = "dev_vhost";
const FORGEJO_ADMIN: &str = "devadmin";
const FORGEJO_EMAIL: &str = "admin@devstack.local";
const POLICY_PREFIX: &str = "devstack-";

/// Engine family a service belongs to. Selects the launch adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    Postgres,
    Mysql,
    Mongodb,
    Redis,
    Rabbitmq,
    Forgejo,
    Generic,
}

impl ServiceKind {
    /// Guesses the kind from a service name, ignoring a numeric node suffix
    /// (`redis-2` is a redis).
    #[must_use]
    pub fn infer(name: &str) -> Self {
        let base = match name.rsplit_once('-') {
            Some((head, tail)) if !tail.is_empty() && tail.chars().all(|c| c.is_ascii_digit()) => {
                head
            }
            _ => name,
        };
        match base {
            "postgres" | "postgresql" => Self::Postgres,
            "mysql" | "mariadb" => Self::Mysql,
            "mongodb" | "mongo" => Self::Mongodb,
            "redis" => Self::Redis,
            "rabbitmq" => Self::Rabbitmq,
            "forgejo" | "gitea" => Self::Forgejo,
            _ => Self::Generic,
        }
    }
}

/// One managed service and its credential conventions.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ServiceSpec {
    pub name: String,
    #[serde(default)]
    pub ip: Option<IpAddr>,
    #[serde(default)]
    pub kind: Option<ServiceKind>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    /// Name of the service whose password this one reuses.
    #[serde(default)]
    pub password_group: Option<String>,
}

impl ServiceSpec {
    fn new(name: &str, last_octet: u8) -> Self {
        Self {
            name: name.to_string(),
            ip: Some(IpAddr::V4(Ipv4Addr::new(172, 20, 0, last_octet))),
            kind: None,
            user: None,
            database: None,
            email: None,
            password_group: None,
        }
    }

    fn with_user(mut self, user: &str) -> Self {
        self.user = Some(user.to_string());
        self
    }

    fn with_database(mut self, database: &str) -> Self {
        self.database = Some(database.to_string());
        self
    }

    fn with_email(mut self, email: &str) -> Self {
        self.email = Some(email.to_string());
        self
    }

    fn sharing_password_with(mut self, leader: &str) -> Self {
        self.password_group = Some(leader.to_string());
        self
    }

    #[must_use]
    pub fn kind(&self) -> ServiceKind {
        self.kind.unwrap_or_else(|| ServiceKind::infer(&self.name))
    }

    #[must_use]
    pub fn role_name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn policy_name(&self) -> String {
        format!("{POLICY_PREFIX}{}", self.name)
    }

    /// Read-only ACL policy for this service's credential record.
    #[must_use]
    pub fn policy_document(&self, kv_mount: &str) -> String {
        format!(
            "path \"{kv_mount}/data/{name}\" {{\n  capabilities = [\"read\"]\n}}\n",
            name = self.name
        )
    }

    /// DNS subject alternative names for the leaf certificate.
    #[must_use]
    pub fn dns_names(&self) -> Vec<String> {
        vec![self.name.clone(), "localhost".to_string()]
    }

    /// IP subject alternative names: the static address plus loopback.
    #[must_use]
    pub fn ip_sans(&self) -> Vec<IpAddr> {
        let loopback = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let mut ips: Vec<IpAddr> = self.ip.into_iter().collect();
        if !ips.contains(&loopback) {
            ips.push(loopback);
        }
        ips
    }
}

/// The bounded, known set of services to provision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceCatalog {
    services: Vec<ServiceSpec>,
}

impl ServiceCatalog {
    #[must_use]
    pub fn builtin() -> Self {
        Self {
            services: vec![
                ServiceSpec::new("postgres", 10)
                    .with_user(DEFAULT_USER)
                    .with_database(DEFAULT_DATABASE),
                ServiceSpec::new("mysql", 12)
                    .with_user(DEFAULT_USER)
                    .with_database(DEFAULT_DATABASE),
                ServiceSpec::new("mongodb", 15)
                    .with_user(DEFAULT_USER)
                    .with_database(DEFAULT_DATABASE),
                ServiceSpec::new("redis-1", 13),
                ServiceSpec::new("redis-2", 16).sharing_password_with("redis-1"),
                ServiceSpec::new("redis-3", 17).sharing_password_with("redis-1"),
                ServiceSpec::new("rabbitmq", 14)
                    .with_user(DEFAULT_USER)
                    .with_database(DEFAULT_VHOST),
                ServiceSpec::new("forgejo", 20)
                    .with_user(FORGEJO_ADMIN)
                    .with_email(FORGEJO_EMAIL),
            ],
        }
    }

    /// Builds a catalog from configured entries.
    ///
    /// # Errors
    /// Returns an error on an empty list, duplicate or malformed names, or a
    /// password group that does not point at a leader earlier in the list.
    pub fn from_specs(services: Vec<ServiceSpec>) -> Result<Self> {
        if services.is_empty() {
            anyhow::bail!("services must not be empty");
        }
        let mut seen = BTreeSet::new();
        for spec in &services {
            validate_service_name(&spec.name)?;
            if !seen.insert(spec.name.as_str()) {
                anyhow::bail!("services contains duplicate name: {}", spec.name);
            }
            if let Some(leader) = &spec.password_group {
                let leader_spec = services
                    .iter()
                    .take_while(|candidate| candidate.name != spec.name)
                    .find(|candidate| &candidate.name == leader)
                    .ok_or_else(|| {
                        anyhow::anyhow!(
                            "services.{}.password_group must name an earlier service, got {leader}",
                            spec.name
                        )
                    })?;
                if leader_spec.password_group.is_some() {
                    anyhow::bail!(
                        "services.{}.password_group points at {leader}, which is itself a follower",
                        spec.name
                    );
                }
            }
        }
        Ok(Self { services })
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServiceSpec> {
        self.services.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.services.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// # Errors
    /// Returns an error if `name` is not part of the catalog.
    pub fn get(&self, name: &str) -> Result<&ServiceSpec> {
        self.services
            .iter()
            .find(|spec| spec.name == name)
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "Unknown service {name}; known services: {}",
                    self.services
                        .iter()
                        .map(|spec| spec.name.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                )
            })
    }
}

/// Service names end up in KV paths, role names and directory names.
///
/// # Errors
/// Returns an error if the name is empty or not lowercase DNS-label safe.
pub fn validate_service_name(name: &str) -> Result<()> {
    if name.is_empty() {
        anyhow::bail!("service name must not be empty");
    }
    if name.starts_with('-') || name.ends_with('-') {
        anyhow::bail!("service name must not start or end with '-': {name}");
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        anyhow::bail!("service name must be lowercase letters, digits or '-': {name}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infer_kind_strips_node_suffix() {
        assert_eq!(ServiceKind::infer("redis-2"), ServiceKind::Redis);
        assert_eq!(ServiceKind::infer("postgres"), ServiceKind::Postgres);
        assert_eq!(ServiceKind::infer("api-v2"), ServiceKind::Generic);
    }

    #[test]
    fn test_builtin_catalog_validates() {
        let builtin = ServiceCatalog::builtin();
        let rebuilt = ServiceCatalog::from_specs(builtin.iter().cloned().collect()).unwrap();
        assert_eq!(rebuilt, builtin);
        assert_eq!(builtin.len(), 8);
    }

    #[test]
    fn test_redis_followers_share_leader() {
        let catalog = ServiceCatalog::builtin();
        assert_eq!(
            catalog.get("redis-3").unwrap().password_group.as_deref(),
            Some("redis-1")
        );
        assert!(catalog.get("redis-1").unwrap().password_group.is_none());
    }

    #[test]
    fn test_ip_sans_include_loopback_once() {
        let catalog = ServiceCatalog::builtin();
        let ips = catalog.get("postgres").unwrap().ip_sans();
        assert_eq!(
            ips,
            vec![
                "172.20.0.10".parse::<IpAddr>().unwrap(),
                "127.0.0.1".parse::<IpAddr>().unwrap()
            ]
        );
    }

    #[test]
    fn test_policy_document_is_read_only() {
        let catalog = ServiceCatalog::builtin();
        let spec = catalog.get("mysql").unwrap();
        assert_eq!(spec.policy_name(), "devstack-mysql");
        let doc = spec.policy_document("secret");
        assert!(doc.contains("path \"secret/data/mysql\""));
        assert!(doc.contains("[\"read\"]"));
    }

    #[test]
    fn test_from_specs_rejects_forward_group() {
        let specs = vec![
            ServiceSpec::new("redis-2", 16).sharing_password_with("redis-1"),
            ServiceSpec::new("redis-1", 13),
        ];
        let err = ServiceCatalog::from_specs(specs).unwrap_err();
        assert!(err.to_string().contains("password_group"));
    }

    #[test]
    fn test_from_specs_rejects_duplicates_and_bad_names() {
        let dup = vec![ServiceSpec::new("redis-1", 13), ServiceSpec::new("redis-1", 14)];
        assert!(ServiceCatalog::from_specs(dup).is_err());
        assert!(validate_service_name("Bad_Name").is_err());
        assert!(validate_service_name("../etc").is_err());
    }

    #[test]
    fn test_get_unknown_lists_known() {
        let err = ServiceCatalog::builtin().get("nginx").unwrap_err();
        assert!(err.to_string().contains("postgres"));
    }
}
