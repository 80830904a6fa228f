//! Per-engine translation of a credential record into environment,
//! arguments and generated config files.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::credentials::CredentialRecord;
use crate::services::ServiceKind;

pub const TLS_FLAG_ENV: &str = "DEVSTACK_TLS_ENABLED";

const REDIS_PORT: u16 = 6379;
const REDIS_TLS_PORT: u16 = 6380;
const RABBITMQ_PORT: u16 = 5672;
const RABBITMQ_TLS_PORT: u16 = 5671;

/// Certificate files the wrapped service should read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsMaterial {
    pub cert: PathBuf,
    pub key: PathBuf,
    pub ca: PathBuf,
}

/// Contents of a file the wrapper writes before handoff.
#[derive(Clone, PartialEq, Eq)]
pub enum FileContents {
    Text(String),
    /// Concatenation of existing files, in order.
    Concat(Vec<PathBuf>),
}

#[derive(Clone, PartialEq, Eq)]
pub struct GeneratedFile {
    pub path: PathBuf,
    pub contents: FileContents,
}

impl GeneratedFile {
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        match &self.contents {
            FileContents::Text(text) => Some(text),
            FileContents::Concat(_) => None,
        }
    }
}

impl fmt::Debug for GeneratedFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = f.debug_struct("GeneratedFile");
        out.field("path", &self.path);
        match &self.contents {
            FileContents::Text(text) => out.field("bytes", &text.len()),
            FileContents::Concat(parts) => out.field("concat", parts),
        };
        out.finish()
    }
}

/// Everything needed to start the wrapped entrypoint.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct LaunchPlan {
    pub env: Vec<(String, String)>,
    pub args: Vec<String>,
    pub files: Vec<GeneratedFile>,
}

impl fmt::Debug for LaunchPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LaunchPlan")
            .field(
                "env",
                &self.env.iter().map(|(name, _)| name.as_str()).collect::<Vec<_>>(),
            )
            .field("args", &self.args.len())
            .field("files", &self.files)
            .finish()
    }
}

impl LaunchPlan {
    fn set(&mut self, name: &str, value: impl Into<String>) {
        self.env.push((name.to_string(), value.into()));
    }

    fn set_opt(&mut self, name: &str, value: Option<&String>) {
        if let Some(value) = value {
            self.set(name, value.clone());
        }
    }

    fn arg(&mut self, value: impl Into<String>) {
        self.args.push(value.into());
    }

    fn file(&mut self, path: PathBuf, contents: String) {
        self.files.push(GeneratedFile {
            path,
            contents: FileContents::Text(contents),
        });
    }

    #[must_use]
    pub fn env_value(&self, name: &str) -> Option<&str> {
        self.env
            .iter()
            .rev()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

/// Inputs shared by every adapter.
#[derive(Debug, Clone, Copy)]
pub struct AdapterContext<'a> {
    pub record: &'a CredentialRecord,
    pub tls: Option<&'a TlsMaterial>,
    pub require_tls: bool,
    pub runtime_dir: &'a Path,
}

/// Builds the launch plan for a service kind.
#[must_use]
pub fn plan_for(kind: ServiceKind, ctx: &AdapterContext<'_>) -> LaunchPlan {
    let mut plan = LaunchPlan::default();
    plan.set(TLS_FLAG_ENV, ctx.tls.is_some().to_string());
    match kind {
        ServiceKind::Postgres => postgres(&mut plan, ctx),
        ServiceKind::Mysql => mysql(&mut plan, ctx),
        ServiceKind::Mongodb => mongodb(&mut plan, ctx),
        ServiceKind::Redis => redis(&mut plan, ctx),
        ServiceKind::Rabbitmq => rabbitmq(&mut plan, ctx),
        ServiceKind::Forgejo => forgejo(&mut plan, ctx),
        ServiceKind::Generic => generic(&mut plan, ctx),
    }
    plan
}

fn postgres(plan: &mut LaunchPlan, ctx: &AdapterContext<'_>) {
    let record = ctx.record;
    plan.set_opt("POSTGRES_USER", record.user.as_ref());
    plan.set("POSTGRES_PASSWORD", record.password.clone());
    plan.set_opt("POSTGRES_DB", record.database.as_ref());
    let Some(tls) = ctx.tls else {
        return;
    };
    plan.arg("-c");
    plan.arg("ssl=on");
    plan.arg("-c");
    plan.arg(format!("ssl_cert_file={}", tls.cert.display()));
    plan.arg("-c");
    plan.arg(format!("ssl_key_file={}", tls.key.display()));
    plan.arg("-c");
    plan.arg(format!("ssl_ca_file={}", tls.ca.display()));
    if ctx.require_tls {
        let hba = ctx.runtime_dir.join("pg_hba.conf");
        plan.file(
            hba.clone(),
            "local all all scram-sha-256\nhostssl all all all scram-sha-256\n".to_string(),
        );
        plan.arg("-c");
        plan.arg(format!("hba_file={}", hba.display()));
    }
}

fn mysql(plan: &mut LaunchPlan, ctx: &AdapterContext<'_>) {
    let record = ctx.record;
    plan.set_opt("MYSQL_USER", record.user.as_ref());
    plan.set("MYSQL_PASSWORD", record.password.clone());
    plan.set("MYSQL_ROOT_PASSWORD", record.password.clone());
    plan.set_opt("MYSQL_DATABASE", record.database.as_ref());
    let Some(tls) = ctx.tls else {
        return;
    };
    plan.arg(format!("--ssl-cert={}", tls.cert.display()));
    plan.arg(format!("--ssl-key={}", tls.key.display()));
    plan.arg(format!("--ssl-ca={}", tls.ca.display()));
    if ctx.require_tls {
        plan.arg("--require-secure-transport=ON");
    }
}

fn mongodb(plan: &mut LaunchPlan, ctx: &AdapterContext<'_>) {
    let record = ctx.record;
    plan.set_opt("MONGO_INITDB_ROOT_USERNAME", record.user.as_ref());
    plan.set("MONGO_INITDB_ROOT_PASSWORD", record.password.clone());
    plan.set_opt("MONGO_INITDB_DATABASE", record.database.as_ref());
    let Some(tls) = ctx.tls else {
        return;
    };
    // mongod wants certificate and key in one PEM
    let combined = ctx.runtime_dir.join("mongodb.pem");
    plan.files.push(GeneratedFile {
        path: combined.clone(),
        contents: FileContents::Concat(vec![tls.cert.clone(), tls.key.clone()]),
    });
    plan.arg("--tlsMode");
    plan.arg(if ctx.require_tls {
        "requireTLS"
    } else {
        "preferTLS"
    });
    plan.arg("--tlsCertificateKeyFile");
    plan.arg(combined.display().to_string());
    plan.arg("--tlsCAFile");
    plan.arg(tls.ca.display().to_string());
    plan.arg("--tlsAllowConnectionsWithoutCertificates");
}

fn redis(plan: &mut LaunchPlan, ctx: &AdapterContext<'_>) {
    let password = &ctx.record.password;
    let mut conf = format!("requirepass {password}\nmasterauth {password}\n");
    match ctx.tls {
        Some(tls) => {
            let plain_port = if ctx.require_tls { 0 } else { REDIS_PORT };
            conf.push_str(&format!(
                "port {plain_port}\ntls-port {REDIS_TLS_PORT}\ntls-cert-file {}\ntls-key-file {}\ntls-ca-cert-file {}\ntls-auth-clients no\ntls-replication yes\ntls-cluster yes\n",
                tls.cert.display(),
                tls.key.display(),
                tls.ca.display(),
            ));
        }
        None => conf.push_str(&format!("port {REDIS_PORT}\n")),
    }
    let path = ctx.runtime_dir.join("redis.conf");
    plan.file(path.clone(), conf);
    plan.set("REDIS_PASSWORD", password.clone());
    plan.arg(path.display().to_string());
}

fn rabbitmq(plan: &mut LaunchPlan, ctx: &AdapterContext<'_>) {
    let record = ctx.record;
    let mut conf = String::new();
    if let Some(user) = &record.user {
        conf.push_str(&format!("default_user = {user}\n"));
    }
    conf.push_str(&format!("default_pass = {}\n", record.password));
    if let Some(vhost) = &record.database {
        conf.push_str(&format!("default_vhost = {vhost}\n"));
    }
    match ctx.tls {
        Some(tls) if ctx.require_tls => {
            conf.push_str("listeners.tcp = none\n");
            push_rabbitmq_tls(&mut conf, tls);
        }
        Some(tls) => {
            conf.push_str(&format!("listeners.tcp.default = {RABBITMQ_PORT}\n"));
            push_rabbitmq_tls(&mut conf, tls);
        }
        None => conf.push_str(&format!("listeners.tcp.default = {RABBITMQ_PORT}\n")),
    }
    let path = ctx.runtime_dir.join("rabbitmq.conf");
    plan.file(path.clone(), conf);
    plan.set("RABBITMQ_CONFIG_FILE", path.display().to_string());
}

fn push_rabbitmq_tls(conf: &mut String, tls: &TlsMaterial) {
    conf.push_str(&format!(
        "listeners.ssl.default = {RABBITMQ_TLS_PORT}\nssl_options.cacertfile = {}\nssl_options.certfile = {}\nssl_options.keyfile = {}\nssl_options.verify = verify_none\nssl_options.fail_if_no_peer_cert = false\n",
        tls.ca.display(),
        tls.cert.display(),
        tls.key.display(),
    ));
}

fn forgejo(plan: &mut LaunchPlan, ctx: &AdapterContext<'_>) {
    let record = ctx.record;
    plan.set_opt("FORGEJO_ADMIN_USER", record.user.as_ref());
    plan.set("FORGEJO_ADMIN_PASSWORD", record.password.clone());
    plan.set_opt("FORGEJO_ADMIN_EMAIL", record.email.as_ref());
    if let Some(tls) = ctx.tls {
        plan.set("FORGEJO__server__PROTOCOL", "https");
        plan.set("FORGEJO__server__CERT_FILE", tls.cert.display().to_string());
        plan.set("FORGEJO__server__KEY_FILE", tls.key.display().to_string());
    }
}

fn generic(plan: &mut LaunchPlan, ctx: &AdapterContext<'_>) {
    let record = ctx.record;
    plan.set_opt("DEVSTACK_USER", record.user.as_ref());
    plan.set("DEVSTACK_PASSWORD", record.password.clone());
    plan.set_opt("DEVSTACK_DATABASE", record.database.as_ref());
    plan.set_opt("DEVSTACK_EMAIL", record.email.as_ref());
    if let Some(tls) = ctx.tls {
        plan.set("DEVSTACK_TLS_CERT_FILE", tls.cert.display().to_string());
        plan.set("DEVSTACK_TLS_KEY_FILE", tls.key.display().to_string());
        plan.set("DEVSTACK_TLS_CA_FILE", tls.ca.display().to_string());
    }
}
