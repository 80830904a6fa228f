use anyhow::{Context, Result};
use devstack_secrets::config::Settings;
use devstack_secrets::error::PipelineError;
use devstack_secrets::materials::BootstrapMaterials;
use devstack_secrets::seeder::read_credential;

use super::root_client;

pub(crate) async fn run_token(settings: &Settings) -> Result<()> {
    let materials = BootstrapMaterials::load(&settings.keys_dir).await?;
    println!("{}", materials.root_token.token().expose());
    Ok(())
}

pub(crate) async fn run_ca_cert(settings: &Settings) -> Result<()> {
    let path = settings.ca_chain_file();
    let chain = match tokio::fs::read_to_string(&path).await {
        Ok(chain) => chain,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(anyhow::Error::from(PipelineError::NotFound {
                what: "CA chain",
                location: path.display().to_string(),
            })
            .context("Run `devstack-secrets bootstrap` first"));
        }
        Err(err) => {
            return Err(err).with_context(|| format!("Failed to read {}", path.display()));
        }
    };
    print!("{chain}");
    Ok(())
}

pub(crate) async fn run_show_password(settings: &Settings, service: &str) -> Result<()> {
    settings.catalog()?.get(service)?;
    let (client, _materials) = root_client(settings).await?;
    let (_, record) = client
        .retrying(|| read_credential(&client, &settings.kv_mount, service))
        .await?;
    eprintln!("warning: the following output contains a plaintext password");
    println!("service:  {service}");
    if let Some(user) = &record.user {
        println!("user:     {user}");
    }
    if let Some(email) = &record.email {
        println!("email:    {email}");
    }
    if let Some(database) = &record.database {
        println!("database: {database}");
    }
    println!("password: {}", record.password);
    Ok(())
}
