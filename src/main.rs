//! Busgate CLI entry point

mod cli;

use crate::cli::{Cli, Commands};
use anyhow::{Context, Result};
use busgate::auth::{hash_secret, sign_nonce_with_seed, Authorizer, IdentityKeyPair, Nonce};
use busgate::config::AuthOptions;
use clap::Parser;
use std::path::Path;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Passwd { secret, cost } => passwd(&secret, cost),
        Commands::Keygen { nkey } => keygen(nkey),
        Commands::Sign { seed, nonce } => sign(&seed, &nonce),
        Commands::Check { config } => check(&config),
    }
}

fn passwd(secret: &str, cost: u32) -> Result<()> {
    if secret.is_empty() {
        anyhow::bail!("Refusing to hash an empty secret");
    }
    let hash = hash_secret(secret, cost).context("Failed to hash secret")?;
    println!("{}", hash);
    Ok(())
}

fn keygen(nkey: bool) -> Result<()> {
    let (public_key, seed) = if nkey {
        let kp = nkeys::KeyPair::new_user();
        let seed = kp
            .seed()
            .map_err(|e| anyhow::anyhow!("Failed to encode seed: {}", e))?;
        (kp.public_key(), seed)
    } else {
        let kp = IdentityKeyPair::generate();
        (kp.public_identity().encode(), kp.seed())
    };

    println!("Public key: {}", public_key);
    println!("Seed:       {}", seed);
    println!();
    println!("Keep the seed private. Add the public key to \"nkeys\" in the server config.");
    Ok(())
}

fn sign(seed: &str, nonce: &str) -> Result<()> {
    let nonce = Nonce::decode(nonce).context("Invalid nonce")?;
    let signature = sign_nonce_with_seed(seed, &nonce).context("Invalid seed")?;

    println!("{}", signature);
    Ok(())
}

fn check(path: &Path) -> Result<()> {
    let opts = AuthOptions::from_json_file(path)
        .with_context(|| format!("Failed to load config: {}", path.display()))?;
    let plaintext = opts.has_plaintext_passwords();
    let cluster = opts.cluster.username.is_some();

    let authorizer = Authorizer::new(opts).context("Invalid configuration")?;
    let store = authorizer.store();
    let options = authorizer.options();

    info!(path = %path.display(), "Configuration is valid");

    println!("Busgate Config");
    println!("==============");
    println!("Auth required: {}", authorizer.auth_required());
    println!("Users:         {}", store.user_count());
    println!("Public keys:   {}", store.public_key_count());
    println!("Shared token:  {}", options.token.is_some());
    println!("Shared user:   {}", options.username.as_deref().unwrap_or("(none)"));
    println!("Cluster auth:  {}", cluster);
    if plaintext {
        println!();
        println!("Warning: plaintext passwords found, hash them with `busgate passwd`");
    }

    Ok(())
}
