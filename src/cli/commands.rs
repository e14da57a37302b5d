//! CLI command definitions

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "busgate")]
#[command(about = "Credential tooling for the busgate auth core", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Hash a password or token with bcrypt
    ///
    /// Examples:
    ///   busgate passwd 'hunter2'
    ///   busgate passwd --cost 12 'hunter2'
    Passwd {
        /// Secret to hash
        secret: String,

        /// bcrypt cost factor (4-31)
        #[arg(long, default_value_t = 11, value_parser = parse_cost)]
        cost: u32,
    },

    /// Generate a new public-key identity and its seed
    Keygen {
        /// Generate a NATS user nkey instead of a pk- identity
        #[arg(long)]
        nkey: bool,
    },

    /// Sign a greeting nonce with an identity seed
    Sign {
        /// Identity seed (sk-... or SU...)
        #[arg(long, env = "BUSGATE_SEED")]
        seed: String,

        /// Nonce from the server greeting
        nonce: String,
    },

    /// Load and validate an auth configuration file
    Check {
        /// Path to the JSON config
        #[arg(long, env = "BUSGATE_CONFIG")]
        config: PathBuf,
    },
}

fn parse_cost(s: &str) -> Result<u32, String> {
    let cost: u32 = s.parse().map_err(|_| format!("Invalid cost: {}", s))?;
    if (4..=31).contains(&cost) {
        Ok(cost)
    } else {
        Err(format!("Invalid cost: {}. Must be between 4 and 31", cost))
    }
}
