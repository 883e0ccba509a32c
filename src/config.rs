use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use crate::auth::{ProviderEndpoints, DEFAULT_IDENTITY_ENDPOINT, DEFAULT_TOKEN_ENDPOINT};

/// Overlang API client
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub args: CliArgs,

    #[command(subcommand)]
    pub command: Command,
}

/// Connection and logging options
#[derive(Args, Debug, Clone)]
pub struct CliArgs {
    /// Backend API base URL
    #[arg(short = 'u', long, env = "API_BASE_URL")]
    pub api_base_url: Option<String>,

    /// Firebase web API key
    #[arg(short = 'k', long, env = "FIREBASE_API_KEY")]
    pub api_key: Option<String>,

    /// Identity toolkit endpoint
    #[arg(long, env = "IDENTITY_ENDPOINT", default_value = DEFAULT_IDENTITY_ENDPOINT)]
    pub identity_endpoint: String,

    /// Securetoken endpoint
    #[arg(long, env = "TOKEN_ENDPOINT", default_value = DEFAULT_TOKEN_ENDPOINT)]
    pub token_endpoint: String,

    /// Refresh id tokens this many seconds before they expire
    #[arg(long, env = "TOKEN_REFRESH_THRESHOLD", default_value = "300")]
    pub token_refresh_threshold: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

/// Email/password options shared by commands that sign in
#[derive(Args, Debug, Clone)]
pub struct SignInArgs {
    /// Account email
    #[arg(short, long, env = "OVERLANG_EMAIL")]
    pub email: String,

    /// Account password (prompted when omitted)
    #[arg(short, long, env = "OVERLANG_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Check backend health (no sign-in)
    Health,

    /// Sign in and show the current member
    Me {
        #[command(flatten)]
        sign_in: SignInArgs,
    },

    /// Create an account and register it with the backend
    Signup {
        #[command(flatten)]
        sign_in: SignInArgs,
    },

    /// Sign in and issue an arbitrary authenticated call
    Call {
        /// HTTP method
        method: String,

        /// Path relative to the base URL, e.g. /v1/auth/me
        path: String,

        /// JSON body
        #[arg(short, long)]
        body: Option<String>,

        #[command(flatten)]
        sign_in: SignInArgs,
    },
}

#[derive(Clone, Debug)]
pub struct Config {
    /// Backend API base URL
    pub api_base_url: String,

    /// Firebase web API key; only commands that sign in need it
    pub api_key: Option<String>,

    /// Identity provider hosts
    pub identity_endpoint: String,
    pub token_endpoint: String,
    pub token_refresh_threshold: u64,

    pub log_level: String,
}

impl Config {
    /// Load configuration with priority: CLI > ENV (.env included) > defaults
    pub fn load() -> Result<(Self, Command)> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let cli = Cli::parse();
        let config = Self::from_args(cli.args)?;
        config.validate()?;

        Ok((config, cli.command))
    }

    /// Build config from parsed arguments
    pub fn from_args(args: CliArgs) -> Result<Self> {
        let api_base_url = args
            .api_base_url
            .context("API_BASE_URL is required (use -u or set API_BASE_URL env var)")?;

        Ok(Config {
            api_base_url,
            api_key: args.api_key,
            identity_endpoint: args.identity_endpoint,
            token_endpoint: args.token_endpoint,
            token_refresh_threshold: args.token_refresh_threshold,
            log_level: args.log_level,
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        validate_url("API_BASE_URL", &self.api_base_url)?;
        validate_url("IDENTITY_ENDPOINT", &self.identity_endpoint)?;
        validate_url("TOKEN_ENDPOINT", &self.token_endpoint)?;

        if let Some(key) = &self.api_key {
            if key.trim().is_empty() {
                anyhow::bail!("FIREBASE_API_KEY cannot be empty");
            }
        }

        Ok(())
    }

    /// Identity provider endpoints, for commands that sign in
    pub fn endpoints(&self) -> Result<ProviderEndpoints> {
        let api_key = self
            .api_key
            .clone()
            .context("FIREBASE_API_KEY is required (use -k or set FIREBASE_API_KEY env var)")?;

        Ok(ProviderEndpoints {
            api_key,
            identity_endpoint: self.identity_endpoint.clone(),
            token_endpoint: self.token_endpoint.clone(),
        })
    }
}

/// Require an absolute http(s) URL
fn validate_url(name: &str, value: &str) -> Result<()> {
    let url = reqwest::Url::parse(value)
        .with_context(|| format!("{} is not a valid URL: {}", name, value))?;

    match url.scheme() {
        "http" | "https" => Ok(()),
        other => anyhow::bail!("{} must use http or https, got {}", name, other),
    }
}
