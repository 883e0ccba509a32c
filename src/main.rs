use anyhow::{Context, Result};
use dialoguer::Password;
use std::sync::Arc;

use overlang_client::auth::FirebaseIdentity;
use overlang_client::backend::BackendApi;
use overlang_client::config::{Command, Config, SignInArgs};
use overlang_client::http_client::{ApiClient, ApiRequest, ApiResponse};
use overlang_client::session::SessionBridge;

#[tokio::main]
async fn main() -> Result<()> {
    let (config, command) = Config::load()?;

    // Initialize logging with a configured level
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .init();

    tracing::debug!(base_url = %config.api_base_url, "Overlang client starting");

    let http = reqwest::Client::builder()
        .build()
        .context("Failed to create HTTP client")?;

    let client = Arc::new(ApiClient::with_client(http.clone(), config.api_base_url.clone()));
    let backend = BackendApi::new(client);

    // Health needs no identity provider, so no API key either
    if let Command::Health = command {
        return health(&backend).await;
    }

    let identity = Arc::new(FirebaseIdentity::new(
        http,
        config.endpoints()?,
        config.token_refresh_threshold,
    ));

    let bridge = SessionBridge::start(identity, backend.clone());
    let initial = bridge.wait_resolved().await;
    tracing::debug!(signed_in = initial.user().is_some(), "Session resolved");

    let result = run(&bridge, &backend, command).await;

    if bridge.state().user().is_some() {
        if let Err(e) = bridge.sign_out().await {
            tracing::warn!("Sign-out failed: {}", e);
        }
    }
    bridge.shutdown();

    result
}

async fn health(backend: &BackendApi) -> Result<()> {
    let health = backend.health().await?;
    println!("server={} db={}", health.server, health.db);
    Ok(())
}

async fn run(bridge: &SessionBridge, backend: &BackendApi, command: Command) -> Result<()> {
    match command {
        Command::Health => health(backend).await?,

        Command::Me { sign_in } => {
            sign_in_with(bridge, &sign_in).await?;
            let profile = backend.me().await?;
            println!(
                "member_id={} uid={} email={} new_member={}",
                profile.member_id,
                profile.firebase_uid,
                profile.email.unwrap_or_default(),
                profile.is_new_member
            );
        }

        Command::Signup { sign_in } => {
            let password = password_for(&sign_in)?;
            let principal = bridge
                .sign_up_with_credentials(&sign_in.email, &password)
                .await?;
            println!("Created account {}", principal.uid);
        }

        Command::Call {
            method,
            path,
            body,
            sign_in,
        } => {
            sign_in_with(bridge, &sign_in).await?;

            let method = reqwest::Method::from_bytes(method.to_uppercase().as_bytes())
                .with_context(|| format!("Invalid HTTP method: {}", method))?;
            let mut request = ApiRequest::new(method, path);
            if let Some(body) = body {
                let value: serde_json::Value =
                    serde_json::from_str(&body).context("--body must be valid JSON")?;
                request = request.json(value);
            }

            let response = backend.client().call(request).await?;
            print_response(&response);
        }
    }

    Ok(())
}

async fn sign_in_with(bridge: &SessionBridge, args: &SignInArgs) -> Result<()> {
    let password = password_for(args)?;
    let principal = bridge
        .sign_in_with_credentials(&args.email, &password)
        .await?;
    tracing::info!(uid = %principal.uid, "Signed in");
    Ok(())
}

/// Password from args, prompting when it was not supplied
fn password_for(args: &SignInArgs) -> Result<String> {
    match &args.password {
        Some(password) => Ok(password.clone()),
        None => Password::new()
            .with_prompt(format!("Password for {}", args.email))
            .interact()
            .context("Failed to read password"),
    }
}

fn print_response(response: &ApiResponse) {
    println!("HTTP {}", response.status);
    match response.json::<serde_json::Value>() {
        Ok(value) => println!(
            "{}",
            serde_json::to_string_pretty(&value).unwrap_or_else(|_| response.text())
        ),
        Err(_) => println!("{}", response.text()),
    }
}
