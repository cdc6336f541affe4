//! Ledgerlink CLI
//!
//! Operator command-line interface for QuickBooks Online connections.
//!
//! # Usage
//!
//! ```bash
//! # Start connecting a company
//! ledgerlink authorize-url 9130357992221046
//!
//! # Finish the connection with the code and state from the redirect
//! ledgerlink exchange AB11... 9130357992221046 --state 3kq...
//!
//! # Get a fresh access token
//! ledgerlink token 9130357992221046
//!
//! # Search customers
//! ledgerlink search 9130357992221046 --name Acme
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ledgerlink_core::{
    ClientConfig, CustomerSearch, DefaultTokenManager, FileCredentialStore, RemoteResourceClient,
    Resource, ResourceKind, SignatureVerifier, TenantId, TokenManager, WebhookDispatcher,
    webhook::WebhookResponse,
};
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, fmt};

mod config;

type Manager = DefaultTokenManager<FileCredentialStore>;

/// Issued authorization states, kept next to the credentials file.
const PENDING_FILE: &str = "pending_authorizations.json";

#[derive(Parser)]
#[command(name = "ledgerlink")]
#[command(about = "Manage QuickBooks Online connections")]
#[command(version)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the authorization URL for a company
    AuthorizeUrl {
        /// Realm id the connection is intended for
        tenant: String,
    },

    /// Exchange an authorization code for tokens
    Exchange {
        /// Code from the redirect
        code: String,

        /// Realm id from the redirect
        realm: String,

        /// State from the redirect; must match one issued by authorize-url
        #[arg(long)]
        state: String,
    },

    /// Print a valid access token, refreshing if needed
    Token {
        realm: String,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Force a token refresh
    Refresh { realm: String },

    /// Revoke tokens with QuickBooks and locally
    Revoke { realm: String },

    /// Show the connection status of a company
    Status { realm: String },

    /// List stored credentials
    List,

    /// Run a webhook delivery through the dispatcher
    VerifyWebhook {
        /// File containing the raw request body
        #[arg(long)]
        body: PathBuf,

        /// Value of the intuit-signature header
        #[arg(long)]
        signature: Option<String>,
    },

    /// Search customers by any combination of criteria
    Search {
        realm: String,

        /// Display name (substring)
        #[arg(long)]
        name: Option<String>,

        /// Company name (substring)
        #[arg(long)]
        company: Option<String>,

        /// Primary email (exact)
        #[arg(long)]
        email: Option<String>,

        #[arg(long)]
        first_name: Option<String>,

        #[arg(long)]
        last_name: Option<String>,
    },

    /// Fetch an entity as JSON
    Get {
        realm: String,

        /// Entity kind (customer, invoice)
        kind: String,

        id: String,
    },

    /// Download an invoice PDF
    Pdf {
        realm: String,

        /// Invoice id
        id: String,

        /// Output file
        #[arg(short, long)]
        out: PathBuf,
    },

    /// Print the QuickBooks web link for an invoice
    ViewLink { realm: String, id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = config::load_config(cli.config.as_deref())?;
    init_logging(&config.log_level, cli.verbose);

    tracing::debug!("Loaded configuration from {:?}", config.config_path);

    let client = Arc::new(config.client);
    let store = match &config.credentials_path {
        Some(path) => FileCredentialStore::open(path),
        None => FileCredentialStore::open_default(),
    }
    .context("Failed to open credential store")?;
    let pending_path = store.path().with_file_name(PENDING_FILE);
    let manager = Arc::new(Manager::new(client.clone(), store)?);
    manager
        .pending_authorizations()
        .load_from(&pending_path)
        .with_context(|| format!("Failed to read pending authorizations from {:?}", pending_path))?;

    match cli.command {
        Commands::AuthorizeUrl { tenant } => authorize_url(&manager, &tenant, &pending_path),
        Commands::Exchange { code, realm, state } => {
            exchange(&manager, &code, &realm, &state, &pending_path).await
        }
        Commands::Token { realm, format } => token(&manager, &realm, &format).await,
        Commands::Refresh { realm } => refresh(&manager, &realm).await,
        Commands::Revoke { realm } => revoke(&manager, &realm).await,
        Commands::Status { realm } => status(&manager, &realm).await,
        Commands::List => list(&manager).await,
        Commands::VerifyWebhook { body, signature } => {
            verify_webhook(&client, manager, &body, signature.as_deref()).await
        }
        Commands::Search {
            realm,
            name,
            company,
            email,
            first_name,
            last_name,
        } => {
            let search = CustomerSearch {
                display_name: name,
                company_name: company,
                email,
                first_name,
                last_name,
            };
            search_customers(resource_client(&client, manager, &realm)?, &search).await
        }
        Commands::Get { realm, kind, id } => {
            let kind: ResourceKind = kind.parse()?;
            get(resource_client(&client, manager, &realm)?, kind, &id).await
        }
        Commands::Pdf { realm, id, out } => {
            pdf(resource_client(&client, manager, &realm)?, &id, &out).await
        }
        Commands::ViewLink { realm, id } => {
            println!("{}", resource_client(&client, manager, &realm)?.view_link(&id));
            Ok(())
        }
    }
}

fn init_logging(level: &str, verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
    };

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn resource_client(
    config: &Arc<ClientConfig>,
    manager: Arc<Manager>,
    realm: &str,
) -> Result<RemoteResourceClient> {
    Ok(RemoteResourceClient::new(
        config.clone(),
        manager,
        TenantId::new(realm),
    )?)
}

fn authorize_url(manager: &Manager, tenant: &str, pending_path: &Path) -> Result<()> {
    let request = manager.build_authorization_url(&TenantId::new(tenant))?;
    manager
        .pending_authorizations()
        .save_to(pending_path)
        .context("Failed to record the authorization state")?;

    println!("{}", request.url);
    println!();
    println!("state: {}", request.state);
    println!("After consent, run: ledgerlink exchange <code> <realmId> --state <state>");
    Ok(())
}

async fn exchange(
    manager: &Manager,
    code: &str,
    realm: &str,
    state: &str,
    pending_path: &Path,
) -> Result<()> {
    let result = manager
        .complete_authorization(code, &TenantId::new(realm), state)
        .await;
    // The state is spent either way.
    manager
        .pending_authorizations()
        .save_to(pending_path)
        .context("Failed to update pending authorizations")?;
    let credential = result.context("Authorization failed")?;

    println!("Connected realm {}", credential.tenant_id);
    if let Some(expires_at) = credential.expires_at {
        println!("  Access token expires: {}", expires_at.to_rfc3339());
    }
    Ok(())
}

async fn token(manager: &Manager, realm: &str, format: &str) -> Result<()> {
    let realm = TenantId::new(realm);
    let token = manager.valid_access_token(&realm).await?;

    match format {
        "json" => {
            let expires_at = manager
                .credential(&realm)
                .await?
                .and_then(|c| c.expires_at)
                .map(|t| t.to_rfc3339());
            let output = json!({
                "realm": realm.as_str(),
                "access_token": token.expose(),
                "expires_at": expires_at,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        _ => println!("{}", token.expose()),
    }
    Ok(())
}

async fn refresh(manager: &Manager, realm: &str) -> Result<()> {
    let credential = manager.refresh(&TenantId::new(realm)).await?;
    println!("Refreshed realm {}", credential.tenant_id);
    if let Some(expires_at) = credential.expires_at {
        println!("  Access token expires: {}", expires_at.to_rfc3339());
    }
    Ok(())
}

async fn revoke(manager: &Manager, realm: &str) -> Result<()> {
    if manager.revoke(&TenantId::new(realm)).await {
        println!("Revoked realm {}", realm);
        Ok(())
    } else {
        anyhow::bail!("Failed to update the local credential for realm {}", realm)
    }
}

async fn status(manager: &Manager, realm: &str) -> Result<()> {
    let status = manager.connection_status(&TenantId::new(realm)).await?;
    println!("{}: {}", realm, status);
    Ok(())
}

async fn list(manager: &Manager) -> Result<()> {
    use ledgerlink_core::CredentialStore;

    let credentials = manager.store().list().await?;
    if credentials.is_empty() {
        println!("No stored credentials");
        return Ok(());
    }

    let now = chrono::Utc::now();
    for credential in credentials {
        let expires = credential
            .expires_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<24} {:<10} {}",
            credential.tenant_id.as_str(),
            credential.effective_state(now).as_str(),
            expires
        );
    }
    Ok(())
}

async fn verify_webhook(
    config: &ClientConfig,
    manager: Arc<Manager>,
    body: &Path,
    signature: Option<&str>,
) -> Result<()> {
    let raw = std::fs::read(body).with_context(|| format!("Failed to read {:?}", body))?;

    let verifier = SignatureVerifier::new(config.webhook_secret.clone());
    if !verifier.is_configured() {
        tracing::warn!("No webhook secret configured; every delivery will be rejected");
    }

    let dispatcher = WebhookDispatcher::new(verifier, manager);
    let result = dispatcher.handle(&raw, signature).await;
    let response = WebhookResponse::from(&result);

    println!("HTTP {}", response.status);
    println!("{}", response.body);
    match result {
        Ok(report) => {
            println!(
                "processed {} change(s): {} disconnected, {} forwarded, {} failed",
                report.processed,
                report.disconnected.len(),
                report.forwarded,
                report.failures.len()
            );
            for failure in report.failures {
                println!(
                    "  {} {} in realm {}: {}",
                    failure.entity, failure.id, failure.realm, failure.reason
                );
            }
        }
        Err(e) => println!("{}", e),
    }
    Ok(())
}

async fn search_customers(client: RemoteResourceClient, search: &CustomerSearch) -> Result<()> {
    if search.is_empty() {
        anyhow::bail!("Provide at least one of --name, --company, --email, --first-name, --last-name");
    }

    let customers = client.search_customers(search).await?;
    let output: Vec<Value> = customers.iter().map(resource_json).collect();
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn get(client: RemoteResourceClient, kind: ResourceKind, id: &str) -> Result<()> {
    let resource = client.get(kind, id).await?;
    println!("{}", serde_json::to_string_pretty(&resource_json(&resource))?);
    Ok(())
}

async fn pdf(client: RemoteResourceClient, id: &str, out: &Path) -> Result<()> {
    let bytes = client.pdf(ResourceKind::Invoice, id).await?;
    std::fs::write(out, &bytes).with_context(|| format!("Failed to write {:?}", out))?;
    println!("Wrote {} bytes to {:?}", bytes.len(), out);
    Ok(())
}

fn resource_json(resource: &Resource) -> Value {
    let mut object = resource.fields.clone();
    object.insert("Id".to_string(), Value::String(resource.id.clone()));
    object.insert(
        "SyncToken".to_string(),
        Value::String(resource.sync_token.clone()),
    );
    Value::Object(object)
}
