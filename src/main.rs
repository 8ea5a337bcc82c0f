mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Commands, CrdAction, DeployAction, ObservabilityAction, PolicyAction, WebhookAction};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Check => commands::check::run().await?,
        Commands::List { resource, tenant } => commands::list::run(resource, tenant).await?,
        Commands::Analyze => commands::analyze::run().await?,

        Commands::Crd { action } => match action {
            CrdAction::Generate => commands::crd::generate()?,
            CrdAction::Install => commands::crd::install().await?,
        },

        Commands::Reconcile => commands::reconcile::run().await?,
        Commands::PolicyReconcile => commands::policy_reconcile::run().await?,

        Commands::Policy { action } => match action {
            PolicyAction::Export { namespace } => commands::policy::export(&namespace).await?,
            PolicyAction::Import { file, dry_run } => commands::policy::import(&file, dry_run).await?,
            PolicyAction::Diff { file } => commands::policy::diff(&file).await?,
        },

        Commands::Webhook { action } => match action {
            WebhookAction::Serve { addr, tls_cert, tls_key } => commands::webhook::serve(&addr, &tls_cert, &tls_key).await?,
            WebhookAction::CertGenerate { service_name, namespace, output_dir, ip_sans } => {
                commands::webhook::generate_certs(&service_name, &namespace, &output_dir, &ip_sans)?
            }
            WebhookAction::InstallConfig { service_name, namespace, ca_bundle_path } => {
                commands::webhook::install_config(&service_name, &namespace, &ca_bundle_path)?
            }
        },

        Commands::Api { addr, oidc_public_key_path } => commands::api::serve(&addr, &oidc_public_key_path).await?,

        Commands::Deploy { action } => match action {
            DeployAction::All => println!("{}", commands::deploy::generate_all()),
            DeployAction::Rbac => println!("{}", commands::deploy::generate_rbac()),
            DeployAction::Deployments => println!("{}", commands::deploy::generate_deployments()),
        },

        Commands::Observability { action } => match action {
            ObservabilityAction::GenerateAll => println!("{}", commands::observability::generate_all()),
            ObservabilityAction::GenerateServiceMonitors => println!("{}", commands::observability::generate_service_monitors()),
            ObservabilityAction::GenerateDashboard => println!("{}", commands::observability::generate_grafana_dashboard_configmap()),
        },
    }

    Ok(())
}
