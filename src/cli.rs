use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "session-operator")]
#[command(about = "Multi-tenant session lifecycle engine and policy enforcement plane")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check cluster connectivity and permissions
    Check,

    /// List Kubernetes resources (sessions, tenants)
    List {
        /// Resource type to list (sessions, tenants)
        resource: String,
        /// Restrict to a single tenant namespace
        #[arg(long)]
        tenant: Option<String>,
    },

    /// Run fleet-wide governance analysis across every tenant
    Analyze,

    /// Manage the Session and NamespacePolicy CRDs
    Crd {
        #[command(subcommand)]
        action: CrdAction,
    },

    /// Start the Session Reconciler loop
    Reconcile,

    /// Start the Policy Reconciler loop
    PolicyReconcile,

    /// Manage tenant NamespacePolicy documents
    Policy {
        #[command(subcommand)]
        action: PolicyAction,
    },

    /// Manage the ingress plane: admission validators, webhook ingestion, runner callbacks
    Webhook {
        #[command(subcommand)]
        action: WebhookAction,
    },

    /// Start the read API server for the UI
    Api {
        #[arg(long, default_value = "0.0.0.0:8080")]
        addr: String,
        #[arg(long, default_value = "oidc-public-key.pem")]
        oidc_public_key_path: String,
    },

    /// Generate Kubernetes deployment manifests
    Deploy {
        #[command(subcommand)]
        action: DeployAction,
    },

    /// Generate observability manifests (Services, ServiceMonitors, Grafana dashboard)
    Observability {
        #[command(subcommand)]
        action: ObservabilityAction,
    },
}

#[derive(Subcommand)]
pub enum CrdAction {
    /// Print the CRD YAML to stdout
    Generate,
    /// Install the CRDs into the connected cluster
    Install,
}

#[derive(Subcommand)]
pub enum PolicyAction {
    /// Export a tenant's NamespacePolicy as YAML
    Export {
        #[arg(long)]
        namespace: String,
    },
    /// Apply a NamespacePolicy document from a file
    Import {
        file: String,
        #[arg(long)]
        dry_run: bool,
    },
    /// Show the diff a file would apply against the live NamespacePolicy
    Diff { file: String },
}

#[derive(Subcommand)]
pub enum WebhookAction {
    /// Start the TLS-fronted admission/ingestion/callback server
    Serve {
        #[arg(long, default_value = "0.0.0.0:8443")]
        addr: String,
        #[arg(long, default_value = "tls.crt")]
        tls_cert: String,
        #[arg(long, default_value = "tls.key")]
        tls_key: String,
    },
    /// Generate self-signed TLS certificates for development
    CertGenerate {
        #[arg(long, default_value = "session-operator-webhook")]
        service_name: String,
        #[arg(long, default_value = "default")]
        namespace: String,
        #[arg(long, default_value = ".")]
        output_dir: String,
        /// Additional IP SANs (e.g. --ip-san 192.168.1.26)
        #[arg(long = "ip-san")]
        ip_sans: Vec<String>,
    },
    /// Print the ValidatingWebhookConfiguration YAML
    InstallConfig {
        #[arg(long, default_value = "session-operator-webhook")]
        service_name: String,
        #[arg(long, default_value = "default")]
        namespace: String,
        #[arg(long)]
        ca_bundle_path: String,
    },
}

#[derive(Subcommand)]
pub enum DeployAction {
    /// Print every deployment manifest (namespace, RBAC, Deployments, PDBs)
    All,
    /// Print just the RBAC manifests (ServiceAccount, ClusterRole, binding)
    Rbac,
    /// Print just the Deployment manifests for every component
    Deployments,
}

#[derive(Subcommand)]
#[allow(clippy::enum_variant_names)]
pub enum ObservabilityAction {
    /// Print every observability manifest (Services + ServiceMonitors + Grafana dashboard)
    GenerateAll,
    /// Print only ServiceMonitor manifests
    GenerateServiceMonitors,
    /// Print only the Grafana dashboard ConfigMap
    GenerateDashboard,
}
