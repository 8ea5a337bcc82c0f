use anyhow::Context;
use kube::api::ListParams;
use kube::{Api, Client};

use session_operator::crd::{NamespacePolicy, Session};

pub async fn run(resource: String, tenant: Option<String>) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .context("Failed to connect to Kubernetes cluster. Is your kubeconfig valid?")?;

    match resource.as_str() {
        "sessions" => list_sessions(client, tenant).await,
        "tenants" => list_tenants(client).await,
        other => anyhow::bail!("Unsupported resource '{}'. Supported: sessions, tenants", other),
    }
}

async fn list_sessions(client: Client, tenant: Option<String>) -> anyhow::Result<()> {
    let api: Api<Session> = match &tenant {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };

    let sessions = api
        .list(&ListParams::default())
        .await
        .context("Failed to list sessions. Check RBAC permissions.")?;

    let mut rows: Vec<(String, String, String, String)> = sessions
        .into_iter()
        .map(|s| {
            let namespace = s.metadata.namespace.unwrap_or_default();
            let name = s.metadata.name.unwrap_or_default();
            let phase = s
                .status
                .as_ref()
                .map(|st| format!("{:?}", st.phase))
                .unwrap_or_else(|| "Unknown".into());
            let framework = format!("{}:{}", s.spec.framework.kind, s.spec.framework.version);
            (namespace, name, phase, framework)
        })
        .collect();

    rows.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

    println!(
        "{:<20} {:<40} {:<12} {:<25}",
        "TENANT", "NAME", "PHASE", "FRAMEWORK"
    );
    println!("{}", "-".repeat(100));

    for (namespace, name, phase, framework) in &rows {
        println!("{:<20} {:<40} {:<12} {:<25}", namespace, name, phase, framework);
    }

    println!("\nTotal: {} sessions", rows.len());
    Ok(())
}

async fn list_tenants(client: Client) -> anyhow::Result<()> {
    let api: Api<NamespacePolicy> = Api::all(client);
    let policies = api
        .list(&ListParams::default())
        .await
        .context("Failed to list NamespacePolicy. Check RBAC permissions.")?;

    let mut rows: Vec<(String, i64, i64, f64)> = policies
        .into_iter()
        .filter_map(|p| {
            let tenant = p.metadata.namespace?;
            let status = p.status.unwrap_or_default();
            Some((tenant, status.usage.sessions.active, status.usage.sessions.total, status.usage.budget.percent_used))
        })
        .collect();

    rows.sort_by(|a, b| a.0.cmp(&b.0));

    println!("{:<30} {:<10} {:<10} {:<15}", "TENANT", "ACTIVE", "TOTAL", "BUDGET USED");
    println!("{}", "-".repeat(65));

    for (tenant, active, total, percent) in &rows {
        println!("{:<30} {:<10} {:<10} {:<15}", tenant, active, total, format!("{:.1}%", percent));
    }

    println!("\nTotal: {} tenants", rows.len());
    Ok(())
}
