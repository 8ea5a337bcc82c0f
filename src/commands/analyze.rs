use anyhow::Context;
use kube::api::ListParams;
use kube::{Api, Client};

use session_operator::crd::{NamespacePolicy, Session, SessionPhase};
use session_operator::governance;

#[derive(Default)]
struct FleetReport {
    tenants: u32,
    tenants_with_shape_errors: u32,
    tenants_over_budget_warning: u32,
    sessions_total: u32,
    sessions_failed: u32,
    sessions_timed_out: u32,
}

pub async fn run() -> anyhow::Result<()> {
    println!("Running fleet governance analysis...\n");

    let client = Client::try_default()
        .await
        .context("Failed to connect to Kubernetes cluster. Is your kubeconfig valid?")?;

    let policies_api: Api<NamespacePolicy> = Api::all(client.clone());
    let policies = policies_api
        .list(&ListParams::default())
        .await
        .context("Failed to list NamespacePolicy. Check RBAC permissions.")?;

    let sessions_api: Api<Session> = Api::all(client);
    let sessions = sessions_api
        .list(&ListParams::default())
        .await
        .context("Failed to list sessions. Check RBAC permissions.")?;

    let mut report = FleetReport::default();

    for policy in &policies.items {
        report.tenants += 1;
        if !governance::validate_policy_shape(&policy.spec).is_empty() {
            report.tenants_with_shape_errors += 1;
        }
        let percent_used = policy.status.as_ref().map(|s| s.usage.budget.percent_used).unwrap_or(0.0);
        if percent_used >= 80.0 {
            report.tenants_over_budget_warning += 1;
        }
    }

    for session in &sessions.items {
        report.sessions_total += 1;
        match session.status.as_ref().map(|s| &s.phase) {
            Some(SessionPhase::Failed) => report.sessions_failed += 1,
            Some(SessionPhase::TimedOut) => report.sessions_timed_out += 1,
            _ => {}
        }
    }

    print_summary(&report);
    Ok(())
}

fn print_summary(report: &FleetReport) {
    let score = calculate_health_score(report);

    println!("===== Fleet Governance Summary =====");
    println!("Tenants analyzed            : {}", report.tenants);
    println!("Tenants with shape errors   : {}", report.tenants_with_shape_errors);
    println!("Tenants near budget cap     : {}", report.tenants_over_budget_warning);
    println!("Sessions analyzed           : {}", report.sessions_total);
    println!("Failed sessions             : {}", report.sessions_failed);
    println!("Timed-out sessions          : {}", report.sessions_timed_out);
    println!("-------------------------------------");
    println!("Fleet Health Score          : {}/100", score);
    println!("=====================================\n");
}

fn calculate_health_score(report: &FleetReport) -> u32 {
    let mut score: i32 = 100;

    if report.tenants > 0 {
        let shape_error_ratio = report.tenants_with_shape_errors as f64 / report.tenants as f64;
        score -= (shape_error_ratio * 30.0) as i32;
        let warning_ratio = report.tenants_over_budget_warning as f64 / report.tenants as f64;
        score -= (warning_ratio * 20.0) as i32;
    }
    if report.sessions_total > 0 {
        let failure_ratio = (report.sessions_failed + report.sessions_timed_out) as f64 / report.sessions_total as f64;
        score -= (failure_ratio * 50.0) as i32;
    }

    score.clamp(0, 100) as u32
}
