/* ============================= SERVICE GENERATORS ============================= */

const NAMESPACE: &str = "session-operator";
const APP_NAME: &str = "session-operator";

pub fn generate_service(component: &str, port: u16) -> String {
    format!(
        r#"apiVersion: v1
kind: Service
metadata:
  name: {APP_NAME}-{component}
  namespace: {NAMESPACE}
  labels:
    app.kubernetes.io/name: {APP_NAME}
    app.kubernetes.io/component: {component}
spec:
  selector:
    app.kubernetes.io/name: {APP_NAME}
    app.kubernetes.io/component: {component}
  ports:
    - name: metrics
      port: {port}
      targetPort: {port}
      protocol: TCP
"#
    )
}

pub fn generate_service_reconcile() -> String {
    generate_service("reconcile", 9090)
}

pub fn generate_service_policy_reconcile() -> String {
    generate_service("policy-reconcile", 9091)
}

pub fn generate_service_webhook() -> String {
    generate_service("webhook", 8443)
}

pub fn generate_service_api() -> String {
    generate_service("api", 8080)
}

/* ============================= SERVICEMONITOR GENERATORS ============================= */

pub fn generate_service_monitor(component: &str, port: u16) -> String {
    let scheme = if port == 8443 { "https" } else { "http" };

    let mut yaml = format!(
        r#"apiVersion: monitoring.coreos.com/v1
kind: ServiceMonitor
metadata:
  name: {APP_NAME}-{component}
  namespace: {NAMESPACE}
  labels:
    app.kubernetes.io/name: {APP_NAME}
    app.kubernetes.io/component: {component}
    release: stable
spec:
  selector:
    matchLabels:
      app.kubernetes.io/name: {APP_NAME}
      app.kubernetes.io/component: {component}
  endpoints:
    - port: metrics
      path: /metrics
      interval: 15s
      scheme: {scheme}
"#
    );

    if port == 8443 {
        yaml.push_str("      tlsConfig:\n        insecureSkipVerify: true\n");
    }

    yaml
}

pub fn generate_service_monitor_reconcile() -> String {
    generate_service_monitor("reconcile", 9090)
}

pub fn generate_service_monitor_policy_reconcile() -> String {
    generate_service_monitor("policy-reconcile", 9091)
}

pub fn generate_service_monitor_webhook() -> String {
    generate_service_monitor("webhook", 8443)
}

pub fn generate_service_monitor_api() -> String {
    generate_service_monitor("api", 8080)
}

/* ============================= GRAFANA DASHBOARD ============================= */

pub fn generate_grafana_dashboard_configmap() -> String {
    let dashboard = build_dashboard_json();
    let dashboard_str = serde_json::to_string_pretty(&dashboard).expect("dashboard JSON is valid");

    let indented: String = dashboard_str.lines().map(|line| format!("    {line}")).collect::<Vec<_>>().join("\n");

    format!(
        r#"apiVersion: v1
kind: ConfigMap
metadata:
  name: {APP_NAME}-grafana-dashboard
  namespace: {NAMESPACE}
  labels:
    app.kubernetes.io/name: {APP_NAME}
    grafana_dashboard: "1"
data:
  session-operator.json: |
{indented}
"#
    )
}

fn build_dashboard_json() -> serde_json::Value {
    serde_json::json!({
        "annotations": { "list": [] },
        "editable": true,
        "fiscalYearStartMonth": 0,
        "graphTooltip": 1,
        "id": null,
        "links": [],
        "panels": [
            row_panel(0, "Overview"),
            graph_panel(1, "Session Reconcile Rate", "rate(session_reconcile_total[5m])", 0),
            graph_panel(2, "Session Reconcile Errors", "rate(session_reconcile_errors_total[5m])", 0),
            graph_panel(3, "Webhook Requests", "rate(webhook_requests_total[5m])", 0),

            row_panel(4, "Sessions"),
            graph_panel(5, "Sessions by Phase", "sessions_by_phase", 1),
            graph_panel(6, "Phase Transitions", "rate(session_phase_transitions_total[5m])", 1),
            graph_panel(7, "Reconcile Duration", "histogram_quantile(0.99, rate(session_reconcile_duration_seconds_bucket[5m]))", 1),

            row_panel(8, "Tenant Budgets"),
            graph_panel(9, "Budget Percent Used", "tenant_budget_percent_used", 2),
            graph_panel(10, "Policy Violations", "tenant_policy_violation_count", 2),
            graph_panel(11, "Policy Reconcile Rate", "rate(policy_reconcile_total[5m])", 2),
            graph_panel(12, "Policy Reconcile Errors", "rate(policy_reconcile_errors_total[5m])", 2),

            row_panel(13, "Ingress"),
            graph_panel(14, "Webhook Allow/Deny Rate", "rate(webhook_requests_total[5m])", 3),
            graph_panel(15, "Webhook Denials", "rate(webhook_denials_total[5m])", 3),
            graph_panel(16, "Webhook Request Latency", "histogram_quantile(0.99, rate(webhook_request_duration_seconds_bucket[5m]))", 3),
            stat_panel(17, "Rate Limited Requests", "sum(rate(webhook_rate_limited_total[5m]))", 3),
        ],
        "schemaVersion": 39,
        "tags": ["kubernetes", "session-operator"],
        "templating": { "list": [] },
        "time": { "from": "now-1h", "to": "now" },
        "title": "session-operator Observability",
        "uid": "session-operator-overview",
        "version": 1
    })
}

fn row_panel(id: u32, title: &str) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "type": "row",
        "title": title,
        "collapsed": false,
        "panels": []
    })
}

fn stat_panel(id: u32, title: &str, expr: &str, _row: u32) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "type": "stat",
        "title": title,
        "targets": [{ "expr": expr, "refId": "A" }],
        "fieldConfig": {
            "defaults": {
                "thresholds": {
                    "steps": [
                        { "color": "green", "value": null },
                        { "color": "red", "value": 80 }
                    ]
                }
            }
        }
    })
}

fn graph_panel(id: u32, title: &str, expr: &str, _row: u32) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "type": "timeseries",
        "title": title,
        "targets": [{ "expr": expr, "refId": "A" }],
        "fieldConfig": { "defaults": {} }
    })
}

/* ============================= GENERATE ALL ============================= */

pub fn generate_all() -> String {
    let mut output = String::new();

    output.push_str(&generate_service_reconcile());
    output.push_str("---\n");
    output.push_str(&generate_service_policy_reconcile());
    output.push_str("---\n");
    output.push_str(&generate_service_webhook());
    output.push_str("---\n");
    output.push_str(&generate_service_api());
    output.push_str("---\n");
    output.push_str(&generate_service_monitor_reconcile());
    output.push_str("---\n");
    output.push_str(&generate_service_monitor_policy_reconcile());
    output.push_str("---\n");
    output.push_str(&generate_service_monitor_webhook());
    output.push_str("---\n");
    output.push_str(&generate_service_monitor_api());
    output.push_str("---\n");
    output.push_str(&generate_grafana_dashboard_configmap());

    output
}

pub fn generate_service_monitors() -> String {
    let mut output = String::new();

    output.push_str(&generate_service_monitor_reconcile());
    output.push_str("---\n");
    output.push_str(&generate_service_monitor_policy_reconcile());
    output.push_str("---\n");
    output.push_str(&generate_service_monitor_webhook());
    output.push_str("---\n");
    output.push_str(&generate_service_monitor_api());

    output
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_reconcile_fields() {
        let yaml = generate_service_reconcile();
        let doc: serde_yaml::Value = serde_yaml::from_str(&yaml).expect("valid YAML");

        assert_eq!(doc["kind"], "Service");
        assert_eq!(doc["metadata"]["name"], "session-operator-reconcile");
        assert_eq!(doc["spec"]["ports"][0]["port"], 9090);
    }

    #[test]
    fn test_service_policy_reconcile_fields() {
        let yaml = generate_service_policy_reconcile();
        let doc: serde_yaml::Value = serde_yaml::from_str(&yaml).expect("valid YAML");

        assert_eq!(doc["metadata"]["name"], "session-operator-policy-reconcile");
        assert_eq!(doc["spec"]["ports"][0]["port"], 9091);
    }

    #[test]
    fn test_service_webhook_fields() {
        let yaml = generate_service_webhook();
        let doc: serde_yaml::Value = serde_yaml::from_str(&yaml).expect("valid YAML");

        assert_eq!(doc["metadata"]["name"], "session-operator-webhook");
        assert_eq!(doc["spec"]["ports"][0]["port"], 8443);
    }

    #[test]
    fn test_service_api_fields() {
        let yaml = generate_service_api();
        let doc: serde_yaml::Value = serde_yaml::from_str(&yaml).expect("valid YAML");

        assert_eq!(doc["metadata"]["name"], "session-operator-api");
        assert_eq!(doc["spec"]["ports"][0]["port"], 8080);
    }

    #[test]
    fn test_service_monitor_webhook_uses_https() {
        let yaml = generate_service_monitor_webhook();
        let doc: serde_yaml::Value = serde_yaml::from_str(&yaml).expect("valid YAML");

        assert_eq!(doc["kind"], "ServiceMonitor");
        assert_eq!(doc["spec"]["endpoints"][0]["scheme"], "https");
        assert_eq!(doc["spec"]["endpoints"][0]["tlsConfig"]["insecureSkipVerify"], true);
    }

    #[test]
    fn test_service_monitor_reconcile_uses_http() {
        let yaml = generate_service_monitor_reconcile();
        let doc: serde_yaml::Value = serde_yaml::from_str(&yaml).expect("valid YAML");

        assert_eq!(doc["spec"]["endpoints"][0]["scheme"], "http");
    }

    #[test]
    fn test_all_services_parseable_yaml() {
        for yaml in [
            generate_service_reconcile(),
            generate_service_policy_reconcile(),
            generate_service_webhook(),
            generate_service_api(),
        ] {
            let _: serde_yaml::Value = serde_yaml::from_str(&yaml).expect("service YAML should be parseable");
        }
    }

    #[test]
    fn test_all_service_monitors_parseable_yaml() {
        for yaml in [
            generate_service_monitor_reconcile(),
            generate_service_monitor_policy_reconcile(),
            generate_service_monitor_webhook(),
            generate_service_monitor_api(),
        ] {
            let _: serde_yaml::Value = serde_yaml::from_str(&yaml).expect("ServiceMonitor YAML should be parseable");
        }
    }

    #[test]
    fn test_dashboard_configmap_valid_json() {
        let yaml = generate_grafana_dashboard_configmap();
        let doc: serde_yaml::Value = serde_yaml::from_str(&yaml).expect("valid YAML");

        let dashboard_json_str =
            doc["data"]["session-operator.json"].as_str().expect("dashboard JSON should be a string");

        let _dashboard: serde_json::Value =
            serde_json::from_str(dashboard_json_str).expect("embedded dashboard should be valid JSON");
    }

    #[test]
    fn test_dashboard_has_panels() {
        let dashboard = build_dashboard_json();
        let panels = dashboard["panels"].as_array().expect("panels should be an array");
        assert!(panels.len() >= 15, "dashboard should have at least 15 panels");
    }

    #[test]
    fn test_dashboard_configmap_has_grafana_label() {
        let yaml = generate_grafana_dashboard_configmap();
        let doc: serde_yaml::Value = serde_yaml::from_str(&yaml).expect("valid YAML");

        assert_eq!(doc["kind"], "ConfigMap");
        assert_eq!(doc["metadata"]["labels"]["grafana_dashboard"], "1");
    }

    #[test]
    fn test_dashboard_references_all_metrics() {
        let dashboard = build_dashboard_json();
        let dashboard_str = serde_json::to_string(&dashboard).expect("valid JSON");

        let expected_metrics = [
            "session_reconcile_total",
            "session_reconcile_errors_total",
            "webhook_requests_total",
            "sessions_by_phase",
            "session_phase_transitions_total",
            "session_reconcile_duration_seconds",
            "tenant_budget_percent_used",
            "tenant_policy_violation_count",
            "policy_reconcile_total",
            "policy_reconcile_errors_total",
            "webhook_denials_total",
            "webhook_request_duration_seconds",
        ];

        for metric in &expected_metrics {
            assert!(dashboard_str.contains(metric), "dashboard should reference metric: {metric}");
        }
    }
}
