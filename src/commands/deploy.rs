/* ============================= CONSTANTS ============================= */

const NAMESPACE: &str = "session-operator";
const APP_NAME: &str = "session-operator";
const IMAGE: &str = "192.168.1.68:5000/session-operator:v0.1.0";

/* ============================= NAMESPACE ============================= */

pub fn generate_namespace() -> String {
    format!(
        r#"apiVersion: v1
kind: Namespace
metadata:
  name: {NAMESPACE}
  labels:
    app.kubernetes.io/name: {APP_NAME}
"#
    )
}

/* ============================= RBAC ============================= */

pub fn generate_service_account() -> String {
    format!(
        r#"apiVersion: v1
kind: ServiceAccount
metadata:
  name: {APP_NAME}
  namespace: {NAMESPACE}
  labels:
    app.kubernetes.io/name: {APP_NAME}
"#
    )
}

pub fn generate_cluster_role() -> String {
    format!(
        r#"apiVersion: rbac.authorization.k8s.io/v1
kind: ClusterRole
metadata:
  name: {APP_NAME}
  labels:
    app.kubernetes.io/name: {APP_NAME}
rules:
  - apiGroups: ["sessions.io"]
    resources: ["sessions", "namespacepolicies", "auditentries"]
    verbs: ["get", "list", "watch", "create", "update", "patch", "delete"]
  - apiGroups: ["sessions.io"]
    resources: ["sessions/status", "namespacepolicies/status"]
    verbs: ["get", "patch", "update"]
  - apiGroups: ["batch"]
    resources: ["jobs"]
    verbs: ["get", "list", "watch", "create", "update", "patch", "delete"]
  - apiGroups: [""]
    resources: ["pods", "nodes"]
    verbs: ["get", "list", "watch"]
  - apiGroups: [""]
    resources: ["secrets"]
    verbs: ["get", "list", "create", "update", "patch"]
  - apiGroups: ["authorization.k8s.io"]
    resources: ["subjectaccessreviews"]
    verbs: ["create"]
  - apiGroups: ["apiextensions.k8s.io"]
    resources: ["customresourcedefinitions"]
    verbs: ["get", "list", "create"]
"#
    )
}

pub fn generate_cluster_role_binding() -> String {
    format!(
        r#"apiVersion: rbac.authorization.k8s.io/v1
kind: ClusterRoleBinding
metadata:
  name: {APP_NAME}
  labels:
    app.kubernetes.io/name: {APP_NAME}
roleRef:
  apiGroup: rbac.authorization.k8s.io
  kind: ClusterRole
  name: {APP_NAME}
subjects:
  - kind: ServiceAccount
    name: {APP_NAME}
    namespace: {NAMESPACE}
"#
    )
}

/* ============================= DEPLOYMENT HELPER ============================= */

pub fn generate_deployment(
    component: &str,
    port: u16,
    args: &[&str],
    volume_mounts: &str,
    volumes: &str,
    probe_scheme: &str,
) -> String {
    let args_yaml: String = args.iter().map(|a| format!("            - \"{a}\"\n")).collect();

    let probe_path = "/healthz";
    let readiness_path = "/readyz";

    let volume_mounts_section = if volume_mounts.is_empty() {
        String::new()
    } else {
        format!("          volumeMounts:\n{volume_mounts}")
    };

    let volumes_section = if volumes.is_empty() {
        String::new()
    } else {
        format!("      volumes:\n{volumes}")
    };

    format!(
        r#"apiVersion: apps/v1
kind: Deployment
metadata:
  name: {APP_NAME}-{component}
  namespace: {NAMESPACE}
  labels:
    app.kubernetes.io/name: {APP_NAME}
    app.kubernetes.io/component: {component}
spec:
  replicas: 2
  selector:
    matchLabels:
      app.kubernetes.io/name: {APP_NAME}
      app.kubernetes.io/component: {component}
  template:
    metadata:
      labels:
        app.kubernetes.io/name: {APP_NAME}
        app.kubernetes.io/component: {component}
    spec:
      serviceAccountName: {APP_NAME}
      containers:
        - name: {APP_NAME}
          image: {IMAGE}
          imagePullPolicy: IfNotPresent
          args:
{args_yaml}          ports:
            - containerPort: {port}
              protocol: TCP
          livenessProbe:
            httpGet:
              path: {probe_path}
              port: {port}
              scheme: {probe_scheme}
            initialDelaySeconds: 5
            periodSeconds: 10
          readinessProbe:
            httpGet:
              path: {readiness_path}
              port: {port}
              scheme: {probe_scheme}
            initialDelaySeconds: 3
            periodSeconds: 5
          resources:
            requests:
              memory: "64Mi"
              cpu: "100m"
            limits:
              memory: "128Mi"
              cpu: "250m"
          securityContext:
            runAsNonRoot: true
            readOnlyRootFilesystem: true
{volume_mounts_section}{volumes_section}"#
    )
}

/* ============================= DEPLOYMENTS ============================= */

pub fn generate_deployment_reconcile() -> String {
    generate_deployment("reconcile", 9090, &["reconcile"], "", "", "HTTP")
}

pub fn generate_deployment_policy_reconcile() -> String {
    generate_deployment("policy-reconcile", 9091, &["policy-reconcile"], "", "", "HTTP")
}

pub fn generate_deployment_webhook() -> String {
    let volume_mounts =
        "            - name: tls-certs\n              mountPath: /tls\n              readOnly: true\n";
    let volumes =
        "        - name: tls-certs\n          secret:\n            secretName: session-operator-webhook-tls\n";
    generate_deployment(
        "webhook",
        8443,
        &["webhook", "serve", "--tls-cert", "/tls/tls.crt", "--tls-key", "/tls/tls.key"],
        volume_mounts,
        volumes,
        "HTTPS",
    )
}

pub fn generate_deployment_api() -> String {
    generate_deployment("api", 8080, &["api", "serve"], "", "", "HTTP")
}

/* ============================= PDB HELPER ============================= */

pub fn generate_pdb(component: &str) -> String {
    format!(
        r#"apiVersion: policy/v1
kind: PodDisruptionBudget
metadata:
  name: {APP_NAME}-{component}
  namespace: {NAMESPACE}
  labels:
    app.kubernetes.io/name: {APP_NAME}
    app.kubernetes.io/component: {component}
spec:
  minAvailable: 1
  selector:
    matchLabels:
      app.kubernetes.io/name: {APP_NAME}
      app.kubernetes.io/component: {component}
"#
    )
}

/* ============================= PDBs ============================= */

pub fn generate_pdb_reconcile() -> String {
    generate_pdb("reconcile")
}

pub fn generate_pdb_policy_reconcile() -> String {
    generate_pdb("policy-reconcile")
}

pub fn generate_pdb_webhook() -> String {
    generate_pdb("webhook")
}

pub fn generate_pdb_api() -> String {
    generate_pdb("api")
}

/* ============================= AGGREGATORS ============================= */

pub fn generate_all() -> String {
    let parts = [
        generate_namespace(),
        generate_service_account(),
        generate_cluster_role(),
        generate_cluster_role_binding(),
        generate_deployment_reconcile(),
        generate_deployment_policy_reconcile(),
        generate_deployment_webhook(),
        generate_deployment_api(),
        generate_pdb_reconcile(),
        generate_pdb_policy_reconcile(),
        generate_pdb_webhook(),
        generate_pdb_api(),
    ];
    parts.join("---\n")
}

pub fn generate_rbac() -> String {
    let parts = [generate_service_account(), generate_cluster_role(), generate_cluster_role_binding()];
    parts.join("---\n")
}

pub fn generate_deployments() -> String {
    let parts = [
        generate_deployment_reconcile(),
        generate_deployment_policy_reconcile(),
        generate_deployment_webhook(),
        generate_deployment_api(),
    ];
    parts.join("---\n")
}

/* ============================= TESTS ============================= */
