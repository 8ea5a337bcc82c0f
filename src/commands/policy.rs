use anyhow::Result;

use session_operator::crd::NamespacePolicy;

const FIELD_MANAGER: &str = "session-operator-cli";

/// Export NamespacePolicies from a namespace as YAML.
pub async fn export(namespace: &str) -> Result<()> {
    let client = kube::Client::try_default().await?;
    let api: kube::Api<NamespacePolicy> = kube::Api::namespaced(client, namespace);
    let policies = api.list(&Default::default()).await?;

    if policies.items.is_empty() {
        println!("No NamespacePolicies found in namespace '{namespace}'");
        return Ok(());
    }

    let now = chrono::Utc::now().to_rfc3339();
    let mut first = true;
    for policy in &policies.items {
        if !first {
            println!("---");
        }
        first = false;

        let spec_yaml = serde_yaml::to_string(&policy.spec)?;
        let indented_spec: String = spec_yaml
            .lines()
            .filter(|l| !l.is_empty())
            .map(|line| format!("  {line}"))
            .collect::<Vec<_>>()
            .join("\n");

        let name = policy.metadata.name.as_deref().unwrap_or("unnamed");
        let ns = policy.metadata.namespace.as_deref().unwrap_or(namespace);

        println!(
            r#"apiVersion: sessions.io/v1
kind: NamespacePolicy
metadata:
  name: {name}
  namespace: {ns}
  annotations:
    sessions.io/exported-at: "{now}"
    sessions.io/exported-from: "{ns}"
spec:
{indented_spec}"#
        );
    }

    Ok(())
}

/// Import NamespacePolicies from a YAML file.
pub async fn import(file: &str, dry_run: bool) -> Result<()> {
    let content = std::fs::read_to_string(file)?;
    let client = kube::Client::try_default().await?;

    for doc in content.split("---") {
        let trimmed = doc.trim();
        if trimmed.is_empty() {
            continue;
        }

        let value: serde_yaml::Value = serde_yaml::from_str(trimmed)?;
        let kind = value["kind"].as_str().unwrap_or("");
        if kind != "NamespacePolicy" {
            continue;
        }

        let policy: NamespacePolicy = serde_yaml::from_str(trimmed)?;
        let name = policy.metadata.name.as_deref().unwrap_or("unnamed");
        let ns = policy.metadata.namespace.as_deref().unwrap_or("default");

        if dry_run {
            println!("[DRY-RUN] Would apply NamespacePolicy '{name}' in namespace '{ns}'");
        } else {
            let api: kube::Api<NamespacePolicy> = kube::Api::namespaced(client.clone(), ns);
            match api
                .patch(name, &kube::api::PatchParams::apply(FIELD_MANAGER), &kube::api::Patch::Apply(&policy))
                .await
            {
                Ok(_) => println!("Applied NamespacePolicy '{name}' in namespace '{ns}'"),
                Err(e) => eprintln!("Failed to apply '{name}': {e}"),
            }
        }
    }

    Ok(())
}

/// Diff local YAML policies against cluster state.
pub async fn diff(file: &str) -> Result<()> {
    let content = std::fs::read_to_string(file)?;
    let client = kube::Client::try_default().await?;

    for doc in content.split("---") {
        let trimmed = doc.trim();
        if trimmed.is_empty() {
            continue;
        }

        let value: serde_yaml::Value = serde_yaml::from_str(trimmed)?;
        let kind = value["kind"].as_str().unwrap_or("");
        if kind != "NamespacePolicy" {
            continue;
        }

        let local_policy: NamespacePolicy = serde_yaml::from_str(trimmed)?;
        let name = local_policy.metadata.name.as_deref().unwrap_or("unnamed");
        let ns = local_policy.metadata.namespace.as_deref().unwrap_or("default");

        let api: kube::Api<NamespacePolicy> = kube::Api::namespaced(client.clone(), ns);
        match api.get(name).await {
            Ok(remote_policy) => {
                let local_json = serde_json::to_value(&local_policy.spec)?;
                let remote_json = serde_json::to_value(&remote_policy.spec)?;

                if local_json == remote_json {
                    println!("[=] {ns}/{name}: no changes");
                } else {
                    println!("[~] {ns}/{name}: spec differs");
                    diff_json("spec", &remote_json, &local_json, "  ");
                }
            }
            Err(kube::Error::Api(err)) if err.code == 404 => {
                println!("[+] {ns}/{name}: new (not in cluster)");
            }
            Err(e) => {
                println!("[!] {ns}/{name}: error fetching from cluster: {e}");
            }
        }
    }

    Ok(())
}

fn diff_json(prefix: &str, remote: &serde_json::Value, local: &serde_json::Value, indent: &str) {
    match (remote, local) {
        (serde_json::Value::Object(r), serde_json::Value::Object(l)) => {
            for key in r.keys().chain(l.keys()).collect::<std::collections::BTreeSet<_>>() {
                let r_val = r.get(key);
                let l_val = l.get(key);
                match (r_val, l_val) {
                    (Some(rv), Some(lv)) if rv != lv => {
                        diff_json(&format!("{prefix}.{key}"), rv, lv, indent);
                    }
                    (Some(rv), None) => {
                        println!("{indent}- {prefix}.{key}: {rv}");
                    }
                    (None, Some(lv)) => {
                        println!("{indent}+ {prefix}.{key}: {lv}");
                    }
                    _ => {}
                }
            }
        }
        _ if remote != local => {
            println!("{indent}- {prefix}: {remote}");
            println!("{indent}+ {prefix}: {local}");
        }
        _ => {}
    }
}
