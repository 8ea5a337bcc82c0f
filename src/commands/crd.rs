use anyhow::Result;
use kube::CustomResourceExt;

use session_operator::crd::{AuditEntry, NamespacePolicy, Session};

/// Print the Session, NamespacePolicy, and AuditEntry CRD YAML to stdout
/// for `kubectl apply -f`, separated by `---` documents.
pub fn generate() -> Result<()> {
    let docs = [
        serde_yaml::to_string(&Session::crd())?,
        serde_yaml::to_string(&NamespacePolicy::crd())?,
        serde_yaml::to_string(&AuditEntry::crd())?,
    ];
    println!("{}", docs.join("---\n"));
    Ok(())
}

/// Apply all three CRDs directly to the connected cluster.
pub async fn install() -> Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::{Api, Client};

    let client = Client::try_default().await?;
    let crds: Api<CustomResourceDefinition> = Api::all(client);

    for crd in [Session::crd(), NamespacePolicy::crd(), AuditEntry::crd()] {
        let name = crd.metadata.name.clone().unwrap_or_default();
        match crds.create(&Default::default(), &crd).await {
            Ok(_) => println!("CRD '{name}' installed successfully"),
            Err(kube::Error::Api(err)) if err.code == 409 => {
                println!("CRD '{name}' already exists, skipping");
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}
