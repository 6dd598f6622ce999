//! Best-effort cluster persistence of the router's identity keypair, so a
//! restarted pod reuses the same key rather than invalidating every
//! outstanding token. Grounded in the pack's `kube`/`k8s-openapi` usage for
//! object lifecycle (create, handle 409, fetch existing).

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, PostParams};
use kube::Client;

use super::JwtKeyMaterial;

const SECRET_NAME: &str = "picod-router-identity";
const CONFIGMAP_NAME: &str = "picod-router-public-key";
const PRIVATE_KEY_FIELD: &str = "privateKey.pem";
const PUBLIC_KEY_FIELD: &str = "publicKey.pem";

/// Attempts to create the identity Secret; if one already exists, loads and
/// returns it instead (another replica won the race). Also best-effort
/// publishes the public key ConfigMap. Returns `Ok(None)` when this call's
/// generated key is the one that should be kept (either this call created
/// the secret, or there is no cluster to talk to — callers distinguish via
/// `Err` for the latter).
pub(crate) async fn persist_or_load(
    namespace: &str,
    generated: &JwtKeyMaterial,
) -> Result<Option<JwtKeyMaterial>, anyhow::Error> {
    let client = Client::try_default().await?;
    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);
    let configmaps: Api<ConfigMap> = Api::namespaced(client, namespace);

    let key = match create_secret(&secrets, namespace, generated).await {
        Ok(()) => None,
        Err(kube::Error::Api(resp)) if resp.code == 409 => {
            let existing = secrets.get(SECRET_NAME).await?;
            Some(load_from_secret(&existing)?)
        }
        Err(e) => return Err(e.into()),
    };

    let public_key_pem = key.as_ref().map_or(generated.public_key_pem(), |k| k.public_key_pem());
    if let Err(e) = publish_public_key(&configmaps, namespace, public_key_pem).await {
        tracing::debug!(error = %e, "public key configmap publish skipped");
    }

    Ok(key)
}

async fn create_secret(
    secrets: &Api<Secret>,
    namespace: &str,
    material: &JwtKeyMaterial,
) -> Result<(), kube::Error> {
    let mut string_data = BTreeMap::new();
    string_data.insert(PRIVATE_KEY_FIELD.to_string(), material.private_key_pem.clone());

    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(SECRET_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        string_data: Some(string_data),
        ..Default::default()
    };

    secrets.create(&PostParams::default(), &secret).await.map(|_| ())
}

fn load_from_secret(secret: &Secret) -> Result<JwtKeyMaterial, anyhow::Error> {
    let data = secret
        .data
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("identity secret has no data"))?;
    let bytes = data
        .get(PRIVATE_KEY_FIELD)
        .ok_or_else(|| anyhow::anyhow!("identity secret missing {PRIVATE_KEY_FIELD}"))?;
    let pem = String::from_utf8(bytes.0.clone())?;
    Ok(JwtKeyMaterial::from_private_key_pem(&pem)?)
}

async fn publish_public_key(
    configmaps: &Api<ConfigMap>,
    namespace: &str,
    public_key_pem: &str,
) -> Result<(), kube::Error> {
    let mut data = BTreeMap::new();
    data.insert(PUBLIC_KEY_FIELD.to_string(), public_key_pem.to_string());

    let configmap = ConfigMap {
        metadata: ObjectMeta {
            name: Some(CONFIGMAP_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    };

    match configmaps.create(&PostParams::default(), &configmap).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(resp)) if resp.code == 409 => {
            configmaps
                .replace(CONFIGMAP_NAME, &PostParams::default(), &configmap)
                .await
                .map(|_| ())
        }
        Err(e) => Err(e),
    }
}
