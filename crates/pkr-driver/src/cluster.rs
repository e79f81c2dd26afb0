//! Kubernetes deployment state and pod listing
//!
//! The files applied for a kard are remembered in a ConfigMap
//! `pkr-<kard>` of `kube-system`, labelled `pkr=kard`. Each data entry is
//! the zlib-compressed, base64-encoded content of one file.

use async_trait::async_trait;
use base64::Engine as _;
use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Client;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::{DriverError, Result};

/// Namespace of the state ConfigMaps
pub const STATE_NAMESPACE: &str = "kube-system";

/// Label selecting the state ConfigMaps
pub const STATE_LABEL: (&str, &str) = ("pkr", "kard");

const STATE_PREFIX: &str = "pkr-";

/// File name to content
pub type DeployedFiles = BTreeMap<String, String>;

pub fn state_name(kard: &str) -> String {
    format!("{STATE_PREFIX}{kard}")
}

/// zlib, then base64
pub fn encode_file(content: &str) -> Result<String> {
    let mut encoder =
        flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
    encoder
        .write_all(content.as_bytes())
        .map_err(|e| DriverError::Compression(e.to_string()))?;
    let compressed = encoder
        .finish()
        .map_err(|e| DriverError::Compression(e.to_string()))?;
    Ok(base64::engine::general_purpose::STANDARD.encode(compressed))
}

pub fn decode_file(data: &str) -> Result<String> {
    let compressed = base64::engine::general_purpose::STANDARD
        .decode(data.trim())
        .map_err(|e| DriverError::Compression(e.to_string()))?;
    let mut decoder = flate2::read::ZlibDecoder::new(compressed.as_slice());
    let mut content = String::new();
    decoder
        .read_to_string(&mut content)
        .map_err(|e| DriverError::Compression(e.to_string()))?;
    Ok(content)
}

fn encode_all(files: &DeployedFiles) -> Result<BTreeMap<String, String>> {
    files
        .iter()
        .map(|(name, content)| Ok((name.clone(), encode_file(content)?)))
        .collect()
}

fn decode_all(data: &BTreeMap<String, String>) -> Result<DeployedFiles> {
    data.iter()
        .map(|(name, encoded)| Ok((name.clone(), decode_file(encoded)?)))
        .collect()
}

/// One pod, as shown by `pkr ps`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodInfo {
    pub name: String,
    pub phase: Option<String>,
    pub ip: Option<String>,
}

#[async_trait]
pub trait Cluster: Send + Sync {
    /// Files applied for a kard, empty when it was never deployed
    async fn load_state(&self, kard: &str) -> Result<DeployedFiles>;

    /// Replace the stored files; an empty set removes the state
    async fn save_state(&self, kard: &str, files: &DeployedFiles) -> Result<()>;

    /// Kards with a stored state
    async fn list_states(&self) -> Result<Vec<String>>;

    async fn list_pods(&self, namespace: &str) -> Result<Vec<PodInfo>>;
}

/// Cluster reached through the current kubeconfig
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub async fn connect() -> Result<Self> {
        let client = Client::try_default().await?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    fn config_maps(&self) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), STATE_NAMESPACE)
    }
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 404)
}

#[async_trait]
impl Cluster for KubeCluster {
    async fn load_state(&self, kard: &str) -> Result<DeployedFiles> {
        match self.config_maps().get_opt(&state_name(kard)).await? {
            Some(cm) => decode_all(&cm.data.unwrap_or_default()),
            None => Ok(DeployedFiles::new()),
        }
    }

    async fn save_state(&self, kard: &str, files: &DeployedFiles) -> Result<()> {
        let api = self.config_maps();
        let name = state_name(kard);

        if files.is_empty() {
            return match api.delete(&name, &DeleteParams::default()).await {
                Ok(_) => Ok(()),
                Err(e) if is_not_found(&e) => Ok(()),
                Err(e) => Err(e.into()),
            };
        }

        let mut labels = BTreeMap::new();
        labels.insert(STATE_LABEL.0.to_string(), STATE_LABEL.1.to_string());

        let mut cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(STATE_NAMESPACE.to_string()),
                labels: Some(labels),
                ..Default::default()
            },
            data: Some(encode_all(files)?),
            ..Default::default()
        };

        match api.get_opt(&name).await? {
            Some(existing) => {
                cm.metadata.resource_version = existing.metadata.resource_version;
                api.replace(&name, &PostParams::default(), &cm).await?;
            }
            None => {
                api.create(&PostParams::default(), &cm).await?;
            }
        }
        tracing::debug!(kard, files = files.len(), "saved deployment state");
        Ok(())
    }

    async fn list_states(&self) -> Result<Vec<String>> {
        let selector = format!("{}={}", STATE_LABEL.0, STATE_LABEL.1);
        let list = self
            .config_maps()
            .list(&ListParams::default().labels(&selector))
            .await?;

        let mut kards: Vec<String> = list
            .items
            .into_iter()
            .filter_map(|cm| cm.metadata.name)
            .filter_map(|name| name.strip_prefix(STATE_PREFIX).map(str::to_string))
            .collect();
        kards.sort();
        Ok(kards)
    }

    async fn list_pods(&self, namespace: &str) -> Result<Vec<PodInfo>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = pods.list(&ListParams::default()).await?;

        Ok(list
            .items
            .into_iter()
            .map(|pod| {
                let status = pod.status.unwrap_or_default();
                PodInfo {
                    name: pod.metadata.name.unwrap_or_default(),
                    phase: status.phase,
                    ip: status.pod_ip,
                }
            })
            .collect())
    }
}

/// In-memory cluster for testing
///
/// States are kept encoded, the way the ConfigMap holds them.
#[derive(Clone, Default)]
pub struct MockCluster {
    states: Arc<RwLock<BTreeMap<String, BTreeMap<String, String>>>>,
    pods: Arc<RwLock<BTreeMap<String, Vec<PodInfo>>>>,
}

impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_pod(&self, namespace: &str, pod: PodInfo) {
        self.pods
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(namespace.to_string())
            .or_default()
            .push(pod);
    }

    /// Raw ConfigMap data of a kard
    pub fn raw_state(&self, kard: &str) -> Option<BTreeMap<String, String>> {
        self.states.read().unwrap_or_else(PoisonError::into_inner).get(&state_name(kard)).cloned()
    }
}

#[async_trait]
impl Cluster for MockCluster {
    async fn load_state(&self, kard: &str) -> Result<DeployedFiles> {
        match self.raw_state(kard) {
            Some(data) => decode_all(&data),
            None => Ok(DeployedFiles::new()),
        }
    }

    async fn save_state(&self, kard: &str, files: &DeployedFiles) -> Result<()> {
        let mut states = self.states.write().unwrap_or_else(PoisonError::into_inner);
        if files.is_empty() {
            states.remove(&state_name(kard));
        } else {
            states.insert(state_name(kard), encode_all(files)?);
        }
        Ok(())
    }

    async fn list_states(&self) -> Result<Vec<String>> {
        Ok(self
            .states
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .filter_map(|name| name.strip_prefix(STATE_PREFIX).map(str::to_string))
            .collect())
    }

    async fn list_pods(&self, namespace: &str) -> Result<Vec<PodInfo>> {
        Ok(self
            .pods
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(namespace)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_cluster_survives_poisoned_lock() {
        let cluster = MockCluster::new();
        let states = Arc::clone(&cluster.states);
        let _ = std::thread::spawn(move || {
            let _guard = states.write().unwrap();
            panic!("poisoning the states");
        })
        .join();

        assert!(cluster.raw_state("demo").is_none());
    }

    #[test]
    fn test_encoding_round_trip() {
        let content = "apiVersion: v1\nkind: Service\n";
        let encoded = encode_file(content).unwrap();
        assert_ne!(encoded, content);
        assert_eq!(decode_file(&encoded).unwrap(), content);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            decode_file("not base64!"),
            Err(DriverError::Compression(_))
        ));
    }

    #[tokio::test]
    async fn test_mock_state_lifecycle() {
        let cluster = MockCluster::new();
        assert!(cluster.load_state("demo").await.unwrap().is_empty());

        let mut files = DeployedFiles::new();
        files.insert("meta.yml".to_string(), "tag: '1'\n".to_string());
        cluster.save_state("demo", &files).await.unwrap();

        let raw = cluster.raw_state("demo").unwrap();
        assert_eq!(decode_file(&raw["meta.yml"]).unwrap(), "tag: '1'\n");
        assert_eq!(cluster.load_state("demo").await.unwrap(), files);
        assert_eq!(cluster.list_states().await.unwrap(), vec!["demo"]);

        cluster.save_state("demo", &DeployedFiles::new()).await.unwrap();
        assert!(cluster.raw_state("demo").is_none());
        assert!(cluster.list_states().await.unwrap().is_empty());
    }

    #[test]
    fn test_state_name() {
        assert_eq!(state_name("staging"), "pkr-staging");
    }
}
