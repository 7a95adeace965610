//! Local simulated cloud.
//!
//! Keeps an inventory of objects in memory, hands out AWS-shaped identifiers
//! and derives the result properties each kind exposes (cluster endpoint,
//! OIDC issuer, kubeconfig, role ARNs, release status). When opened on a
//! path the inventory is written back after every mutation, so successive
//! runs see the same cloud.

use super::{Created, Provider, ProviderError};
use crate::core::types::ResourceKind;
use crate::tripwire::hasher;
use async_trait::async_trait;
use indexmap::IndexMap;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

const ACCOUNT_ID: &str = "123456789012";

/// One provisioned object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudObject {
    pub kind: ResourceKind,
    pub name: String,
    pub properties: serde_json::Value,
    pub outputs: serde_json::Value,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Inventory {
    serial: u64,
    objects: IndexMap<String, CloudObject>,
}

#[derive(Debug)]
struct Fault {
    error: ProviderError,
    remaining: u32,
}

/// Simulated cloud provider.
#[derive(Debug)]
pub struct LocalProvider {
    region: String,
    path: Option<PathBuf>,
    latency: Duration,
    inventory: Mutex<Inventory>,
    faults: Mutex<FxHashMap<String, Fault>>,
}

impl LocalProvider {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            path: None,
            latency: Duration::ZERO,
            inventory: Mutex::new(Inventory::default()),
            faults: Mutex::new(FxHashMap::default()),
        }
    }

    /// Load the inventory persisted at `path` (empty when absent).
    pub fn open(region: impl Into<String>, path: impl Into<PathBuf>) -> Result<Self, ProviderError> {
        let path = path.into();
        let inventory = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .map_err(|e| ProviderError::Permanent(format!("cannot read {}: {}", path.display(), e)))?;
            serde_json::from_str(&content).map_err(|e| {
                ProviderError::Permanent(format!("invalid inventory {}: {}", path.display(), e))
            })?
        } else {
            Inventory::default()
        };
        Ok(Self {
            path: Some(path),
            inventory: Mutex::new(inventory),
            ..Self::new(region)
        })
    }

    /// Inventory path for a stack inside a state directory.
    pub fn inventory_path(state_dir: &Path, stack: &str) -> PathBuf {
        state_dir.join(stack).join("cloud.json")
    }

    /// Delay every call by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Make the next `times` calls for object `name` fail with `error`.
    pub fn inject_fault(&self, name: &str, error: ProviderError, times: u32) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.insert(
                name.to_string(),
                Fault {
                    error,
                    remaining: times,
                },
            );
        }
    }

    /// Change a property behind the engine's back (simulated console edit).
    pub fn tamper(&self, provider_id: &str, key: &str, value: serde_json::Value) -> bool {
        let Ok(mut inv) = self.inventory.lock() else {
            return false;
        };
        let Some(obj) = inv.objects.get_mut(provider_id) else {
            return false;
        };
        if let Some(map) = obj.properties.as_object_mut() {
            map.insert(key.to_string(), value);
        }
        let _ = self.persist(&inv);
        true
    }

    /// Remove an object behind the engine's back.
    pub fn evict(&self, provider_id: &str) -> bool {
        let Ok(mut inv) = self.inventory.lock() else {
            return false;
        };
        let removed = inv.objects.shift_remove(provider_id).is_some();
        let _ = self.persist(&inv);
        removed
    }

    pub fn object(&self, provider_id: &str) -> Option<CloudObject> {
        self.inventory
            .lock()
            .ok()
            .and_then(|inv| inv.objects.get(provider_id).cloned())
    }

    pub fn object_count(&self) -> usize {
        self.inventory.lock().map(|inv| inv.objects.len()).unwrap_or(0)
    }

    async fn simulate_latency(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    fn check_fault(&self, name: &str) -> Result<(), ProviderError> {
        let mut faults = self
            .faults
            .lock()
            .map_err(|_| ProviderError::Permanent("fault table poisoned".to_string()))?;
        if let Some(fault) = faults.get_mut(name) {
            if fault.remaining > 0 {
                fault.remaining -= 1;
                return Err(fault.error.clone());
            }
        }
        Ok(())
    }

    fn locked(&self) -> Result<MutexGuard<'_, Inventory>, ProviderError> {
        self.inventory
            .lock()
            .map_err(|_| ProviderError::Permanent("inventory poisoned".to_string()))
    }

    fn persist(&self, inv: &Inventory) -> Result<(), ProviderError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let write = || -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let json = serde_json::to_string_pretty(inv).map_err(std::io::Error::other)?;
            let tmp = path.with_extension("json.tmp");
            std::fs::write(&tmp, json)?;
            std::fs::rename(&tmp, path)
        };
        write().map_err(|e| ProviderError::Transient(format!("cannot persist inventory: {}", e)))
    }

    fn mint_id(&self, inv: &mut Inventory, kind: ResourceKind, name: &str) -> String {
        inv.serial += 1;
        let seed = hasher::hash_string(&format!("{}/{}/{}", kind, name, inv.serial));
        let hex = seed.trim_start_matches("blake3:");
        let short = &hex[..17];
        match kind {
            ResourceKind::Vpc => format!("vpc-{}", short),
            ResourceKind::InternetGateway => format!("igw-{}", short),
            ResourceKind::RouteTable => format!("rtb-{}", short),
            ResourceKind::Subnet => format!("subnet-{}", short),
            ResourceKind::RouteTableAssociation => format!("rtbassoc-{}", short),
            ResourceKind::SecurityGroup => format!("sg-{}", short),
            ResourceKind::IamRole => format!("AROA{}", hex[..17].to_uppercase()),
            ResourceKind::IamPolicy => format!("ANPA{}", hex[..17].to_uppercase()),
            ResourceKind::RolePolicyAttachment => format!("{}-{}", name, &hex[..8]),
            ResourceKind::InstanceProfile => format!("AIPA{}", hex[..17].to_uppercase()),
            ResourceKind::EksCluster => hex[..32].to_uppercase(),
            ResourceKind::NodeGroup => format!("ng-{}", &hex[..12]),
            ResourceKind::KubernetesProvider => format!("k8s-{}", &hex[..12]),
            ResourceKind::Namespace => format!("ns-{}", &hex[..12]),
            ResourceKind::HelmRelease => format!("rel-{}", &hex[..12]),
            ResourceKind::Manifest => format!("cg-{}", &hex[..12]),
        }
    }

    /// Name under which a named object is unique in its account.
    fn unique_name(kind: ResourceKind, properties: &serde_json::Value) -> Option<String> {
        let name = properties.get("name").and_then(|v| v.as_str())?;
        match kind {
            ResourceKind::IamRole
            | ResourceKind::IamPolicy
            | ResourceKind::InstanceProfile
            | ResourceKind::EksCluster
            | ResourceKind::Namespace => Some(name.to_string()),
            ResourceKind::HelmRelease => {
                let ns = properties.get("namespace").and_then(|v| v.as_str())?;
                Some(format!("{}/{}", ns, name))
            }
            _ => None,
        }
    }

    fn outputs_for(
        &self,
        kind: ResourceKind,
        name: &str,
        provider_id: &str,
        props: &serde_json::Value,
        previous: Option<&serde_json::Value>,
    ) -> serde_json::Value {
        let s = |key: &str| props.get(key).and_then(|v| v.as_str()).unwrap_or_default();
        let named = |key: &str| {
            let v = s(key);
            if v.is_empty() {
                name.to_string()
            } else {
                v.to_string()
            }
        };
        let region = &self.region;
        match kind {
            ResourceKind::Vpc => json!({
                "id": provider_id,
                "arn": format!("arn:aws:ec2:{}:{}:vpc/{}", region, ACCOUNT_ID, provider_id),
                "cidrBlock": s("cidr_block"),
            }),
            ResourceKind::Subnet => json!({
                "id": provider_id,
                "arn": format!("arn:aws:ec2:{}:{}:subnet/{}", region, ACCOUNT_ID, provider_id),
                "availabilityZone": s("availability_zone"),
                "cidrBlock": s("cidr_block"),
            }),
            ResourceKind::SecurityGroup => json!({
                "id": provider_id,
                "arn": format!("arn:aws:ec2:{}:{}:security-group/{}", region, ACCOUNT_ID, provider_id),
            }),
            ResourceKind::IamRole => {
                let role = named("name");
                json!({
                    "id": provider_id,
                    "name": role,
                    "arn": format!("arn:aws:iam::{}:role/{}", ACCOUNT_ID, role),
                })
            }
            ResourceKind::IamPolicy => {
                let policy = named("name");
                json!({
                    "id": provider_id,
                    "name": policy,
                    "arn": format!("arn:aws:iam::{}:policy/{}", ACCOUNT_ID, policy),
                })
            }
            ResourceKind::InstanceProfile => {
                let profile = named("name");
                json!({
                    "id": provider_id,
                    "name": profile,
                    "arn": format!("arn:aws:iam::{}:instance-profile/{}", ACCOUNT_ID, profile),
                })
            }
            ResourceKind::EksCluster => {
                let cluster = named("name");
                let issuer = format!("oidc.eks.{}.amazonaws.com/id/{}", region, provider_id);
                let endpoint = format!(
                    "https://{}.gr7.{}.eks.amazonaws.com",
                    provider_id, region
                );
                let ca = hasher::hash_string(&format!("ca/{}", provider_id));
                json!({
                    "id": provider_id,
                    "name": cluster,
                    "arn": format!("arn:aws:eks:{}:{}:cluster/{}", region, ACCOUNT_ID, cluster),
                    "endpoint": endpoint,
                    "version": s("version"),
                    "certificateAuthority": ca.trim_start_matches("blake3:"),
                    "oidcProviderUrl": format!("https://{}", issuer),
                    "oidcProviderArn": format!("arn:aws:iam::{}:oidc-provider/{}", ACCOUNT_ID, issuer),
                    "kubeconfig": render_kubeconfig(&cluster, &endpoint, region),
                })
            }
            ResourceKind::NodeGroup => json!({
                "id": provider_id,
                "name": name,
                "arn": format!("arn:aws:eks:{}:{}:nodegroup/{}/{}/{}", region, ACCOUNT_ID, s("cluster_name"), name, provider_id),
                "status": "ACTIVE",
            }),
            ResourceKind::KubernetesProvider => json!({
                "id": provider_id,
                "context": "aws",
            }),
            ResourceKind::Namespace => json!({
                "id": provider_id,
                "name": s("name"),
            }),
            ResourceKind::HelmRelease => {
                let revision = previous
                    .and_then(|p| p.get("revision"))
                    .and_then(|v| v.as_u64())
                    .map_or(1, |r| r + 1);
                json!({
                    "id": provider_id,
                    "name": s("name"),
                    "namespace": s("namespace"),
                    "chart": s("chart"),
                    "version": s("version"),
                    "status": "deployed",
                    "revision": revision,
                })
            }
            ResourceKind::Manifest => {
                let objects = s("yaml")
                    .split("\n---")
                    .filter(|doc| doc.lines().any(|l| l.starts_with("kind:")))
                    .count();
                json!({
                    "id": provider_id,
                    "name": s("name"),
                    "objects": objects,
                    "status": "applied",
                })
            }
            ResourceKind::InternetGateway
            | ResourceKind::RouteTable
            | ResourceKind::RouteTableAssociation
            | ResourceKind::RolePolicyAttachment => json!({ "id": provider_id }),
        }
    }
}

fn render_kubeconfig(cluster: &str, endpoint: &str, region: &str) -> String {
    format!(
        "apiVersion: v1\n\
         kind: Config\n\
         clusters:\n\
         - name: {cluster}\n  cluster:\n    server: {endpoint}\n\
         contexts:\n\
         - name: aws\n  context:\n    cluster: {cluster}\n    user: aws\n\
         current-context: aws\n\
         users:\n\
         - name: aws\n  user:\n    exec:\n      apiVersion: client.authentication.k8s.io/v1beta1\n      command: aws\n      args: [eks, get-token, --cluster-name, {cluster}, --region, {region}]\n"
    )
}

#[async_trait]
impl Provider for LocalProvider {
    fn name(&self) -> &str {
        "local"
    }

    async fn create(
        &self,
        kind: ResourceKind,
        name: &str,
        properties: &serde_json::Value,
    ) -> Result<Created, ProviderError> {
        self.simulate_latency().await;
        self.check_fault(name)?;

        let mut inv = self.locked()?;
        if let Some(unique) = Self::unique_name(kind, properties) {
            let taken = inv.objects.values().any(|o| {
                o.kind == kind
                    && Self::unique_name(kind, &o.properties).as_deref() == Some(unique.as_str())
            });
            if taken {
                return Err(ProviderError::AlreadyExists(format!("{} {}", kind, unique)));
            }
        }

        let provider_id = self.mint_id(&mut inv, kind, name);
        let outputs = self.outputs_for(kind, name, &provider_id, properties, None);
        inv.objects.insert(
            provider_id.clone(),
            CloudObject {
                kind,
                name: name.to_string(),
                properties: properties.clone(),
                outputs: outputs.clone(),
            },
        );
        self.persist(&inv)?;
        tracing::debug!(kind = %kind, name, provider_id = %provider_id, "local: created");
        Ok(Created {
            provider_id,
            outputs,
        })
    }

    async fn update(
        &self,
        kind: ResourceKind,
        provider_id: &str,
        properties: &serde_json::Value,
    ) -> Result<serde_json::Value, ProviderError> {
        self.simulate_latency().await;

        let name = {
            let inv = self.locked()?;
            match inv.objects.get(provider_id) {
                Some(obj) if obj.kind == kind => obj.name.clone(),
                _ => return Err(ProviderError::NotFound(provider_id.to_string())),
            }
        };
        self.check_fault(&name)?;

        let mut inv = self.locked()?;
        let previous = inv
            .objects
            .get(provider_id)
            .map(|o| o.outputs.clone())
            .ok_or_else(|| ProviderError::NotFound(provider_id.to_string()))?;
        let outputs = self.outputs_for(kind, &name, provider_id, properties, Some(&previous));
        if let Some(obj) = inv.objects.get_mut(provider_id) {
            obj.properties = properties.clone();
            obj.outputs = outputs.clone();
        }
        self.persist(&inv)?;
        tracing::debug!(kind = %kind, provider_id, "local: updated");
        Ok(outputs)
    }

    async fn delete(&self, kind: ResourceKind, provider_id: &str) -> Result<(), ProviderError> {
        self.simulate_latency().await;

        let name = {
            let inv = self.locked()?;
            match inv.objects.get(provider_id) {
                Some(obj) if obj.kind == kind => obj.name.clone(),
                _ => return Err(ProviderError::NotFound(provider_id.to_string())),
            }
        };
        self.check_fault(&name)?;

        let mut inv = self.locked()?;
        inv.objects.shift_remove(provider_id);
        self.persist(&inv)?;
        tracing::debug!(kind = %kind, provider_id, "local: deleted");
        Ok(())
    }

    async fn read(
        &self,
        kind: ResourceKind,
        provider_id: &str,
    ) -> Result<Option<serde_json::Value>, ProviderError> {
        let inv = self.locked()?;
        Ok(inv
            .objects
            .get(provider_id)
            .filter(|o| o.kind == kind)
            .map(|o| o.properties.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster_props() -> serde_json::Value {
        json!({
            "name": "demo",
            "version": "1.33",
            "role_arn": "arn:aws:iam::123456789012:role/demo-cluster",
            "vpc_id": "vpc-1",
            "subnet_ids": ["subnet-1"],
        })
    }

    #[tokio::test]
    async fn test_create_assigns_shaped_ids() {
        let p = LocalProvider::new("us-east-2");
        let vpc = p
            .create(ResourceKind::Vpc, "vpc", &json!({"cidr_block": "10.0.0.0/16"}))
            .await
            .unwrap();
        assert!(vpc.provider_id.starts_with("vpc-"));
        assert_eq!(vpc.provider_id.len(), 4 + 17);
        assert_eq!(vpc.outputs["id"], json!(vpc.provider_id));
        assert_eq!(vpc.outputs["cidrBlock"], json!("10.0.0.0/16"));
        assert_eq!(p.object_count(), 1);
    }

    #[tokio::test]
    async fn test_cluster_outputs() {
        let p = LocalProvider::new("us-east-2");
        let c = p
            .create(ResourceKind::EksCluster, "cluster", &cluster_props())
            .await
            .unwrap();
        let out = &c.outputs;
        assert_eq!(out["arn"], json!("arn:aws:eks:us-east-2:123456789012:cluster/demo"));
        assert_eq!(out["version"], json!("1.33"));
        let url = out["oidcProviderUrl"].as_str().unwrap();
        assert!(url.starts_with("https://oidc.eks.us-east-2.amazonaws.com/id/"));
        let arn = out["oidcProviderArn"].as_str().unwrap();
        assert!(arn.ends_with(url.trim_start_matches("https://")));
        let kubeconfig = out["kubeconfig"].as_str().unwrap();
        assert!(kubeconfig.contains(out["endpoint"].as_str().unwrap()));
        assert!(kubeconfig.contains("--cluster-name, demo"));
    }

    #[tokio::test]
    async fn test_named_objects_are_unique() {
        let p = LocalProvider::new("us-east-2");
        let props = json!({"name": "demo-node", "assume_role_policy": "{}"});
        p.create(ResourceKind::IamRole, "a", &props).await.unwrap();
        let err = p.create(ResourceKind::IamRole, "b", &props).await.unwrap_err();
        assert!(matches!(err, ProviderError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_update_and_delete_missing() {
        let p = LocalProvider::new("us-east-2");
        let err = p
            .update(ResourceKind::Vpc, "vpc-ghost", &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::NotFound(_)));
        let err = p.delete(ResourceKind::Vpc, "vpc-ghost").await.unwrap_err();
        assert!(matches!(err, ProviderError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_helm_revision_increments() {
        let p = LocalProvider::new("us-east-2");
        let props = json!({"name": "karpenter", "namespace": "kube-system", "chart": "c", "version": "1.6.3", "provider": "k"});
        let rel = p.create(ResourceKind::HelmRelease, "karpenter", &props).await.unwrap();
        assert_eq!(rel.outputs["revision"], json!(1));
        let out = p
            .update(ResourceKind::HelmRelease, &rel.provider_id, &props)
            .await
            .unwrap();
        assert_eq!(out["revision"], json!(2));
    }

    #[tokio::test]
    async fn test_manifest_counts_objects() {
        let p = LocalProvider::new("us-east-2");
        let yaml = "apiVersion: v1\nkind: A\n---\napiVersion: v1\nkind: B\n";
        let cg = p
            .create(
                ResourceKind::Manifest,
                "nodes",
                &json!({"name": "nodes", "yaml": yaml, "provider": "k"}),
            )
            .await
            .unwrap();
        assert!(cg.provider_id.starts_with("cg-"));
        assert_eq!(cg.outputs["objects"], json!(2));
        assert_eq!(cg.outputs["status"], json!("applied"));
    }

    #[tokio::test]
    async fn test_injected_fault_expires() {
        let p = LocalProvider::new("us-east-2");
        p.inject_fault("vpc", ProviderError::Transient("throttled".into()), 1);
        let props = json!({"cidr_block": "10.0.0.0/16"});
        assert!(matches!(
            p.create(ResourceKind::Vpc, "vpc", &props).await,
            Err(ProviderError::Transient(_))
        ));
        assert!(p.create(ResourceKind::Vpc, "vpc", &props).await.is_ok());
    }

    #[tokio::test]
    async fn test_inventory_persists_across_opens() {
        let dir = tempfile::tempdir().unwrap();
        let path = LocalProvider::inventory_path(dir.path(), "dev");
        let id = {
            let p = LocalProvider::open("us-east-2", &path).unwrap();
            p.create(ResourceKind::Vpc, "vpc", &json!({"cidr_block": "10.0.0.0/16"}))
                .await
                .unwrap()
                .provider_id
        };
        let p = LocalProvider::open("us-east-2", &path).unwrap();
        let seen = p.read(ResourceKind::Vpc, &id).await.unwrap();
        assert_eq!(seen, Some(json!({"cidr_block": "10.0.0.0/16"})));
        p.delete(ResourceKind::Vpc, &id).await.unwrap();
        let p = LocalProvider::open("us-east-2", &path).unwrap();
        assert_eq!(p.object_count(), 0);
    }

    #[tokio::test]
    async fn test_tamper_changes_read() {
        let p = LocalProvider::new("us-east-2");
        let vpc = p
            .create(ResourceKind::Vpc, "vpc", &json!({"cidr_block": "10.0.0.0/16"}))
            .await
            .unwrap();
        assert!(p.tamper(&vpc.provider_id, "cidr_block", json!("10.9.0.0/16")));
        let seen = p.read(ResourceKind::Vpc, &vpc.provider_id).await.unwrap().unwrap();
        assert_eq!(seen["cidr_block"], json!("10.9.0.0/16"));
        assert!(p.evict(&vpc.provider_id));
        assert_eq!(p.read(ResourceKind::Vpc, &vpc.provider_id).await.unwrap(), None);
    }
}
