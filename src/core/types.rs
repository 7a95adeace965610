//! Engine data model.
//!
//! Stack configuration (YAML), resource descriptors and their deferred
//! values, persisted resource state, plans, apply reports and provenance
//! events. Persisted types derive Serialize/Deserialize for YAML/JSON
//! roundtripping.

use indexmap::{IndexMap, IndexSet};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Top-level stack.yaml
// ============================================================================

/// Root configuration for one stack (one environment of the topology).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StackConfig {
    /// Schema version (must be "1.0")
    pub version: String,

    /// Stack name; keys the state directory
    pub name: String,

    /// Optional description
    #[serde(default)]
    pub description: Option<String>,

    /// Scalar settings consumed while building the graph
    #[serde(default)]
    pub settings: Settings,

    /// Free-form parameters usable from templates
    #[serde(default)]
    #[schemars(with = "HashMap<String, serde_json::Value>")]
    pub params: HashMap<String, serde_yaml_ng::Value>,

    /// Extra tags merged into every taggable resource (values are templates)
    #[serde(default)]
    pub tags: IndexMap<String, String>,

    /// Execution policy
    #[serde(default)]
    pub policy: Policy,
}

/// Scalar settings for the cluster topology.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct Settings {
    pub cluster_name: String,
    pub region: String,
    /// Desired node group size
    pub node_count: u32,
    pub min_size: u32,
    pub max_size: u32,
    pub kubernetes_version: String,
    pub instance_type: String,
    pub vpc_cidr: String,
    /// Availability zone suffixes appended to the region
    pub availability_zones: Vec<String>,
    pub karpenter_namespace: String,
    pub karpenter_version: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cluster_name: "eks-cluster".to_string(),
            region: "us-east-2".to_string(),
            node_count: 3,
            min_size: 1,
            max_size: 5,
            kubernetes_version: "1.33".to_string(),
            instance_type: "t3.medium".to_string(),
            vpc_cidr: "10.0.0.0/16".to_string(),
            availability_zones: vec!["a".to_string(), "b".to_string(), "c".to_string()],
            karpenter_namespace: "kube-system".to_string(),
            karpenter_version: "1.6.3".to_string(),
        }
    }
}

impl Settings {
    /// Look up a setting by field name, rendered as a string (for templates).
    pub fn lookup(&self, field: &str) -> Option<String> {
        let value = match field {
            "cluster_name" => self.cluster_name.clone(),
            "region" => self.region.clone(),
            "node_count" => self.node_count.to_string(),
            "min_size" => self.min_size.to_string(),
            "max_size" => self.max_size.to_string(),
            "kubernetes_version" => self.kubernetes_version.clone(),
            "instance_type" => self.instance_type.clone(),
            "vpc_cidr" => self.vpc_cidr.clone(),
            "karpenter_namespace" => self.karpenter_namespace.clone(),
            "karpenter_version" => self.karpenter_version.clone(),
            _ => return None,
        };
        Some(value)
    }
}

// ============================================================================
// Policy
// ============================================================================

/// Execution policy.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Policy {
    /// Failure handling
    #[serde(default)]
    pub failure: FailurePolicy,

    /// Append provenance events on every run
    #[serde(default = "default_true")]
    pub tripwire: bool,

    /// Persist state after every batch
    #[serde(default = "default_true")]
    pub lock_file: bool,

    /// Retry policy for transient provider errors
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            failure: FailurePolicy::default(),
            tripwire: true,
            lock_file: true,
            retry: RetryPolicy::default(),
        }
    }
}

fn default_true() -> bool {
    true
}

/// Failure handling strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Skip only the dependents of a failed resource.
    #[default]
    ContinueIndependent,
    /// Start no further batch once a resource failed.
    StopOnFirst,
}

/// Bounded exponential backoff for transient provider errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (0-based), capped at `max_delay_ms`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let ms = (self.initial_delay_ms as f64 * factor).min(self.max_delay_ms as f64);
        Duration::from_millis(ms.max(0.0) as u64)
    }
}

// ============================================================================
// Resource kinds
// ============================================================================

/// Resource kind — the closed set of infrastructure the engine provisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Vpc,
    InternetGateway,
    RouteTable,
    Subnet,
    RouteTableAssociation,
    SecurityGroup,
    IamRole,
    IamPolicy,
    RolePolicyAttachment,
    InstanceProfile,
    EksCluster,
    NodeGroup,
    KubernetesProvider,
    Namespace,
    HelmRelease,
    /// Raw Kubernetes objects applied as one multi-document YAML group
    Manifest,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 16] = [
        Self::Vpc,
        Self::InternetGateway,
        Self::RouteTable,
        Self::Subnet,
        Self::RouteTableAssociation,
        Self::SecurityGroup,
        Self::IamRole,
        Self::IamPolicy,
        Self::RolePolicyAttachment,
        Self::InstanceProfile,
        Self::EksCluster,
        Self::NodeGroup,
        Self::KubernetesProvider,
        Self::Namespace,
        Self::HelmRelease,
        Self::Manifest,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vpc => "vpc",
            Self::InternetGateway => "internet_gateway",
            Self::RouteTable => "route_table",
            Self::Subnet => "subnet",
            Self::RouteTableAssociation => "route_table_association",
            Self::SecurityGroup => "security_group",
            Self::IamRole => "iam_role",
            Self::IamPolicy => "iam_policy",
            Self::RolePolicyAttachment => "role_policy_attachment",
            Self::InstanceProfile => "instance_profile",
            Self::EksCluster => "eks_cluster",
            Self::NodeGroup => "node_group",
            Self::KubernetesProvider => "kubernetes_provider",
            Self::Namespace => "namespace",
            Self::HelmRelease => "helm_release",
            Self::Manifest => "manifest",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Deferred values
// ============================================================================

/// Projection applied to a resolved resource result.
pub type ProjectionFn =
    Arc<dyn Fn(&serde_json::Value) -> Result<serde_json::Value, String> + Send + Sync>;

/// How a consumer derives its value from a producer's result properties.
#[derive(Clone)]
pub enum Projection {
    /// The whole result object
    Identity,
    /// A dotted path into the result object (`status.endpoint`)
    Field(String),
    /// An arbitrary transformation, labelled for display
    Custom { label: String, f: ProjectionFn },
}

impl Projection {
    pub fn custom<F>(label: impl Into<String>, f: F) -> Self
    where
        F: Fn(&serde_json::Value) -> Result<serde_json::Value, String> + Send + Sync + 'static,
    {
        Self::Custom {
            label: label.into(),
            f: Arc::new(f),
        }
    }

    /// Apply the projection to a resolved value.
    pub fn apply(&self, value: &serde_json::Value) -> Result<serde_json::Value, String> {
        match self {
            Self::Identity => Ok(value.clone()),
            Self::Field(path) => {
                let mut current = value;
                for segment in path.split('.') {
                    current = current
                        .get(segment)
                        .ok_or_else(|| format!("no field '{}' in result", path))?;
                }
                Ok(current.clone())
            }
            Self::Custom { f, .. } => f(value),
        }
    }
}

impl fmt::Debug for Projection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Identity => write!(f, "Identity"),
            Self::Field(path) => write!(f, "Field({})", path),
            Self::Custom { label, .. } => write!(f, "Custom({})", label),
        }
    }
}

/// A reference to another resource's pending result.
#[derive(Debug, Clone)]
pub struct OutputRef {
    pub resource_id: String,
    pub projection: Projection,
}

/// A property value — literal, deferred, or a collection of values.
#[derive(Debug, Clone)]
pub enum Value {
    /// A scalar known at declaration time
    Literal(serde_json::Value),
    /// Known only after the referenced resource is created
    Output(OutputRef),
    List(Vec<Value>),
    Map(IndexMap<String, Value>),
    /// Parts resolved and joined into one string
    Concat(Vec<Value>),
}

impl Value {
    /// Reference a field of another resource's result.
    pub fn output(resource_id: impl Into<String>, field: impl Into<String>) -> Self {
        Self::Output(OutputRef {
            resource_id: resource_id.into(),
            projection: Projection::Field(field.into()),
        })
    }

    /// Reference another resource's result through a projection.
    pub fn project(resource_id: impl Into<String>, projection: Projection) -> Self {
        Self::Output(OutputRef {
            resource_id: resource_id.into(),
            projection,
        })
    }

    pub fn list<I, V>(items: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self::List(items.into_iter().map(Into::into).collect())
    }

    pub fn map<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        Self::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn concat<I, V>(parts: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self::Concat(parts.into_iter().map(Into::into).collect())
    }

    /// Every output reference in this value, depth-first.
    pub fn output_refs(&self) -> Vec<&OutputRef> {
        let mut refs = Vec::new();
        self.collect_refs(&mut refs);
        refs
    }

    fn collect_refs<'a>(&'a self, refs: &mut Vec<&'a OutputRef>) {
        match self {
            Self::Literal(_) => {}
            Self::Output(r) => refs.push(r),
            Self::List(items) | Self::Concat(items) => {
                for item in items {
                    item.collect_refs(refs);
                }
            }
            Self::Map(entries) => {
                for value in entries.values() {
                    value.collect_refs(refs);
                }
            }
        }
    }

    /// True when the value contains no output references.
    pub fn is_known(&self) -> bool {
        self.output_refs().is_empty()
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Literal(serde_json::Value::String(s.to_string()))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Literal(serde_json::Value::String(s))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Literal(serde_json::Value::Bool(b))
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Literal(serde_json::Value::from(n))
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Self::Literal(serde_json::Value::from(n))
    }
}

impl From<OutputRef> for Value {
    fn from(r: OutputRef) -> Self {
        Self::Output(r)
    }
}

// ============================================================================
// Resource descriptors
// ============================================================================

/// Registration index of a descriptor inside a graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Declaration of a desired resource.
#[derive(Debug, Clone)]
pub struct ResourceDescriptor {
    /// Unique within the graph
    pub id: String,
    pub kind: ResourceKind,
    pub properties: IndexMap<String, Value>,
    /// Explicit dependencies; implicit ones come from output references
    pub depends_on: IndexSet<String>,
}

impl ResourceDescriptor {
    pub fn new(id: impl Into<String>, kind: ResourceKind) -> Self {
        Self {
            id: id.into(),
            kind,
            properties: IndexMap::new(),
            depends_on: IndexSet::new(),
        }
    }

    pub fn prop(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.depends_on.insert(id.into());
        self
    }

    /// A value referencing a field of this resource's future result.
    pub fn output(&self, field: &str) -> Value {
        Value::output(self.id.clone(), field)
    }

    /// Ids this descriptor references through output values, deduplicated.
    pub fn implicit_dependencies(&self) -> IndexSet<String> {
        self.properties
            .values()
            .flat_map(|v| v.output_refs())
            .map(|r| r.resource_id.clone())
            .collect()
    }
}

// ============================================================================
// State / Lock file
// ============================================================================

/// Persisted state lock for one stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateLock {
    /// Schema version
    pub schema: String,

    /// Stack name
    pub stack: String,

    /// When the lock was generated
    pub generated_at: String,

    /// Generator version
    pub generator: String,

    /// BLAKE3 version used for property hashes
    pub blake3_version: String,

    /// Per-resource state, in apply order
    pub resources: IndexMap<String, ResourceState>,

    /// Resolved stack exports
    #[serde(default)]
    pub outputs: IndexMap<String, ExportValue>,
}

/// Last-known state of one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceState {
    pub id: String,

    pub kind: ResourceKind,

    /// Identifier assigned by the provider
    #[serde(default)]
    pub provider_id: Option<String>,

    pub status: ResourceStatus,

    /// BLAKE3 hash of the last applied properties
    #[serde(default)]
    pub properties_hash: String,

    #[serde(default)]
    pub last_applied: serde_json::Value,

    /// Result properties returned by the provider
    #[serde(default)]
    pub outputs: serde_json::Value,

    /// Dependency ids at the time of the last apply
    #[serde(default)]
    pub dependencies: Vec<String>,

    #[serde(default)]
    pub applied_at: Option<String>,

    #[serde(default)]
    pub duration_seconds: Option<f64>,
}

impl ResourceState {
    pub fn new(id: impl Into<String>, kind: ResourceKind) -> Self {
        Self {
            id: id.into(),
            kind,
            provider_id: None,
            status: ResourceStatus::Pending,
            properties_hash: String::new(),
            last_applied: serde_json::Value::Null,
            outputs: serde_json::Value::Null,
            dependencies: Vec::new(),
            applied_at: None,
            duration_seconds: None,
        }
    }

    /// Whether the provider has an object for this resource.
    pub fn is_provisioned(&self) -> bool {
        self.provider_id.is_some() && self.status != ResourceStatus::Deleted
    }
}

/// Resource lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    Pending,
    Created,
    Failed,
    Deleted,
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Created => write!(f, "CREATED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Deleted => write!(f, "DELETED"),
        }
    }
}

/// A named stack output, resolved once apply finishes.
#[derive(Debug, Clone)]
pub struct StackExport {
    pub name: String,
    pub value: Value,
    /// Masked when displayed
    pub secret: bool,
}

impl StackExport {
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
            secret: false,
        }
    }

    pub fn secret(mut self) -> Self {
        self.secret = true;
        self
    }
}

/// A resolved stack export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportValue {
    pub value: serde_json::Value,
    #[serde(default)]
    pub secret: bool,
}

impl ExportValue {
    /// Display form; secrets are masked unless `reveal` is set.
    pub fn display(&self, reveal: bool) -> String {
        if self.secret && !reveal {
            return "[secret]".to_string();
        }
        match &self.value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

// ============================================================================
// Plan
// ============================================================================

/// Action to take on a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanAction {
    Create,
    Update,
    Delete,
    NoOp,
}

impl fmt::Display for PlanAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "CREATE"),
            Self::Update => write!(f, "UPDATE"),
            Self::Delete => write!(f, "DELETE"),
            Self::NoOp => write!(f, "NO-OP"),
        }
    }
}

/// A single planned change.
#[derive(Debug, Clone)]
pub struct PlannedChange {
    pub resource_id: String,
    pub kind: ResourceKind,
    pub action: PlanAction,
    /// Some properties depend on outputs not known before apply
    pub known_after_apply: bool,
    pub description: String,
}

/// Summary counts of a diff.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanSummary {
    pub to_create: u32,
    pub to_update: u32,
    pub to_delete: u32,
    pub unchanged: u32,
}

impl PlanSummary {
    pub fn from_changes(changes: &[PlannedChange]) -> Self {
        let mut summary = Self::default();
        for change in changes {
            match change.action {
                PlanAction::Create => summary.to_create += 1,
                PlanAction::Update => summary.to_update += 1,
                PlanAction::Delete => summary.to_delete += 1,
                PlanAction::NoOp => summary.unchanged += 1,
            }
        }
        summary
    }
}

impl fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} to add, {} to change, {} to destroy, {} unchanged",
            self.to_create, self.to_update, self.to_delete, self.unchanged
        )
    }
}

/// Direction an execution plan walks the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanDirection {
    Apply,
    Destroy,
}

/// Ordered batches; members of one batch are mutually independent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    pub direction: PlanDirection,
    pub batches: Vec<Vec<String>>,
}

impl ExecutionPlan {
    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Concatenation of all batches.
    pub fn order(&self) -> Vec<String> {
        self.batches.iter().flatten().cloned().collect()
    }

    /// Batch index holding `id`.
    pub fn batch_of(&self, id: &str) -> Option<usize> {
        self.batches
            .iter()
            .position(|batch| batch.iter().any(|member| member == id))
    }

    pub fn resource_count(&self) -> usize {
        self.batches.iter().map(Vec::len).sum()
    }
}

// ============================================================================
// Apply report
// ============================================================================

/// Why a resource was not attempted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// An upstream resource failed or was skipped
    DependencyFailed(String),
    /// The stop-on-first failure policy halted the run
    Halted,
    /// The run was cancelled
    Cancelled,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DependencyFailed(upstream) => write!(f, "dependency '{}' failed", upstream),
            Self::Halted => write!(f, "halted after earlier failure"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Terminal status of a resource after a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalStatus {
    Created,
    Updated,
    Unchanged,
    Deleted,
    Failed(String),
    Skipped(SkipReason),
}

impl TerminalStatus {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_) | Self::Skipped(_))
    }
}

impl fmt::Display for TerminalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "CREATED"),
            Self::Updated => write!(f, "UPDATED"),
            Self::Unchanged => write!(f, "UNCHANGED"),
            Self::Deleted => write!(f, "DELETED"),
            Self::Failed(e) => write!(f, "FAILED ({})", e),
            Self::Skipped(reason) => write!(f, "SKIPPED ({})", reason),
        }
    }
}

/// Outcome of one resource in a run.
#[derive(Debug, Clone)]
pub struct ResourceOutcome {
    pub resource_id: String,
    pub kind: ResourceKind,
    pub status: TerminalStatus,
    /// Provider call attempts (0 when no call was made)
    pub attempts: u32,
    pub duration: Duration,
}

/// Aggregate result of an apply or destroy run.
#[derive(Debug, Clone)]
pub struct ApplyReport {
    pub stack: String,
    pub run_id: String,
    pub direction: PlanDirection,
    pub outcomes: IndexMap<String, ResourceOutcome>,
    pub exports: IndexMap<String, ExportValue>,
    pub total_duration: Duration,
}

impl ApplyReport {
    pub fn count(&self, pred: impl Fn(&TerminalStatus) -> bool) -> usize {
        self.outcomes.values().filter(|o| pred(&o.status)).count()
    }

    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, TerminalStatus::Failed(_)))
    }

    pub fn skipped(&self) -> usize {
        self.count(|s| matches!(s, TerminalStatus::Skipped(_)))
    }

    /// Resources that ended Failed or Skipped.
    pub fn failure_count(&self) -> usize {
        self.failed() + self.skipped()
    }

    pub fn is_success(&self) -> bool {
        self.failure_count() == 0
    }

    pub fn status_of(&self, id: &str) -> Option<&TerminalStatus> {
        self.outcomes.get(id).map(|o| &o.status)
    }

    /// Convert into the aggregate error when anything failed or was skipped.
    pub fn into_result(self) -> crate::core::error::Result<ApplyReport> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(crate::core::error::EngineError::ApplyFailed {
                failed: self.failed(),
                skipped: self.skipped(),
            })
        }
    }
}

// ============================================================================
// Provenance events
// ============================================================================

/// Provenance event for the JSONL event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProvenanceEvent {
    ApplyStarted {
        stack: String,
        run_id: String,
        direction: String,
        version: String,
    },
    ResourceStarted {
        stack: String,
        resource: String,
        action: String,
    },
    ResourceApplied {
        stack: String,
        resource: String,
        action: String,
        duration_seconds: f64,
        hash: String,
    },
    ResourceFailed {
        stack: String,
        resource: String,
        error: String,
    },
    ResourceSkipped {
        stack: String,
        resource: String,
        reason: String,
    },
    ResourceDeleted {
        stack: String,
        resource: String,
        duration_seconds: f64,
    },
    ApplyCompleted {
        stack: String,
        run_id: String,
        resources_changed: u32,
        resources_unchanged: u32,
        resources_failed: u32,
        resources_skipped: u32,
        total_seconds: f64,
    },
    DriftDetected {
        stack: String,
        resource: String,
        expected_hash: String,
        actual_hash: String,
    },
}

/// Timestamped event wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampedEvent {
    pub ts: String,
    #[serde(flatten)]
    pub event: ProvenanceEvent,
}

// ============================================================================
// Template helper
// ============================================================================

/// Convert a serde_yaml_ng::Value to a string for template resolution.
pub fn yaml_value_to_string(val: &serde_yaml_ng::Value) -> String {
    match val {
        serde_yaml_ng::Value::String(s) => s.clone(),
        serde_yaml_ng::Value::Number(n) => n.to_string(),
        serde_yaml_ng::Value::Bool(b) => b.to_string(),
        serde_yaml_ng::Value::Null => String::new(),
        other => format!("{:?}", other),
    }
}

// ============================================================================
// Tests
// ============================================================================
