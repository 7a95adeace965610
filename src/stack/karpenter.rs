//! Karpenter: Kubernetes provider, optional namespace, CRD and controller
//! charts, and the default EC2NodeClass/NodePool.

use super::cluster::Cluster;
use super::iam::ControllerRole;
use super::{interpolate, StackBuilder};
use crate::core::error::Result;
use crate::core::types::{ResourceDescriptor, ResourceKind, Value};

const CRD_CHART: &str = "oci://public.ecr.aws/karpenter/karpenter-crd";
const CONTROLLER_CHART: &str = "oci://public.ecr.aws/karpenter/karpenter";

/// Namespace that exists on every cluster and is never managed here.
const SYSTEM_NAMESPACE: &str = "kube-system";

/// Default node class and pool; `@CLUSTER@` and `@ROLE@` are filled after apply.
const NODE_CONFIG: &str = r#"apiVersion: karpenter.k8s.aws/v1
kind: EC2NodeClass
metadata:
  name: default
spec:
  role: "@ROLE@"
  amiSelectorTerms:
    - alias: al2023@latest
  subnetSelectorTerms:
    - tags:
        kubernetes.io/cluster/@CLUSTER@: owned
  securityGroupSelectorTerms:
    - tags:
        karpenter.sh/discovery: "@CLUSTER@"
---
apiVersion: karpenter.sh/v1
kind: NodePool
metadata:
  name: default
spec:
  template:
    spec:
      nodeClassRef:
        group: karpenter.k8s.aws
        kind: EC2NodeClass
        name: default
      requirements:
        - key: kubernetes.io/arch
          operator: In
          values: ["amd64"]
        - key: karpenter.sh/capacity-type
          operator: In
          values: ["on-demand", "spot"]
  limits:
    cpu: 100
  disruption:
    consolidationPolicy: WhenEmptyOrUnderutilized
    consolidateAfter: 1m
"#;

fn controller_resources() -> Value {
    let limits = || Value::map([("cpu", "1"), ("memory", "1Gi")]);
    Value::map([("requests", limits()), ("limits", limits())])
}

pub(crate) fn build(
    b: &mut StackBuilder<'_>,
    eks: &Cluster,
    controller: &ControllerRole,
    node_role: &str,
) -> Result<String> {
    let settings = b.settings;

    let provider = b.add(
        ResourceDescriptor::new(b.name("k8s"), ResourceKind::KubernetesProvider)
            .prop("kubeconfig", Value::output(&eks.cluster, "kubeconfig")),
    )?;

    let namespace = if settings.karpenter_namespace == SYSTEM_NAMESPACE {
        Value::from(SYSTEM_NAMESPACE)
    } else {
        let ns = b.add(
            ResourceDescriptor::new(
                b.name(&format!("{}-namespace", settings.karpenter_namespace)),
                ResourceKind::Namespace,
            )
            .prop("name", settings.karpenter_namespace.as_str())
            .prop("provider", Value::output(&provider, "id")),
        )?;
        Value::output(ns, "name")
    };

    let crds = b.add(
        ResourceDescriptor::new(b.name("karpenter-crds"), ResourceKind::HelmRelease)
            .prop("name", "karpenter-crd")
            .prop("chart", CRD_CHART)
            .prop("version", settings.karpenter_version.as_str())
            .prop("namespace", namespace.clone())
            .prop("provider", Value::output(&provider, "id"))
            .prop("skip_crds", false),
    )?;

    let values = Value::map([
        (
            "serviceAccount",
            Value::map([
                ("name", Value::from("karpenter")),
                (
                    "annotations",
                    Value::map([(
                        "eks.amazonaws.com/role-arn",
                        Value::output(&controller.role, "arn"),
                    )]),
                ),
            ]),
        ),
        (
            "settings",
            Value::map([
                ("clusterName", Value::output(&eks.cluster, "name")),
                ("clusterEndpoint", Value::output(&eks.cluster, "endpoint")),
            ]),
        ),
        (
            "controller",
            Value::map([("resources", controller_resources())]),
        ),
    ]);

    // pods need schedulable nodes and a role that already carries its policy
    let release = b.add(
        ResourceDescriptor::new(b.name("karpenter"), ResourceKind::HelmRelease)
            .prop("name", "karpenter")
            .prop("chart", CONTROLLER_CHART)
            .prop("version", settings.karpenter_version.as_str())
            .prop("namespace", namespace)
            .prop("provider", Value::output(&provider, "id"))
            .prop("skip_crds", true)
            .prop("values", values)
            .depends_on(crds)
            .depends_on(&eks.node_group)
            .depends_on(&controller.attachment),
    )?;

    // the NodePool CRDs and their webhook come with the charts
    let yaml = interpolate(
        NODE_CONFIG,
        &[
            ("@CLUSTER@", Value::output(&eks.cluster, "name")),
            ("@ROLE@", Value::output(node_role, "name")),
        ],
    );
    b.add(
        ResourceDescriptor::new(b.name("karpenter-node-config"), ResourceKind::Manifest)
            .prop("name", "karpenter-node-config")
            .prop("yaml", yaml)
            .prop("provider", Value::output(&provider, "id"))
            .depends_on(release),
    )
}
