//! Public VPC: internet gateway, default route, one subnet per availability zone.

use super::StackBuilder;
use crate::core::error::{EngineError, Result};
use crate::core::types::{ResourceDescriptor, ResourceKind, Value};
use std::net::Ipv4Addr;

/// Ids of the network resources later layers reference.
#[derive(Debug, Clone)]
pub struct Network {
    pub vpc: String,
    pub route_table: String,
    pub subnets: Vec<String>,
}

pub(crate) fn build(b: &mut StackBuilder<'_>) -> Result<Network> {
    let settings = b.settings;
    let cluster_name = settings.cluster_name.clone();

    let vpc_name = b.name("vpc");
    let vpc = b.add(
        ResourceDescriptor::new(&vpc_name, ResourceKind::Vpc)
            .prop("cidr_block", settings.vpc_cidr.as_str())
            .prop("enable_dns_hostnames", true)
            .prop("enable_dns_support", true)
            .prop("tags", b.tags(&vpc_name, &[])),
    )?;

    let igw_name = b.name("igw");
    let igw = b.add(
        ResourceDescriptor::new(&igw_name, ResourceKind::InternetGateway)
            .prop("vpc_id", Value::output(&vpc, "id"))
            .prop("tags", b.tags(&igw_name, &[])),
    )?;

    let rt_name = b.name("public-rt");
    let route_table = b.add(
        ResourceDescriptor::new(&rt_name, ResourceKind::RouteTable)
            .prop("vpc_id", Value::output(&vpc, "id"))
            .prop(
                "routes",
                Value::list([Value::map([
                    ("cidr_block", Value::from("0.0.0.0/0")),
                    ("gateway_id", Value::output(&igw, "id")),
                ])]),
            )
            .prop("tags", b.tags(&rt_name, &[])),
    )?;

    let owned = format!("kubernetes.io/cluster/{}", cluster_name);
    let mut subnets = Vec::with_capacity(settings.availability_zones.len());
    for (i, az) in settings.availability_zones.iter().enumerate() {
        let subnet_name = b.name(&format!("public-subnet-{}", az));
        let subnet = b.add(
            ResourceDescriptor::new(&subnet_name, ResourceKind::Subnet)
                .prop("vpc_id", Value::output(&vpc, "id"))
                .prop("cidr_block", subnet_cidr(&settings.vpc_cidr, i)?)
                .prop("availability_zone", format!("{}{}", settings.region, az))
                .prop("map_public_ip_on_launch", true)
                .prop(
                    "tags",
                    b.tags(
                        &subnet_name,
                        &[("kubernetes.io/role/elb", "1"), (owned.as_str(), "owned")],
                    ),
                ),
        )?;

        b.add(
            ResourceDescriptor::new(b.name(&format!("public-rta-{}", az)), ResourceKind::RouteTableAssociation)
                .prop("subnet_id", Value::output(&subnet, "id"))
                .prop("route_table_id", Value::output(&route_table, "id")),
        )?;
        subnets.push(subnet);
    }

    Ok(Network {
        vpc,
        route_table,
        subnets,
    })
}

/// The `index`-th /24 inside the VPC block, starting at `x.y.1.0/24`.
fn subnet_cidr(vpc_cidr: &str, index: usize) -> Result<String> {
    let invalid = || EngineError::Config(format!("settings.vpc_cidr '{}' is not an IPv4 CIDR", vpc_cidr));
    let (addr, _prefix) = vpc_cidr.split_once('/').ok_or_else(invalid)?;
    let addr: Ipv4Addr = addr.parse().map_err(|_| invalid())?;
    let third = index + 1;
    if third > 255 {
        return Err(EngineError::Config(format!(
            "too many availability zones for {}",
            vpc_cidr
        )));
    }
    let [a, b, _, _] = addr.octets();
    Ok(format!("{}.{}.{}.0/24", a, b, third))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subnet_cidr() {
        assert_eq!(subnet_cidr("10.0.0.0/16", 0).unwrap(), "10.0.1.0/24");
        assert_eq!(subnet_cidr("10.0.0.0/16", 2).unwrap(), "10.0.3.0/24");
        assert_eq!(subnet_cidr("172.31.0.0/16", 1).unwrap(), "172.31.2.0/24");
        assert!(subnet_cidr("not-a-cidr", 0).is_err());
        assert!(subnet_cidr("10.0.0.0/16", 255).is_err());
    }
}
