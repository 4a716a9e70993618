//! Catalog of simulated resource kinds

use serde_json::{Value as Json, json};

/// One simulated resource type
#[derive(Debug)]
pub struct Kind {
    pub resource_type: &'static str,
    /// Prefix of generated ids (`vpc-0a1b...`)
    pub id_prefix: &'static str,
    /// Inputs that must be present on create and update
    pub required: &'static [&'static str],
    /// Inputs that cannot change in place
    pub force_new: &'static [&'static str],
    /// Outputs the cloud fills in
    pub computed: &'static [&'static str],
    /// Input that must be unique among live objects of this kind
    pub unique: Option<&'static str>,
}

pub const KINDS: &[Kind] = &[
    Kind {
        resource_type: "aws_vpc",
        id_prefix: "vpc",
        required: &["cidr_block"],
        force_new: &["cidr_block", "instance_tenancy"],
        computed: &["arn", "default_security_group_id", "main_route_table_id"],
        unique: None,
    },
    Kind {
        resource_type: "aws_subnet",
        id_prefix: "subnet",
        required: &["vpc_id", "cidr_block"],
        force_new: &["vpc_id", "cidr_block", "availability_zone"],
        computed: &["arn", "availability_zone"],
        unique: None,
    },
    Kind {
        resource_type: "aws_internet_gateway",
        id_prefix: "igw",
        required: &["vpc_id"],
        force_new: &[],
        computed: &["arn"],
        unique: None,
    },
    Kind {
        resource_type: "aws_nat_gateway",
        id_prefix: "nat",
        required: &["subnet_id"],
        force_new: &["subnet_id", "connectivity_type"],
        computed: &["public_ip", "network_interface_id"],
        unique: None,
    },
    Kind {
        resource_type: "aws_security_group",
        id_prefix: "sg",
        required: &["name", "vpc_id"],
        force_new: &["name", "vpc_id"],
        computed: &["arn", "owner_id"],
        unique: Some("name"),
    },
    Kind {
        resource_type: "aws_iam_role",
        id_prefix: "AROA",
        required: &["name", "assume_role_policy"],
        force_new: &["name"],
        computed: &["arn", "unique_id"],
        unique: Some("name"),
    },
    Kind {
        resource_type: "aws_iam_role_policy_attachment",
        id_prefix: "attach",
        required: &["role", "policy_arn"],
        force_new: &["role", "policy_arn"],
        computed: &[],
        unique: None,
    },
    Kind {
        resource_type: "aws_eks_cluster",
        id_prefix: "eks",
        required: &["name", "role_arn", "subnet_ids"],
        force_new: &["name", "role_arn", "subnet_ids"],
        computed: &["arn", "endpoint", "certificate_authority", "oidc_issuer", "status"],
        unique: Some("name"),
    },
    Kind {
        resource_type: "aws_eks_node_group",
        id_prefix: "ng",
        required: &["cluster_name", "node_group_name", "node_role_arn", "subnet_ids"],
        force_new: &["cluster_name", "node_group_name", "node_role_arn", "subnet_ids", "instance_types"],
        computed: &["arn", "status"],
        unique: Some("node_group_name"),
    },
    Kind {
        resource_type: "aws_eks_addon",
        id_prefix: "addon",
        required: &["cluster_name", "addon_name"],
        force_new: &["cluster_name", "addon_name"],
        computed: &["arn", "addon_version"],
        unique: None,
    },
    Kind {
        resource_type: "aws_efs_file_system",
        id_prefix: "fs",
        required: &[],
        force_new: &["creation_token", "encrypted", "performance_mode"],
        computed: &["arn", "dns_name"],
        unique: Some("creation_token"),
    },
    Kind {
        resource_type: "aws_efs_mount_target",
        id_prefix: "fsmt",
        required: &["file_system_id", "subnet_id"],
        force_new: &["file_system_id", "subnet_id"],
        computed: &["ip_address", "dns_name"],
        unique: None,
    },
    Kind {
        resource_type: "aws_secretsmanager_secret",
        id_prefix: "secret",
        required: &["name"],
        force_new: &["name"],
        computed: &["arn"],
        unique: Some("name"),
    },
    Kind {
        resource_type: "aws_instance",
        id_prefix: "i",
        required: &["ami", "instance_type"],
        force_new: &["ami", "subnet_id"],
        computed: &["arn", "private_ip", "public_ip", "public_dns"],
        unique: None,
    },
    Kind {
        resource_type: "aws_sagemaker_model",
        id_prefix: "model",
        required: &["name", "execution_role_arn", "primary_container"],
        force_new: &["name", "execution_role_arn", "primary_container"],
        computed: &["arn"],
        unique: Some("name"),
    },
    Kind {
        resource_type: "aws_sagemaker_endpoint_configuration",
        id_prefix: "epc",
        required: &["name", "production_variants"],
        force_new: &["name", "production_variants"],
        computed: &["arn"],
        unique: Some("name"),
    },
    Kind {
        resource_type: "aws_sagemaker_endpoint",
        id_prefix: "ep",
        required: &["name", "endpoint_config_name"],
        force_new: &["name"],
        computed: &["arn", "endpoint_url"],
        unique: Some("name"),
    },
    Kind {
        resource_type: "helm_release",
        id_prefix: "release",
        required: &["name", "chart"],
        force_new: &["name", "namespace"],
        computed: &["status", "revision"],
        unique: Some("name"),
    },
    Kind {
        resource_type: "kubernetes_namespace",
        id_prefix: "ns",
        required: &["name"],
        force_new: &["name"],
        computed: &["uid"],
        unique: Some("name"),
    },
];

pub const REGION: &str = "us-east-1";
pub const ACCOUNT: &str = "123456789012";

/// Value the cloud assigns to a computed output.
///
/// `previous` is the value from before an update, if any.
pub fn computed_value(kind: &Kind, attribute: &str, id: &str, name: Option<&str>, previous: Option<&Json>) -> Json {
    let digest = blake3::hash(format!("{id}/{attribute}").as_bytes());
    let hex = digest.to_hex();
    let bytes = digest.as_bytes();
    let label = name.unwrap_or(id);

    match attribute {
        "arn" => json!(format!(
            "arn:aws:{}:{REGION}:{ACCOUNT}:{}/{label}",
            service(kind.resource_type),
            kind.id_prefix
        )),
        "endpoint" => json!(format!("https://{}.gr7.{REGION}.eks.amazonaws.com", &hex[..32])),
        "oidc_issuer" => json!(format!("https://oidc.eks.{REGION}.amazonaws.com/id/{}", &hex[..32])),
        "endpoint_url" => json!(format!(
            "https://runtime.sagemaker.{REGION}.amazonaws.com/endpoints/{label}/invocations"
        )),
        "dns_name" => json!(format!("{id}.efs.{REGION}.amazonaws.com")),
        "public_dns" => json!(format!("ec2-{}.compute-1.amazonaws.com", &hex[..12])),
        "private_ip" | "ip_address" => json!(format!("10.0.{}.{}", bytes[0], bytes[1].max(4))),
        "public_ip" => json!(format!("54.{}.{}.{}", bytes[0], bytes[1], bytes[2].max(1))),
        "availability_zone" => json!(format!("{REGION}{}", ['a', 'b', 'c'][usize::from(bytes[0]) % 3])),
        "status" if kind.resource_type == "helm_release" => json!("deployed"),
        "status" => json!("ACTIVE"),
        "revision" => json!(previous.and_then(Json::as_u64).map_or(1, |r| r + 1)),
        "addon_version" => json!("v2.1.0-eksbuild.1"),
        "owner_id" => json!(ACCOUNT),
        _ => json!(format!("{}-{}", attribute.replace('_', "-"), &hex[..17])),
    }
}

fn service(resource_type: &str) -> &str {
    let rest = resource_type.strip_prefix("aws_").unwrap_or(resource_type);
    match rest.split('_').next() {
        Some("vpc" | "subnet" | "internet" | "nat" | "security" | "instance") => "ec2",
        Some("efs") => "elasticfilesystem",
        Some("secretsmanager") => "secretsmanager",
        Some(other) => other,
        None => rest,
    }
}

#[cfg(test)]
pub fn find(resource_type: &str) -> Option<&'static Kind> {
    KINDS.iter().find(|k| k.resource_type == resource_type)
}
