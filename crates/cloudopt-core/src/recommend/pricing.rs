//! Static on-demand monthly prices (USD) used to size idle-resource savings.

use rust_decimal::Decimal;

use crate::provider::Resource;
use crate::types::ResourceKind;

/// (type, cents per month)
const EC2_PRICES: &[(&str, i64)] = &[
    ("t3.nano", 380),
    ("t3.micro", 759),
    ("t3.small", 1518),
    ("t3.medium", 3037),
    ("t3.large", 6074),
    ("t3.xlarge", 12147),
    ("m5.large", 7008),
    ("m5.xlarge", 14016),
    ("m5.2xlarge", 28032),
    ("c5.large", 6205),
    ("c5.xlarge", 12410),
    ("r5.large", 9198),
];

const AZURE_VM_PRICES: &[(&str, i64)] = &[
    ("Standard_B1s", 759),
    ("Standard_B1ms", 1518),
    ("Standard_B2s", 3037),
    ("Standard_B2ms", 6074),
    ("Standard_D2s_v3", 7008),
    ("Standard_D4s_v3", 14016),
    ("Standard_E2s_v3", 9198),
];

const GCE_PRICES: &[(&str, i64)] = &[
    ("e2-micro", 611),
    ("e2-small", 1223),
    ("e2-medium", 2446),
    ("e2-standard-2", 4892),
    ("n1-standard-1", 2427),
    ("n1-standard-2", 4855),
    ("n2-standard-2", 5672),
];

const EC2_UNKNOWN: i64 = 3000;
const AZURE_VM_UNKNOWN: i64 = 4000;
const GCE_UNKNOWN: i64 = 3000;
const OTHER_UNKNOWN: i64 = 1000;

fn lookup(table: &[(&str, i64)], key: &str, unknown: i64) -> Decimal {
    let cents = table
        .iter()
        .find(|(name, _)| *name == key)
        .map(|(_, cents)| *cents)
        .unwrap_or(unknown);
    Decimal::new(cents, 2)
}

/// Estimated monthly cost of keeping `resource` running. Resources without
/// a size attribute are priced as the smallest size of their family.
pub fn monthly_price(resource: &Resource) -> Decimal {
    match resource.kind {
        ResourceKind::Ec2Instance => lookup(
            EC2_PRICES,
            resource.property_str("instance_type").unwrap_or("t3.micro"),
            EC2_UNKNOWN,
        ),
        ResourceKind::VirtualMachine => lookup(
            AZURE_VM_PRICES,
            resource.property_str("vm_size").unwrap_or("Standard_B1s"),
            AZURE_VM_UNKNOWN,
        ),
        ResourceKind::ComputeInstance => lookup(
            GCE_PRICES,
            resource.property_str("machine_type").unwrap_or("e2-micro"),
            GCE_UNKNOWN,
        ),
        _ => Decimal::new(OTHER_UNKNOWN, 2),
    }
}
