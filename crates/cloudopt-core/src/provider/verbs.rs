//! Generic action kinds → vendor verbs, per resource kind.

use crate::types::{ActionKind, ResourceKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderCall {
    /// `ProviderAdapter::execute_action` with this verb.
    Execute(&'static str),
    /// `ProviderAdapter::tag_resource`.
    Tag,
}

/// Resolve the provider call for `action` on a resource of `kind`. Every
/// pair is listed; the ones without a vendor verb use the action's own name.
pub fn resolve(kind: Option<&ResourceKind>, action: ActionKind) -> ProviderCall {
    use ActionKind::*;
    use ResourceKind::*;

    let generic = action.as_str();
    let verb = match action {
        AddTags => return ProviderCall::Tag,
        PurchaseReservation | InvestigateCost | OptimizeResource => generic,
        StartResource => match kind {
            Some(Ec2Instance | RdsInstance | ComputeInstance) => "start_instance",
            Some(VirtualMachine) => "start_vm",
            Some(S3Bucket | StorageAccount | StorageBucket | Other(_)) | None => generic,
        },
        StopResource => match kind {
            Some(Ec2Instance | RdsInstance | ComputeInstance) => "stop_instance",
            Some(VirtualMachine) => "stop_vm",
            Some(S3Bucket | StorageAccount | StorageBucket | Other(_)) | None => generic,
        },
        ResizeResource => match kind {
            Some(Ec2Instance | RdsInstance | ComputeInstance) => "resize_instance",
            Some(VirtualMachine) => "resize_vm",
            Some(S3Bucket | StorageAccount | StorageBucket | Other(_)) | None => generic,
        },
        DeleteResource => match kind {
            Some(Ec2Instance) => "terminate_instance",
            Some(RdsInstance | ComputeInstance) => "delete_instance",
            Some(VirtualMachine) => "delete_vm",
            Some(S3Bucket | StorageBucket) => "delete_bucket",
            Some(StorageAccount) => "delete_storage_account",
            Some(Other(_)) | None => generic,
        },
        OptimizeStorage => match kind {
            Some(S3Bucket) => "update_lifecycle",
            Some(StorageAccount) => "update_tier",
            Some(StorageBucket) => "update_storage_class",
            Some(Ec2Instance | RdsInstance | VirtualMachine | ComputeInstance | Other(_)) | None => {
                generic
            }
        },
    };
    ProviderCall::Execute(verb)
}

/// The verb an idle VM of `kind` would be stopped with.
pub fn stop_verb(kind: &ResourceKind) -> &'static str {
    match resolve(Some(kind), ActionKind::StopResource) {
        ProviderCall::Execute(verb) => verb,
        ProviderCall::Tag => ActionKind::StopResource.as_str(),
    }
}
