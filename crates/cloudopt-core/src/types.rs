use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::CloudoptError;

/// Declares a closed string enum with a stable snake_case wire name per
/// variant, plus `as_str`, `all`, `Display` and `FromStr`.
macro_rules! str_enum {
    (
        $(#[$meta:meta])*
        $name:ident ($what:literal) {
            $($variant:ident => $s:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $s)] $variant),+
        }

        impl $name {
            pub fn all() -> &'static [$name] {
                &[$($name::$variant),+]
            }

            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $s),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = CloudoptError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok($name::$variant),)+
                    _ => Err(CloudoptError::Validation(format!(
                        "unknown {} '{}'",
                        $what, s
                    ))),
                }
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Recommendations
// ---------------------------------------------------------------------------

str_enum! {
    RecommendationType ("recommendation type") {
        Resize => "resize",
        Idle => "idle",
        Delete => "delete",
        Reservation => "reservation",
        MissingTags => "missing_tags",
        CostAnomaly => "cost_anomaly",
        General => "general",
    }
}

impl RecommendationType {
    /// Normalize a provider-native recommendation type. Unmapped types fall
    /// back to `General`.
    pub fn from_provider(provider_type: &str) -> Self {
        match provider_type.to_ascii_lowercase().as_str() {
            "rightsizing" | "machine_type" => Self::Resize,
            "reservation" => Self::Reservation,
            "idle" => Self::Idle,
            "azure_advisor" => Self::General,
            _ => Self::General,
        }
    }

    /// The remediation an action created from this recommendation performs.
    pub fn action_kind(self) -> ActionKind {
        match self {
            Self::Resize => ActionKind::ResizeResource,
            Self::Idle => ActionKind::StopResource,
            Self::Delete => ActionKind::DeleteResource,
            Self::Reservation => ActionKind::PurchaseReservation,
            Self::MissingTags => ActionKind::AddTags,
            Self::CostAnomaly => ActionKind::InvestigateCost,
            Self::General => ActionKind::OptimizeResource,
        }
    }
}

str_enum! {
    /// Transitions: `Open → Applied | Dismissed | Expired`. Never re-opened.
    RecommendationStatus ("recommendation status") {
        Open => "open",
        Applied => "applied",
        Dismissed => "dismissed",
        Expired => "expired",
    }
}

impl RecommendationStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Open)
    }
}

str_enum! {
    Priority ("priority") {
        High => "high",
        Medium => "medium",
        Low => "low",
    }
}

str_enum! {
    SavingsPeriod ("savings period") {
        Monthly => "monthly",
        Yearly => "yearly",
    }
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

str_enum! {
    /// Provider-independent remediation verbs. `provider::verbs` maps these
    /// onto vendor verbs per resource kind.
    ActionKind ("action type") {
        StartResource => "start_resource",
        StopResource => "stop_resource",
        ResizeResource => "resize_resource",
        DeleteResource => "delete_resource",
        PurchaseReservation => "purchase_reservation",
        AddTags => "add_tags",
        InvestigateCost => "investigate_cost",
        OptimizeResource => "optimize_resource",
        OptimizeStorage => "optimize_storage",
    }
}

str_enum! {
    /// Lifecycle of an `Action`.
    ///
    /// Transitions: `Pending → InProgress → Completed | Failed`,
    /// `Failed → InProgress` (bounded retry), `Pending | Failed → Cancelled`.
    ActionStatus ("action status") {
        Pending => "pending",
        InProgress => "in_progress",
        Completed => "completed",
        Failed => "failed",
        Cancelled => "cancelled",
    }
}

impl ActionStatus {
    pub fn can_transition_to(self, target: ActionStatus) -> bool {
        use ActionStatus::*;
        matches!(
            (self, target),
            (Pending, InProgress)
                | (Pending, Cancelled)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (Failed, InProgress)
                | (Failed, Cancelled)
        )
    }

    pub fn is_executable(self) -> bool {
        matches!(self, Self::Pending | Self::Failed)
    }
}

str_enum! {
    /// Transitions: `Pending → Approved | Rejected`.
    ApprovalStatus ("approval status") {
        Pending => "pending",
        Approved => "approved",
        Rejected => "rejected",
    }
}

str_enum! {
    /// Status of one execution attempt (action or workflow run).
    ExecutionStatus ("execution status") {
        InProgress => "in_progress",
        Completed => "completed",
        Failed => "failed",
        Cancelled => "cancelled",
    }
}

impl ExecutionStatus {
    pub fn is_finished(self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

// ---------------------------------------------------------------------------
// Workflows
// ---------------------------------------------------------------------------

str_enum! {
    TriggerType ("trigger type") {
        Manual => "manual",
        Scheduled => "scheduled",
        Event => "event",
    }
}

str_enum! {
    WorkflowStatus ("workflow status") {
        Active => "active",
        Inactive => "inactive",
        Archived => "archived",
    }
}

// ---------------------------------------------------------------------------
// ResourceKind
// ---------------------------------------------------------------------------

/// Cloud resource kinds the engines know how to act on. Anything else is
/// carried through verbatim as `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ResourceKind {
    Ec2Instance,
    RdsInstance,
    S3Bucket,
    VirtualMachine,
    StorageAccount,
    ComputeInstance,
    StorageBucket,
    Other(String),
}

impl ResourceKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Ec2Instance => "ec2_instance",
            Self::RdsInstance => "rds_instance",
            Self::S3Bucket => "s3_bucket",
            Self::VirtualMachine => "virtual_machine",
            Self::StorageAccount => "storage_account",
            Self::ComputeInstance => "compute_instance",
            Self::StorageBucket => "storage_bucket",
            Self::Other(s) => s,
        }
    }

    /// Virtual machines across vendors: the kinds idle detection samples.
    pub fn is_compute(&self) -> bool {
        matches!(
            self,
            Self::Ec2Instance | Self::VirtualMachine | Self::ComputeInstance
        )
    }
}

impl From<String> for ResourceKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "ec2_instance" => Self::Ec2Instance,
            "rds_instance" => Self::RdsInstance,
            "s3_bucket" => Self::S3Bucket,
            "virtual_machine" => Self::VirtualMachine,
            "storage_account" => Self::StorageAccount,
            "compute_instance" => Self::ComputeInstance,
            "storage_bucket" => Self::StorageBucket,
            _ => Self::Other(s),
        }
    }
}

impl From<&str> for ResourceKind {
    fn from(s: &str) -> Self {
        Self::from(s.to_string())
    }
}

impl From<ResourceKind> for String {
    fn from(kind: ResourceKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
