//! Custom Resource Definitions for Windrose

mod conditions;
mod machine_config;

pub use conditions::{merge_conditions, Condition, ConditionStatus, ConditionType};
pub use machine_config::{
    AwsSpec, WindowsMachineConfig, WindowsMachineConfigSpec, WindowsMachineConfigStatus,
};
