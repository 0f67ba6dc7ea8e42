mod plan;
mod registry;
mod step;

pub use plan::{registry_from_plans, StepPlan};
pub use registry::{ChainEnd, ChainWalk, Lookup, UpgradeRegistry, UpgradeRegistryBuilder};
pub use step::{StepContext, StepFn, UpgradeStep};
