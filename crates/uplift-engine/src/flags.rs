use serde::Serialize;
use uplift_store::InstanceState;

use crate::MaintenanceAction;

/// Maintenance obligations recorded by upgrade steps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceFlags {
    pub needs_reindex: bool,
    pub needs_role_remap: bool,
}

impl MaintenanceFlags {
    pub fn load(state: &InstanceState) -> Self {
        Self {
            needs_reindex: state.needs_reindex,
            needs_role_remap: state.needs_role_remap,
        }
    }

    pub fn is_set(state: &InstanceState, action: MaintenanceAction) -> bool {
        match action {
            MaintenanceAction::Reindex => state.needs_reindex,
            MaintenanceAction::RoleRemap => state.needs_role_remap,
        }
    }

    pub fn clear(state: &mut InstanceState, action: MaintenanceAction) {
        match action {
            MaintenanceAction::Reindex => state.needs_reindex = false,
            MaintenanceAction::RoleRemap => state.needs_role_remap = false,
        }
    }
}
