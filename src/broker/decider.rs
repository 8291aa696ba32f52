//! Classifies an update request as a plan/parameter update or a maintenance
//! info upgrade. Doing both at once is refused.

use crate::error::BrokerError;
use crate::executor::TfVersion;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Update,
    Upgrade,
}

/// The parts of an update request the decision depends on.
#[derive(Debug, Clone, Default)]
pub struct UpdateRequest {
    pub has_params: bool,
    pub plan_id: String,
    pub previous_plan_id: String,
    pub maintenance_info: Option<TfVersion>,
    pub previous_maintenance_info: Option<TfVersion>,
}

const UPGRADE_BEFORE_UPDATE: &str = "service instance needs to be upgraded before updating";

/// `service_mi` is the maintenance info version of the requested plan.
///
/// The platform sends only the fields it means to change but always sends
/// previous values, so a missing maintenance info means "unchanged" unless the
/// plan has dropped its maintenance info altogether.
pub fn decide_operation(service_mi: Option<&TfVersion>, req: &UpdateRequest) -> Result<Operation, BrokerError> {
    let has_mi = req.maintenance_info.is_some();
    let has_previous_mi = req.previous_maintenance_info.is_some();
    let has_plan_change = !req.plan_id.is_empty() && req.plan_id != req.previous_plan_id;
    let has_update = req.has_params || has_plan_change;

    let mi_changed = req.maintenance_info != req.previous_maintenance_info;
    let update_with_mi_change = has_update && has_mi && mi_changed;
    let update_with_mi_removal = has_update && !has_mi && has_previous_mi && service_mi.is_none();

    if has_mi && service_mi.is_none() {
        return Err(BrokerError::Unprocessable {
            error: "MaintenanceInfoConflict".to_string(),
            description: "maintenance_info was passed, but the broker catalog contains no maintenance_info".to_string(),
        });
    }
    if has_mi && service_mi != req.maintenance_info.as_ref() {
        return Err(BrokerError::maintenance_info_conflict());
    }
    if update_with_mi_change || update_with_mi_removal {
        return Err(BrokerError::Unprocessable {
            error: "previous-maintenance-info-check".to_string(),
            description: UPGRADE_BEFORE_UPDATE.to_string(),
        });
    }
    if !has_mi && !has_update && service_mi.is_none() && has_previous_mi {
        return Ok(Operation::Upgrade);
    }
    if has_mi && !has_update && mi_changed {
        return Ok(Operation::Upgrade);
    }
    if !has_mi && service_mi != req.previous_maintenance_info.as_ref() {
        return Err(BrokerError::maintenance_info_conflict());
    }
    Ok(Operation::Update)
}
