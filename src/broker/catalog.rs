//! The OSBAPI catalog assembled from every registered offering.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::brokerpak::reader::unique_across_services;
use crate::brokerpak::registrar::maintenance_info;
use crate::brokerpak::{MaintenanceInfo, RegisteredService, ServiceDefinition, ServicePlan};
use crate::config::Config;
use crate::error::BrokerError;

/// Registered offerings with their final plan lists.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    services: Vec<RegisteredService>,
}

impl Catalog {
    /// Merge user plans into each offering, synthesise a `default` plan where
    /// none are left, and reject plan ids that are not globally unique.
    pub fn build(services: Vec<RegisteredService>, config: &Config) -> Result<Self> {
        let mut out = Vec::with_capacity(services.len());
        for mut svc in services {
            let mut def = (*svc.definition).clone();
            let mi = config
                .flags
                .tf_upgrades
                .then(|| maintenance_info(&svc.binaries.default_version));

            if let Some(raw) = config.user_plans_for(&def.name) {
                let mut user = user_plans(raw).with_context(|| format!("invalid user plans for {}", def.name))?;
                for plan in &mut user {
                    plan.maintenance_info = mi.clone();
                }
                def.plans.extend(user);
            }
            if def.plans.is_empty() {
                tracing::info!(service = %def.name, "no plans defined, synthesising default plan");
                def.plans.push(default_plan(&def, mi));
            }

            svc.definition = Arc::new(def);
            out.push(svc);
        }

        let definitions: Vec<ServiceDefinition> = out.iter().map(|s| (*s.definition).clone()).collect();
        unique_across_services(&definitions).into_result()?;
        Ok(Self { services: out })
    }

    pub fn services(&self) -> &[RegisteredService] {
        &self.services
    }

    pub fn service(&self, service_id: &str) -> Result<&RegisteredService, BrokerError> {
        self.services
            .iter()
            .find(|s| s.definition.id == service_id)
            .ok_or_else(|| BrokerError::Validation(format!("unknown service ID: {service_id:?}")))
    }

    pub fn plan<'a>(&'a self, service: &'a RegisteredService, plan_id: &str) -> Result<&'a ServicePlan, BrokerError> {
        service
            .definition
            .plans
            .iter()
            .find(|p| p.id == plan_id)
            .ok_or_else(|| BrokerError::Validation(format!("plan ID {plan_id:?} could not be found")))
    }

    /// The `GET /v2/catalog` body.
    pub fn to_osb(&self) -> OsbCatalog {
        OsbCatalog {
            services: self.services.iter().map(|s| OsbService::from(&*s.definition)).collect(),
        }
    }
}

fn user_plans(raw: &str) -> Result<Vec<ServicePlan>> {
    let items: Vec<Map<String, Value>> = serde_json::from_str(raw).context("plans must be a JSON list of objects")?;
    items.iter().map(ServicePlan::from_user_json).collect()
}

/// A plan whose id is derived from the offering id, so it is stable across restarts.
fn default_plan(def: &ServiceDefinition, mi: Option<MaintenanceInfo>) -> ServicePlan {
    ServicePlan {
        name: "default".into(),
        id: Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("{}/default", def.id).as_bytes()).to_string(),
        description: format!("Default plan for {}", def.display_name),
        display_name: "default".into(),
        free: false,
        maintenance_info: mi,
        ..Default::default()
    }
}

// ─── Wire format ────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct OsbCatalog {
    pub services: Vec<OsbService>,
}

#[derive(Debug, Serialize)]
pub struct OsbService {
    pub id: String,
    pub name: String,
    pub description: String,
    pub bindable: bool,
    pub plan_updateable: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<String>,
    pub metadata: OsbServiceMetadata,
    pub plans: Vec<OsbPlan>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OsbServiceMetadata {
    pub display_name: String,
    pub long_description: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub documentation_url: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub image_url: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub support_url: String,
}

#[derive(Debug, Serialize)]
pub struct OsbPlan {
    pub id: String,
    pub name: String,
    pub description: String,
    pub free: bool,
    pub metadata: OsbPlanMetadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maintenance_info: Option<MaintenanceInfo>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OsbPlanMetadata {
    pub display_name: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub bullets: Vec<String>,
}

impl From<&ServiceDefinition> for OsbService {
    fn from(def: &ServiceDefinition) -> Self {
        OsbService {
            id: def.id.clone(),
            name: def.name.clone(),
            description: def.description.clone(),
            bindable: true,
            plan_updateable: def.plan_updateable,
            tags: def.tags.clone(),
            requires: def.requires.clone(),
            metadata: OsbServiceMetadata {
                display_name: def.display_name.clone(),
                long_description: def.description.clone(),
                documentation_url: def.documentation_url.clone(),
                image_url: def.image_url.clone(),
                support_url: def.support_url.clone(),
            },
            plans: def
                .plans
                .iter()
                .map(|p| OsbPlan {
                    id: p.id.clone(),
                    name: p.name.clone(),
                    description: p.description.clone(),
                    free: p.free,
                    metadata: OsbPlanMetadata {
                        display_name: p.display_name.clone(),
                        bullets: p.bullets.clone(),
                    },
                    maintenance_info: p.maintenance_info.clone(),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{TfBinariesContext, TfVersion};
    use std::collections::{BTreeMap, HashMap};

    fn registered(name: &str, id: &str, plans: Vec<ServicePlan>) -> RegisteredService {
        RegisteredService {
            definition: Arc::new(ServiceDefinition {
                name: name.into(),
                id: id.into(),
                display_name: name.into(),
                plans,
                ..Default::default()
            }),
            binaries: Arc::new(TfBinariesContext {
                dir: "/nonexistent".into(),
                default_version: TfVersion::parse("1.6.2").unwrap(),
                upgrade_path: vec![],
                provider_replacements: BTreeMap::new(),
                env: BTreeMap::new(),
            }),
            pak_config: Arc::new(Map::new()),
            pak_name: "test".into(),
        }
    }

    fn plan(name: &str, id: &str) -> ServicePlan {
        ServicePlan {
            name: name.into(),
            id: id.into(),
            ..Default::default()
        }
    }

    fn config(pairs: &[(&str, &str)]) -> Config {
        Config::load(pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect::<HashMap<_, _>>()).unwrap()
    }

    #[test]
    fn default_plan_is_stable() {
        let svc = registered("csb-a", "0a7b4d8e-7a77-4cfa-9f2d-2d7a1a1f5a01", vec![]);
        let first = Catalog::build(vec![svc.clone()], &config(&[])).unwrap();
        let second = Catalog::build(vec![svc], &config(&[])).unwrap();
        let p1 = &first.services()[0].definition.plans[0];
        let p2 = &second.services()[0].definition.plans[0];
        assert_eq!(p1.name, "default");
        assert_eq!(p1.id, p2.id);
        assert!(Uuid::parse_str(&p1.id).is_ok());
    }

    #[test]
    fn user_plans_are_appended_with_properties() {
        let svc = registered("csb-a", "0a7b4d8e-7a77-4cfa-9f2d-2d7a1a1f5a01", vec![]);
        let cfg = config(&[(
            "GSB_SERVICE_CSB_A_PLANS",
            r#"[{"name":"big","id":"6d3a2b7e-1f4c-4b8a-9a4e-2c1b3d5e7f90","description":"d","size":"xl"}]"#,
        )]);
        let catalog = Catalog::build(vec![svc], &cfg).unwrap();
        let plans = &catalog.services()[0].definition.plans;
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].name, "big");
        assert_eq!(plans[0].properties["size"], "xl");
    }

    #[test]
    fn duplicate_plan_ids_are_rejected() {
        let dup = "8b52a460-b246-11eb-a8f5-d349948e2480";
        let a = registered(
            "csb-a",
            "0a7b4d8e-7a77-4cfa-9f2d-2d7a1a1f5a01",
            vec![plan("one", "11111111-2222-4333-8444-555555555555"), plan("two", dup)],
        );
        let b = registered(
            "csb-b",
            "0a7b4d8e-7a77-4cfa-9f2d-2d7a1a1f5a02",
            vec![plan("one", "11111111-2222-4333-8444-666666666666"), plan("two", dup)],
        );
        let err = Catalog::build(vec![a, b], &config(&[])).unwrap_err();
        assert_eq!(
            err.to_string(),
            "duplicated value, must be unique: 8b52a460-b246-11eb-a8f5-d349948e2480: services[1].plans[1].ID"
        );
    }

    #[test]
    fn maintenance_info_only_with_upgrades() {
        let svc = registered("csb-a", "0a7b4d8e-7a77-4cfa-9f2d-2d7a1a1f5a01", vec![]);
        let off = Catalog::build(vec![svc.clone()], &config(&[])).unwrap();
        assert!(off.services()[0].definition.plans[0].maintenance_info.is_none());

        let on = Catalog::build(vec![svc], &config(&[("TERRAFORM_UPGRADES_ENABLED", "true")])).unwrap();
        let mi = on.services()[0].definition.plans[0].maintenance_info.clone().unwrap();
        assert_eq!(mi.version, "1.6.2");

        let json = serde_json::to_value(on.to_osb()).unwrap();
        assert_eq!(json["services"][0]["plans"][0]["maintenance_info"]["version"], "1.6.2");
        assert_eq!(json["services"][0]["metadata"]["displayName"], "csb-a");
    }
}
