use std::fmt;

use chrono::NaiveDate;

use crate::model::LocationId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Provenance {
    /// `plan-<planId>-loc-<locationId>`
    Plan { plan_id: i64, location_id: LocationId },
    /// `plan-sync-<locationId>`
    PlanSync { location_id: LocationId },
    /// `daily:<date>:meal:<mealKey>`
    Meal { date: NaiveDate, meal: String },
    /// `daily:<date>:pickup`
    Pickup { date: NaiveDate },
    /// `daily:<date>:dropoff`
    Dropoff { date: NaiveDate },
    /// `custom:<hash>`
    Custom { hash: String },
    Unknown(String),
}

impl Provenance {
    pub fn parse(tag: &str) -> Provenance {
        let unknown = || Provenance::Unknown(tag.to_string());

        if let Some(rest) = tag.strip_prefix("plan-sync-") {
            return rest
                .parse()
                .map(|location_id| Provenance::PlanSync { location_id })
                .unwrap_or_else(|_| unknown());
        }
        if let Some(rest) = tag.strip_prefix("plan-") {
            return rest
                .split_once("-loc-")
                .and_then(|(plan, loc)| Some((plan.parse().ok()?, loc.parse().ok()?)))
                .map(|(plan_id, location_id)| Provenance::Plan { plan_id, location_id })
                .unwrap_or_else(unknown);
        }
        if let Some(rest) = tag.strip_prefix("daily:") {
            let mut parts = rest.splitn(3, ':');
            let date = parts.next().and_then(|d| d.parse::<NaiveDate>().ok());
            let Some(date) = date else { return unknown() };
            return match (parts.next(), parts.next()) {
                (Some("pickup"), None) => Provenance::Pickup { date },
                (Some("dropoff"), None) => Provenance::Dropoff { date },
                (Some("meal"), Some(meal)) if !meal.is_empty() => Provenance::Meal {
                    date,
                    meal: meal.to_string(),
                },
                _ => unknown(),
            };
        }
        if let Some(hash) = tag.strip_prefix("custom:")
            && !hash.is_empty()
        {
            return Provenance::Custom { hash: hash.to_string() };
        }
        unknown()
    }

    /// Location bound by a plan-derived tag.
    pub fn location_id(&self) -> Option<LocationId> {
        match self {
            Provenance::Plan { location_id, .. } | Provenance::PlanSync { location_id } => {
                Some(*location_id)
            }
            _ => None,
        }
    }

    pub fn is_plan_derived(&self) -> bool {
        self.location_id().is_some()
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provenance::Plan { plan_id, location_id } => {
                write!(f, "plan-{plan_id}-loc-{location_id}")
            }
            Provenance::PlanSync { location_id } => write!(f, "plan-sync-{location_id}"),
            Provenance::Meal { date, meal } => write!(f, "daily:{date}:meal:{meal}"),
            Provenance::Pickup { date } => write!(f, "daily:{date}:pickup"),
            Provenance::Dropoff { date } => write!(f, "daily:{date}:dropoff"),
            Provenance::Custom { hash } => write!(f, "custom:{hash}"),
            Provenance::Unknown(raw) => f.write_str(raw),
        }
    }
}
