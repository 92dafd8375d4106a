use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResidentCategory {
    ExistingCustomer,
    PotentialNewCustomer,
    ClarificationNeeded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResidentStatus {
    Interested,
    NotInterested,
    NotReached,
    AppointmentScheduled,
    Written,
}

/// One nameplate entry at an address. `is_fixed` residents are mirrored
/// from the customer master list and immutable from the dataset side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resident {
    pub name: String,
    pub category: ResidentCategory,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ResidentStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub floor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub door: Option<String>,
    #[serde(default)]
    pub is_fixed: bool,
}

impl Resident {
    /// A status only makes sense on a prospect. Every write path calls
    /// this; a status on any other category is silently cleared.
    pub fn enforce_status_invariant(&mut self) {
        if self.status.is_some() && self.category != ResidentCategory::PotentialNewCustomer {
            self.status = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resident(category: ResidentCategory, status: Option<ResidentStatus>) -> Resident {
        Resident {
            name: "Müller".to_string(),
            category,
            status,
            notes: None,
            floor: None,
            door: None,
            is_fixed: false,
        }
    }

    #[test]
    fn status_cleared_for_existing_customer() {
        let mut r = resident(
            ResidentCategory::ExistingCustomer,
            Some(ResidentStatus::Interested),
        );
        r.enforce_status_invariant();
        assert_eq!(r.status, None);
    }

    #[test]
    fn status_kept_for_prospect() {
        let mut r = resident(
            ResidentCategory::PotentialNewCustomer,
            Some(ResidentStatus::AppointmentScheduled),
        );
        r.enforce_status_invariant();
        assert_eq!(r.status, Some(ResidentStatus::AppointmentScheduled));
    }

    #[test]
    fn status_cleared_for_clarification() {
        let mut r = resident(
            ResidentCategory::ClarificationNeeded,
            Some(ResidentStatus::NotReached),
        );
        r.enforce_status_invariant();
        assert_eq!(r.status, None);
    }
}
