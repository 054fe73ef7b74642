//! The organization aggregate.
//!
//! Orgs are the resource owners inside an instance: users and projects
//! record the owning org's id on every event. The org's primary domain is
//! unique per instance, case-insensitively.

use serde::{Deserialize, Serialize};

use crate::aggregate::Aggregate;
use crate::error::Error;
use crate::unique::UniqueConstraint;

/// Unique-constraint namespace for org primary domains.
pub const ORG_DOMAIN_CONSTRAINT: &str = "org_domain";

/// Lifecycle states of an organization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OrgState {
    /// No events yet.
    #[default]
    Unspecified,
    /// Usable org.
    Active,
    /// Disabled; members cannot act within it.
    Inactive,
    /// Terminal.
    Removed,
}

/// Write-model state of one organization.
#[derive(Debug, Clone, Default)]
pub struct Org {
    /// Lifecycle state.
    pub state: OrgState,
    /// Display name.
    pub name: String,
    /// Primary domain, unique per instance.
    pub primary_domain: String,
}

impl Org {
    fn exists(&self) -> bool {
        !matches!(self.state, OrgState::Unspecified | OrgState::Removed)
    }
}

/// Commands an org aggregate handles.
#[derive(Debug, Clone)]
pub enum OrgCommand {
    /// Create the org and reserve its primary domain.
    AddOrg { name: String, primary_domain: String },
    /// Rename the org. No-op if unchanged.
    ChangeName { name: String },
    /// Disable the org.
    Deactivate,
    /// Re-enable a deactivated org.
    Reactivate,
    /// Remove the org and release its domain.
    Remove,
}

/// Events an org aggregate produces and applies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum OrgEvent {
    #[serde(rename = "org.added")]
    Added { name: String, primary_domain: String },
    #[serde(rename = "org.changed")]
    Changed { name: String },
    #[serde(rename = "org.deactivated")]
    Deactivated,
    #[serde(rename = "org.reactivated")]
    Reactivated,
    #[serde(rename = "org.removed")]
    Removed { primary_domain: String },
}

/// Why an org command was rejected.
#[derive(Debug, thiserror::Error)]
pub enum OrgError {
    #[error("org already exists")]
    AlreadyExists,
    #[error("org does not exist")]
    NotFound,
    #[error("org is not active")]
    NotActive,
    #[error("org is not deactivated")]
    NotInactive,
    #[error("org name must not be empty")]
    EmptyName,
    #[error("org primary domain must not be empty")]
    EmptyDomain,
}

impl From<OrgError> for Error {
    fn from(e: OrgError) -> Self {
        match e {
            OrgError::EmptyName | OrgError::EmptyDomain => Error::validation(e.to_string()),
            _ => Error::PreconditionFailed {
                aggregate_type: Org::AGGREGATE_TYPE,
                aggregate_id: String::new(),
                message: e.to_string(),
            },
        }
    }
}

impl Aggregate for Org {
    const AGGREGATE_TYPE: &'static str = "org";

    type Command = OrgCommand;
    type DomainEvent = OrgEvent;
    type Error = OrgError;
    type Services = ();

    fn handle(&self, cmd: OrgCommand, _services: &()) -> Result<Vec<OrgEvent>, OrgError> {
        match cmd {
            OrgCommand::AddOrg {
                name,
                primary_domain,
            } => {
                if self.state != OrgState::Unspecified {
                    return Err(OrgError::AlreadyExists);
                }
                if name.trim().is_empty() {
                    return Err(OrgError::EmptyName);
                }
                if primary_domain.trim().is_empty() {
                    return Err(OrgError::EmptyDomain);
                }
                Ok(vec![OrgEvent::Added {
                    name,
                    primary_domain,
                }])
            }
            OrgCommand::ChangeName { name } => {
                if !self.exists() {
                    return Err(OrgError::NotFound);
                }
                if name.trim().is_empty() {
                    return Err(OrgError::EmptyName);
                }
                if name == self.name {
                    return Ok(vec![]);
                }
                Ok(vec![OrgEvent::Changed { name }])
            }
            OrgCommand::Deactivate => {
                if !self.exists() {
                    return Err(OrgError::NotFound);
                }
                if self.state != OrgState::Active {
                    return Err(OrgError::NotActive);
                }
                Ok(vec![OrgEvent::Deactivated])
            }
            OrgCommand::Reactivate => {
                if !self.exists() {
                    return Err(OrgError::NotFound);
                }
                if self.state != OrgState::Inactive {
                    return Err(OrgError::NotInactive);
                }
                Ok(vec![OrgEvent::Reactivated])
            }
            OrgCommand::Remove => {
                if !self.exists() {
                    return Err(OrgError::NotFound);
                }
                Ok(vec![OrgEvent::Removed {
                    primary_domain: self.primary_domain.clone(),
                }])
            }
        }
    }

    fn apply(mut self, event: &OrgEvent) -> Self {
        match event {
            OrgEvent::Added {
                name,
                primary_domain,
            } => {
                self.state = OrgState::Active;
                self.name = name.clone();
                self.primary_domain = primary_domain.clone();
            }
            OrgEvent::Changed { name } => self.name = name.clone(),
            OrgEvent::Deactivated => self.state = OrgState::Inactive,
            OrgEvent::Reactivated => self.state = OrgState::Active,
            OrgEvent::Removed { .. } => self.state = OrgState::Removed,
        }
        self
    }

    fn unique_constraints(event: &OrgEvent) -> Vec<UniqueConstraint> {
        match event {
            OrgEvent::Added { primary_domain, .. } => vec![
                UniqueConstraint::add(
                    ORG_DOMAIN_CONSTRAINT,
                    primary_domain,
                    "org domain already taken",
                )
                .ignoring_case(),
            ],
            OrgEvent::Removed { primary_domain } => {
                vec![UniqueConstraint::remove(ORG_DOMAIN_CONSTRAINT, primary_domain).ignoring_case()]
            }
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acme() -> Org {
        Org::default().apply(&OrgEvent::Added {
            name: "ACME".into(),
            primary_domain: "acme.example".into(),
        })
    }

    #[test]
    fn add_org_activates_and_reserves_domain() {
        let events = Org::default()
            .handle(
                OrgCommand::AddOrg {
                    name: "ACME".into(),
                    primary_domain: "acme.example".into(),
                },
                &(),
            )
            .unwrap();
        let ops = Org::unique_constraints(&events[0]);
        assert_eq!(ops[0].unique_type, ORG_DOMAIN_CONSTRAINT);
        assert!(ops[0].case_insensitive);

        let org = Org::default().apply(&events[0]);
        assert_eq!(org.state, OrgState::Active);
        assert_eq!(org.primary_domain, "acme.example");
    }

    #[test]
    fn rename_is_noop_when_unchanged() {
        let events = acme()
            .handle(OrgCommand::ChangeName { name: "ACME".into() }, &())
            .unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn deactivate_then_reactivate() {
        let inactive = acme().apply(&OrgEvent::Deactivated);
        assert_eq!(inactive.state, OrgState::Inactive);
        assert!(matches!(
            inactive.handle(OrgCommand::Deactivate, &()),
            Err(OrgError::NotActive)
        ));
        let events = inactive.handle(OrgCommand::Reactivate, &()).unwrap();
        assert_eq!(inactive.apply(&events[0]).state, OrgState::Active);
    }

    #[test]
    fn remove_releases_domain_and_is_terminal() {
        let org = acme();
        let events = org.handle(OrgCommand::Remove, &()).unwrap();
        let ops = Org::unique_constraints(&events[0]);
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].keyed_field(), "acme.example");

        let removed = org.apply(&events[0]);
        assert!(matches!(
            removed.handle(OrgCommand::ChangeName { name: "x".into() }, &()),
            Err(OrgError::NotFound)
        ));
    }
}
