//! The project aggregate.
//!
//! Projects belong to an org and carry only the org's id; resolving the
//! org happens in projections. The project name is unique within its org,
//! case-insensitively, keyed as `"{org_id}/{name}"`.

use serde::{Deserialize, Serialize};

use crate::aggregate::Aggregate;
use crate::error::Error;
use crate::unique::UniqueConstraint;

/// Unique-constraint namespace for project names within an org.
pub const PROJECT_NAME_CONSTRAINT: &str = "project_name";

fn name_key(org_id: &str, name: &str) -> String {
    format!("{org_id}/{name}")
}

/// Lifecycle states of a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ProjectState {
    /// No events yet.
    #[default]
    Unspecified,
    /// Usable project.
    Active,
    /// Disabled.
    Inactive,
    /// Terminal.
    Removed,
}

/// Write-model state of one project.
#[derive(Debug, Clone, Default)]
pub struct Project {
    /// Lifecycle state.
    pub state: ProjectState,
    /// Display name, unique within the owning org.
    pub name: String,
    /// Id of the owning org.
    pub org_id: String,
}

impl Project {
    fn exists(&self) -> bool {
        !matches!(self.state, ProjectState::Unspecified | ProjectState::Removed)
    }
}

/// Commands a project aggregate handles.
#[derive(Debug, Clone)]
pub enum ProjectCommand {
    /// Create the project under `org_id` and reserve its name there.
    AddProject { name: String, org_id: String },
    /// Rename, swapping the name reservation. No-op if unchanged.
    ChangeName { name: String },
    /// Disable the project.
    Deactivate,
    /// Re-enable a deactivated project.
    Reactivate,
    /// Remove the project and release its name.
    Remove,
}

/// Events a project aggregate produces and applies.
///
/// Rename and removal events carry the data their unique-constraint
/// operations need, so replay and append derive identical reservations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ProjectEvent {
    #[serde(rename = "project.added")]
    Added { name: String, org_id: String },
    #[serde(rename = "project.changed")]
    Changed {
        old_name: String,
        name: String,
        org_id: String,
    },
    #[serde(rename = "project.deactivated")]
    Deactivated,
    #[serde(rename = "project.reactivated")]
    Reactivated,
    #[serde(rename = "project.removed")]
    Removed { name: String, org_id: String },
}

/// Why a project command was rejected.
#[derive(Debug, thiserror::Error)]
pub enum ProjectError {
    #[error("project already exists")]
    AlreadyExists,
    #[error("project does not exist")]
    NotFound,
    #[error("project is not active")]
    NotActive,
    #[error("project is not deactivated")]
    NotInactive,
    #[error("project name must not be empty")]
    EmptyName,
    #[error("owning org id must not be empty")]
    EmptyOrg,
}

impl From<ProjectError> for Error {
    fn from(e: ProjectError) -> Self {
        match e {
            ProjectError::EmptyName | ProjectError::EmptyOrg => Error::validation(e.to_string()),
            _ => Error::PreconditionFailed {
                aggregate_type: Project::AGGREGATE_TYPE,
                aggregate_id: String::new(),
                message: e.to_string(),
            },
        }
    }
}

impl Aggregate for Project {
    const AGGREGATE_TYPE: &'static str = "project";

    type Command = ProjectCommand;
    type DomainEvent = ProjectEvent;
    type Error = ProjectError;
    type Services = ();

    fn handle(&self, cmd: ProjectCommand, _services: &()) -> Result<Vec<ProjectEvent>, ProjectError> {
        match cmd {
            ProjectCommand::AddProject { name, org_id } => {
                if self.state != ProjectState::Unspecified {
                    return Err(ProjectError::AlreadyExists);
                }
                if name.trim().is_empty() {
                    return Err(ProjectError::EmptyName);
                }
                if org_id.trim().is_empty() {
                    return Err(ProjectError::EmptyOrg);
                }
                Ok(vec![ProjectEvent::Added { name, org_id }])
            }
            ProjectCommand::ChangeName { name } => {
                if !self.exists() {
                    return Err(ProjectError::NotFound);
                }
                if name.trim().is_empty() {
                    return Err(ProjectError::EmptyName);
                }
                if name == self.name {
                    return Ok(vec![]);
                }
                Ok(vec![ProjectEvent::Changed {
                    old_name: self.name.clone(),
                    name,
                    org_id: self.org_id.clone(),
                }])
            }
            ProjectCommand::Deactivate => {
                if !self.exists() {
                    return Err(ProjectError::NotFound);
                }
                if self.state != ProjectState::Active {
                    return Err(ProjectError::NotActive);
                }
                Ok(vec![ProjectEvent::Deactivated])
            }
            ProjectCommand::Reactivate => {
                if !self.exists() {
                    return Err(ProjectError::NotFound);
                }
                if self.state != ProjectState::Inactive {
                    return Err(ProjectError::NotInactive);
                }
                Ok(vec![ProjectEvent::Reactivated])
            }
            ProjectCommand::Remove => {
                if !self.exists() {
                    return Err(ProjectError::NotFound);
                }
                Ok(vec![ProjectEvent::Removed {
                    name: self.name.clone(),
                    org_id: self.org_id.clone(),
                }])
            }
        }
    }

    fn apply(mut self, event: &ProjectEvent) -> Self {
        match event {
            ProjectEvent::Added { name, org_id } => {
                self.state = ProjectState::Active;
                self.name = name.clone();
                self.org_id = org_id.clone();
            }
            ProjectEvent::Changed { name, .. } => self.name = name.clone(),
            ProjectEvent::Deactivated => self.state = ProjectState::Inactive,
            ProjectEvent::Reactivated => self.state = ProjectState::Active,
            ProjectEvent::Removed { .. } => self.state = ProjectState::Removed,
        }
        self
    }

    fn unique_constraints(event: &ProjectEvent) -> Vec<UniqueConstraint> {
        match event {
            ProjectEvent::Added { name, org_id } => vec![
                UniqueConstraint::add(
                    PROJECT_NAME_CONSTRAINT,
                    name_key(org_id, name),
                    "project name already taken in this org",
                )
                .ignoring_case(),
            ],
            ProjectEvent::Changed {
                old_name,
                name,
                org_id,
            } => vec![
                UniqueConstraint::remove(PROJECT_NAME_CONSTRAINT, name_key(org_id, old_name))
                    .ignoring_case(),
                UniqueConstraint::add(
                    PROJECT_NAME_CONSTRAINT,
                    name_key(org_id, name),
                    "project name already taken in this org",
                )
                .ignoring_case(),
            ],
            ProjectEvent::Removed { name, org_id } => vec![
                UniqueConstraint::remove(PROJECT_NAME_CONSTRAINT, name_key(org_id, name))
                    .ignoring_case(),
            ],
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unique::UniqueAction;

    fn portal() -> Project {
        Project::default().apply(&ProjectEvent::Added {
            name: "Portal".into(),
            org_id: "org1".into(),
        })
    }

    #[test]
    fn name_reserved_within_owning_org() {
        let ops = Project::unique_constraints(&ProjectEvent::Added {
            name: "Portal".into(),
            org_id: "org1".into(),
        });
        assert_eq!(ops[0].keyed_field(), "org1/portal");
    }

    #[test]
    fn rename_swaps_reservation_in_same_org() {
        let events = portal()
            .handle(ProjectCommand::ChangeName { name: "Gateway".into() }, &())
            .unwrap();
        let ops = Project::unique_constraints(&events[0]);
        assert_eq!(ops[0].action, UniqueAction::Remove);
        assert_eq!(ops[0].keyed_field(), "org1/portal");
        assert_eq!(ops[1].action, UniqueAction::Add);
        assert_eq!(ops[1].keyed_field(), "org1/gateway");
    }

    #[test]
    fn lifecycle_mirrors_other_aggregates() {
        let project = portal();
        assert!(matches!(
            project.handle(ProjectCommand::Reactivate, &()),
            Err(ProjectError::NotInactive)
        ));
        let removed = project.apply(&ProjectEvent::Removed {
            name: "Portal".into(),
            org_id: "org1".into(),
        });
        assert!(matches!(
            removed.handle(ProjectCommand::Deactivate, &()),
            Err(ProjectError::NotFound)
        ));
    }

    #[test]
    fn add_requires_org() {
        assert!(matches!(
            Project::default().handle(
                ProjectCommand::AddProject {
                    name: "Portal".into(),
                    org_id: "".into()
                },
                &()
            ),
            Err(ProjectError::EmptyOrg)
        ));
    }
}
