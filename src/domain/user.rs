//! The user aggregate: human accounts with a username, email, and
//! credentials.
//!
//! Lifecycle: `Unspecified -> Active -> Inactive -> Removed`. A removed
//! user is terminal. The username is unique per instance,
//! case-insensitively; the reservation travels with the events that create,
//! change, and release it.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::aggregate::Aggregate;
use crate::error::Error;
use crate::services::{EncryptedBlob, EncryptionService, SecretHasher};
use crate::unique::UniqueConstraint;

/// Unique-constraint namespace for usernames.
pub const USERNAME_CONSTRAINT: &str = "username";

/// Encryption key id for stored OTP secrets.
const OTP_KEY_ID: &str = "user_otp";

/// Lifecycle states of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum UserState {
    /// No events yet; the user does not exist.
    #[default]
    Unspecified,
    /// Usable account.
    Active,
    /// Temporarily disabled; can be reactivated.
    Inactive,
    /// Terminal. A removed user's id is never reused.
    Removed,
}

/// Write-model state of one user, folded from its events.
#[derive(Debug, Clone, Default)]
pub struct User {
    /// Lifecycle state.
    pub state: UserState,
    /// Login name, unique per instance (case-insensitive).
    pub username: String,
    /// Contact email.
    pub email: String,
    /// Given name.
    pub first_name: String,
    /// Family name.
    pub last_name: String,
    /// Password verifier produced by the injected hasher.
    pub password_hash: Option<String>,
    /// Encrypted OTP secret, opaque to the core.
    pub otp_secret: Option<EncryptedBlob>,
}

impl User {
    fn exists(&self) -> bool {
        !matches!(self.state, UserState::Unspecified | UserState::Removed)
    }
}

/// Commands a user aggregate handles.
#[derive(Debug, Clone)]
pub enum UserCommand {
    /// Create a human user. Reserves the username.
    AddHuman {
        /// Login name; must be non-empty.
        username: String,
        /// Contact email; must contain an `@`.
        email: String,
        /// Given name.
        first_name: String,
        /// Family name.
        last_name: String,
        /// Initial password, hashed by the handler; `None` for users that
        /// authenticate externally.
        password: Option<String>,
    },
    /// Change the contact email. No-op if unchanged.
    ChangeEmail {
        /// The new email.
        email: String,
    },
    /// Change the login name, swapping the uniqueness reservation
    /// atomically. No-op if unchanged.
    ChangeUsername {
        /// The new username.
        username: String,
    },
    /// Store an OTP secret, encrypted by the handler.
    SetupOtp {
        /// Raw secret bytes as provisioned to the authenticator.
        secret: Vec<u8>,
    },
    /// Disable the account.
    Deactivate,
    /// Re-enable a deactivated account.
    Reactivate,
    /// Remove the account and release its username.
    Remove,
}

/// Events a user aggregate produces and applies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum UserEvent {
    #[serde(rename = "user.human.added")]
    HumanAdded {
        username: String,
        email: String,
        first_name: String,
        last_name: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        password_hash: Option<String>,
    },
    #[serde(rename = "user.email.changed")]
    EmailChanged { email: String },
    #[serde(rename = "user.username.changed")]
    UsernameChanged {
        old_username: String,
        username: String,
    },
    #[serde(rename = "user.otp.added")]
    OtpAdded { secret: EncryptedBlob },
    #[serde(rename = "user.deactivated")]
    Deactivated,
    #[serde(rename = "user.reactivated")]
    Reactivated,
    #[serde(rename = "user.removed")]
    Removed { username: String },
}

/// Why a user command was rejected.
#[derive(Debug, thiserror::Error)]
pub enum UserError {
    #[error("user already exists")]
    AlreadyExists,
    #[error("user does not exist")]
    NotFound,
    #[error("user is not active")]
    NotActive,
    #[error("user is not deactivated")]
    NotInactive,
    #[error("username must not be empty")]
    EmptyUsername,
    #[error("email address is invalid")]
    InvalidEmail,
    #[error("secret handling failed: {0}")]
    Secret(String),
}

impl From<UserError> for Error {
    fn from(e: UserError) -> Self {
        match e {
            UserError::EmptyUsername | UserError::InvalidEmail => Error::validation(e.to_string()),
            UserError::Secret(message) => Error::fatal(message),
            _ => Error::PreconditionFailed {
                aggregate_type: User::AGGREGATE_TYPE,
                aggregate_id: String::new(),
                message: e.to_string(),
            },
        }
    }
}

/// External collaborators user command handlers consult.
#[derive(Clone)]
pub struct UserServices {
    /// Password hashing.
    pub hasher: Arc<dyn SecretHasher>,
    /// Encryption for sensitive payload fields.
    pub encryption: Arc<dyn EncryptionService>,
}

impl Aggregate for User {
    const AGGREGATE_TYPE: &'static str = "user";

    type Command = UserCommand;
    type DomainEvent = UserEvent;
    type Error = UserError;
    type Services = UserServices;

    fn handle(
        &self,
        cmd: UserCommand,
        services: &UserServices,
    ) -> Result<Vec<UserEvent>, UserError> {
        match cmd {
            UserCommand::AddHuman {
                username,
                email,
                first_name,
                last_name,
                password,
            } => {
                if self.state != UserState::Unspecified {
                    return Err(UserError::AlreadyExists);
                }
                if username.trim().is_empty() {
                    return Err(UserError::EmptyUsername);
                }
                if !email.contains('@') {
                    return Err(UserError::InvalidEmail);
                }
                let password_hash = password
                    .map(|pw| services.hasher.hash(&pw))
                    .transpose()
                    .map_err(|e| UserError::Secret(e.to_string()))?;
                Ok(vec![UserEvent::HumanAdded {
                    username,
                    email,
                    first_name,
                    last_name,
                    password_hash,
                }])
            }

            UserCommand::ChangeEmail { email } => {
                if !self.exists() {
                    return Err(UserError::NotFound);
                }
                if !email.contains('@') {
                    return Err(UserError::InvalidEmail);
                }
                if email == self.email {
                    return Ok(vec![]);
                }
                Ok(vec![UserEvent::EmailChanged { email }])
            }

            UserCommand::ChangeUsername { username } => {
                if !self.exists() {
                    return Err(UserError::NotFound);
                }
                if username.trim().is_empty() {
                    return Err(UserError::EmptyUsername);
                }
                if username == self.username {
                    return Ok(vec![]);
                }
                Ok(vec![UserEvent::UsernameChanged {
                    old_username: self.username.clone(),
                    username,
                }])
            }

            UserCommand::SetupOtp { secret } => {
                if self.state != UserState::Active {
                    return Err(UserError::NotActive);
                }
                let secret = services
                    .encryption
                    .encrypt(&secret, OTP_KEY_ID)
                    .map_err(|e| UserError::Secret(e.to_string()))?;
                Ok(vec![UserEvent::OtpAdded { secret }])
            }

            UserCommand::Deactivate => {
                if !self.exists() {
                    return Err(UserError::NotFound);
                }
                if self.state != UserState::Active {
                    return Err(UserError::NotActive);
                }
                Ok(vec![UserEvent::Deactivated])
            }

            UserCommand::Reactivate => {
                if !self.exists() {
                    return Err(UserError::NotFound);
                }
                if self.state != UserState::Inactive {
                    return Err(UserError::NotInactive);
                }
                Ok(vec![UserEvent::Reactivated])
            }

            UserCommand::Remove => {
                if !self.exists() {
                    return Err(UserError::NotFound);
                }
                Ok(vec![UserEvent::Removed {
                    username: self.username.clone(),
                }])
            }
        }
    }

    fn apply(mut self, event: &UserEvent) -> Self {
        match event {
            UserEvent::HumanAdded {
                username,
                email,
                first_name,
                last_name,
                password_hash,
            } => {
                self.state = UserState::Active;
                self.username = username.clone();
                self.email = email.clone();
                self.first_name = first_name.clone();
                self.last_name = last_name.clone();
                self.password_hash = password_hash.clone();
            }
            UserEvent::EmailChanged { email } => self.email = email.clone(),
            UserEvent::UsernameChanged { username, .. } => self.username = username.clone(),
            UserEvent::OtpAdded { secret } => self.otp_secret = Some(secret.clone()),
            UserEvent::Deactivated => self.state = UserState::Inactive,
            UserEvent::Reactivated => self.state = UserState::Active,
            UserEvent::Removed { .. } => self.state = UserState::Removed,
        }
        self
    }

    fn unique_constraints(event: &UserEvent) -> Vec<UniqueConstraint> {
        match event {
            UserEvent::HumanAdded { username, .. } => vec![
                UniqueConstraint::add(USERNAME_CONSTRAINT, username, "username already taken")
                    .ignoring_case(),
            ],
            UserEvent::UsernameChanged {
                old_username,
                username,
            } => vec![
                UniqueConstraint::remove(USERNAME_CONSTRAINT, old_username).ignoring_case(),
                UniqueConstraint::add(USERNAME_CONSTRAINT, username, "username already taken")
                    .ignoring_case(),
            ],
            UserEvent::Removed { username } => {
                vec![UniqueConstraint::remove(USERNAME_CONSTRAINT, username).ignoring_case()]
            }
            _ => Vec::new(),
        }
    }
}
