pub mod approval;
pub mod comment;
pub mod expense;
pub mod policy;
pub mod report;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($($name:ident),+ $(,)?) => {
        $(
            #[derive(
                Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
                ::serde::Serialize, ::serde::Deserialize,
            )]
            pub struct $name(pub String);

            impl $name {
                pub fn generate() -> Self {
                    Self(::uuid::Uuid::new_v4().to_string())
                }

                pub fn as_str(&self) -> &str {
                    &self.0
                }
            }

            impl ::std::fmt::Display for $name {
                fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                    f.write_str(&self.0)
                }
            }

            impl From<&str> for $name {
                fn from(value: &str) -> Self {
                    Self(value.to_owned())
                }
            }
        )+
    };
}

string_id!(UserId, CategoryId);

/// The actor recorded on history rows written by the scheduler rather than a person.
pub const SYSTEM_ACTOR: &str = "system";

impl UserId {
    pub fn system() -> Self {
        Self(SYSTEM_ACTOR.to_owned())
    }

    pub fn is_system(&self) -> bool {
        self.0 == SYSTEM_ACTOR
    }
}

/// Soft-delete marker shared by reports, policies and comments.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RecordState {
    #[default]
    Active,
    Deleted { at: DateTime<Utc> },
}

impl RecordState {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    pub fn deleted_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Active => None,
            Self::Deleted { at } => Some(*at),
        }
    }

    pub fn from_deleted_at(deleted_at: Option<DateTime<Utc>>) -> Self {
        match deleted_at {
            Some(at) => Self::Deleted { at },
            None => Self::Active,
        }
    }
}

pub(crate) use string_id;

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::{RecordState, UserId};

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(UserId::generate(), UserId::generate());
    }

    #[test]
    fn record_state_round_trips_deleted_timestamp() {
        let now = Utc::now();
        let state = RecordState::from_deleted_at(Some(now));
        assert!(!state.is_active());
        assert_eq!(state.deleted_at(), Some(now));
        assert!(RecordState::from_deleted_at(None).is_active());
    }
}
