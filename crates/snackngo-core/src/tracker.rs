//! Per-order field verification state.
//!
//! Each field is `Absent`, `Proposed` or `Verified`. Both non-absent states
//! carry their value, so a verified field without a value cannot be built.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use snackngo_types::models::{CandidateSource, Field, FieldGroup, FieldValue, Stage};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum FieldState {
    Absent,
    Proposed {
        value: FieldValue,
        source: CandidateSource,
    },
    Verified {
        value: FieldValue,
        source: CandidateSource,
    },
}

static ABSENT: FieldState = FieldState::Absent;

impl FieldState {
    pub fn value(&self) -> Option<&FieldValue> {
        match self {
            Self::Absent => None,
            Self::Proposed { value, .. } | Self::Verified { value, .. } => Some(value),
        }
    }

    pub fn source(&self) -> Option<CandidateSource> {
        match self {
            Self::Absent => None,
            Self::Proposed { source, .. } | Self::Verified { source, .. } => Some(*source),
        }
    }

    pub fn is_verified(&self) -> bool {
        matches!(self, Self::Verified { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TrackerError {
    #[error("{0} has no candidate value")]
    MissingValue(Field),
    #[error("{field}: {reason}")]
    InvalidValue { field: Field, reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldTracker {
    states: BTreeMap<Field, FieldState>,
}

impl FieldTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, field: Field) -> &FieldState {
        self.states.get(&field).unwrap_or(&ABSENT)
    }

    pub fn value(&self, field: Field) -> Option<&FieldValue> {
        self.state(field).value()
    }

    pub fn has_candidate(&self, field: Field) -> bool {
        self.value(field).is_some()
    }

    pub fn is_verified(&self, field: Field) -> bool {
        self.state(field).is_verified()
    }

    /// All fields in declaration order, absent ones included.
    pub fn iter(&self) -> impl Iterator<Item = (Field, &FieldState)> {
        Field::ALL.into_iter().map(|field| (field, self.state(field)))
    }

    /// Record an unverified candidate. Returns false when nothing changed
    /// (same value already proposed or verified).
    pub fn propose(
        &mut self,
        field: Field,
        value: FieldValue,
        source: CandidateSource,
    ) -> Result<bool, TrackerError> {
        validate(field, &value)?;

        if self.value(field) == Some(&value) {
            return Ok(false);
        }

        self.states
            .insert(field, FieldState::Proposed { value, source });
        Ok(true)
    }

    /// Mark the candidate verified. Returns false if it already was.
    pub fn confirm(&mut self, field: Field) -> Result<bool, TrackerError> {
        match self.states.remove(&field) {
            None | Some(FieldState::Absent) => Err(TrackerError::MissingValue(field)),
            Some(verified @ FieldState::Verified { .. }) => {
                self.states.insert(field, verified);
                Ok(false)
            }
            Some(FieldState::Proposed { value, source }) => {
                self.states
                    .insert(field, FieldState::Verified { value, source });
                Ok(true)
            }
        }
    }

    /// Drop the candidate so it can be proposed again. Returns false if there was none.
    pub fn reject(&mut self, field: Field) -> bool {
        self.states.remove(&field).is_some()
    }

    pub fn all_verified(&self, group: FieldGroup) -> bool {
        group.fields().iter().all(|field| self.is_verified(*field))
    }

    pub fn stage_verified(&self, stage: Stage) -> bool {
        stage.groups().iter().all(|group| self.all_verified(*group))
    }

    /// Required fields of `stage` in checklist order with their state.
    pub fn checklist(&self, stage: Stage) -> Vec<(Field, &FieldState)> {
        stage.fields().map(|field| (field, self.state(field))).collect()
    }

    /// Required fields of `stage` without any candidate.
    pub fn missing(&self, stage: Stage) -> Vec<Field> {
        stage.fields().filter(|field| !self.has_candidate(*field)).collect()
    }

    /// Required fields of `stage` proposed but not yet confirmed.
    pub fn pending(&self, stage: Stage) -> Vec<Field> {
        stage
            .fields()
            .filter(|field| matches!(self.state(*field), FieldState::Proposed { .. }))
            .collect()
    }

    /// Rebuild one field from persisted columns. A verified flag without a
    /// value is reported as corrupt rather than silently dropped.
    pub fn restore(
        &mut self,
        field: Field,
        value: Option<FieldValue>,
        verified: bool,
        source: CandidateSource,
    ) -> Result<(), TrackerError> {
        match value {
            None if verified => Err(TrackerError::MissingValue(field)),
            None => {
                self.states.remove(&field);
                Ok(())
            }
            Some(value) => {
                validate(field, &value)?;
                let state = if verified {
                    FieldState::Verified { value, source }
                } else {
                    FieldState::Proposed { value, source }
                };
                self.states.insert(field, state);
                Ok(())
            }
        }
    }
}

fn validate(field: Field, value: &FieldValue) -> Result<(), TrackerError> {
    if value.kind() != field.kind() {
        return Err(TrackerError::InvalidValue {
            field,
            reason: format!("expected a {:?} value", field.kind()).to_lowercase(),
        });
    }
    if value.is_empty() {
        return Err(TrackerError::InvalidValue {
            field,
            reason: "value is empty".into(),
        });
    }
    Ok(())
}
