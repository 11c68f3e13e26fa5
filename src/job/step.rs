// src/job/step.rs

use crate::types::CompletionPolicy;

/// UI-facing grouping of event names. Declarative; never mutated by the
/// engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub label: String,
    pub event_names: Vec<String>,
    pub policy: CompletionPolicy,
}

impl Step {
    pub fn new<I, S>(label: impl Into<String>, event_names: I, policy: CompletionPolicy) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            label: label.into(),
            event_names: event_names.into_iter().map(Into::into).collect(),
            policy,
        }
    }

    pub fn all_of<I, S>(label: impl Into<String>, event_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(label, event_names, CompletionPolicy::AllOf)
    }

    pub fn any_of<I, S>(label: impl Into<String>, event_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(label, event_names, CompletionPolicy::AnyOf)
    }
}
