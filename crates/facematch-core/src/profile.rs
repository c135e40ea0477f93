use crate::types::Label;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Contact card a host associates with a label. The matcher never sees it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linkedin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telegram: Option<String>,
}

impl Profile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Label a face is enrolled under when registered with this profile.
    pub fn label(&self) -> Label {
        Label::new(self.name.clone())
    }
}

/// Resolves a matched label to whatever the host stores for it.
pub trait ProfileLookup<P> {
    fn lookup(&self, label: &Label) -> Option<P>;
}

impl<P, F> ProfileLookup<P> for F
where
    F: Fn(&Label) -> Option<P>,
{
    fn lookup(&self, label: &Label) -> Option<P> {
        self(label)
    }
}

impl<P: Clone> ProfileLookup<P> for HashMap<Label, P> {
    fn lookup(&self, label: &Label) -> Option<P> {
        self.get(label).cloned()
    }
}
