use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tag {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: i64,
}

/// A tag identified only by its natural key (name, type).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NewTag {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: i64,
}

impl NewTag {
    pub fn new(name: impl Into<String>, kind: i64) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    /// Parses `name` or `name:type`. The type is taken after the last colon
    /// only when it is an integer, so names may themselves contain colons.
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        let (name, kind) = match input.rsplit_once(':') {
            Some((name, kind)) => match kind.parse::<i64>() {
                Ok(kind) => (name, kind),
                Err(_) => (input, 0),
            },
            None => (input, 0),
        };

        if name.is_empty() {
            return Err(AppError::InvalidInput(format!(
                "tag name is empty in {:?}",
                input
            )));
        }

        Ok(Self::new(name, kind))
    }
}

impl From<Tag> for NewTag {
    fn from(tag: Tag) -> Self {
        Self {
            name: tag.name,
            kind: tag.kind,
        }
    }
}

/// A tag supplied by a caller that may or may not have a stored id yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagCandidate {
    Unresolved(NewTag),
    Resolved(Tag),
}

impl From<NewTag> for TagCandidate {
    fn from(tag: NewTag) -> Self {
        TagCandidate::Unresolved(tag)
    }
}

impl From<Tag> for TagCandidate {
    fn from(tag: Tag) -> Self {
        TagCandidate::Resolved(tag)
    }
}

/// Selects articles carrying every listed tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagCriteria {
    Pairs(Vec<NewTag>),
    Names(Vec<String>),
    Ids(Vec<i64>),
}

impl TagCriteria {
    pub fn len(&self) -> usize {
        match self {
            TagCriteria::Pairs(tags) => tags.len(),
            TagCriteria::Names(names) => names.len(),
            TagCriteria::Ids(ids) => ids.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.id, self.name, self.kind)
    }
}
