use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    #[serde(default)]
    pub is_superuser: bool,
}

impl Principal {
    pub fn user(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            is_superuser: false,
        }
    }

    pub fn superuser(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            is_superuser: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceClass {
    Chat,
    Embedding,
    Image2Text,
    Speech2Text,
    Rerank,
    Tts,
}

impl ResourceClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceClass::Chat => "chat",
            ResourceClass::Embedding => "embedding",
            ResourceClass::Image2Text => "image2text",
            ResourceClass::Speech2Text => "speech2text",
            ResourceClass::Rerank => "rerank",
            ResourceClass::Tts => "tts",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "chat" => Some(ResourceClass::Chat),
            "embedding" => Some(ResourceClass::Embedding),
            "image2text" => Some(ResourceClass::Image2Text),
            "speech2text" => Some(ResourceClass::Speech2Text),
            "rerank" => Some(ResourceClass::Rerank),
            "tts" => Some(ResourceClass::Tts),
            _ => None,
        }
    }
}

impl fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_class_round_trips_through_text() {
        for class in [
            ResourceClass::Chat,
            ResourceClass::Embedding,
            ResourceClass::Image2Text,
            ResourceClass::Speech2Text,
            ResourceClass::Rerank,
            ResourceClass::Tts,
        ] {
            assert_eq!(ResourceClass::parse(class.as_str()), Some(class));
        }
        assert_eq!(ResourceClass::parse("EMBEDDING"), Some(ResourceClass::Embedding));
        assert_eq!(ResourceClass::parse("vision"), None);
    }
}
