use serde::{Serialize, Deserialize};
use std::fmt;
use std::str::FromStr;

/// Collection an image was discovered in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceCollection {
    Gallery,
    Event,
}

impl SourceCollection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceCollection::Gallery => "gallery",
            SourceCollection::Event => "event",
        }
    }

    /// Link used when a listing hit carries none of its own.
    pub fn default_link(&self) -> &'static str {
        match self {
            SourceCollection::Gallery => "/gallery",
            SourceCollection::Event => "/events",
        }
    }
}

impl fmt::Display for SourceCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceCollection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "gallery" => Ok(SourceCollection::Gallery),
            "event" | "events" => Ok(SourceCollection::Event),
            other => Err(format!("unknown source collection: {}", other)),
        }
    }
}

/// Pointer to an externally stored image. Identity is the `url`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub url: String,
    pub source_collection: SourceCollection,
    pub source_link: String,
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct MatchRecord {
    pub image: ImageReference,
    pub matched: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_collection_parse() {
        assert_eq!("gallery".parse::<SourceCollection>().unwrap(), SourceCollection::Gallery);
        assert_eq!(" Events ".parse::<SourceCollection>().unwrap(), SourceCollection::Event);
        assert!("albums".parse::<SourceCollection>().is_err());
    }

    #[test]
    fn test_image_reference_serializes_lowercase_collection() {
        let r = ImageReference {
            url: "https://cdn.example.com/a.jpg".to_string(),
            source_collection: SourceCollection::Event,
            source_link: "/events/spring-gala".to_string(),
        };
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["source_collection"], "event");
        assert_eq!(v["source_link"], "/events/spring-gala");
    }
}
