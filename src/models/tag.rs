use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::JsonMap;
use crate::error::AppError;

flag_set!(TagFlags { FAVORITE = 1 });

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagCategory {
    #[default]
    General,
    Group,
    Artist,
    Copyright,
    Character,
    /// Informational tags and personal reminders.
    Meta,
}

impl TagCategory {
    pub fn as_i64(self) -> i64 {
        match self {
            TagCategory::General => 1,
            TagCategory::Group => 2,
            TagCategory::Artist => 3,
            TagCategory::Copyright => 4,
            TagCategory::Character => 5,
            TagCategory::Meta => 6,
        }
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            1 => Some(TagCategory::General),
            2 => Some(TagCategory::Group),
            3 => Some(TagCategory::Artist),
            4 => Some(TagCategory::Copyright),
            5 => Some(TagCategory::Character),
            6 => Some(TagCategory::Meta),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TagCategory::General => "general",
            TagCategory::Group => "group",
            TagCategory::Artist => "artist",
            TagCategory::Copyright => "copyright",
            TagCategory::Character => "character",
            TagCategory::Meta => "meta",
        }
    }
}

impl fmt::Display for TagCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TagCategory {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "general" => Ok(TagCategory::General),
            "group" => Ok(TagCategory::Group),
            "artist" => Ok(TagCategory::Artist),
            "copyright" => Ok(TagCategory::Copyright),
            "character" => Ok(TagCategory::Character),
            "meta" => Ok(TagCategory::Meta),
            other => Err(AppError::Adapter(format!("unknown tag category: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteTag {
    pub id: i64,
    pub source_id: i64,
    pub category: TagCategory,
    pub tag: String,
    pub metadata: JsonMap,
    pub flags: TagFlags,
}

impl fmt::Display for RemoteTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.category, self.tag)
    }
}
