use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::JsonMap;

flag_set!(PostFlags {
    FAVORITE = 1,
    HIDDEN = 2,
    // deleted on the remote host
    REMOVED = 4,
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PostKind {
    /// Bundle of unrelated files, or a single file.
    #[default]
    Set,
    /// Files that belong together.
    Collection,
    /// Text with files in between.
    Blog,
}

impl PostKind {
    pub fn as_i64(self) -> i64 {
        match self {
            PostKind::Set => 1,
            PostKind::Collection => 2,
            PostKind::Blog => 3,
        }
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            1 => Some(PostKind::Set),
            2 => Some(PostKind::Collection),
            3 => Some(PostKind::Blog),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemotePost {
    pub id: i64,
    pub source_id: i64,
    pub original_id: Option<String>,
    pub url: Option<String>,
    pub title: Option<String>,
    pub comment: Option<String>,
    pub kind: PostKind,
    pub flags: PostFlags,
    pub metadata: JsonMap,
    pub post_time: Option<DateTime<Utc>>,
    pub created_time: DateTime<Utc>,
    pub updated_time: DateTime<Utc>,
}

impl RemotePost {
    /// Numeric reading of the original id, used as the default feed position.
    pub fn numeric_original_id(&self) -> Option<i64> {
        self.original_id.as_deref().and_then(|id| id.parse().ok())
    }
}

/// Directed link from a post to a URL, resolved to another post once downloaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Related {
    pub id: i64,
    pub related_to_id: i64,
    pub remote_id: Option<i64>,
    pub url: Option<String>,
}
