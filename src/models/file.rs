use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::JsonMap;

flag_set!(FileFlags {
    FAVORITE = 1,
    HIDDEN = 2,
    // removed on the remote host
    REMOVED = 4,
    // accepted or rejected locally
    PROCESSED = 8,
    PRESENT = 16,
    THUMB_PRESENT = 32,
});

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct File {
    pub id: i64,
    pub local_id: Option<i64>,
    pub remote_id: Option<i64>,
    pub local_order: i64,
    pub remote_order: i64,
    pub hash: Option<Vec<u8>>,
    pub filename: Option<String>,
    pub mime: Option<String>,
    pub ext: Option<String>,
    pub thumb_ext: Option<String>,
    pub remote_identifier: Option<String>,
    pub metadata: JsonMap,
    pub flags: FileFlags,
    pub created_time: DateTime<Utc>,
    pub updated_time: DateTime<Utc>,
}

impl File {
    pub fn is_present(&self) -> bool {
        self.flags.contains(FileFlags::PRESENT)
    }

    pub fn is_thumb_present(&self) -> bool {
        self.flags.contains(FileFlags::THUMB_PRESENT)
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewFile {
    pub remote_id: i64,
    pub remote_order: i64,
    pub filename: Option<String>,
    pub remote_identifier: Option<String>,
    pub metadata: JsonMap,
}
