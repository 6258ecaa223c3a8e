use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::JsonMap;

/// A named remote origin, e.g. one website.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: i64,
    pub name: String,
    pub config: JsonMap,
    pub metadata: JsonMap,
    pub preferred_plugin_id: Option<i64>,
    pub update_interval: Option<Duration>,
    pub created_time: DateTime<Utc>,
    pub updated_time: DateTime<Utc>,
}

/// A versioned adapter instance bound to one source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plugin {
    pub id: i64,
    pub source_id: i64,
    pub name: String,
    pub version: i64,
    pub config: JsonMap,
}
