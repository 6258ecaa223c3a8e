pub const SCHEMA: &str = r#"
-- source table
CREATE TABLE IF NOT EXISTS source (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE COLLATE NOCASE,
    config TEXT,
    metadata TEXT,
    preferred_plugin_id INTEGER REFERENCES plugin(id) ON DELETE SET NULL,
    update_interval_secs INTEGER,
    created_time TEXT NOT NULL,
    updated_time TEXT NOT NULL
);

-- plugin table
CREATE TABLE IF NOT EXISTS plugin (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_id INTEGER NOT NULL REFERENCES source(id) ON DELETE CASCADE,
    name TEXT NOT NULL UNIQUE COLLATE NOCASE,
    version INTEGER NOT NULL,
    config TEXT
);

-- remote_post table
CREATE TABLE IF NOT EXISTS remote_post (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_id INTEGER NOT NULL REFERENCES source(id) ON DELETE CASCADE,
    original_id TEXT,
    url TEXT,
    title TEXT COLLATE NOCASE,
    comment TEXT COLLATE NOCASE,
    type INTEGER NOT NULL,
    flags INTEGER NOT NULL DEFAULT 0,
    metadata TEXT,
    post_time TEXT,
    created_time TEXT NOT NULL,
    updated_time TEXT NOT NULL
);

-- NULL original ids never collide, so synthetic posts are unconstrained
CREATE UNIQUE INDEX IF NOT EXISTS idx_remote_posts ON remote_post(source_id, original_id);

-- remote_tag table
CREATE TABLE IF NOT EXISTS remote_tag (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_id INTEGER NOT NULL REFERENCES source(id) ON DELETE CASCADE,
    category INTEGER NOT NULL,
    tag TEXT NOT NULL COLLATE NOCASE,
    metadata TEXT,
    flags INTEGER NOT NULL DEFAULT 0,
    created_time TEXT NOT NULL,
    updated_time TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_remote_tags ON remote_tag(source_id, category, tag);

CREATE TABLE IF NOT EXISTS remote_post_tag (
    post_id INTEGER NOT NULL REFERENCES remote_post(id) ON DELETE CASCADE,
    tag_id INTEGER NOT NULL REFERENCES remote_tag(id) ON DELETE CASCADE,
    UNIQUE(post_id, tag_id)
);

CREATE INDEX IF NOT EXISTS idx_remote_post_tag_post ON remote_post_tag(post_id);

-- local posts curated from remote ones
CREATE TABLE IF NOT EXISTS post (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    title TEXT COLLATE NOCASE,
    comment TEXT COLLATE NOCASE,
    type INTEGER NOT NULL,
    flags INTEGER NOT NULL DEFAULT 0,
    metadata TEXT,
    post_time TEXT,
    created_time TEXT NOT NULL,
    updated_time TEXT NOT NULL
);

-- file table
CREATE TABLE IF NOT EXISTS file (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    local_id INTEGER REFERENCES post(id) ON DELETE SET NULL,
    remote_id INTEGER REFERENCES remote_post(id) ON DELETE SET NULL,
    local_order INTEGER NOT NULL DEFAULT 0,
    remote_order INTEGER NOT NULL DEFAULT 0,
    hash BLOB,
    filename TEXT,
    mime TEXT COLLATE NOCASE,
    ext TEXT COLLATE NOCASE,
    thumb_ext TEXT COLLATE NOCASE,
    remote_identifier TEXT,
    metadata TEXT,
    flags INTEGER NOT NULL DEFAULT 0,
    created_time TEXT NOT NULL,
    updated_time TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_file_remote_id ON file(remote_id);
CREATE INDEX IF NOT EXISTS idx_file_hash ON file(hash);

-- related table
CREATE TABLE IF NOT EXISTS related (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    related_to_id INTEGER REFERENCES remote_post(id) ON DELETE CASCADE,
    remote_id INTEGER REFERENCES remote_post(id) ON DELETE SET NULL,
    url TEXT
);

CREATE INDEX IF NOT EXISTS idx_related_to ON related(related_to_id);

-- subscription table
CREATE TABLE IF NOT EXISTS subscription (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_id INTEGER NOT NULL REFERENCES source(id) ON DELETE CASCADE,
    plugin_id INTEGER REFERENCES plugin(id) ON DELETE SET NULL,
    name TEXT NOT NULL,
    repr TEXT,
    options TEXT,
    state TEXT,
    metadata TEXT,
    flags INTEGER NOT NULL DEFAULT 0,
    update_interval_secs INTEGER,
    last_feed_update_time TEXT,
    created_time TEXT NOT NULL,
    updated_time TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_subscription ON subscription(source_id, name);
CREATE UNIQUE INDEX IF NOT EXISTS idx_subscription_repr ON subscription(source_id, repr);

-- feed table (subscription membership with an external ordering)
CREATE TABLE IF NOT EXISTS feed (
    subscription_id INTEGER NOT NULL REFERENCES subscription(id) ON DELETE CASCADE,
    remote_post_id INTEGER NOT NULL REFERENCES remote_post(id) ON DELETE CASCADE,
    sort_index INTEGER NOT NULL,
    UNIQUE(subscription_id, remote_post_id)
);

CREATE INDEX IF NOT EXISTS idx_feed_subscription ON feed(subscription_id, sort_index DESC);
"#;
