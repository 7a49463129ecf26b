pub const SCHEMA_VERSION: &str = "1";

pub const CREATE_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

-- One row per scan. Counters are a cache refreshed by the progress aggregator
CREATE TABLE IF NOT EXISTS user_progress (
    scan_id INTEGER PRIMARY KEY,
    user_id INTEGER NOT NULL,
    total_recommendations INTEGER NOT NULL DEFAULT 0,
    active_recommendations INTEGER NOT NULL DEFAULT 0,
    completed_recommendations INTEGER NOT NULL DEFAULT 0,
    locked_recommendations INTEGER NOT NULL DEFAULT 0,
    skipped_recommendations INTEGER NOT NULL DEFAULT 0,
    site_wide_total INTEGER NOT NULL DEFAULT 0,
    site_wide_completed INTEGER NOT NULL DEFAULT 0,
    site_wide_active INTEGER NOT NULL DEFAULT 0,
    page_specific_total INTEGER NOT NULL DEFAULT 0,
    page_specific_completed INTEGER NOT NULL DEFAULT 0,
    site_wide_complete BOOLEAN NOT NULL DEFAULT 0,
    total_batches INTEGER NOT NULL,
    next_replacement_date INTEGER,
    last_replacement_date INTEGER,
    recommendations_replaced_count INTEGER NOT NULL DEFAULT 0,
    target_active_count INTEGER NOT NULL DEFAULT 5,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    CHECK (completed_recommendations <= total_recommendations),
    CHECK (site_wide_completed <= site_wide_total),
    CHECK (page_specific_completed <= page_specific_total)
);

CREATE INDEX IF NOT EXISTS idx_user_progress_user ON user_progress (user_id);
CREATE INDEX IF NOT EXISTS idx_user_progress_replacement ON user_progress (next_replacement_date);

-- Each time a batch became eligible. is_initial marks the grant made at ingest
CREATE TABLE IF NOT EXISTS batch_unlocks (
    unlock_id INTEGER PRIMARY KEY AUTOINCREMENT,
    scan_id INTEGER NOT NULL,
    batch_number INTEGER NOT NULL CHECK (batch_number >= 1),
    unlocked_at INTEGER NOT NULL,
    unlocked_count INTEGER NOT NULL,
    is_initial BOOLEAN NOT NULL DEFAULT 0,
    FOREIGN KEY (scan_id) REFERENCES user_progress(scan_id)
);

CREATE INDEX IF NOT EXISTS idx_batch_unlocks_scan ON batch_unlocks (scan_id, unlocked_at);

CREATE TABLE IF NOT EXISTS recommendations (
    recommendation_id INTEGER PRIMARY KEY AUTOINCREMENT,
    scan_id INTEGER NOT NULL,
    user_id INTEGER NOT NULL,
    category TEXT NOT NULL,
    recommendation_text TEXT NOT NULL CHECK (length(trim(recommendation_text)) > 0),
    scope INTEGER NOT NULL,                         -- 0 = site-wide, 1 = page-specific
    page_url TEXT,
    required_elements TEXT NOT NULL DEFAULT '[]',   -- JSON array of element descriptors
    unlock_state INTEGER NOT NULL,
    batch_number INTEGER NOT NULL CHECK (batch_number >= 1),
    progress_percentage INTEGER NOT NULL DEFAULT 0 CHECK (progress_percentage BETWEEN 0 AND 100),
    validation_status INTEGER,
    previous_recommendation_id INTEGER,
    created_at INTEGER NOT NULL,
    unlocked_at INTEGER,
    completed_at INTEGER,
    last_validated_at INTEGER,
    updated_at INTEGER NOT NULL,
    FOREIGN KEY (scan_id) REFERENCES user_progress(scan_id),
    FOREIGN KEY (previous_recommendation_id) REFERENCES recommendations(recommendation_id)
);

CREATE INDEX IF NOT EXISTS idx_recommendations_scan_state ON recommendations (scan_id, unlock_state, batch_number);
CREATE INDEX IF NOT EXISTS idx_recommendations_user ON recommendations (user_id);

-- A record is superseded at most once, so the replacement chain never branches
CREATE UNIQUE INDEX IF NOT EXISTS idx_recommendations_previous
    ON recommendations (previous_recommendation_id)
    WHERE previous_recommendation_id IS NOT NULL;

CREATE TRIGGER IF NOT EXISTS recommendations_no_delete
BEFORE DELETE ON recommendations
BEGIN
    SELECT RAISE(ABORT, 'recommendations are never deleted');
END;

CREATE TABLE IF NOT EXISTS validation_history (
    history_id INTEGER PRIMARY KEY AUTOINCREMENT,
    recommendation_id INTEGER NOT NULL,
    scan_id INTEGER NOT NULL,
    checked_elements TEXT NOT NULL,                 -- JSON array
    found_elements TEXT NOT NULL,                   -- JSON array
    missing_elements TEXT NOT NULL,                 -- JSON array
    outcome INTEGER NOT NULL,
    completion_percentage INTEGER NOT NULL CHECK (completion_percentage BETWEEN 0 AND 100),
    state_before INTEGER NOT NULL,
    state_after INTEGER NOT NULL,
    applied BOOLEAN NOT NULL,
    checked_at INTEGER NOT NULL,
    FOREIGN KEY (recommendation_id) REFERENCES recommendations(recommendation_id)
);

CREATE INDEX IF NOT EXISTS idx_validation_history_rec ON validation_history (recommendation_id, history_id);

CREATE TRIGGER IF NOT EXISTS validation_history_no_update
BEFORE UPDATE ON validation_history
BEGIN
    SELECT RAISE(ABORT, 'validation_history is append-only');
END;

CREATE TRIGGER IF NOT EXISTS validation_history_no_delete
BEFORE DELETE ON validation_history
BEGIN
    SELECT RAISE(ABORT, 'validation_history is append-only');
END;

-- Fresh content queued by the generation service, consumed by replacements
CREATE TABLE IF NOT EXISTS replacement_candidates (
    candidate_id INTEGER PRIMARY KEY AUTOINCREMENT,
    scan_id INTEGER NOT NULL,
    category TEXT NOT NULL,
    recommendation_text TEXT NOT NULL,
    scope INTEGER NOT NULL,
    page_url TEXT,
    required_elements TEXT NOT NULL DEFAULT '[]',
    created_at INTEGER NOT NULL,
    FOREIGN KEY (scan_id) REFERENCES user_progress(scan_id)
);

CREATE INDEX IF NOT EXISTS idx_replacement_candidates_scan ON replacement_candidates (scan_id, candidate_id);
"#;
