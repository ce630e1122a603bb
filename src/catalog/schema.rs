//! SQLite schema definition

/// SQL schema for the catalog database
pub const SCHEMA_SQL: &str = r#"
-- Projects: map workspaces grouping datasets and charts
CREATE TABLE IF NOT EXISTS projects (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    owner TEXT,
    default_map_center_json TEXT NOT NULL,
    default_map_zoom REAL NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Datasets: a named group of ingested files and their converted layers
CREATE TABLE IF NOT EXISTS datasets (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    description TEXT NOT NULL DEFAULT '',
    category TEXT,
    metadata_json TEXT NOT NULL DEFAULT '{}',
    owner TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS dataset_tags (
    dataset_id TEXT NOT NULL REFERENCES datasets(id) ON DELETE CASCADE,
    tag TEXT NOT NULL,
    PRIMARY KEY (dataset_id, tag)
);

-- Project membership, replaced wholesale
CREATE TABLE IF NOT EXISTS project_datasets (
    project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    dataset_id TEXT NOT NULL REFERENCES datasets(id) ON DELETE CASCADE,
    PRIMARY KEY (project_id, dataset_id)
);

CREATE TABLE IF NOT EXISTS charts (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    description TEXT NOT NULL DEFAULT '',
    project_id TEXT REFERENCES projects(id) ON DELETE CASCADE,
    metadata_json TEXT,
    chart_data_json TEXT,
    chart_options_json TEXT,
    editable INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- File items: owned by exactly one dataset or chart
CREATE TABLE IF NOT EXISTS file_items (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    dataset_id TEXT REFERENCES datasets(id) ON DELETE CASCADE,
    chart_id TEXT REFERENCES charts(id) ON DELETE CASCADE,
    file_type TEXT NOT NULL,
    file_size INTEGER NOT NULL,
    file_index INTEGER NOT NULL DEFAULT 0,
    metadata_json TEXT NOT NULL DEFAULT '{}',
    blob_path TEXT NOT NULL,
    created_at TEXT NOT NULL,
    CHECK ((dataset_id IS NULL) <> (chart_id IS NULL)),
    UNIQUE (dataset_id, name),
    UNIQUE (chart_id, name)
);

-- Normalized vector layers
CREATE TABLE IF NOT EXISTS vector_data (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    dataset_id TEXT NOT NULL REFERENCES datasets(id) ON DELETE CASCADE,
    source_file_id TEXT REFERENCES file_items(id) ON DELETE CASCADE,
    metadata_json TEXT NOT NULL DEFAULT '{}',
    feature_count INTEGER NOT NULL DEFAULT 0,
    blob_path TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS vector_features (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    vector_data_id TEXT NOT NULL REFERENCES vector_data(id) ON DELETE CASCADE,
    geometry_json TEXT NOT NULL,
    properties_json TEXT NOT NULL DEFAULT '{}'
);

-- Canonical cloud-optimized rasters
CREATE TABLE IF NOT EXISTS raster_data (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    dataset_id TEXT NOT NULL REFERENCES datasets(id) ON DELETE CASCADE,
    source_file_id TEXT REFERENCES file_items(id) ON DELETE CASCADE,
    metadata_json TEXT NOT NULL DEFAULT '{}',
    blob_path TEXT NOT NULL,
    created_at TEXT NOT NULL
);

-- Job records: status and results of asynchronous work
CREATE TABLE IF NOT EXISTS job_records (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    job_type TEXT NOT NULL,
    project_id TEXT REFERENCES projects(id) ON DELETE SET NULL,
    inputs_json TEXT NOT NULL DEFAULT '{}',
    outputs_json TEXT,
    status TEXT NOT NULL,
    error TEXT,
    completed INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    completed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_file_items_dataset ON file_items(dataset_id);
CREATE INDEX IF NOT EXISTS idx_file_items_chart ON file_items(chart_id);
CREATE INDEX IF NOT EXISTS idx_vector_data_dataset ON vector_data(dataset_id);
CREATE INDEX IF NOT EXISTS idx_vector_features_data ON vector_features(vector_data_id);
CREATE INDEX IF NOT EXISTS idx_raster_data_dataset ON raster_data(dataset_id);
CREATE INDEX IF NOT EXISTS idx_job_records_project ON job_records(project_id);
CREATE INDEX IF NOT EXISTS idx_job_records_created ON job_records(created_at);
"#;
