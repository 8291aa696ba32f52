/// SQL DDL for the broker database.
///
/// Each migration is a batch of idempotent statements; the index of the batch
/// in [`MIGRATIONS`] is the number recorded in the `migrations` table.

/// Highest migration number this build knows about.
pub const NUM_MIGRATIONS: i64 = 6;

pub const CREATE_MIGRATIONS_TABLE_SQL: &str = "
CREATE TABLE IF NOT EXISTS migrations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    migration_id INTEGER NOT NULL,
    created_at TEXT NOT NULL
);
";

const MIGRATION_0_CORE_TABLES: &str = "
CREATE TABLE IF NOT EXISTS service_instance_details (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL DEFAULT '',
    service_id TEXT NOT NULL DEFAULT '',
    plan_id TEXT NOT NULL DEFAULT '',
    space_guid TEXT NOT NULL DEFAULT '',
    organization_guid TEXT NOT NULL DEFAULT '',
    other_details BLOB,
    operation_type TEXT NOT NULL DEFAULT '',
    operation_id TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS service_binding_credentials (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    service_id TEXT NOT NULL DEFAULT '',
    service_instance_id TEXT NOT NULL,
    binding_id TEXT NOT NULL UNIQUE,
    other_details BLOB,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS provision_request_details (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    service_instance_id TEXT NOT NULL UNIQUE,
    request_details BLOB,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
";

const MIGRATION_1_PLAN_DETAILS: &str = "
CREATE TABLE IF NOT EXISTS plan_details (
    id TEXT PRIMARY KEY,
    service_id TEXT NOT NULL DEFAULT '',
    name TEXT NOT NULL DEFAULT '',
    features TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
";

const MIGRATION_2_TERRAFORM_DEPLOYMENTS: &str = "
CREATE TABLE IF NOT EXISTS terraform_deployments (
    id TEXT PRIMARY KEY,
    workspace BLOB,
    last_operation_type TEXT NOT NULL DEFAULT '',
    last_operation_state TEXT NOT NULL DEFAULT '',
    last_operation_message TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
";

const MIGRATION_3_BIND_REQUEST_DETAILS: &str = "
CREATE TABLE IF NOT EXISTS bind_request_details (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    service_binding_id TEXT NOT NULL UNIQUE,
    service_instance_id TEXT NOT NULL,
    request_details BLOB,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
";

const MIGRATION_4_PASSWORD_METADATA: &str = "
CREATE TABLE IF NOT EXISTS password_metadata (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    label TEXT NOT NULL UNIQUE,
    salt BLOB NOT NULL,
    canary BLOB NOT NULL,
    \"primary\" INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
";

const MIGRATION_5_BINDING_INDEX: &str = "
CREATE INDEX IF NOT EXISTS idx_binding_credentials_instance
    ON service_binding_credentials(service_instance_id);
CREATE INDEX IF NOT EXISTS idx_bind_request_details_instance
    ON bind_request_details(service_instance_id);
";

const MIGRATION_6_OPERATION_STATE_INDEX: &str = "
CREATE INDEX IF NOT EXISTS idx_terraform_deployments_state
    ON terraform_deployments(last_operation_state);
";

/// Ordered migration batches, indexed by migration number.
pub const MIGRATIONS: [&str; NUM_MIGRATIONS as usize + 1] = [
    MIGRATION_0_CORE_TABLES,
    MIGRATION_1_PLAN_DETAILS,
    MIGRATION_2_TERRAFORM_DEPLOYMENTS,
    MIGRATION_3_BIND_REQUEST_DETAILS,
    MIGRATION_4_PASSWORD_METADATA,
    MIGRATION_5_BINDING_INDEX,
    MIGRATION_6_OPERATION_STATE_INDEX,
];
