/// Error code registry for schemaflow
///
/// Error codes are organized by category:
/// - 1000-1999: Configuration errors
/// - 2000-2999: Validation errors
/// - 3000-3999: Storage errors
/// - 4000-4999: Migration errors
/// - 5000-5999: Safety errors
/// - 6000-6999: Rollback errors
/// - 7000-7999: Deployment errors
/// - 9000-9999: Other errors
#[allow(dead_code)]
pub struct ErrorCode;

impl ErrorCode {
    // Configuration errors (1000-1999)
    pub const CONFIG_GENERIC: u16 = 1000;
    pub const CONFIG_NOT_FOUND: u16 = 1001;
    pub const CONFIG_PARSE_ERROR: u16 = 1002;
    pub const CONFIG_INVALID_VALUE: u16 = 1003;
    pub const CONFIG_INVALID_VERSION: u16 = 1004;
    pub const CONFIG_CIRCULAR_DEPENDENCY: u16 = 1005;
    pub const CONFIG_UNKNOWN_DEPENDENCY: u16 = 1006;
    pub const CONFIG_DUPLICATE_OPERATION: u16 = 1007;
    pub const CONFIG_INVALID_PATH: u16 = 1008;

    // Validation errors (2000-2999)
    pub const VALIDATION_GENERIC: u16 = 2000;
    pub const VALIDATION_SCHEMA_STRUCTURE: u16 = 2001;
    pub const VALIDATION_DUPLICATE_VERSION: u16 = 2002;
    pub const VALIDATION_BREAKING_FLAG: u16 = 2003;
    pub const VALIDATION_DOCUMENT_REJECTED: u16 = 2004;

    // Storage errors (3000-3999)
    pub const STORAGE_GENERIC: u16 = 3000;
    pub const STORAGE_NOT_FOUND: u16 = 3001;
    pub const STORAGE_CONFLICT: u16 = 3002;
    pub const STORAGE_CAPACITY: u16 = 3003;
    pub const STORAGE_UNAVAILABLE: u16 = 3004;
    pub const STORAGE_SERIALIZATION_ERROR: u16 = 3005;
    pub const STORAGE_TEMPORARY: u16 = 3006;

    // Migration errors (4000-4999)
    pub const MIGRATION_GENERIC: u16 = 4000;
    pub const MIGRATION_DOCUMENT_FAILED: u16 = 4001;
    pub const MIGRATION_HOOK_FAILED: u16 = 4002;
    pub const MIGRATION_CONVERSION_FAILED: u16 = 4003;
    pub const MIGRATION_RETRIES_EXHAUSTED: u16 = 4004;

    // Safety errors (5000-5999)
    pub const SAFETY_GENERIC: u16 = 5000;
    pub const SAFETY_BACKUP_FAILED: u16 = 5001;
    pub const SAFETY_BACKUP_NOT_FOUND: u16 = 5002;
    pub const SAFETY_CHECKSUM_MISMATCH: u16 = 5003;
    pub const SAFETY_BACKUP_UNUSABLE: u16 = 5004;
    pub const SAFETY_MONITOR_NOT_FOUND: u16 = 5005;
    pub const SAFETY_NO_RESUME_POINT: u16 = 5006;
    pub const SAFETY_INVALID_STATE: u16 = 5007;
    pub const SAFETY_CHECK_FAILED: u16 = 5008;

    // Rollback errors (6000-6999)
    pub const ROLLBACK_GENERIC: u16 = 6000;
    pub const ROLLBACK_RESTORE_FAILED: u16 = 6001;
    pub const ROLLBACK_PLAN_INVALID: u16 = 6002;

    // Deployment errors (7000-7999)
    pub const DEPLOYMENT_GENERIC: u16 = 7000;
    pub const DEPLOYMENT_PHASE_FAILED: u16 = 7001;
    pub const DEPLOYMENT_CANARY_UNHEALTHY: u16 = 7002;
    pub const DEPLOYMENT_CANCELLED: u16 = 7003;
    pub const DEPLOYMENT_NOT_FOUND: u16 = 7004;
    pub const DEPLOYMENT_STRATEGY_REJECTED: u16 = 7005;

    // Other errors (9000-9999)
    pub const OTHER_GENERIC: u16 = 9000;
    pub const OTHER_INTERNAL_ERROR: u16 = 9001;
}

/// Get a human-readable description for an error code
pub fn describe_error_code(code: u16) -> &'static str {
    match code {
        1000 => "Generic configuration error",
        1001 => "Configuration file not found",
        1002 => "Failed to parse configuration",
        1003 => "Invalid value in configuration",
        1004 => "Malformed schema version",
        1005 => "Circular dependency between migration operations",
        1006 => "Migration operation depends on an unknown operation",
        1007 => "Duplicate migration operation id",
        1008 => "Invalid migration path",

        2000 => "Generic validation error",
        2001 => "Schema definition failed structural validation",
        2002 => "Schema version is already registered",
        2003 => "Major version bump without breaking flag",
        2004 => "Document rejected by validator",

        3000 => "Generic storage error",
        3001 => "Document or record not found",
        3002 => "Concurrent modification conflict",
        3003 => "Write group exceeds store capacity",
        3004 => "Document store unavailable",
        3005 => "Storage serialization error",
        3006 => "Temporary storage error",

        4000 => "Generic migration error",
        4001 => "Migration failed on a document",
        4002 => "Migration hook failed",
        4003 => "Field type conversion failed",
        4004 => "Retry attempts exhausted",

        5000 => "Generic safety error",
        5001 => "Backup creation failed",
        5002 => "Backup not found",
        5003 => "Backup checksum mismatch",
        5004 => "Backup is not in a restorable state",
        5005 => "Migration monitor not found",
        5006 => "No resumable checkpoint available",
        5007 => "Monitor is in an invalid state for this action",
        5008 => "Critical safety check failed",

        6000 => "Generic rollback error",
        6001 => "Restore failed during rollback",
        6002 => "Rollback plan is invalid",

        7000 => "Generic deployment error",
        7001 => "Deployment phase failed",
        7002 => "Canary success rate below threshold",
        7003 => "Deployment cancelled",
        7004 => "Deployment not found",
        7005 => "Deployment strategy not allowed",

        9000 => "Generic error",
        9001 => "Internal error",

        _ => "Unknown error code",
    }
}
