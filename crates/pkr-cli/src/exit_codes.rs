//! Process exit codes, one per error kind

/// Operation completed
pub const SUCCESS: i32 = 0;

/// Unclassified failure
pub const ERROR: i32 = 1;

/// Malformed or contradictory configuration: sources, environments,
/// drivers, required meta, output conflicts
pub const CONFIG_ERROR: i32 = 2;

/// Template rendering failed
pub const TEMPLATE_ERROR: i32 = 3;

/// The kard driver does not offer the requested operation
pub const UNSUPPORTED_ERROR: i32 = 4;

/// File not found, permission denied, etc.
pub const IO_ERROR: i32 = 5;

/// An external tool (docker, kubectl, git) or the cluster failed
pub const COLLABORATOR_ERROR: i32 = 6;

/// Interrupted by the user (128 + SIGINT)
pub const CANCELLED: i32 = 130;
