//! Migration path planning between two schema versions

use serde::{Deserialize, Serialize};

use super::definition::{SchemaDefinition, SchemaStatus};
use super::version::SchemaVersion;

/// Result of planning a path from one version to another
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationPlan {
    pub from: SchemaVersion,
    pub to: SchemaVersion,
    /// Schemas to apply, ascending by version
    pub path: Vec<SchemaDefinition>,
    pub is_valid: bool,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    /// Sum of the per-schema estimates, in minutes
    pub estimated_time_minutes: u32,
    pub breaking_changes: bool,
}

impl MigrationPlan {
    pub fn versions(&self) -> Vec<SchemaVersion> {
        self.path.iter().map(|s| s.version).collect()
    }

    /// Every collection named by any schema on the path
    pub fn collections(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .path
            .iter()
            .flat_map(|s| s.collections.iter().map(|c| c.name.clone()))
            .collect();
        names.sort();
        names.dedup();
        names
    }

    pub fn target_schema(&self) -> Option<&SchemaDefinition> {
        self.path.last()
    }
}

/// Select and check the schemas in `(from, to]`.
///
/// Only error-level findings invalidate the plan; warnings are advisory.
pub fn plan_path(
    registered: &[SchemaDefinition],
    from: SchemaVersion,
    to: SchemaVersion,
) -> MigrationPlan {
    let mut plan = MigrationPlan {
        from,
        to,
        path: Vec::new(),
        is_valid: true,
        warnings: Vec::new(),
        errors: Vec::new(),
        estimated_time_minutes: 0,
        breaking_changes: false,
    };

    if from > to {
        plan.errors.push(format!(
            "cannot plan a downgrade from {} to {}; use a rollback instead",
            from, to
        ));
        plan.is_valid = false;
        return plan;
    }
    if from == to {
        plan.warnings
            .push(format!("already at version {}, nothing to migrate", to));
        return plan;
    }
    if !registered.iter().any(|s| s.version == to) {
        plan.errors
            .push(format!("target version {} is not registered", to));
    }

    let mut path: Vec<SchemaDefinition> = registered
        .iter()
        .filter(|s| s.version > from && s.version <= to)
        .cloned()
        .collect();
    path.sort_by(|a, b| a.version.cmp(&b.version));

    let mut running = from;
    for schema in &path {
        let version = schema.version;

        if let Some(min) = schema.compatibility.min_version {
            if running < min {
                plan.errors.push(format!(
                    "schema {} requires at least version {}, but the path is at {}",
                    version, min, running
                ));
            }
        }
        if let Some(max) = schema.compatibility.max_version {
            if running > max {
                plan.errors.push(format!(
                    "schema {} supports upgrades from at most version {}, but the path is at {}",
                    version, max, running
                ));
            }
        }

        match schema.status {
            SchemaStatus::Draft => plan
                .warnings
                .push(format!("schema {} is still a draft", version)),
            SchemaStatus::Deprecated => plan
                .warnings
                .push(format!("schema {} is deprecated", version)),
            SchemaStatus::Archived => plan
                .errors
                .push(format!("schema {} is archived and cannot be applied", version)),
            SchemaStatus::Active => {}
        }

        if schema.breaking {
            plan.breaking_changes = true;
            plan.warnings.push(format!(
                "schema {} introduces breaking changes",
                version
            ));
        }

        plan.estimated_time_minutes = plan
            .estimated_time_minutes
            .saturating_add(schema.estimated_migration_minutes);
        running = version;
    }

    plan.path = path;
    plan.is_valid = plan.errors.is_empty();
    plan
}
