//! Maintenance commands: reset, restart, swap/unswap and health check.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::Profile;
use crate::core::identifier::{qualify_pg, quote_pg};
use crate::core::traits::{CatalogSource, Connector};
use crate::error::{Result, SliceError};
use crate::fanout::{Unit, Wave};

/// Drop the destination and staging tables of the named families.
pub fn reset_waves(profile: &Profile, families: &[String]) -> Result<Vec<Wave>> {
    if families.is_empty() {
        return Err(SliceError::config("reset needs at least one family"));
    }
    let mut units = Vec::new();
    for name in families {
        let family = profile
            .family(name)
            .ok_or_else(|| SliceError::config(format!("unknown family: {}", name)))?;

        let mut statements = Vec::new();
        // Children before parents.
        for table in family.tables().iter().rev() {
            statements.push(format!(
                "DROP TABLE IF EXISTS {} CASCADE",
                qualify_pg(&profile.dest_schema, table)?
            ));
        }
        let root = family.root.selection.as_deref().and_then(|r| profile.root(r));
        if let Some(root) = root.filter(|r| r.shard_count() > 1) {
            for shard in 0..root.shard_count() {
                statements.push(format!(
                    "DROP TABLE IF EXISTS {}",
                    qualify_pg(
                        &profile.shards_schema,
                        &format!("{}_sh{}", family.root.table, shard)
                    )?
                ));
            }
        }
        units.push(Unit::statements(&family.root.table, format!("reset {}", name), statements));
    }
    Ok(vec![Wave::parallel(units)])
}

/// Statements recreating the destination schema from scratch.
pub fn restart_statements(profile: &Profile) -> Result<Vec<String>> {
    let dest = quote_pg(&profile.dest_schema)?;
    Ok(vec![
        format!("DROP SCHEMA IF EXISTS {} CASCADE", dest),
        format!("CREATE SCHEMA {}", dest),
    ])
}

/// Direction of a schema swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapDirection {
    /// source → old, destination → source.
    Swap,
    /// source → destination, old → source.
    Unswap,
}

/// Check preconditions and return the renames, run in one transaction.
pub async fn swap_statements(
    profile: &Profile,
    catalog: &dyn CatalogSource,
    direction: SwapDirection,
) -> Result<Vec<String>> {
    let source = quote_pg(&profile.source_schema)?;
    let dest = quote_pg(&profile.dest_schema)?;
    let old = quote_pg(&profile.old_schema)?;

    let require = |exists: bool, schema: &str, wanted: bool| {
        if exists == wanted {
            Ok(())
        } else if wanted {
            Err(SliceError::config(format!("schema {} does not exist", schema)))
        } else {
            Err(SliceError::config(format!("schema {} already exists", schema)))
        }
    };

    let (renames, checks) = match direction {
        SwapDirection::Swap => (
            vec![
                format!("ALTER SCHEMA {} RENAME TO {}", source, old),
                format!("ALTER SCHEMA {} RENAME TO {}", dest, source),
            ],
            [
                (&profile.source_schema, true),
                (&profile.dest_schema, true),
                (&profile.old_schema, false),
            ],
        ),
        SwapDirection::Unswap => (
            vec![
                format!("ALTER SCHEMA {} RENAME TO {}", source, dest),
                format!("ALTER SCHEMA {} RENAME TO {}", old, source),
            ],
            [
                (&profile.source_schema, true),
                (&profile.old_schema, true),
                (&profile.dest_schema, false),
            ],
        ),
    };
    for (schema, wanted) in checks {
        require(catalog.schema_exists(schema).await?, schema.as_str(), wanted)?;
    }
    Ok(renames)
}

/// Result of a connectivity check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub endpoint: String,
    pub connected: bool,
    pub latency_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub source_schema_exists: bool,
    pub dest_schema_exists: bool,
    pub healthy: bool,
}

/// Connect, run a trivial query and look up the profile's schemas.
pub async fn health_check(
    profile: &Profile,
    connector: &dyn Connector,
    catalog: &dyn CatalogSource,
) -> HealthReport {
    let started = Instant::now();
    let mut report = HealthReport {
        endpoint: connector.describe(),
        connected: false,
        latency_ms: 0,
        error: None,
        source_schema_exists: false,
        dest_schema_exists: false,
        healthy: false,
    };

    let attempt = async {
        let mut session = connector.connect().await?;
        session.query_scalar("SELECT 1::bigint").await?;
        Ok::<_, SliceError>(())
    };
    match attempt.await {
        Ok(()) => {
            report.connected = true;
            report.latency_ms = started.elapsed().as_millis() as u64;
        }
        Err(e) => {
            report.error = Some(e.to_string());
            return report;
        }
    }

    match (
        catalog.schema_exists(&profile.source_schema).await,
        catalog.schema_exists(&profile.dest_schema).await,
    ) {
        (Ok(source), Ok(dest)) => {
            report.source_schema_exists = source;
            report.dest_schema_exists = dest;
        }
        (Err(e), _) | (_, Err(e)) => report.error = Some(e.to_string()),
    }
    report.healthy = report.connected && report.error.is_none() && report.source_schema_exists;
    info!(
        "health check {}: {} in {}ms",
        report.endpoint,
        if report.healthy { "healthy" } else { "unhealthy" },
        report.latency_ms
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schema::SchemaSnapshot;
    use crate::drivers::mock::MockConnector;
    use crate::testing::shop_profile;

    #[test]
    fn test_reset_drops_children_first() {
        let waves = reset_waves(&shop_profile(), &["shop".to_string()]).unwrap();
        assert_eq!(
            waves[0].units[0].sql(),
            vec![
                "DROP TABLE IF EXISTS \"stage\".\"order_item\" CASCADE".to_string(),
                "DROP TABLE IF EXISTS \"stage\".\"order\" CASCADE".to_string(),
                "DROP TABLE IF EXISTS \"stage\".\"product\" CASCADE".to_string(),
                "DROP TABLE IF EXISTS \"stage\".\"store\" CASCADE".to_string(),
            ]
        );
    }

    #[test]
    fn test_reset_unknown_family() {
        assert!(matches!(
            reset_waves(&shop_profile(), &["nope".to_string()]).unwrap_err(),
            SliceError::Config(_)
        ));
        assert!(reset_waves(&shop_profile(), &[]).is_err());
    }

    #[test]
    fn test_restart() {
        assert_eq!(
            restart_statements(&shop_profile()).unwrap(),
            vec![
                "DROP SCHEMA IF EXISTS \"stage\" CASCADE".to_string(),
                "CREATE SCHEMA \"stage\"".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_swap_checks_preconditions() {
        let profile = shop_profile();
        let ready = MockConnector::new()
            .with_snapshot(SchemaSnapshot::empty("public"))
            .with_snapshot(SchemaSnapshot::empty("stage"));
        let renames = swap_statements(&profile, &ready, SwapDirection::Swap)
            .await
            .unwrap();
        assert_eq!(
            renames,
            vec![
                "ALTER SCHEMA \"public\" RENAME TO \"old\"".to_string(),
                "ALTER SCHEMA \"stage\" RENAME TO \"public\"".to_string(),
            ]
        );

        // Nothing to unswap without an old schema.
        let err = swap_statements(&profile, &ready, SwapDirection::Unswap)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("old does not exist"));

        let swapped = MockConnector::new()
            .with_snapshot(SchemaSnapshot::empty("public"))
            .with_snapshot(SchemaSnapshot::empty("old"));
        assert!(swap_statements(&profile, &swapped, SwapDirection::Swap)
            .await
            .unwrap_err()
            .to_string()
            .contains("old already exists"));
        assert_eq!(
            swap_statements(&profile, &swapped, SwapDirection::Unswap)
                .await
                .unwrap()[1],
            "ALTER SCHEMA \"old\" RENAME TO \"public\""
        );
    }

    #[tokio::test]
    async fn test_health_check() {
        let profile = shop_profile();
        let connector = MockConnector::new()
            .with_rows("SELECT 1", vec![vec![Some(1)]])
            .with_snapshot(SchemaSnapshot::empty("public"));
        let report = health_check(&profile, &connector, &connector).await;
        assert!(report.connected);
        assert!(report.healthy);
        assert!(!report.dest_schema_exists);

        let down = MockConnector::new().fail_on("SELECT 1");
        let report = health_check(&profile, &down, &down).await;
        assert!(!report.connected);
        assert!(!report.healthy);
        assert!(report.error.is_some());
    }
}
