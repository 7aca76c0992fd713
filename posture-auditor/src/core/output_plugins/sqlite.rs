/*!
SQLite output: the findings table is replaced wholesale on every run.

Drop, create and insert happen in one transaction, so a failed write leaves the
previous run's table untouched.
*/

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use rusqlite::{Connection, params_from_iter};
use tracing::info;

use crate::core::{
    config::{OutputsConfig, SqliteConfig},
    error::{ConfigError, OutputError},
    finding::Finding,
};

use super::OutputProvider;

pub const NAME: &str = "sqlite";

/// Column order of the findings table
pub const COLUMNS: [&str; 19] = [
    "schemaversion",
    "findingid",
    "awsaccountid",
    "productarn",
    "generatorid",
    "types",
    "createdat",
    "severitylabel",
    "confidence",
    "title",
    "description",
    "resourcetype",
    "resourceid",
    "resourceregion",
    "resourcepartition",
    "compliancestatus",
    "compliancecontrols",
    "workflowstatus",
    "recordstate",
];

pub fn factory(config: &OutputsConfig) -> Result<Box<dyn OutputProvider>, ConfigError> {
    let section = OutputsConfig::section(NAME, &config.sqlite)?;
    Ok(Box::new(SqliteOutputProvider::new(section)?))
}

/// SQLite database output provider
pub struct SqliteOutputProvider {
    file_path: PathBuf,
    table_name: String,
}

impl SqliteOutputProvider {
    /// The table name is checked here since it is spliced into SQL
    pub fn new(config: &SqliteConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            file_path: config.path.clone(),
            table_name: config.table_name.clone(),
        })
    }
}

#[async_trait]
impl OutputProvider for SqliteOutputProvider {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn write_findings(&mut self, findings: &[Finding]) -> Result<(), OutputError> {
        let rows: Vec<[String; 19]> = findings.iter().map(finding_row).collect();
        let file_path = self.file_path.clone();
        let table_name = self.table_name.clone();

        let written =
            tokio::task::spawn_blocking(move || replace_table(&file_path, &table_name, &rows))
                .await??;

        info!("Replaced table {} with {} findings", self.table_name, written);
        Ok(())
    }
}

fn replace_table(path: &Path, table_name: &str, rows: &[[String; 19]]) -> Result<usize, OutputError> {
    let mut conn = Connection::open(path)?;
    let tx = conn.transaction()?;

    tx.execute(&format!("DROP TABLE IF EXISTS {table_name}"), [])?;
    // unkeyed: every finding in the batch is stored, repeated ids included
    let columns = COLUMNS
        .iter()
        .map(|column| format!("{column} TEXT"))
        .collect::<Vec<_>>()
        .join(", ");
    tx.execute(&format!("CREATE TABLE {table_name} ({columns})"), [])?;

    {
        let placeholders = (1..=COLUMNS.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let mut insert = tx.prepare(&format!(
            "INSERT INTO {table_name} ({}) VALUES ({placeholders})",
            COLUMNS.join(", ")
        ))?;
        for row in rows {
            insert.execute(params_from_iter(row.iter()))?;
        }
    }

    // dropping the transaction without commit rolls everything back
    tx.commit()?;
    Ok(rows.len())
}

fn finding_row(finding: &Finding) -> [String; 19] {
    let (resource_type, resource_id, region, partition) = match finding.resource() {
        Some(resource) => (
            resource.resource_type.clone(),
            resource.id.clone(),
            resource.region.clone(),
            resource.partition.clone(),
        ),
        None => Default::default(),
    };
    [
        finding.schema_version.clone(),
        finding.id.clone(),
        finding.aws_account_id.clone(),
        finding.product_arn.clone(),
        finding.generator_id.clone(),
        finding.types.first().cloned().unwrap_or_default(),
        finding.created_at.clone(),
        finding.severity.label.as_str().to_string(),
        finding.confidence.to_string(),
        finding.title.clone(),
        finding.description.clone(),
        resource_type,
        resource_id,
        region,
        partition,
        finding.compliance.status.as_str().to_string(),
        serde_json::to_string(&finding.compliance.related_requirements)
            .unwrap_or_else(|_| "[]".to_string()),
        finding.workflow.status.as_str().to_string(),
        finding.record_state.as_str().to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::output_plugins::testing;

    fn provider(path: &Path) -> SqliteOutputProvider {
        SqliteOutputProvider::new(&SqliteConfig {
            path: path.to_path_buf(),
            table_name: "findings".into(),
        })
        .unwrap()
    }

    fn ids(path: &Path) -> Vec<String> {
        let conn = Connection::open(path).unwrap();
        let mut stmt = conn
            .prepare("SELECT findingid FROM findings ORDER BY rowid")
            .unwrap();
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        ids
    }

    #[tokio::test]
    async fn each_run_replaces_the_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("findings.db");
        let mut sink = provider(&path);

        sink.write_findings(&testing::findings(4)).await.unwrap();
        assert_eq!(ids(&path).len(), 4);

        sink.write_findings(&testing::findings(2)).await.unwrap();
        assert_eq!(
            ids(&path),
            vec![
                "arn:aws:ec2:us-east-1:111122223333:image/ami-0000/test-check-0",
                "arn:aws:ec2:us-east-1:111122223333:image/ami-0001/test-check-1",
            ]
        );
    }

    #[tokio::test]
    async fn rows_carry_the_flattened_finding() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("findings.db");
        provider(&path)
            .write_findings(&testing::findings(1))
            .await
            .unwrap();

        let conn = Connection::open(&path).unwrap();
        let (types, status, controls, workflow, record, region): (
            String,
            String,
            String,
            String,
            String,
            String,
        ) = conn
            .query_row(
                "SELECT types, compliancestatus, compliancecontrols, workflowstatus, recordstate, resourceregion FROM findings",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?)),
            )
            .unwrap();
        assert_eq!(types, "Software and Configuration Checks/AWS Security Best Practices");
        assert_eq!(status, "FAILED");
        assert_eq!(controls, r#"["NIST CSF PR.DS-5"]"#);
        assert_eq!(workflow, "NEW");
        assert_eq!(record, "ACTIVE");
        assert_eq!(region, "us-east-1");
    }

    #[tokio::test]
    async fn repeated_ids_are_all_stored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("findings.db");

        let mut repeated = testing::findings(2);
        repeated.push(repeated[0].clone());
        provider(&path).write_findings(&repeated).await.unwrap();

        let stored = ids(&path);
        assert_eq!(stored.len(), 3);
        assert_eq!(stored[0], stored[2]);
    }

    #[tokio::test]
    async fn failed_write_keeps_the_previous_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("findings.db");
        let mut sink = provider(&path);

        sink.write_findings(&testing::findings(3)).await.unwrap();
        let before = ids(&path);

        // another writer holds the database until the write gives up
        let blocker = Connection::open(&path).unwrap();
        blocker.execute_batch("BEGIN EXCLUSIVE").unwrap();
        let err = sink.write_findings(&testing::findings(1)).await.unwrap_err();
        assert!(matches!(err, OutputError::Database(_)));
        blocker.execute_batch("ROLLBACK").unwrap();

        assert_eq!(ids(&path), before);
    }

    #[tokio::test]
    async fn empty_batch_leaves_an_empty_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("findings.db");
        let mut sink = provider(&path);

        sink.write_findings(&testing::findings(2)).await.unwrap();
        sink.write_findings(&[]).await.unwrap();
        assert!(ids(&path).is_empty());
    }

    #[test]
    fn unsafe_table_names_are_rejected() {
        let err = SqliteOutputProvider::new(&SqliteConfig {
            path: "findings.db".into(),
            table_name: "findings;--".into(),
        })
        .err()
        .unwrap();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }
}
