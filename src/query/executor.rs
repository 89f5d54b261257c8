//! Query execution and privacy treatment
//!
//! Execution is pluggable: anything implementing [`QueryExecutor`] (including
//! a plain closure) can run queries. [`CsvSummaryExecutor`] is the built-in
//! engine; [`PrivacyFilter`] runs on every output before it is stored.

use crate::data::DecryptedDataset;
use crate::error::{CollabError, CollabResult};
use crate::types::{PrivacyLevel, QueryOutput};

use std::collections::BTreeMap;

/// Runs a query over decrypted datasets
pub trait QueryExecutor: Send + Sync {
    /// Execute `query_text`; the privacy level is advisory here and is
    /// enforced again afterwards by [`PrivacyFilter`]
    fn execute(
        &self,
        query_text: &str,
        datasets: &[DecryptedDataset],
        privacy_level: PrivacyLevel,
    ) -> CollabResult<QueryOutput>;
}

impl<F> QueryExecutor for F
where
    F: Fn(&str, &[DecryptedDataset], PrivacyLevel) -> CollabResult<QueryOutput> + Send + Sync,
{
    fn execute(
        &self,
        query_text: &str,
        datasets: &[DecryptedDataset],
        privacy_level: PrivacyLevel,
    ) -> CollabResult<QueryOutput> {
        self(query_text, datasets, privacy_level)
    }
}

/// Read-only summaries over CSV datasets
///
/// Commands (case-insensitive):
/// - `COUNT` total records across all datasets
/// - `COUNT BY <column>` records per distinct value
/// - `SCHEMA` columns and record count per dataset
/// - `SELECT *` every record (row-level)
#[derive(Debug, Default, Clone, Copy)]
pub struct CsvSummaryExecutor;

enum Command {
    Count,
    CountBy(String),
    Schema,
    SelectAll,
}

impl Command {
    fn parse(text: &str) -> CollabResult<Self> {
        let words: Vec<&str> = text.split_whitespace().collect();
        let upper: Vec<String> = words.iter().map(|w| w.to_ascii_uppercase()).collect();

        match upper.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
            ["COUNT"] => Ok(Self::Count),
            ["COUNT", "BY", _] => Ok(Self::CountBy(normalize_column(words[2]))),
            ["SCHEMA"] => Ok(Self::Schema),
            ["SELECT", "*"] => Ok(Self::SelectAll),
            _ => Err(CollabError::ExecutionFailed(
                "unsupported query; expected COUNT, COUNT BY <column>, SCHEMA or SELECT *".into(),
            )),
        }
    }
}

struct Table {
    dataset: String,
    columns: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl QueryExecutor for CsvSummaryExecutor {
    fn execute(
        &self,
        query_text: &str,
        datasets: &[DecryptedDataset],
        _privacy_level: PrivacyLevel,
    ) -> CollabResult<QueryOutput> {
        let command = Command::parse(query_text)?;
        let tables = datasets
            .iter()
            .map(|d| parse_table(d.id().as_str(), d.as_text()?))
            .collect::<CollabResult<Vec<_>>>()?;

        match command {
            Command::Count => {
                let total: usize = tables.iter().map(|t| t.rows.len()).sum();
                Ok(QueryOutput::aggregate(
                    vec!["count".into()],
                    vec![vec![total.to_string()]],
                    vec![total as u64],
                ))
            }
            Command::CountBy(column) => {
                let mut groups: BTreeMap<String, u64> = BTreeMap::new();
                for table in &tables {
                    let index = table.columns.iter().position(|c| c == &column).ok_or_else(|| {
                        CollabError::ExecutionFailed(format!(
                            "dataset {} has no column '{}'",
                            table.dataset, column
                        ))
                    })?;
                    for row in &table.rows {
                        *groups.entry(row[index].clone()).or_default() += 1;
                    }
                }

                let (rows, sizes): (Vec<Vec<String>>, Vec<u64>) = groups
                    .into_iter()
                    .map(|(value, count)| (vec![value, count.to_string()], count))
                    .unzip();
                Ok(QueryOutput::aggregate(vec![column, "count".into()], rows, sizes))
            }
            Command::Schema => {
                let rows = tables
                    .iter()
                    .map(|t| vec![t.dataset.clone(), t.columns.join(","), t.rows.len().to_string()])
                    .collect();
                let sizes = tables.iter().map(|t| t.rows.len() as u64).collect();
                Ok(QueryOutput::aggregate(
                    vec!["dataset_id".into(), "columns".into(), "count".into()],
                    rows,
                    sizes,
                ))
            }
            Command::SelectAll => {
                let columns = tables.first().map(|t| t.columns.clone()).unwrap_or_default();
                let mut rows = Vec::new();
                for table in tables {
                    if table.columns != columns {
                        return Err(CollabError::ExecutionFailed(
                            "SELECT * needs datasets with identical columns".into(),
                        ));
                    }
                    rows.extend(table.rows);
                }
                Ok(QueryOutput::rows(columns, rows))
            }
        }
    }
}

fn normalize_column(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}

fn parse_table(dataset: &str, text: &str) -> CollabResult<Table> {
    let mut lines = text.lines().filter(|l| !l.trim().is_empty());

    let header = lines
        .next()
        .ok_or_else(|| CollabError::ExecutionFailed(format!("dataset {} is empty", dataset)))?;
    let columns: Vec<String> = split_record(header).iter().map(|c| normalize_column(c)).collect();

    let mut rows = Vec::new();
    for (n, line) in lines.enumerate() {
        let record = split_record(line);
        if record.len() != columns.len() {
            return Err(CollabError::ExecutionFailed(format!(
                "dataset {} record {} has {} fields, expected {}",
                dataset,
                n + 1,
                record.len(),
                columns.len()
            )));
        }
        rows.push(record);
    }

    if rows.is_empty() {
        return Err(CollabError::ExecutionFailed(format!(
            "dataset {} has no data rows",
            dataset
        )));
    }

    Ok(Table {
        dataset: dataset.to_owned(),
        columns,
        rows,
    })
}

/// Split one CSV record; double quotes group fields and `""` escapes a quote
fn split_record(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if quoted && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => quoted = !quoted,
            ',' if !quoted => fields.push(std::mem::take(&mut current).trim().to_owned()),
            _ => current.push(c),
        }
    }
    fields.push(current.trim().to_owned());
    fields
}

/// Applies a privacy level to execution output
#[derive(Debug, Clone, Copy)]
pub struct PrivacyFilter {
    k_threshold: u64,
    max_rows: usize,
}

impl PrivacyFilter {
    /// Create a filter
    pub fn new(k_threshold: u64, max_rows: usize) -> Self {
        Self {
            k_threshold,
            max_rows,
        }
    }

    /// Apply `level`; row-level output under an aggregate level is a violation
    pub fn apply(&self, mut output: QueryOutput, level: PrivacyLevel) -> CollabResult<QueryOutput> {
        match level {
            PrivacyLevel::FullAccess => {}
            PrivacyLevel::AggregateOnly | PrivacyLevel::DifferentialPrivacy => {
                require_aggregate(&output, level)?;
                if level == PrivacyLevel::DifferentialPrivacy {
                    tracing::warn!("differential privacy requested; enforcing aggregate-only without noise");
                }
            }
            PrivacyLevel::KAnonymized => {
                require_aggregate(&output, level)?;
                let before = output.rows.len();
                let (rows, sizes): (Vec<_>, Vec<_>) = output
                    .rows
                    .into_iter()
                    .zip(output.group_sizes)
                    .filter(|(_, size)| *size >= self.k_threshold)
                    .unzip();
                output.rows = rows;
                output.group_sizes = sizes;
                if output.rows.len() < before {
                    tracing::debug!(
                        suppressed = before - output.rows.len(),
                        k = self.k_threshold,
                        "small groups suppressed"
                    );
                }
            }
        }

        if output.rows.len() > self.max_rows {
            output.rows.truncate(self.max_rows);
            output.group_sizes.truncate(self.max_rows);
        }

        Ok(output)
    }
}

fn require_aggregate(output: &QueryOutput, level: PrivacyLevel) -> CollabResult<()> {
    if !output.aggregate {
        return Err(CollabError::PrivacyViolation(format!(
            "row-level output not allowed under {}",
            level.as_str()
        )));
    }
    if output.group_sizes.len() != output.rows.len() {
        return Err(CollabError::PrivacyViolation(
            "aggregate output is missing group sizes".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dataset(id: &str, text: &str) -> DecryptedDataset {
        DecryptedDataset::new(id.into(), "alice".into(), text.as_bytes().to_vec())
    }

    fn sales() -> Vec<DecryptedDataset> {
        vec![
            dataset("d1", "Region,Amount\nnorth,10\nsouth,20\nnorth,5\n"),
            dataset("d2", "region,amount\nnorth,7\n\"east, far\",1\n"),
        ]
    }

    #[test]
    fn test_count() {
        let out = CsvSummaryExecutor
            .execute("count", &sales(), PrivacyLevel::AggregateOnly)
            .unwrap();
        assert_eq!(out.rows, vec![vec!["5".to_string()]]);
        assert!(out.aggregate);
    }

    #[test]
    fn test_count_by() {
        let out = CsvSummaryExecutor
            .execute("COUNT BY region", &sales(), PrivacyLevel::AggregateOnly)
            .unwrap();
        assert_eq!(out.columns, vec!["region", "count"]);
        assert_eq!(
            out.rows,
            vec![
                vec!["east, far".to_string(), "1".to_string()],
                vec!["north".to_string(), "3".to_string()],
                vec!["south".to_string(), "1".to_string()],
            ]
        );
        assert_eq!(out.group_sizes, vec![1, 3, 1]);
    }

    #[test]
    fn test_schema_and_select() {
        let schema = CsvSummaryExecutor
            .execute("SCHEMA", &sales(), PrivacyLevel::AggregateOnly)
            .unwrap();
        assert_eq!(schema.rows[0], vec!["d1", "region,amount", "3"]);

        let all = CsvSummaryExecutor
            .execute("select *", &sales(), PrivacyLevel::FullAccess)
            .unwrap();
        assert!(!all.aggregate);
        assert_eq!(all.rows.len(), 5);
    }

    #[test]
    fn test_execution_errors() {
        let exec = CsvSummaryExecutor;
        assert!(exec.execute("DROP TABLE x", &sales(), PrivacyLevel::FullAccess).is_err());
        assert!(exec.execute("COUNT BY missing", &sales(), PrivacyLevel::FullAccess).is_err());
        assert!(exec
            .execute("COUNT", &[dataset("d3", "a,b\n1\n")], PrivacyLevel::FullAccess)
            .is_err());
        assert!(exec
            .execute("COUNT", &[dataset("d4", "a,b\n")], PrivacyLevel::FullAccess)
            .is_err());
    }

    #[test]
    fn test_closure_executor() {
        let exec = |text: &str, data: &[DecryptedDataset], _: PrivacyLevel| -> CollabResult<QueryOutput> {
            Ok(QueryOutput::aggregate(
                vec!["q".into()],
                vec![vec![format!("{}:{}", text, data.len())]],
                vec![10],
            ))
        };
        let out = exec.execute("anything", &sales(), PrivacyLevel::AggregateOnly).unwrap();
        assert_eq!(out.rows[0][0], "anything:2");
    }

    #[test]
    fn test_privacy_filter() {
        let filter = PrivacyFilter::new(2, 100);
        let grouped = QueryOutput::aggregate(
            vec!["region".into(), "count".into()],
            vec![vec!["north".into(), "3".into()], vec!["south".into(), "1".into()]],
            vec![3, 1],
        );
        let rows = QueryOutput::rows(vec!["a".into()], vec![vec!["1".into()]]);

        let k = filter.apply(grouped.clone(), PrivacyLevel::KAnonymized).unwrap();
        assert_eq!(k.rows.len(), 1);
        assert_eq!(k.group_sizes, vec![3]);

        assert_eq!(filter.apply(grouped.clone(), PrivacyLevel::AggregateOnly).unwrap(), grouped);
        assert_eq!(
            filter.apply(rows.clone(), PrivacyLevel::AggregateOnly).unwrap_err().error_code(),
            "privacy_violation"
        );
        assert!(filter.apply(rows.clone(), PrivacyLevel::DifferentialPrivacy).is_err());
        assert!(filter.apply(rows, PrivacyLevel::FullAccess).is_ok());
    }

    #[test]
    fn test_max_rows() {
        let filter = PrivacyFilter::new(2, 1);
        let rows = QueryOutput::rows(vec!["a".into()], vec![vec!["1".into()], vec!["2".into()]]);
        assert_eq!(filter.apply(rows, PrivacyLevel::FullAccess).unwrap().rows.len(), 1);
    }
}
