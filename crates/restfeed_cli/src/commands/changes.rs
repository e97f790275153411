//! Changes command implementation.

use super::inspect::open_journal;
use restfeed_protocol::{ChangeRecord, Revision};
use restfeed_server::ChangeManager;
use std::path::Path;

/// Reads the change log of a journal after `since`.
pub fn read_changes(
    path: &Path,
    since: Revision,
    limit: Option<usize>,
) -> Result<Vec<ChangeRecord>, Box<dyn std::error::Error>> {
    let changes = ChangeManager::new(open_journal(path)?);
    Ok(changes.changes_since(since, limit.unwrap_or(usize::MAX))?)
}

/// Runs the changes command.
pub fn run(
    path: &Path,
    since: Revision,
    limit: Option<usize>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let records = read_changes(path, since, limit)?;

    match format {
        "json" => {
            for record in &records {
                println!("{}", serde_json::to_string(record)?);
            }
        }
        _ => {
            println!("{:>8}  {:<8}  KEY", "REV", "KIND");
            for record in &records {
                let kind = if record.deleted { "delete" } else { "upsert" };
                println!("{:>8}  {:<8}  {}", record.revision, kind, record.key);
            }
            println!();
            println!("{} change(s) after revision {since}", records.len());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use restfeed_server::ObjectStateStore;
    use tempfile::tempdir;

    #[test]
    fn reads_changes_after_revision() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tasks.objectstate.jsonl");
        {
            let store = ObjectStateStore::open("tasks", &path).unwrap();
            for key in ["a", "b", "c"] {
                store.record(key, Some(format!("{{\"k\":\"{key}\"}}"))).unwrap();
            }
            store.record("a", None).unwrap();
        }

        let records = read_changes(&path, 1, None).unwrap();
        let revisions: Vec<_> = records.iter().map(|r| r.revision).collect();
        assert_eq!(revisions, vec![2, 3, 4]);
        assert!(records[2].deleted);

        assert_eq!(read_changes(&path, 0, Some(2)).unwrap().len(), 2);
    }
}
