//! Inspect command implementation.

use restfeed_server::ObjectStateStore;
use serde::Serialize;
use std::path::Path;

const JOURNAL_SUFFIX: &str = ".objectstate.jsonl";

/// Journal inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Journal path.
    pub path: String,
    /// Service the journal belongs to.
    pub service: String,
    /// Journal size in bytes.
    pub size: u64,
    /// Number of live objects.
    pub live_count: usize,
    /// Number of tombstones.
    pub tombstone_count: usize,
    /// Highest revision in the journal.
    pub latest_revision: u64,
    /// Live keys (if requested).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keys: Option<Vec<String>>,
}

/// Opens an existing object state journal for reading.
///
/// The journal is neither created nor repaired, so it is safe to run
/// against a live server. The service name is taken from the file name.
pub fn open_journal(path: &Path) -> Result<ObjectStateStore, Box<dyn std::error::Error>> {
    if !path.is_file() {
        return Err(format!("No journal found at {}", path.display()).into());
    }
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let service = file_name
        .strip_suffix(JOURNAL_SUFFIX)
        .unwrap_or(&file_name)
        .to_string();
    Ok(ObjectStateStore::open_read_only(service, path)?)
}

/// Collects statistics about a journal.
pub fn inspect(path: &Path, show_keys: bool) -> Result<InspectResult, Box<dyn std::error::Error>> {
    let store = open_journal(path)?;
    let (live_count, tombstone_count) = store.counts();

    Ok(InspectResult {
        path: path.display().to_string(),
        service: store.service().to_string(),
        size: std::fs::metadata(path)?.len(),
        live_count,
        tombstone_count,
        latest_revision: store.latest_revision(),
        keys: show_keys.then(|| store.live_keys()),
    })
}

/// Runs the inspect command.
pub fn run(path: &Path, show_keys: bool, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let result = inspect(path, show_keys)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

fn print_text_output(result: &InspectResult) {
    println!("Journal: {}", result.path);
    println!("Service: {}", result.service);
    println!("Size:    {} bytes", result.size);
    println!();
    println!("Live objects:    {}", result.live_count);
    println!("Tombstones:      {}", result.tombstone_count);
    println!("Latest revision: {}", result.latest_revision);

    if let Some(keys) = &result.keys {
        println!();
        println!("Keys:");
        for key in keys {
            println!("  {key}");
        }
    }
}
