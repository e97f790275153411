//! Checkpoint commands.

use restfeed_consumer::{FileFollowStore, FollowRegistry, FollowStateStore};
use std::path::Path;

/// Lists the checkpoints stored in a follow state file.
pub fn list(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let store = FileFollowStore::open(path)?;
    let states = store.list()?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&states)?);
        }
        _ => {
            if states.is_empty() {
                println!("No checkpoints in {}", path.display());
            }
            for state in &states {
                println!("{:>8}  {}", state.revision, state.collection_url);
            }
        }
    }

    Ok(())
}

/// Removes checkpoints so the next follow starts from revision 0.
///
/// Without a URL every checkpoint is removed. Returns the number removed.
pub fn reset(path: &Path, url: Option<&str>) -> Result<usize, Box<dyn std::error::Error>> {
    let store = FileFollowStore::open(path)?;
    let urls = match url {
        Some(url) => vec![FollowRegistry::normalize_url(url)?],
        None => store
            .list()?
            .into_iter()
            .map(|state| state.collection_url)
            .collect(),
    };

    let mut removed = 0;
    for url in urls {
        if store.remove(&url)? {
            tracing::info!(url = %url, "reset checkpoint");
            removed += 1;
        }
    }
    Ok(removed)
}
