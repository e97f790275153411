//! Applies one change record and advances the checkpoint.

use crate::applier::ChangeApplier;
use crate::checkpoint::{FollowState, FollowStateStore};
use crate::error::{ConsumeError, ConsumeResult};
use restfeed_protocol::ChangeRecord;
use tracing::{info, warn};

/// Loads the checkpoint of `collection_url`, creating it at revision 0.
pub(crate) fn load_or_create(
    store: &dyn FollowStateStore,
    collection_url: &str,
) -> ConsumeResult<FollowState> {
    if let Some(state) = store.load(collection_url)? {
        return Ok(state);
    }
    let state = FollowState {
        collection_url: collection_url.to_string(),
        revision: 0,
    };
    store.save(&state)?;
    Ok(state)
}

/// Applies `record` and persists the new checkpoint.
///
/// The checkpoint is only moved once the applier succeeded, so a failed
/// record is delivered again on the next connection.
pub(crate) fn apply_record<A: ChangeApplier>(
    applier: &mut A,
    record: ChangeRecord,
    state: &mut FollowState,
    store: &dyn FollowStateStore,
) -> ConsumeResult<()> {
    record.validate()?;
    let ChangeRecord {
        revision,
        key,
        deleted,
        data,
    } = record;

    match data {
        Some(data) if !deleted => {
            let object: A::Record =
                serde_json::from_value(data).map_err(|source| ConsumeError::Materialize {
                    key: key.clone(),
                    revision,
                    source,
                })?;
            applier.apply_upsert(&key, object)?;
        }
        _ => applier.apply_delete(&key)?,
    }

    if revision <= state.revision {
        warn!(
            url = %state.collection_url,
            revision,
            checkpoint = state.revision,
            "received change out of order"
        );
    }

    let previous = state.revision;
    state.revision = revision;
    if let Err(e) = store.save(state) {
        state.revision = previous;
        return Err(e);
    }

    info!(url = %state.collection_url, key = %key, revision, deleted, "applied change");
    Ok(())
}
