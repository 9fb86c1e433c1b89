use tracing::error;

use accredit_core::participant::AuditRecord;
use accredit_core::traits::WorkflowStore;

/// Append an audit row after the primary write has committed.
///
/// A failed append is logged and swallowed: the state change it describes
/// already happened and must not be reported as failed.
pub(crate) async fn record_audit(store: &dyn WorkflowStore, record: AuditRecord) {
    if let Err(e) = store.append_audit(&record).await {
        error!(
            participant = %record.participant_id,
            kind = record.kind.as_str(),
            actor = %record.actor,
            error = %e,
            "Audit append failed"
        );
    }
}
