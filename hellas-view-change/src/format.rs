//! Tools for formatting view change types for logging and debugging.

use crate::types::*;

/// Format a ViewNum in a concise way
pub fn format_view_num(view_num: &ViewNum) -> String {
    format!("v{}", view_num.0)
}

/// Format an Identity in a concise way
pub fn format_identity(identity: &Identity) -> String {
    format!("p{}", identity.0)
}

/// Format a BatchId in a concise way
pub fn format_batch_id(batch: &BatchId) -> String {
    format!(
        "{}:{}#{}",
        format_view_num(&batch.view_no),
        batch.pp_seq_no,
        batch.digest.short()
    )
}

/// Format a Checkpoint in a concise way
pub fn format_checkpoint(checkpoint: &Checkpoint) -> String {
    format!("cp{}#{}", checkpoint.seq_no_end, checkpoint.digest.short())
}

/// Format a run of batches, collapsing long ones to their ends
pub fn format_batches(batches: &[BatchId], verbose: bool) -> String {
    match batches {
        [] => "[]".to_string(),
        _ if verbose || batches.len() <= 3 => {
            let strs: Vec<_> = batches.iter().map(format_batch_id).collect();
            format!("[{}]", strs.join(", "))
        }
        [first, .., last] => format!(
            "[{} .. {}; {}]",
            format_batch_id(first),
            format_batch_id(last),
            batches.len()
        ),
        [only] => format!("[{}]", format_batch_id(only)),
    }
}

/// Format a ViewChange vote
pub fn format_view_change(vc: &ViewChange, verbose: bool) -> String {
    if verbose {
        let checkpoints: Vec<_> = vc.checkpoints.iter().map(format_checkpoint).collect();
        format!(
            "ViewChange{{ view: {}, stable: {}, preprepared: {}, prepared: {}, checkpoints: [{}] }}",
            format_view_num(&vc.view_no),
            vc.stable_checkpoint,
            format_batches(&vc.preprepared, true),
            vc.prepared.len(),
            checkpoints.join(", ")
        )
    } else {
        format!(
            "VC({},cp{},{}pp,{}p)",
            format_view_num(&vc.view_no),
            vc.stable_checkpoint,
            vc.preprepared.len(),
            vc.prepared.len()
        )
    }
}

/// Format a NewView certificate
pub fn format_new_view(nv: &NewView, verbose: bool) -> String {
    if verbose {
        let voters: Vec<_> = nv.view_changes.keys().map(format_identity).collect();
        format!(
            "NewView{{ view: {}, votes: [{}], checkpoint: {}, batches: {} }}",
            format_view_num(&nv.view_no),
            voters.join(", "),
            format_checkpoint(&nv.checkpoint),
            format_batches(&nv.batches, true)
        )
    } else {
        format!(
            "NV({},{},{})",
            format_view_num(&nv.view_no),
            format_checkpoint(&nv.checkpoint),
            format_batches(&nv.batches, false)
        )
    }
}

/// Format any protocol message
pub fn format_message(message: &Message, verbose: bool) -> String {
    match message {
        Message::ViewChange(vc) => format_view_change(vc, verbose),
        Message::NewView(nv) => format_new_view(nv, verbose),
        Message::ViewChangeAck(ack) => format!(
            "Ack({},#{})",
            format_view_num(&ack.view_no),
            ack.digest.short()
        ),
    }
}
