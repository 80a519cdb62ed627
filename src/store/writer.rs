use std::io;

use tokio::sync::{mpsc, oneshot};

use crate::model::Event;
use crate::observability;
use crate::wal::Wal;

pub(super) type Ack = oneshot::Sender<io::Result<()>>;

pub(super) enum WalCommand {
    Append { event: Event, response: Ack },
    Rewrite { events: Vec<Event>, response: Ack },
    AppendsSinceCompact { response: oneshot::Sender<u64> },
}

/// Background task that owns the WAL and group-commits appends.
///
/// Blocks for the first append, drains whatever else is already queued,
/// syncs once for the whole batch and acknowledges every sender. A non-append
/// command ends the batch; the batch is flushed before that command runs.
pub(super) async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_other(&mut wal, cmd);
            continue;
        };

        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        commit_batch(&mut wal, &mut batch);
        if let Some(other) = deferred {
            handle_other(&mut wal, other);
        }
    }
    tracing::debug!("WAL writer stopped: all senders dropped");
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, Ack)>) {
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let mut append_err = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    let failure = match append_err {
        Some(e) => Some(e),
        None => wal.flush_sync().err(),
    };
    // Every sender in a failed batch is told so, so none of its frames may
    // survive to be replayed.
    let result = match failure {
        Some(e) => {
            tracing::error!("WAL batch of {} failed: {e}", batch.len());
            if let Err(rollback_err) = wal.rollback() {
                tracing::error!("WAL rollback failed: {rollback_err}");
            }
            Err(e)
        }
        None => Ok(()),
    };

    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS).record(started.elapsed().as_secs_f64());

    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_other(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Rewrite { events, response } => {
            let _ = response.send(wal.rewrite(&events));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { response, .. } => {
            // Appends are always batched by the caller loop.
            let _ = response.send(Err(io::Error::other("append routed outside a batch")));
        }
    }
}
