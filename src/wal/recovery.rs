use tracing::{debug, warn};

use crate::error::{KvError, Result};
use crate::tx::transaction::Transaction;
use crate::wal::event::{Event, TxId};

/// One `StartTransaction .. CommitTransaction` run from the log, markers
/// included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedTx {
    pub txid: TxId,
    pub events: Vec<Event>,
}

/// Split a decoded log into complete transactions.
///
/// A transaction still open at the end of the log never reached its commit
/// marker and is dropped. Anything else out of shape (nested starts, a
/// commit for another txid, events outside a transaction) means the log was
/// not written by a sequence of commits and is rejected.
pub fn committed_transactions(events: Vec<Event>) -> Result<Vec<CommittedTx>> {
    let mut done = Vec::new();
    let mut open: Option<CommittedTx> = None;

    for (index, event) in events.into_iter().enumerate() {
        match &event {
            Event::StartTransaction { txid } => {
                let txid = *txid;
                if let Some(tx) = &open {
                    return Err(KvError::WalParse(format!(
                        "event {}: transaction {} starts inside transaction {}",
                        index, txid, tx.txid
                    )));
                }
                open = Some(CommittedTx {
                    txid,
                    events: vec![event],
                });
            }
            Event::CommitTransaction { txid } => {
                let txid = *txid;
                match open.take() {
                    Some(mut tx) if tx.txid == txid => {
                        tx.events.push(event);
                        done.push(tx);
                    }
                    Some(tx) => {
                        return Err(KvError::WalParse(format!(
                            "event {}: commit of transaction {} inside transaction {}",
                            index, txid, tx.txid
                        )));
                    }
                    None => return Err(outside_transaction(index, &event)),
                }
            }
            _ => match open.as_mut() {
                Some(tx) => tx.events.push(event),
                None => return Err(outside_transaction(index, &event)),
            },
        }
    }

    if let Some(tx) = open {
        warn!(
            txid = tx.txid,
            events = tx.events.len(),
            "dropping uncommitted transaction at WAL end"
        );
    }
    Ok(done)
}

fn outside_transaction(index: usize, event: &Event) -> KvError {
    KvError::WalParse(format!(
        "event {}: {} outside of a transaction",
        index,
        event.name()
    ))
}

/// Transactions the master page does not reflect yet.
pub fn pending(transactions: Vec<CommittedTx>, applied_txid: TxId) -> Vec<CommittedTx> {
    transactions
        .into_iter()
        .filter(|tx| tx.txid > applied_txid)
        .collect()
}

/// Apply events to `tx` in order. Boundary markers and page frees are
/// skipped; entry events must match the current state exactly (inserting an
/// existing key, or updating/deleting with a different old value, fails).
///
/// The first failure is returned as `KvError::Replay` carrying the index of
/// the offending event; the caller rolls `tx` back.
pub fn apply_events(tx: &mut Transaction, events: &[Event]) -> Result<usize> {
    let mut applied = 0;
    for (index, event) in events.iter().enumerate() {
        if event.is_bookkeeping() {
            continue;
        }
        apply_event(tx, event).map_err(|source| KvError::Replay {
            index,
            source: Box::new(source),
        })?;
        applied += 1;
    }
    debug!(applied, "replayed WAL events");
    Ok(applied)
}

fn apply_event(tx: &mut Transaction, event: &Event) -> Result<()> {
    match event {
        Event::CreateTable { name } => tx.create_table(name),
        Event::DeleteTable { name } => tx.delete_table(name),
        Event::InsertEntry { table, key, value } => tx.insert(table, key, value),
        Event::UpdateEntry {
            table,
            key,
            old_value,
            new_value,
        } => {
            expect_value(tx, table, key, old_value)?;
            tx.update(table, key, new_value).map(drop)
        }
        Event::DeleteEntry {
            table,
            key,
            old_value,
        } => {
            expect_value(tx, table, key, old_value)?;
            tx.delete(table, key).map(drop)
        }
        Event::StartTransaction { .. }
        | Event::CommitTransaction { .. }
        | Event::FreePages { .. } => Ok(()),
    }
}

fn expect_value(tx: &mut Transaction, table: &str, key: &[u8], expected: &[u8]) -> Result<()> {
    match tx.get(table, key)? {
        None => Err(KvError::KeyNotFound(table.to_string())),
        Some(current) if current != expected => Err(KvError::ValueMismatch(table.to_string())),
        Some(_) => Ok(()),
    }
}
