//! Streaming search result handle.
//!
//! A backend creates a ([`ResultSender`], [`SearchResult`]) pair. The sender
//! side reports records and errors and finally calls [`ResultSender::finish`]
//! with the stat, which closes the record and error channels and then
//! signals `done`. The receiver side observes the three channels through
//! [`SearchResult::next_event`].

use crate::search::{Record, Stat};
use crate::Error;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

pub const RECORD_CHANNEL_SIZE: usize = 256;
pub const ERROR_CHANNEL_SIZE: usize = 64;

/// One item observed on a result.
#[derive(Debug)]
pub enum Event {
    Record(Record),
    Error(Error),
}

#[derive(Debug, Default)]
struct Counters {
    records: AtomicU64,
    errors: AtomicU64,
}

/// Consumer side of a running search.
pub struct SearchResult {
    records: mpsc::Receiver<Record>,
    errors: mpsc::Receiver<Error>,
    done: oneshot::Receiver<Option<Stat>>,
    done_seen: bool,
    stat: Option<Stat>,
    cancel: CancellationToken,
    counters: Arc<Counters>,
}

/// Producer side of a running search.
pub struct ResultSender {
    records: mpsc::Sender<Record>,
    errors: mpsc::Sender<Error>,
    done: oneshot::Sender<Option<Stat>>,
    cancel: CancellationToken,
}

impl SearchResult {
    /// Create a new connected sender/result pair.
    pub fn channel() -> (ResultSender, SearchResult) {
        let (rec_tx, rec_rx) = mpsc::channel(RECORD_CHANNEL_SIZE);
        let (err_tx, err_rx) = mpsc::channel(ERROR_CHANNEL_SIZE);
        let (done_tx, done_rx) = oneshot::channel();
        let cancel = CancellationToken::new();

        let sender = ResultSender {
            records: rec_tx,
            errors: err_tx,
            done: done_tx,
            cancel: cancel.clone(),
        };
        let result = SearchResult {
            records: rec_rx,
            errors: err_rx,
            done: done_rx,
            done_seen: false,
            stat: None,
            cancel,
            counters: Arc::new(Counters::default()),
        };
        (sender, result)
    }

    /// A result that is already done and carries only an error.
    pub fn failed(err: Error) -> SearchResult {
        let (tx, rx) = Self::channel();
        let _ = tx.errors.try_send(err);
        tx.finish(None);
        rx
    }

    /// Wait for the next record or error.
    ///
    /// Returns `None` once `done` has been observed and both channels are
    /// drained. Cancel-safe: may be used inside `tokio::select!`.
    pub async fn next_event(&mut self) -> Option<Event> {
        loop {
            if self.done_seen {
                if let Ok(rec) = self.records.try_recv() {
                    return Some(self.count_record(rec));
                }
                if let Ok(err) = self.errors.try_recv() {
                    return Some(self.count_error(err));
                }
                return None;
            }

            tokio::select! {
                biased;
                Some(rec) = self.records.recv() => return Some(self.count_record(rec)),
                Some(err) = self.errors.recv() => return Some(self.count_error(err)),
                stat = &mut self.done => {
                    self.stat = stat.unwrap_or(None);
                    self.done_seen = true;
                }
            }
        }
    }

    fn count_record(&self, rec: Record) -> Event {
        self.counters.records.fetch_add(1, Ordering::Relaxed);
        Event::Record(rec)
    }

    fn count_error(&self, err: Error) -> Event {
        self.counters.errors.fetch_add(1, Ordering::Relaxed);
        Event::Error(err)
    }

    /// Cancel the search and discard anything still buffered.
    ///
    /// Idempotent and safe after done. Returns the number of unread
    /// (records, errors).
    pub fn cancel(&mut self) -> (usize, usize) {
        self.cancel.cancel();
        self.records.close();
        self.errors.close();

        let mut records = 0;
        while self.records.try_recv().is_ok() {
            records += 1;
        }
        let mut errors = 0;
        while self.errors.try_recv().is_ok() {
            errors += 1;
        }
        if !self.done_seen {
            if let Ok(stat) = self.done.try_recv() {
                self.stat = stat;
                self.done_seen = true;
            }
        }
        (records, errors)
    }

    /// Token cancelled by [`SearchResult::cancel`].
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_done(&self) -> bool {
        self.done_seen
    }

    /// Final statistics, available once done.
    pub fn stat(&self) -> Option<&Stat> {
        self.stat.as_ref()
    }

    pub fn stat_mut(&mut self) -> Option<&mut Stat> {
        self.stat.as_mut()
    }

    pub fn take_stat(&mut self) -> Option<Stat> {
        self.stat.take()
    }

    pub fn records_reported(&self) -> u64 {
        self.counters.records.load(Ordering::Relaxed)
    }

    pub fn errors_reported(&self) -> u64 {
        self.counters.errors.load(Ordering::Relaxed)
    }

    /// Cancel and keep draining in a background task so the producer is
    /// never left blocked on a full channel.
    pub fn cancel_in_background(mut self) {
        let (records, errors) = self.cancel();
        if records > 0 || errors > 0 {
            tracing::debug!(records, errors, "some records/errors are ignored");
        }
        if !self.done_seen {
            tokio::spawn(async move { while self.next_event().await.is_some() {} });
        }
    }
}

impl Drop for SearchResult {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl ResultSender {
    /// Report a record. Returns false if the consumer cancelled or went away.
    pub async fn report_record(&self, rec: Record) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            res = self.records.send(rec) => res.is_ok(),
        }
    }

    /// Report an error. Returns false if the consumer cancelled or went away.
    pub async fn report_error(&self, err: Error) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            res = self.errors.send(err) => res.is_ok(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token cancelled when the consumer cancels.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Close the record and error channels, then signal done with the stat.
    pub fn finish(self, stat: Option<Stat>) {
        let ResultSender {
            records,
            errors,
            done,
            ..
        } = self;
        drop(records);
        drop(errors);
        let _ = done.send(stat);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::Index;

    fn rec(i: u64) -> Record {
        Record::new(Index::new("f", i, 1, 0), vec![b'x'])
    }

    #[tokio::test]
    async fn delivers_records_errors_then_done() {
        let (tx, mut rx) = SearchResult::channel();
        tokio::spawn(async move {
            for i in 0..3 {
                assert!(tx.report_record(rec(i)).await);
            }
            tx.report_error(Error::Stream("bad".into())).await;
            tx.finish(Some(Stat::new("h")));
        });

        let mut records = 0;
        let mut errors = 0;
        while let Some(ev) = rx.next_event().await {
            match ev {
                Event::Record(_) => records += 1,
                Event::Error(_) => errors += 1,
            }
        }
        assert_eq!((records, errors), (3, 1));
        assert!(rx.is_done());
        assert_eq!(rx.stat().map(|s| s.host.as_str()), Some("h"));
        assert_eq!(rx.records_reported(), 3);
    }

    #[tokio::test]
    async fn cancel_unblocks_producer_and_counts_unread() {
        let (tx, mut rx) = SearchResult::channel();
        let producer = tokio::spawn(async move {
            let mut sent = 0u64;
            loop {
                if !tx.report_record(rec(sent)).await {
                    break;
                }
                sent += 1;
            }
            tx.finish(None);
            sent
        });

        // let the channel fill up
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let (records, errors) = rx.cancel();
        assert_eq!(records, RECORD_CHANNEL_SIZE);
        assert_eq!(errors, 0);

        let sent = producer.await.unwrap();
        assert!(sent >= RECORD_CHANNEL_SIZE as u64);
        assert_eq!(rx.cancel(), (0, 0), "cancel is idempotent");
    }

    #[tokio::test]
    async fn failed_result_is_done_with_single_error() {
        let mut rx = SearchResult::failed(Error::Engine("boom".into()));
        match rx.next_event().await {
            Some(Event::Error(e)) => assert_eq!(e.to_string(), "boom"),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(rx.next_event().await.is_none());
        assert!(rx.stat().is_none());
    }
}
