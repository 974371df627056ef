//! Requests awaiting an asynchronous server reply.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::ClientError;

pub(crate) type Reply<T> = oneshot::Sender<Result<T, ClientError>>;

/// How the server settled a reducer call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ReducerOutcome {
    Committed,
    Failed(String),
    OutOfEnergy,
}

/// Rows of one table returned by a one-off query, in canonical form.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryTable {
    pub table: String,
    pub rows: Vec<Value>,
}

pub(crate) struct PendingSubscribe {
    /// Full table set the request asked for
    pub tables: Vec<String>,
    pub reply: Reply<()>,
}

#[derive(Default)]
pub(crate) struct PendingRequests {
    subscribes: BTreeMap<u32, PendingSubscribe>,
    reducers: HashMap<u32, Reply<ReducerOutcome>>,
    queries: HashMap<String, Reply<Vec<QueryTable>>>,
}

impl PendingRequests {
    pub fn insert_subscribe(&mut self, request_id: u32, pending: PendingSubscribe) {
        self.subscribes.insert(request_id, pending);
    }

    /// Settle the subscribe the server answered. Request ids start at 1, so
    /// a missing or zero id means the server did not echo it and the oldest
    /// waiter is settled. An echoed id with no waiter (a reply that arrived
    /// after its caller timed out) settles nothing.
    pub fn take_subscribe(&mut self, request_id: Option<u32>) -> Option<PendingSubscribe> {
        match request_id.filter(|id| *id != 0) {
            Some(id) => self.subscribes.remove(&id),
            None => self.subscribes.pop_first().map(|(_, pending)| pending),
        }
    }

    pub fn remove_subscribe(&mut self, request_id: u32) {
        self.subscribes.remove(&request_id);
    }

    pub fn insert_reducer(&mut self, request_id: u32, reply: Reply<ReducerOutcome>) {
        self.reducers.insert(request_id, reply);
    }

    pub fn resolve_reducer(&mut self, request_id: u32, outcome: ReducerOutcome) -> bool {
        match self.reducers.remove(&request_id) {
            Some(reply) => {
                let _ = reply.send(Ok(outcome));
                true
            }
            None => false,
        }
    }

    pub fn remove_reducer(&mut self, request_id: u32) {
        self.reducers.remove(&request_id);
    }

    pub fn insert_query(&mut self, message_id: String, reply: Reply<Vec<QueryTable>>) {
        self.queries.insert(message_id, reply);
    }

    pub fn resolve_query(
        &mut self,
        message_id: &str,
        result: Result<Vec<QueryTable>, ClientError>,
    ) -> bool {
        match self.queries.remove(message_id) {
            Some(reply) => {
                let _ = reply.send(result);
                true
            }
            None => false,
        }
    }

    pub fn remove_query(&mut self, message_id: &str) {
        self.queries.remove(message_id);
    }

    pub fn len(&self) -> usize {
        self.subscribes.len() + self.reducers.len() + self.queries.len()
    }

    /// Fail every waiter with an error built by `error`. Returns how many.
    pub fn fail_all(&mut self, error: impl Fn() -> ClientError) -> usize {
        let count = self.len();
        for (_, pending) in std::mem::take(&mut self.subscribes) {
            let _ = pending.reply.send(Err(error()));
        }
        for (_, reply) in self.reducers.drain() {
            let _ = reply.send(Err(error()));
        }
        for (_, reply) in self.queries.drain() {
            let _ = reply.send(Err(error()));
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unechoed_subscribe_id_settles_the_oldest() {
        let mut pending = PendingRequests::default();
        let (tx1, _rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();
        pending.insert_subscribe(4, PendingSubscribe { tables: vec!["a".into()], reply: tx1 });
        pending.insert_subscribe(9, PendingSubscribe { tables: vec!["b".into()], reply: tx2 });

        let settled = pending.take_subscribe(Some(9)).unwrap();
        assert_eq!(settled.tables, vec!["b".to_string()]);

        let settled = pending.take_subscribe(Some(0)).unwrap();
        assert_eq!(settled.tables, vec!["a".to_string()]);
        assert!(pending.take_subscribe(None).is_none());
    }

    #[tokio::test]
    async fn stale_subscribe_id_settles_nothing() {
        let mut pending = PendingRequests::default();
        let (tx, _rx) = oneshot::channel();
        pending.insert_subscribe(2, PendingSubscribe { tables: vec!["food".into()], reply: tx });

        assert!(pending.take_subscribe(Some(1)).is_none());
        assert_eq!(pending.len(), 1);
        assert!(pending.take_subscribe(Some(2)).is_some());
    }

    #[tokio::test]
    async fn fail_all_wakes_every_waiter() {
        let mut pending = PendingRequests::default();
        let (tx, rx) = oneshot::channel();
        pending.insert_reducer(1, tx);
        let (tx, query_rx) = oneshot::channel();
        pending.insert_query("q".into(), tx);

        assert_eq!(pending.fail_all(|| ClientError::lost("reset")), 2);
        assert!(matches!(rx.await.unwrap(), Err(ClientError::ConnectionLost(_))));
        assert!(query_rx.await.unwrap().is_err());
        assert_eq!(pending.len(), 0);
    }
}
