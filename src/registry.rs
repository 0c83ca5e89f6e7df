//! Result records keyed by id, with per-session pagination state.
//!
//! The registry performs no I/O. The engine asks it which command to send
//! next and feeds decoded responses back; every update is a transformation of
//! one record looked up by id, so responses for records that were removed in
//! the meantime are dropped.

use std::collections::BTreeMap;
use std::time::Instant;

use crate::{
    decode::ensure_ok,
    wire::{QueryAck, Tuple, TupleBatch},
    QueryResult, RelationTable, Result, ResultId,
};

/// Reserved tuple key that never becomes a column.
const META_KEY: &str = "meta";

#[derive(Debug)]
pub(crate) struct SessionRegistry {
    batch_size: usize,
    next_id: u64,
    // Ids are allocated in increasing order, so iteration follows submission.
    results: BTreeMap<ResultId, QueryResult>,
}

impl SessionRegistry {
    /// A batch size of zero is raised to one: `NEXT` must ask for a row and
    /// an empty batch must end pagination.
    pub(crate) fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            next_id: 0,
            results: BTreeMap::new(),
        }
    }

    pub(crate) fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Replaces the result set with one loading record per query, in order.
    pub(crate) fn replace(&mut self, queries: Vec<String>, now: Instant) -> Vec<(ResultId, String)> {
        self.results.clear();
        queries
            .into_iter()
            .map(|query| {
                let id = self.allocate_id();
                let mut result = QueryResult::new(id, query.clone());
                result.is_loading = true;
                result.started_at = Some(now);
                self.results.insert(id, result);
                (id, query)
            })
            .collect()
    }

    /// Marks `id` loading and returns its session, unless it has no session
    /// yet or a fetch is already in flight.
    pub(crate) fn begin_fetch(&mut self, id: ResultId) -> Option<String> {
        let result = self.results.get_mut(&id)?;
        if result.is_loading {
            return None;
        }
        let session = result.session_id.clone()?;
        result.is_loading = true;
        Some(session)
    }

    /// Applies the outcome of `QUERY`. Returns true when the first batch
    /// should be requested.
    pub(crate) fn apply_ack(&mut self, id: ResultId, outcome: Result<QueryAck>) -> bool {
        let mut acknowledged = false;
        self.update(id, |result| {
            let (next, ok) = with_ack(result, outcome);
            acknowledged = ok;
            next
        });
        acknowledged
    }

    /// Applies the outcome of `NEXT`.
    pub(crate) fn apply_batch(&mut self, id: ResultId, outcome: Result<TupleBatch>, now: Instant) {
        let batch_size = self.batch_size;
        self.update(id, |result| with_batch(result, outcome, batch_size, now));
    }

    /// Removes one record and returns its session if it had one.
    pub(crate) fn remove(&mut self, id: ResultId) -> Option<String> {
        self.results.remove(&id)?.session_id
    }

    /// Removes every record and returns the sessions that need closing.
    pub(crate) fn drain_sessions(&mut self) -> Vec<String> {
        std::mem::take(&mut self.results)
            .into_values()
            .filter_map(|result| result.session_id)
            .collect()
    }

    pub(crate) fn is_loading(&self) -> bool {
        self.results.values().any(|result| result.is_loading)
    }

    pub(crate) fn contains(&self, id: ResultId) -> bool {
        self.results.contains_key(&id)
    }

    #[cfg(test)]
    pub(crate) fn get(&self, id: ResultId) -> Option<&QueryResult> {
        self.results.get(&id)
    }

    pub(crate) fn results(&self) -> Vec<QueryResult> {
        self.results.values().cloned().collect()
    }

    fn allocate_id(&mut self) -> ResultId {
        self.next_id += 1;
        ResultId(self.next_id)
    }

    fn update(&mut self, id: ResultId, apply: impl FnOnce(QueryResult) -> QueryResult) {
        if let Some(result) = self.results.remove(&id) {
            self.results.insert(id, apply(result));
        }
    }
}

fn with_ack(mut result: QueryResult, outcome: Result<QueryAck>) -> (QueryResult, bool) {
    result.is_loading = false;
    let ack = outcome.and_then(|ack| {
        ensure_ok(&ack.status, ack.message.as_deref())?;
        Ok(ack)
    });

    match ack {
        Ok(QueryAck {
            session_id: Some(session),
            ..
        }) => {
            // Assigned at most once.
            if result.session_id.is_none() {
                result.session_id = Some(session);
            }
            (result, true)
        }
        Ok(_) => {
            result.error_message = Some("acknowledgement carried no session id".to_owned());
            (result, false)
        }
        Err(err) => {
            result.error_message = Some(err.to_string());
            (result, false)
        }
    }
}

fn with_batch(
    mut result: QueryResult,
    outcome: Result<TupleBatch>,
    batch_size: usize,
    now: Instant,
) -> QueryResult {
    result.is_loading = false;
    let batch = match outcome.and_then(|batch| {
        ensure_ok(&batch.status, batch.message.as_deref())?;
        Ok(batch)
    }) {
        Ok(batch) => batch,
        Err(err) => {
            result.error_message = Some(err.to_string());
            return result;
        }
    };

    if result.execution_time.is_none() {
        result.execution_time = result.started_at.map(|started| now.duration_since(started));
    }
    result.has_more_rows = batch.tuples.len() >= batch_size;

    let table = match result.table.take() {
        Some(mut table) => {
            let rows = project_rows(&table.columns, &batch.tuples);
            table.rows.extend(rows);
            Some(table)
        }
        None => table_from_first_batch(&batch.tuples),
    };
    result.table = table;
    result
}

/// Builds a table whose columns are the sorted keys of the first tuple,
/// excluding the reserved `meta` key. Returns `None` for an empty batch.
fn table_from_first_batch(tuples: &[Tuple]) -> Option<RelationTable> {
    let first = tuples.first()?;
    let columns: Vec<String> = first
        .keys()
        .filter(|key| key.as_str() != META_KEY)
        .cloned()
        .collect();
    let rows = project_rows(&columns, tuples);
    Some(RelationTable { columns, rows })
}

fn project_rows(columns: &[String], tuples: &[Tuple]) -> Vec<Vec<String>> {
    tuples
        .iter()
        .map(|tuple| {
            columns
                .iter()
                .map(|column| tuple.get(column).cloned().unwrap_or_default())
                .collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::SessionRegistry;
    use crate::{
        wire::{QueryAck, Tuple, TupleBatch},
        DominoError,
    };

    fn tuple(pairs: &[(&str, &str)]) -> Tuple {
        pairs
            .iter()
            .map(|(key, value)| ((*key).to_owned(), (*value).to_owned()))
            .collect()
    }

    fn ok_batch(tuples: Vec<Tuple>) -> TupleBatch {
        TupleBatch {
            status: "ok".to_owned(),
            tuples,
            message: None,
        }
    }

    fn ack(session: &str) -> QueryAck {
        QueryAck {
            status: "ok".to_owned(),
            session_id: Some(session.to_owned()),
            message: None,
        }
    }

    fn numbered(count: usize) -> Vec<Tuple> {
        (0..count)
            .map(|n| {
                let n = n.to_string();
                tuple(&[("n", n.as_str()), ("meta", "x")])
            })
            .collect()
    }

    #[test]
    fn replace_preserves_order_and_marks_loading() {
        let mut registry = SessionRegistry::new(10);
        let ids = registry.replace(vec!["{a}".to_owned(), "{b}".to_owned()], Instant::now());

        assert_eq!(ids.len(), 2);
        let results = registry.results();
        assert_eq!(results[0].query, "{a}");
        assert_eq!(results[1].query, "{b}");
        assert!(results.iter().all(|result| result.is_loading));
        assert!(registry.is_loading());
    }

    #[test]
    fn ack_assigns_session_and_requests_first_batch() {
        let mut registry = SessionRegistry::new(10);
        let (id, _) = registry.replace(vec!["{a}".to_owned()], Instant::now())[0].clone();

        assert!(registry.apply_ack(id, Ok(ack("s-1"))));
        let result = registry.get(id).expect("record");
        assert_eq!(result.session_id.as_deref(), Some("s-1"));
        assert!(!result.is_loading);

        assert_eq!(registry.begin_fetch(id).as_deref(), Some("s-1"));
        assert_eq!(registry.begin_fetch(id), None, "one fetch per session at a time");
    }

    #[test]
    fn failed_ack_records_message_without_session() {
        let mut registry = SessionRegistry::new(10);
        let (id, _) = registry.replace(vec!["{a}".to_owned()], Instant::now())[0].clone();

        let requested = registry.apply_ack(
            id,
            Ok(QueryAck {
                status: "error".to_owned(),
                session_id: Some("ignored".to_owned()),
                message: Some("unknown relation".to_owned()),
            }),
        );

        assert!(!requested);
        let result = registry.get(id).expect("record");
        assert_eq!(result.error_message.as_deref(), Some("unknown relation"));
        assert_eq!(result.session_id, None);
        assert_eq!(result.table, None);
        assert!(!registry.is_loading());
        assert_eq!(registry.begin_fetch(id), None);
    }

    #[test]
    fn ack_without_session_is_an_error() {
        let mut registry = SessionRegistry::new(10);
        let (id, _) = registry.replace(vec!["{a}".to_owned()], Instant::now())[0].clone();
        assert!(!registry.apply_ack(
            id,
            Ok(QueryAck {
                status: "ok".to_owned(),
                session_id: None,
                message: None,
            })
        ));
        assert!(registry.get(id).expect("record").error_message.is_some());
    }

    #[test]
    fn batches_append_under_fixed_columns() {
        let mut registry = SessionRegistry::new(10);
        let start = Instant::now();
        let (id, _) = registry.replace(vec!["{a}".to_owned()], start)[0].clone();
        registry.apply_ack(id, Ok(ack("s")));

        registry.begin_fetch(id);
        let first = vec![
            tuple(&[("name", "Ada"), ("id", "1"), ("meta", "m")]),
            tuple(&[("name", "Grace"), ("id", "2")]),
        ];
        registry.apply_batch(id, Ok(ok_batch(first)), start + Duration::from_millis(40));

        let result = registry.get(id).expect("record");
        let table = result.table.as_ref().expect("table");
        assert_eq!(table.columns, vec!["id", "name"]);
        assert_eq!(table.rows[1], vec!["2", "Grace"]);
        assert_eq!(result.execution_time, Some(Duration::from_millis(40)));
        assert!(!result.has_more_rows);

        registry.begin_fetch(id);
        let second = vec![tuple(&[("name", "Linus"), ("extra", "x")])];
        registry.apply_batch(id, Ok(ok_batch(second)), start + Duration::from_secs(5));

        let result = registry.get(id).expect("record");
        let table = result.table.as_ref().expect("table");
        assert_eq!(table.columns, vec!["id", "name"]);
        assert_eq!(table.row_count(), 3);
        assert_eq!(table.rows[2], vec!["", "Linus"]);
        assert!(table.rows.iter().all(|row| row.len() == table.column_count()));
        assert_eq!(result.execution_time, Some(Duration::from_millis(40)));
    }

    #[test]
    fn has_more_rows_follows_batch_size() {
        let mut registry = SessionRegistry::new(10);
        let now = Instant::now();
        let (id, _) = registry.replace(vec!["{a}".to_owned()], now)[0].clone();
        registry.apply_ack(id, Ok(ack("s")));

        registry.begin_fetch(id);
        registry.apply_batch(id, Ok(ok_batch(numbered(10))), now);
        assert!(registry.get(id).expect("record").has_more_rows);

        registry.begin_fetch(id);
        registry.apply_batch(id, Ok(ok_batch(numbered(3))), now);
        let result = registry.get(id).expect("record");
        assert!(!result.has_more_rows);
        assert_eq!(result.table.as_ref().expect("table").row_count(), 13);
        assert_eq!(result.table.as_ref().expect("table").columns, vec!["n"]);

        registry.begin_fetch(id);
        registry.apply_batch(id, Ok(ok_batch(Vec::new())), now);
        assert!(!registry.get(id).expect("record").has_more_rows);
    }

    #[test]
    fn empty_first_batch_creates_no_table() {
        let mut registry = SessionRegistry::new(10);
        let now = Instant::now();
        let (id, _) = registry.replace(vec!["{a}".to_owned()], now)[0].clone();
        registry.apply_ack(id, Ok(ack("s")));
        registry.begin_fetch(id);
        registry.apply_batch(id, Ok(ok_batch(Vec::new())), now);

        let result = registry.get(id).expect("record");
        assert_eq!(result.table, None);
        assert!(!result.has_more_rows);
        assert!(result.execution_time.is_some());
    }

    #[test]
    fn failed_batch_clears_loading_and_keeps_pagination() {
        let mut registry = SessionRegistry::new(2);
        let now = Instant::now();
        let (id, _) = registry.replace(vec!["{a}".to_owned()], now)[0].clone();
        registry.apply_ack(id, Ok(ack("s")));
        registry.begin_fetch(id);
        registry.apply_batch(id, Ok(ok_batch(numbered(2))), now);

        registry.begin_fetch(id);
        registry.apply_batch(id, Err(DominoError::IncompleteFrame), now);

        let result = registry.get(id).expect("record");
        assert!(!result.is_loading);
        assert!(result.has_more_rows);
        assert_eq!(
            result.error_message.as_deref(),
            Some("connection closed before a complete response was received")
        );
        assert_eq!(result.table.as_ref().expect("table").row_count(), 2);
    }

    #[test]
    fn updates_for_removed_records_are_ignored() {
        let mut registry = SessionRegistry::new(10);
        let (id, _) = registry.replace(vec!["{a}".to_owned()], Instant::now())[0].clone();
        registry.apply_ack(id, Ok(ack("s-9")));

        assert_eq!(registry.drain_sessions(), vec!["s-9".to_owned()]);
        assert!(!registry.contains(id));

        registry.apply_batch(id, Ok(ok_batch(numbered(1))), Instant::now());
        assert!(!registry.apply_ack(id, Err(DominoError::NotConnected)));
        assert!(registry.results().is_empty());
    }

    #[test]
    fn zero_batch_size_still_ends_pagination() {
        let mut registry = SessionRegistry::new(0);
        assert_eq!(registry.batch_size(), 1);

        let now = Instant::now();
        let (id, _) = registry.replace(vec!["{a}".to_owned()], now)[0].clone();
        registry.apply_ack(id, Ok(ack("s")));

        registry.begin_fetch(id);
        registry.apply_batch(id, Ok(ok_batch(numbered(1))), now);
        assert!(registry.get(id).expect("record").has_more_rows);

        registry.begin_fetch(id);
        registry.apply_batch(id, Ok(ok_batch(Vec::new())), now);
        assert!(!registry.get(id).expect("record").has_more_rows);
    }

    #[test]
    fn ids_are_never_reused() {
        let mut registry = SessionRegistry::new(10);
        let (first, _) = registry.replace(vec!["{a}".to_owned()], Instant::now())[0].clone();
        let (second, _) = registry.replace(vec!["{a}".to_owned()], Instant::now())[0].clone();
        assert_ne!(first, second);
        assert_eq!(registry.remove(second), None);
    }
}
