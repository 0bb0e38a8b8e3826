//! Recording connection for unit tests.

use sqldao_core::{Connection, Dialect, IsolationLevel, Result, Row, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
pub struct MockState {
    /// Single statements, in call order.
    pub executed: Vec<(String, Vec<Value>)>,
    /// Batched statements with one parameter row per entry.
    pub batches: Vec<(String, Vec<Vec<Value>>)>,
    /// Canned results returned by `query`, oldest first.
    pub responses: VecDeque<Vec<Row>>,
    pub last_id: i64,
    pub begins: usize,
    pub commits: usize,
    pub rollbacks: usize,
    pub affected: u64,
}

#[derive(Debug, Clone)]
pub struct MockConnection {
    state: Arc<Mutex<MockState>>,
}

impl MockConnection {
    pub fn new(state: Arc<Mutex<MockState>>) -> Self {
        Self { state }
    }

    /// Queue rows for the next `query` call.
    pub fn respond(&self, rows: Vec<Row>) {
        self.state.lock().unwrap().responses.push_back(rows);
    }
}

impl Connection for MockConnection {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let mut state = self.state.lock().unwrap();
        state.executed.push((sql.to_string(), params.to_vec()));
        Ok(state.responses.pop_front().unwrap_or_default())
    }

    fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        state.executed.push((sql.to_string(), params.to_vec()));
        Ok(state.affected)
    }

    fn insert(&self, sql: &str, params: &[Value]) -> Result<Option<Value>> {
        let mut state = self.state.lock().unwrap();
        state.executed.push((sql.to_string(), params.to_vec()));
        state.last_id += 1;
        Ok(Some(Value::BigInt(state.last_id)))
    }

    fn insert_batch(&self, sql: &str, rows: &[Vec<Value>]) -> Result<Vec<Option<Value>>> {
        let mut state = self.state.lock().unwrap();
        state.batches.push((sql.to_string(), rows.to_vec()));
        Ok(rows
            .iter()
            .map(|_| {
                state.last_id += 1;
                Some(Value::BigInt(state.last_id))
            })
            .collect())
    }

    fn execute_batch(&self, sql: &str, rows: &[Vec<Value>]) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        state.batches.push((sql.to_string(), rows.to_vec()));
        Ok(rows.len() as u64)
    }

    fn begin(&self, _isolation: IsolationLevel) -> Result<()> {
        self.state.lock().unwrap().begins += 1;
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        self.state.lock().unwrap().commits += 1;
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        self.state.lock().unwrap().rollbacks += 1;
        Ok(())
    }
}

/// A result row with the given column names and values.
pub fn row(columns: &[&str], values: Vec<Value>) -> Row {
    Row::new(columns.iter().map(|c| (*c).to_string()).collect(), values)
}
