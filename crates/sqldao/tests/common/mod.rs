#![allow(dead_code)]

use sqldao::prelude::*;
use sqldao::{Dialect, IsolationLevel, Row};
use std::cell::RefCell;
use std::rc::Rc;

/// Records every statement sent to the wrapped connection.
///
/// Transaction control (BEGIN, COMMIT, ROLLBACK) is not recorded.
#[derive(Clone, Default)]
pub struct StatementLog(Rc<RefCell<Vec<String>>>);

impl StatementLog {
    pub fn count(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn statements(&self) -> Vec<String> {
        self.0.borrow().clone()
    }

    pub fn last(&self) -> Option<String> {
        self.0.borrow().last().cloned()
    }

    pub fn clear(&self) {
        self.0.borrow_mut().clear();
    }

    /// Statements recorded after running `f`.
    pub fn during<T>(&self, f: impl FnOnce() -> T) -> (T, Vec<String>) {
        let before = self.count();
        let out = f();
        let after = self.0.borrow()[before..].to_vec();
        (out, after)
    }

    fn record(&self, sql: &str) {
        self.0.borrow_mut().push(sql.to_string());
    }
}

pub struct CountingConnection {
    inner: SqliteConnection,
    log: StatementLog,
}

impl CountingConnection {
    pub fn open() -> (Self, StatementLog) {
        let log = StatementLog::default();
        let inner = SqliteConnection::open_memory().expect("open sqlite memory db");
        (
            Self {
                inner,
                log: log.clone(),
            },
            log,
        )
    }
}

impl Connection for CountingConnection {
    fn dialect(&self) -> Dialect {
        self.inner.dialect()
    }

    fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.log.record(sql);
        self.inner.query(sql, params)
    }

    fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.log.record(sql);
        self.inner.execute(sql, params)
    }

    fn insert(&self, sql: &str, params: &[Value]) -> Result<Option<Value>> {
        self.log.record(sql);
        self.inner.insert(sql, params)
    }

    fn insert_batch(&self, sql: &str, rows: &[Vec<Value>]) -> Result<Vec<Option<Value>>> {
        self.log.record(sql);
        self.inner.insert_batch(sql, rows)
    }

    fn execute_batch(&self, sql: &str, rows: &[Vec<Value>]) -> Result<u64> {
        self.log.record(sql);
        self.inner.execute_batch(sql, rows)
    }

    fn begin(&self, isolation: IsolationLevel) -> Result<()> {
        self.inner.begin(isolation)
    }

    fn commit(&self) -> Result<()> {
        self.inner.commit()
    }

    fn rollback(&self) -> Result<()> {
        self.inner.rollback()
    }
}

// ============================================================================
// Models
// ============================================================================

macro_rules! entity {
    ($name:ident) => {
        pub struct $name(pub EntityHandle);

        impl Entity for $name {
            fn from_handle(handle: EntityHandle) -> Self {
                $name(handle)
            }

            fn handle(&self) -> &EntityHandle {
                &self.0
            }
        }
    };
}

entity!(Country);
entity!(Region);
entity!(Person);
entity!(Company);
entity!(ContactInfo);

impl Model for Country {
    const TABLE: &'static str = "country";

    fn table() -> TableDef {
        TableDef::new("country")
            .column(ColumnDef::new("name", SqlType::Text))
            .column(ColumnDef::new("population", SqlType::BigInt).default_value(0_i64))
            .one_to_many("regions", "region", "country_id")
            .order_by("name")
    }
}

impl Model for Region {
    const TABLE: &'static str = "region";

    fn table() -> TableDef {
        TableDef::new("region")
            .column(ColumnDef::new("name", SqlType::Text))
            .column(ColumnDef::new("country_id", SqlType::BigInt).references("country", "id"))
            .many_to_one("country", "country_id", "country")
    }
}

impl Model for Person {
    const TABLE: &'static str = "person";

    fn table() -> TableDef {
        TableDef::new("person")
            .column(ColumnDef::new("name", SqlType::Text))
            .column(
                ColumnDef::new("country_id", SqlType::BigInt)
                    .nullable(true)
                    .references("country", "id"),
            )
            .column(
                ColumnDef::new("parent_id", SqlType::BigInt)
                    .nullable(true)
                    .references("person", "id"),
            )
            .many_to_optional("country", "country_id", "country")
            .many_to_optional("parent", "parent_id", "person")
            .one_to_many("children", "person", "parent_id")
    }
}

impl Model for Company {
    const TABLE: &'static str = "company";

    fn table() -> TableDef {
        TableDef::new("company")
            .column(ColumnDef::new("name", SqlType::Text))
            .column(ColumnDef::new("manager_id", SqlType::BigInt).references("person", "id"))
            .many_to_one("manager", "manager_id", "person")
            .reverse_one("contact", "contact_info", "company_id")
    }
}

impl Model for ContactInfo {
    const TABLE: &'static str = "contact_info";

    fn table() -> TableDef {
        TableDef::new("contact_info")
            .column(ColumnDef::new("email", SqlType::Text))
            .column(ColumnDef::new("company_id", SqlType::BigInt).references("company", "id"))
            .many_to_one("company", "company_id", "company")
    }
}

/// A session over an in-memory database with every test table created.
pub fn session_with(bus: &EventBus) -> (Session, StatementLog) {
    let (conn, log) = CountingConnection::open();
    let session = Session::builder()
        .event_bus(bus.clone())
        .register::<Country>()
        .register::<Region>()
        .register::<Person>()
        .register::<Company>()
        .register::<ContactInfo>()
        .build(conn)
        .expect("build session");
    session.create_tables().expect("create tables");
    session.commit().expect("commit schema");
    log.clear();
    (session, log)
}

pub fn session() -> (Session, StatementLog) {
    session_with(&EventBus::new())
}

pub fn country(session: &Session, name: &str) -> Country {
    session
        .create::<Country>(|c| c.handle().set("name", name))
        .expect("create country")
}

pub fn person(session: &Session, name: &str, country: Option<&Country>) -> Person {
    session
        .create::<Person>(|p| {
            p.handle().set("name", name)?;
            p.handle()
                .set_related("country", country.map(|c| c.handle()))
        })
        .expect("create person")
}

pub fn name_of<E: Entity>(entity: &E) -> String {
    entity
        .handle()
        .get_as::<String>("name")
        .expect("read name")
}
