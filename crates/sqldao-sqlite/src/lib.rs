//! SQLite driver for sqldao.
//!
// FFI bindings require unsafe code - this is expected for database drivers
#![allow(unsafe_code)]
//!
//! This crate implements the blocking `Connection` trait from sqldao-core on
//! top of libsqlite3 (compiled from the bundled amalgamation).
//!
//! # Example
//!
//! ```rust,ignore
//! use sqldao_sqlite::SqliteConnection;
//! use sqldao_core::{Connection, Value};
//!
//! let conn = SqliteConnection::open_memory()?;
//! conn.execute_raw("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)")?;
//! let id = conn.insert("INSERT INTO users (name) VALUES (?1)", &[Value::from("Alice")])?;
//! ```
//!
//! # Type Mapping
//!
//! | Value | SQLite storage |
//! |-------|----------------|
//! | `Bool` | INTEGER (0/1) |
//! | `Int`, `BigInt` | INTEGER |
//! | `Double` | REAL |
//! | `Text` | TEXT |
//! | `Bytes`, `Uuid` | BLOB |
//! | `Json` | TEXT |
//!
//! Integers read back as `Int` when they fit in 32 bits and `BigInt` otherwise.

pub mod connection;
pub mod types;

pub use connection::{OpenFlags, SqliteConfig, SqliteConnection};

use libsqlite3_sys as ffi;
use std::ffi::CStr;

/// The SQLite library version string.
pub fn sqlite_version() -> &'static str {
    // SAFETY: sqlite3_libversion returns a pointer to a static string
    unsafe { CStr::from_ptr(ffi::sqlite3_libversion()) }
        .to_str()
        .unwrap_or("unknown")
}

/// The SQLite library version number.
pub fn sqlite_version_number() -> i32 {
    // SAFETY: no preconditions
    unsafe { ffi::sqlite3_libversion_number() }
}
