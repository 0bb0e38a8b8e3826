//! Value encoding and decoding between sqldao and SQLite.
//!
//! SQLite has five storage classes (INTEGER, REAL, TEXT, BLOB, NULL). Booleans
//! bind as 0/1 integers, UUIDs as 16-byte blobs and JSON as text.

use libsqlite3_sys as ffi;
use sqldao_core::Value;
use std::ffi::{CStr, c_int};

fn bind_text(stmt: *mut ffi::sqlite3_stmt, index: c_int, text: &str) -> c_int {
    let bytes = text.as_bytes();
    // SAFETY: the caller guarantees a valid statement; SQLITE_TRANSIENT makes
    // SQLite copy the buffer before this function returns
    unsafe {
        ffi::sqlite3_bind_text(
            stmt,
            index,
            bytes.as_ptr().cast(),
            bytes.len() as c_int,
            ffi::SQLITE_TRANSIENT(),
        )
    }
}

fn bind_blob(stmt: *mut ffi::sqlite3_stmt, index: c_int, data: &[u8]) -> c_int {
    // SAFETY: as in bind_text
    unsafe {
        ffi::sqlite3_bind_blob(
            stmt,
            index,
            data.as_ptr().cast(),
            data.len() as c_int,
            ffi::SQLITE_TRANSIENT(),
        )
    }
}

/// Bind a Value to a prepared statement parameter.
///
/// # Safety
/// - `stmt` must be a valid, non-null prepared statement handle
/// - `index` must be a valid 1-based parameter index
pub unsafe fn bind_value(stmt: *mut ffi::sqlite3_stmt, index: c_int, value: &Value) -> c_int {
    match value {
        Value::Null => unsafe { ffi::sqlite3_bind_null(stmt, index) },
        Value::Bool(b) => unsafe { ffi::sqlite3_bind_int(stmt, index, if *b { 1 } else { 0 }) },
        Value::Int(v) => unsafe { ffi::sqlite3_bind_int(stmt, index, *v) },
        Value::BigInt(v) => unsafe { ffi::sqlite3_bind_int64(stmt, index, *v) },
        Value::Double(v) => unsafe { ffi::sqlite3_bind_double(stmt, index, *v) },
        Value::Text(s) => bind_text(stmt, index, s),
        Value::Bytes(b) => bind_blob(stmt, index, b),
        Value::Uuid(bytes) => bind_blob(stmt, index, bytes),
        Value::Json(json) => bind_text(stmt, index, &json.to_string()),
    }
}

/// Read a column value from a result row.
///
/// # Safety
/// - `stmt` must be a valid prepared statement that has just returned SQLITE_ROW
/// - `index` must be a valid 0-based column index
pub unsafe fn read_column(stmt: *mut ffi::sqlite3_stmt, index: c_int) -> Value {
    let col_type = unsafe { ffi::sqlite3_column_type(stmt, index) };

    match col_type {
        ffi::SQLITE_NULL => Value::Null,

        ffi::SQLITE_INTEGER => {
            let v = unsafe { ffi::sqlite3_column_int64(stmt, index) };
            match i32::try_from(v) {
                Ok(small) => Value::Int(small),
                Err(_) => Value::BigInt(v),
            }
        }

        ffi::SQLITE_FLOAT => Value::Double(unsafe { ffi::sqlite3_column_double(stmt, index) }),

        ffi::SQLITE_TEXT => {
            let ptr = unsafe { ffi::sqlite3_column_text(stmt, index) };
            let len = unsafe { ffi::sqlite3_column_bytes(stmt, index) };
            if ptr.is_null() {
                Value::Null
            } else {
                // SAFETY: SQLite guarantees `len` readable bytes at `ptr` until the next step
                let slice = unsafe { std::slice::from_raw_parts(ptr, len as usize) };
                Value::Text(String::from_utf8_lossy(slice).into_owned())
            }
        }

        ffi::SQLITE_BLOB => {
            let ptr = unsafe { ffi::sqlite3_column_blob(stmt, index) };
            let len = unsafe { ffi::sqlite3_column_bytes(stmt, index) };
            if ptr.is_null() || len == 0 {
                Value::Bytes(Vec::new())
            } else {
                let slice = unsafe { std::slice::from_raw_parts(ptr.cast::<u8>(), len as usize) };
                Value::Bytes(slice.to_vec())
            }
        }

        _ => Value::Null,
    }
}

/// Get the column name from a result.
///
/// # Safety
/// - `stmt` must be a valid prepared statement
/// - `index` must be a valid 0-based column index
pub unsafe fn column_name(stmt: *mut ffi::sqlite3_stmt, index: c_int) -> Option<String> {
    let ptr = unsafe { ffi::sqlite3_column_name(stmt, index) };
    if ptr.is_null() {
        None
    } else {
        unsafe { CStr::from_ptr(ptr) }.to_str().ok().map(String::from)
    }
}

/// Human-readable description of a result code.
pub fn error_string(code: c_int) -> String {
    // SAFETY: sqlite3_errstr returns a static string for every code
    unsafe {
        let ptr = ffi::sqlite3_errstr(code);
        if ptr.is_null() {
            format!("sqlite error {}", code)
        } else {
            CStr::from_ptr(ptr).to_string_lossy().into_owned()
        }
    }
}
