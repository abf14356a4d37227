// SPDX-License-Identifier: Apache-2.0

//! Hub member drivers
//!
//! Each driver wraps a live connection of one backend and implements
//! [`qore_core::MemberConnection`] on top of a keyed table snapshot.

pub mod duckdb;
pub mod postgres;
pub mod snapshot;
pub mod sqlite;
pub mod watch;

pub use self::duckdb::DuckDbMember;
pub use self::postgres::PostgresMember;
pub use self::snapshot::{KeyedStatement, MemberStore, RowKey, SnapshotTable};
pub use self::sqlite::SqliteMember;
pub use self::watch::SchemaWatcher;
