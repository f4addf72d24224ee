//! Row models for the key/value table.

use chrono::NaiveDateTime;
use derive_getters::Getters;
use derive_new::new;
use diesel::prelude::*;

use crate::store::schema;

/// A stored entry.
#[derive(Debug, Clone, Queryable, Selectable, Getters)]
#[diesel(table_name = schema::kv_entries)]
pub struct KvEntry {
    scope: String,
    entry_key: String,
    value: String,
    updated_at: NaiveDateTime,
}

/// Insertable entry; replaces any existing row with the same scope and key.
#[derive(Debug, Clone, Insertable, new, Getters)]
#[diesel(table_name = schema::kv_entries)]
pub struct NewKvEntry {
    scope: String,
    entry_key: String,
    value: String,
    updated_at: NaiveDateTime,
}
