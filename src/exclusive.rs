//! Single-default bookkeeping shared by model configs and prompt templates.
//!
//! Both tables carry an `is_default` column of which at most one row may be
//! set. The helpers here run on a connection that is already inside a
//! transaction, so a flag move is never observable half-done.

use anyhow::Context;
use sqlx::SqliteConnection;
use uuid::Uuid;

use crate::models::{ModelConfig, PromptTemplate};

pub trait ExclusiveDefault {
    /// Table holding the `id` and `is_default` columns.
    const TABLE: &'static str;
    /// Human readable entity name for logs and errors.
    const KIND: &'static str;

    fn is_default(&self) -> bool;
}

impl ExclusiveDefault for ModelConfig {
    const TABLE: &'static str = "model_configs";
    const KIND: &'static str = "model config";

    fn is_default(&self) -> bool {
        self.is_default
    }
}

impl ExclusiveDefault for PromptTemplate {
    const TABLE: &'static str = "prompt_templates";
    const KIND: &'static str = "prompt template";

    fn is_default(&self) -> bool {
        self.is_default
    }
}

/// Clears the flag on every row. Returns how many rows were demoted.
pub(crate) async fn clear_default<T: ExclusiveDefault>(
    conn: &mut SqliteConnection,
) -> Result<u64, anyhow::Error> {
    let sql = format!("UPDATE {} SET is_default = 0 WHERE is_default = 1", T::TABLE);
    let result = sqlx::query(&sql)
        .execute(&mut *conn)
        .await
        .with_context(|| format!("Failed to clear default {}", T::KIND))?;
    Ok(result.rows_affected())
}

/// Makes `id` the only flagged row. Returns `false` without touching
/// anything when `id` does not exist.
///
/// The existence check and the flag move are one statement, so no writer
/// can slip in between them.
pub(crate) async fn promote<T: ExclusiveDefault>(
    conn: &mut SqliteConnection,
    id: Uuid,
) -> Result<bool, anyhow::Error> {
    let id_text = id.to_string();
    let sql = format!(
        "UPDATE {table} SET is_default = CASE WHEN id = ? THEN 1 ELSE 0 END \
         WHERE EXISTS (SELECT 1 FROM {table} WHERE id = ?)",
        table = T::TABLE
    );
    let result = sqlx::query(&sql)
        .bind(id_text.as_str())
        .bind(id_text.as_str())
        .execute(&mut *conn)
        .await
        .with_context(|| format!("Failed to promote {} {} to default", T::KIND, id))?;

    if result.rows_affected() == 0 {
        log::warn!("Attempted to make non-existent {} {} the default", T::KIND, id);
        return Ok(false);
    }
    log::info!("{} {} is now the default", T::KIND, id);
    Ok(true)
}

pub fn default_count<T: ExclusiveDefault>(records: &[T]) -> usize {
    records.iter().filter(|record| record.is_default()).count()
}
