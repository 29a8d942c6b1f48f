//! SQL text builders for the load paths.
//!
//! Every identifier goes through [`quote_ident`]; values are always bound as
//! parameters, never interpolated.

use uuid::Uuid;

use crate::hash::hash_parts;
use crate::infer::ColumnDef;

/// PostgreSQL's limit on bind parameters in one statement.
pub const MAX_BIND_PARAMS: usize = 65_535;

/// Upper bound on rows per multi-row INSERT, regardless of width.
pub const MAX_ROWS_PER_INSERT: usize = 1_000;

/// Hidden ordinal column carried by staging tables for last-writer-wins
/// de-duplication.
pub const ORDINAL_COLUMN: &str = "__sync_ord";

/// PostgreSQL's identifier length limit (NAMEDATALEN - 1).
const MAX_IDENT_BYTES: usize = 63;

/// Helper: quote a SQL identifier, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// `"schema"."table"`
pub fn qualified(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}

/// Quote a possibly schema-qualified dotted name such as `etl.etl_job`.
pub fn qualified_name(dotted: &str) -> String {
    match dotted.split_once('.') {
        Some((schema, table)) => qualified(schema, table),
        None => quote_ident(dotted),
    }
}

/// Helper: build a comma-separated list of quoted column references.
pub fn col_list(cols: &[String]) -> String {
    cols.iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Helper: build a comma-separated list of prefixed column references.
pub fn prefixed_col_list(prefix: &str, cols: &[String]) -> String {
    cols.iter()
        .map(|c| format!("{prefix}.{}", quote_ident(c)))
        .collect::<Vec<_>>()
        .join(", ")
}

fn truncate_ident(name: &str, max_bytes: usize) -> &str {
    if name.len() <= max_bytes {
        return name;
    }
    let mut end = max_bytes;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

// ── DDL ─────────────────────────────────────────────────────────────────

pub fn create_schema_sql(schema: &str) -> String {
    format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(schema))
}

pub fn create_table_sql(schema: &str, table: &str, columns: &[ColumnDef]) -> String {
    let defs = columns
        .iter()
        .map(|c| format!("{} {}", quote_ident(&c.name), c.kind.sql_type()))
        .collect::<Vec<_>>()
        .join(", ");
    format!("CREATE TABLE {} ({defs})", qualified(schema, table))
}

pub fn add_column_sql(schema: &str, table: &str, column: &ColumnDef) -> String {
    format!(
        "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {} {}",
        qualified(schema, table),
        quote_ident(&column.name),
        column.kind.sql_type()
    )
}

const INDEX_SUFFIX: &str = "_sync_key";

/// Prefix shared by every upsert index of `table`, whatever its key set.
pub fn unique_index_prefix(table: &str) -> String {
    // 9 bytes left for "_" plus 8 hex digits.
    format!(
        "{}{INDEX_SUFFIX}_",
        truncate_ident(table, MAX_IDENT_BYTES - INDEX_SUFFIX.len() - 9)
    )
}

/// Name of the unique index backing upserts on `keys`:
/// `<table>_sync_key_<8 hex digits of the key list hash>`. A different key
/// set gets a different name.
pub fn unique_index_name(table: &str, keys: &[String]) -> String {
    let parts: Vec<&str> = keys.iter().map(String::as_str).collect();
    let hash = hash_parts(&parts) as u64;
    format!("{}{:08x}", unique_index_prefix(table), hash >> 32)
}

pub fn unique_index_sql(schema: &str, table: &str, keys: &[String]) -> String {
    format!(
        "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {} ({})",
        quote_ident(&unique_index_name(table, keys)),
        qualified(schema, table),
        col_list(keys)
    )
}

pub fn drop_index_sql(schema: &str, index: &str) -> String {
    format!("DROP INDEX IF EXISTS {}", qualified(schema, index))
}

pub fn truncate_sql(schema: &str, table: &str) -> String {
    format!("TRUNCATE {}", qualified(schema, table))
}

pub fn drop_table_if_exists_sql(schema: &str, table: &str) -> String {
    format!("DROP TABLE IF EXISTS {}", qualified(schema, table))
}

// ── DML ─────────────────────────────────────────────────────────────────

/// Rows per INSERT statement for a given column count, staying under the
/// bind parameter limit.
pub fn rows_per_chunk(column_count: usize) -> usize {
    (MAX_BIND_PARAMS / column_count.max(1)).clamp(1, MAX_ROWS_PER_INSERT)
}

/// `INSERT INTO t (a, b) VALUES ($1, $2), ($3, $4), ...` for `row_count` rows.
pub fn insert_values_sql(table_sql: &str, columns: &[String], row_count: usize) -> String {
    let width = columns.len();
    let mut values = String::with_capacity(row_count * width * 5);
    for row in 0..row_count {
        if row > 0 {
            values.push_str(", ");
        }
        values.push('(');
        for col in 0..width {
            if col > 0 {
                values.push_str(", ");
            }
            values.push('$');
            values.push_str(&(row * width + col + 1).to_string());
        }
        values.push(')');
    }
    format!(
        "INSERT INTO {table_sql} ({}) VALUES {values}",
        col_list(columns)
    )
}

/// Unique per-run staging table name: `_stg_<table>_<run id prefix>`.
pub fn staging_name(table: &str, run_id: Uuid) -> String {
    let simple = run_id.simple().to_string();
    format!("_stg_{}_{}", truncate_ident(table, 40), &simple[..12])
}

/// Staging table shaped like the target plus the ordinal column.
pub fn create_staging_sql(schema: &str, staging: &str, table: &str) -> String {
    format!(
        "CREATE UNLOGGED TABLE {} (LIKE {}, {} BIGINT NOT NULL)",
        qualified(schema, staging),
        qualified(schema, table),
        quote_ident(ORDINAL_COLUMN)
    )
}

/// Set-based upsert from the staging table into the target.
///
/// Duplicate keys inside the staged set keep the highest ordinal (the last
/// record fetched). Non-key columns are overwritten only when they differ;
/// when every column is a key, conflicts are ignored.
pub fn upsert_from_staging_sql(
    schema: &str,
    table: &str,
    staging: &str,
    columns: &[String],
    keys: &[String],
) -> String {
    let col_sql = col_list(columns);
    let key_sql = col_list(keys);
    let ord = quote_ident(ORDINAL_COLUMN);

    let non_keys: Vec<&String> = columns.iter().filter(|c| !keys.contains(c)).collect();
    let conflict_action = if non_keys.is_empty() {
        "DO NOTHING".to_string()
    } else {
        let set_clause = non_keys
            .iter()
            .map(|c| {
                let qc = quote_ident(c);
                format!("{qc} = EXCLUDED.{qc}")
            })
            .collect::<Vec<_>>()
            .join(", ");
        let is_distinct_clause = non_keys
            .iter()
            .map(|c| {
                let qc = quote_ident(c);
                format!("tgt.{qc} IS DISTINCT FROM EXCLUDED.{qc}")
            })
            .collect::<Vec<_>>()
            .join(" OR ");
        format!("DO UPDATE SET {set_clause} WHERE ({is_distinct_clause})")
    };

    format!(
        "INSERT INTO {target} AS tgt ({col_sql}) \
         SELECT {s_cols} FROM (\
           SELECT DISTINCT ON ({key_sql}) {col_sql}, {ord} \
           FROM {stage} \
           ORDER BY {key_sql}, {ord} DESC\
         ) s \
         ON CONFLICT ({key_sql}) {conflict_action}",
        target = qualified(schema, table),
        stage = qualified(schema, staging),
        s_cols = prefixed_col_list("s", columns),
    )
}

/// `MAX(column)` as text, plus the column's type name.
pub fn max_value_sql(schema: &str, table: &str, column: &str) -> String {
    let col = quote_ident(column);
    format!(
        "SELECT MAX({col})::text, pg_typeof(MAX({col}))::text FROM {}",
        qualified(schema, table)
    )
}

pub fn count_sql(schema: &str, table: &str) -> String {
    format!("SELECT count(*) FROM {}", qualified(schema, table))
}

/// `condition` is caller-supplied SQL with `$n` placeholders.
pub fn delete_where_sql(schema: &str, table: &str, condition: &str) -> String {
    format!("DELETE FROM {} WHERE {condition}", qualified(schema, table))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infer::ColumnKind;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    // ── quoting ─────────────────────────────────────────────────────

    #[test]
    fn test_quote_ident_simple() {
        assert_eq!(quote_ident("prices"), "\"prices\"");
    }

    #[test]
    fn test_quote_ident_with_quotes() {
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_qualified_name() {
        assert_eq!(qualified_name("etl.etl_job"), "\"etl\".\"etl_job\"");
        assert_eq!(qualified_name("etl_job"), "\"etl_job\"");
    }

    #[test]
    fn test_prefixed_col_list() {
        assert_eq!(
            prefixed_col_list("s", &cols(&["a", "b"])),
            "s.\"a\", s.\"b\""
        );
    }

    // ── DDL ─────────────────────────────────────────────────────────

    #[test]
    fn test_create_table_sql() {
        let sql = create_table_sql(
            "public",
            "prices",
            &[
                ColumnDef::new("id", ColumnKind::BigInt),
                ColumnDef::new("price", ColumnKind::Double),
            ],
        );
        assert_eq!(
            sql,
            "CREATE TABLE \"public\".\"prices\" (\"id\" BIGINT, \"price\" DOUBLE PRECISION)"
        );
    }

    #[test]
    fn test_add_column_is_idempotent_ddl() {
        let sql = add_column_sql("s", "t", &ColumnDef::new("c", ColumnKind::Text));
        assert_eq!(
            sql,
            "ALTER TABLE \"s\".\"t\" ADD COLUMN IF NOT EXISTS \"c\" TEXT"
        );
    }

    #[test]
    fn test_unique_index_name_fits_identifier_limit() {
        let keys = vec!["id".to_string()];
        let name = unique_index_name("prices", &keys);
        assert!(name.starts_with("prices_sync_key_"));
        assert_eq!(name.len(), "prices_sync_key_".len() + 8);
        let long = "x".repeat(100);
        assert_eq!(unique_index_name(&long, &keys).len(), 63);
        let multibyte = "é".repeat(40);
        assert!(unique_index_name(&multibyte, &keys).len() <= 63);
    }

    #[test]
    fn test_unique_index_name_follows_key_set() {
        let id = vec!["id".to_string()];
        let id_date = vec!["id".to_string(), "date".to_string()];
        assert_eq!(unique_index_name("prices", &id), unique_index_name("prices", &id));
        assert_ne!(
            unique_index_name("prices", &id),
            unique_index_name("prices", &id_date)
        );
        assert!(unique_index_name("prices", &id_date).starts_with(&unique_index_prefix("prices")));
    }

    #[test]
    fn test_drop_index_sql() {
        assert_eq!(
            drop_index_sql("public", "prices_sync_key_0badf00d"),
            "DROP INDEX IF EXISTS \"public\".\"prices_sync_key_0badf00d\""
        );
    }

    // ── DML ─────────────────────────────────────────────────────────

    #[test]
    fn test_insert_values_sql_numbering() {
        let sql = insert_values_sql("\"s\".\"t\"", &cols(&["a", "b"]), 2);
        assert_eq!(
            sql,
            "INSERT INTO \"s\".\"t\" (\"a\", \"b\") VALUES ($1, $2), ($3, $4)"
        );
    }

    #[test]
    fn test_rows_per_chunk_respects_param_limit() {
        assert_eq!(rows_per_chunk(1), MAX_ROWS_PER_INSERT);
        assert_eq!(rows_per_chunk(0), MAX_ROWS_PER_INSERT);
        assert_eq!(rows_per_chunk(100), 655);
        assert_eq!(rows_per_chunk(70_000), 1);
        assert!(rows_per_chunk(100) * 100 <= MAX_BIND_PARAMS);
    }

    #[test]
    fn test_staging_name_is_unique_per_run() {
        let a = staging_name("prices", Uuid::new_v4());
        let b = staging_name("prices", Uuid::new_v4());
        assert_ne!(a, b);
        assert!(a.starts_with("_stg_prices_"));
        assert_eq!(a.len(), "_stg_prices_".len() + 12);
    }

    #[test]
    fn test_create_staging_sql() {
        assert_eq!(
            create_staging_sql("public", "_stg_t_abc", "t"),
            "CREATE UNLOGGED TABLE \"public\".\"_stg_t_abc\" \
             (LIKE \"public\".\"t\", \"__sync_ord\" BIGINT NOT NULL)"
        );
    }

    #[test]
    fn test_upsert_sql_updates_non_key_columns() {
        let sql = upsert_from_staging_sql(
            "public",
            "prices",
            "_stg",
            &cols(&["id", "price", "date"]),
            &cols(&["id"]),
        );
        assert!(sql.starts_with("INSERT INTO \"public\".\"prices\" AS tgt (\"id\", \"price\", \"date\")"));
        assert!(sql.contains("SELECT DISTINCT ON (\"id\")"));
        assert!(sql.contains("ORDER BY \"id\", \"__sync_ord\" DESC"));
        assert!(sql.contains("ON CONFLICT (\"id\") DO UPDATE SET"));
        assert!(sql.contains("\"price\" = EXCLUDED.\"price\", \"date\" = EXCLUDED.\"date\""));
        assert!(sql.contains("tgt.\"price\" IS DISTINCT FROM EXCLUDED.\"price\""));
        assert!(!sql.contains("\"id\" = EXCLUDED.\"id\""));
    }

    #[test]
    fn test_upsert_sql_all_key_columns_does_nothing_on_conflict() {
        let sql = upsert_from_staging_sql(
            "public",
            "pairs",
            "_stg",
            &cols(&["a", "b"]),
            &cols(&["a", "b"]),
        );
        assert!(sql.ends_with("ON CONFLICT (\"a\", \"b\") DO NOTHING"));
    }

    #[test]
    fn test_max_value_sql() {
        assert_eq!(
            max_value_sql("public", "prices", "date"),
            "SELECT MAX(\"date\")::text, pg_typeof(MAX(\"date\"))::text \
             FROM \"public\".\"prices\""
        );
    }

    #[test]
    fn test_delete_where_sql() {
        assert_eq!(
            delete_where_sql("public", "prices", "\"date\" < $1"),
            "DELETE FROM \"public\".\"prices\" WHERE \"date\" < $1"
        );
    }
}
