//! Static metadata for the three primitive tables.
//!
//! A [`TableDescriptor`] renders every statement the middle layer issues for
//! one table from the configured prefix: creation DDL, the deferred index
//! phase, and the named prepared statements used by append mode and the
//! query path. Reverse lookups (ways by node, relations by member) live in
//! side tables that the index phase fills from the bulk-loaded rows and then
//! keeps current with triggers.

use std::fmt;

mod codec;

pub use codec::{
    CopyRow, DecodeError, EncodeError, EncodeReason, decode_copy_row, point_values,
    relation_values, way_values,
};
pub(crate) use codec::{coordinate_from_cells, relation_from_cells, way_from_cells};

/// The primitive kind a table stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TableKind {
    /// Point coordinates and tags.
    Points,
    /// Way node lists.
    Ways,
    /// Relation member lists.
    Relations,
}

impl TableKind {
    /// Every kind, in index order.
    pub const ALL: [Self; 3] = [Self::Points, Self::Ways, Self::Relations];

    /// Dense index for per-table arrays.
    pub const fn index(self) -> usize {
        match self {
            Self::Points => 0,
            Self::Ways => 1,
            Self::Relations => 2,
        }
    }

    const fn suffix(self) -> &'static str {
        match self {
            Self::Points => "nodes",
            Self::Ways => "ways",
            Self::Relations => "rels",
        }
    }

    const fn columns(self) -> &'static [Column] {
        match self {
            Self::Points => POINT_COLUMNS,
            Self::Ways => WAY_COLUMNS,
            Self::Relations => RELATION_COLUMNS,
        }
    }
}

impl fmt::Display for TableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Points => "points",
            Self::Ways => "ways",
            Self::Relations => "relations",
        })
    }
}

/// Storage class of a column in the bulk-stream format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    /// Signed 64-bit integer.
    Integer,
    /// Free text.
    Text,
    /// JSON document stored as text.
    Json,
}

impl ColumnType {
    const fn sql(self) -> &'static str {
        match self {
            Self::Integer => "INTEGER",
            Self::Text | Self::Json => "TEXT",
        }
    }
}

/// One column of a primitive table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    /// Column name.
    pub name: &'static str,
    /// Storage class.
    pub ty: ColumnType,
    /// Whether `NULL` is rejected.
    pub required: bool,
}

const fn column(name: &'static str, ty: ColumnType, required: bool) -> Column {
    Column { name, ty, required }
}

const POINT_COLUMNS: &[Column] = &[
    column("id", ColumnType::Integer, true),
    column("lat", ColumnType::Integer, true),
    column("lon", ColumnType::Integer, true),
    column("tags", ColumnType::Json, false),
];

const WAY_COLUMNS: &[Column] = &[
    column("id", ColumnType::Integer, true),
    column("nodes", ColumnType::Json, true),
    column("tags", ColumnType::Json, false),
    column("attrs", ColumnType::Json, false),
];

const RELATION_COLUMNS: &[Column] = &[
    column("id", ColumnType::Integer, true),
    column("members", ColumnType::Json, true),
    column("tags", ColumnType::Json, false),
    column("attrs", ColumnType::Json, false),
];

/// Destination of a bulk stream: table name plus field layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyTarget {
    /// Fully prefixed table name.
    pub table: String,
    /// Fields in wire order.
    pub columns: &'static [Column],
}

/// Named prepared statements a table may register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Statement {
    /// Fetch one row by id.
    Get,
    /// Fetch every row whose id is in a JSON array parameter.
    GetMany,
    /// Insert or replace a full row.
    Upsert,
    /// Delete one row by id.
    Delete,
    /// Touch the table and its side table so a missing one fails.
    Verify,
    /// Ways containing a point, ascending.
    WaysByNode,
    /// Relations having a member of a given kind and id, ascending.
    RelationsByMember,
}

impl Statement {
    const fn label(self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::GetMany => "get_many",
            Self::Upsert => "upsert",
            Self::Delete => "delete",
            Self::Verify => "verify",
            Self::WaysByNode => "ways_by_node",
            Self::RelationsByMember => "rels_by_member",
        }
    }
}

/// A statement ready for [`crate::BackingStore::prepare`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedStatement {
    /// Registration name.
    pub name: String,
    /// SQL text.
    pub sql: String,
}

/// Static metadata for one primitive table under a prefix.
///
/// # Examples
/// ```
/// use middle_core::{Statement, TableDescriptor, TableKind};
///
/// let ways = TableDescriptor::new("planet_osm", TableKind::Ways);
/// assert_eq!(ways.name(), "planet_osm_ways");
/// assert_eq!(ways.statement_name(Statement::Delete), "planet_osm_ways_delete");
/// assert!(ways.create_ddl()[0].starts_with("CREATE TABLE"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDescriptor {
    kind: TableKind,
    prefix: String,
    name: String,
}

impl TableDescriptor {
    /// Describe the `kind` table under `prefix`.
    pub fn new(prefix: &str, kind: TableKind) -> Self {
        Self {
            kind,
            prefix: prefix.to_owned(),
            name: format!("{prefix}_{}", kind.suffix()),
        }
    }

    /// Primitive kind stored here.
    pub const fn kind(&self) -> TableKind {
        self.kind
    }

    /// Fully prefixed table name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Field layout in wire order.
    pub const fn columns(&self) -> &'static [Column] {
        self.kind.columns()
    }

    /// Bulk stream destination.
    pub fn copy_target(&self) -> CopyTarget {
        CopyTarget {
            table: self.name.clone(),
            columns: self.columns(),
        }
    }

    fn side_table(&self) -> Option<String> {
        match self.kind {
            TableKind::Points => None,
            TableKind::Ways => Some(format!("{}_way_nodes", self.prefix)),
            TableKind::Relations => Some(format!("{}_rel_parts", self.prefix)),
        }
    }

    /// Registration name of `statement` for this table.
    pub fn statement_name(&self, statement: Statement) -> String {
        format!("{}_{}", self.name, statement.label())
    }

    /// Statements creating the table. Secondary indexes are deferred.
    pub fn create_ddl(&self) -> Vec<String> {
        let fields = self
            .columns()
            .iter()
            .map(|column| {
                let mut field = format!("{} {}", column.name, column.ty.sql());
                if column.name == "id" {
                    field.push_str(" PRIMARY KEY");
                } else if column.required {
                    field.push_str(" NOT NULL");
                }
                field
            })
            .collect::<Vec<_>>()
            .join(", ");
        vec![format!("CREATE TABLE IF NOT EXISTS {} ({fields})", self.name)]
    }

    /// Statements removing the table, its side table and triggers.
    pub fn drop_ddl(&self) -> Vec<String> {
        let name = &self.name;
        let mut ddl = Vec::new();
        if let Some(side) = self.side_table() {
            ddl.push(format!("DROP TRIGGER IF EXISTS {name}_after_insert"));
            ddl.push(format!("DROP TRIGGER IF EXISTS {name}_after_delete"));
            ddl.push(format!("DROP TABLE IF EXISTS {side}"));
        }
        ddl.push(format!("DROP TABLE IF EXISTS {name}"));
        ddl
    }

    /// Deferred index phase: materialise the reverse-lookup side table from
    /// the loaded rows, index it, and install maintenance triggers.
    pub fn index_ddl(&self) -> Vec<String> {
        let name = &self.name;
        match (self.kind, self.side_table()) {
            (TableKind::Ways, Some(side)) => vec![
                format!(
                    "CREATE TABLE IF NOT EXISTS {side} \
                     (way_id INTEGER NOT NULL, node_id INTEGER NOT NULL)"
                ),
                format!("DELETE FROM {side}"),
                format!(
                    "INSERT INTO {side} (way_id, node_id) \
                     SELECT w.id, j.value FROM {name} AS w, json_each(w.nodes) AS j"
                ),
                format!("CREATE INDEX IF NOT EXISTS {side}_node_idx ON {side} (node_id)"),
                format!("CREATE INDEX IF NOT EXISTS {side}_way_idx ON {side} (way_id)"),
                format!(
                    "CREATE TRIGGER IF NOT EXISTS {name}_after_insert AFTER INSERT ON {name} \
                     BEGIN INSERT INTO {side} (way_id, node_id) \
                     SELECT NEW.id, value FROM json_each(NEW.nodes); END"
                ),
                format!(
                    "CREATE TRIGGER IF NOT EXISTS {name}_after_delete AFTER DELETE ON {name} \
                     BEGIN DELETE FROM {side} WHERE way_id = OLD.id; END"
                ),
            ],
            (TableKind::Relations, Some(side)) => vec![
                format!(
                    "CREATE TABLE IF NOT EXISTS {side} \
                     (rel_id INTEGER NOT NULL, member_type TEXT NOT NULL, \
                     member_id INTEGER NOT NULL)"
                ),
                format!("DELETE FROM {side}"),
                format!(
                    "INSERT INTO {side} (rel_id, member_type, member_id) \
                     SELECT r.id, json_extract(j.value, '$.type'), json_extract(j.value, '$.ref') \
                     FROM {name} AS r, json_each(r.members) AS j"
                ),
                format!(
                    "CREATE INDEX IF NOT EXISTS {side}_member_idx \
                     ON {side} (member_type, member_id)"
                ),
                format!("CREATE INDEX IF NOT EXISTS {side}_rel_idx ON {side} (rel_id)"),
                format!(
                    "CREATE TRIGGER IF NOT EXISTS {name}_after_insert AFTER INSERT ON {name} \
                     BEGIN INSERT INTO {side} (rel_id, member_type, member_id) \
                     SELECT NEW.id, json_extract(value, '$.type'), json_extract(value, '$.ref') \
                     FROM json_each(NEW.members); END"
                ),
                format!(
                    "CREATE TRIGGER IF NOT EXISTS {name}_after_delete AFTER DELETE ON {name} \
                     BEGIN DELETE FROM {side} WHERE rel_id = OLD.id; END"
                ),
            ],
            _ => Vec::new(),
        }
    }

    /// Statement refreshing planner statistics.
    pub fn analyze_ddl(&self) -> Vec<String> {
        let mut ddl = vec![format!("ANALYZE {}", self.name)];
        if let Some(side) = self.side_table() {
            ddl.push(format!("ANALYZE {side}"));
        }
        ddl
    }

    /// Every prepared statement this table registers.
    pub fn statements(&self) -> Vec<PreparedStatement> {
        let name = &self.name;
        let columns = self.columns();
        let field_list = columns
            .iter()
            .map(|column| column.name)
            .collect::<Vec<_>>()
            .join(", ");
        let value_fields = columns
            .iter()
            .skip(1)
            .map(|column| column.name)
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = (1..=columns.len())
            .map(|index| format!("?{index}"))
            .collect::<Vec<_>>()
            .join(", ");

        let mut statements = vec![
            (
                Statement::Get,
                format!("SELECT {value_fields} FROM {name} WHERE id = ?1"),
            ),
            (
                Statement::GetMany,
                format!(
                    "SELECT {field_list} FROM {name} \
                     WHERE id IN (SELECT value FROM json_each(?1))"
                ),
            ),
            (
                Statement::Upsert,
                format!("INSERT OR REPLACE INTO {name} ({field_list}) VALUES ({placeholders})"),
            ),
            (Statement::Delete, format!("DELETE FROM {name} WHERE id = ?1")),
        ];
        match self.side_table() {
            Some(side) => {
                statements.push((
                    Statement::Verify,
                    format!("SELECT 1 FROM {name}, {side} LIMIT 0"),
                ));
                let lookup = match self.kind {
                    TableKind::Ways => (
                        Statement::WaysByNode,
                        format!(
                            "SELECT DISTINCT way_id FROM {side} \
                             WHERE node_id = ?1 ORDER BY way_id"
                        ),
                    ),
                    _ => (
                        Statement::RelationsByMember,
                        format!(
                            "SELECT DISTINCT rel_id FROM {side} \
                             WHERE member_type = ?1 AND member_id = ?2 ORDER BY rel_id"
                        ),
                    ),
                };
                statements.push(lookup);
            }
            None => statements.push((Statement::Verify, format!("SELECT 1 FROM {name} LIMIT 0"))),
        }

        statements
            .into_iter()
            .map(|(statement, sql)| PreparedStatement {
                name: self.statement_name(statement),
                sql,
            })
            .collect()
    }
}

/// Descriptors of all three tables under one prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSet {
    tables: [TableDescriptor; 3],
}

impl TableSet {
    /// Describe every table under `prefix`.
    pub fn new(prefix: &str) -> Self {
        Self {
            tables: TableKind::ALL.map(|kind| TableDescriptor::new(prefix, kind)),
        }
    }

    /// Descriptor for `kind`.
    pub fn get(&self, kind: TableKind) -> &TableDescriptor {
        match kind {
            TableKind::Points => &self.tables[0],
            TableKind::Ways => &self.tables[1],
            TableKind::Relations => &self.tables[2],
        }
    }

    /// Descriptors in kind order.
    pub fn iter(&self) -> impl Iterator<Item = &TableDescriptor> {
        self.tables.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(TableKind::Points, "osm_nodes")]
    #[case(TableKind::Ways, "osm_ways")]
    #[case(TableKind::Relations, "osm_rels")]
    fn names_follow_prefix(#[case] kind: TableKind, #[case] expected: &str) {
        let table = TableDescriptor::new("osm", kind);
        assert_eq!(table.name(), expected);
        assert_eq!(table.copy_target().table, expected);
    }

    #[rstest]
    fn creation_defers_secondary_indexes() {
        let ways = TableDescriptor::new("osm", TableKind::Ways);
        let ddl = ways.create_ddl().join(";");
        assert!(!ddl.contains("INDEX"));
        assert!(ddl.contains("nodes TEXT NOT NULL"));
        assert!(ddl.contains("id INTEGER PRIMARY KEY"));
        assert!(ways.index_ddl().iter().any(|sql| sql.contains("CREATE INDEX")));
    }

    #[rstest]
    fn points_have_no_index_phase() {
        let points = TableDescriptor::new("osm", TableKind::Points);
        assert!(points.index_ddl().is_empty());
        assert_eq!(points.drop_ddl(), vec!["DROP TABLE IF EXISTS osm_nodes".to_owned()]);
    }

    #[rstest]
    #[case(TableKind::Points, &[Statement::Get, Statement::GetMany, Statement::Upsert, Statement::Delete, Statement::Verify][..])]
    #[case(TableKind::Ways, &[Statement::Get, Statement::GetMany, Statement::Upsert, Statement::Delete, Statement::Verify, Statement::WaysByNode][..])]
    #[case(TableKind::Relations, &[Statement::Get, Statement::GetMany, Statement::Upsert, Statement::Delete, Statement::Verify, Statement::RelationsByMember][..])]
    fn statements_are_registered_per_kind(#[case] kind: TableKind, #[case] expected: &[Statement]) {
        let table = TableDescriptor::new("osm", kind);
        let names: Vec<_> = table.statements().into_iter().map(|s| s.name).collect();
        let wanted: Vec<_> = expected.iter().map(|s| table.statement_name(*s)).collect();
        assert_eq!(names, wanted);
    }

    #[rstest]
    fn upsert_binds_every_column() {
        let relations = TableDescriptor::new("osm", TableKind::Relations);
        let upsert = relations
            .statements()
            .into_iter()
            .find(|s| s.name == "osm_rels_upsert")
            .expect("upsert registered");
        assert_eq!(
            upsert.sql,
            "INSERT OR REPLACE INTO osm_rels (id, members, tags, attrs) VALUES (?1, ?2, ?3, ?4)"
        );
    }
}
