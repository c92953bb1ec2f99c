use serde::{Serialize, Deserialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use crate::core::error::{Error, ErrorKind, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Boolean,
    Integer,
    Number,
    String,
    DateTime,
    Bytes,
}

impl DataType {
    pub fn is_indexable(&self) -> bool {
        !matches!(self, DataType::Bytes)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Order {
    Asc,
    Desc,
}

impl Order {
    pub fn reverse(self) -> Order {
        match self {
            Order::Asc => Order::Desc,
            Order::Desc => Order::Asc,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedColumn {
    pub name: String,
    pub order: Order,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexDef {
    pub name: String,
    pub table: String,
    pub columns: Vec<IndexedColumn>,
    pub unique: bool,
    /// Set when any indexed column accepts nulls.
    pub nullable: bool,
}

impl IndexDef {
    /// Name used as the index-store key and as the lock-scope item, `table.index`.
    pub fn normalized_name(&self) -> String {
        format!("{}.{}", self.table, self.name)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConstraintAction {
    Restrict,
    Cascade,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConstraintTiming {
    Immediate,
    Deferrable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForeignKeySpec {
    pub name: String,
    pub child_table: String,
    pub child_column: String,
    pub parent_table: String,
    pub parent_column: String,
    pub action: ConstraintAction,
    pub timing: ConstraintTiming,
}

impl ForeignKeySpec {
    /// `table.name`, unique across the schema.
    pub fn normalized_name(&self) -> String {
        format!("{}.{}", self.child_table, self.name)
    }

    /// Index on the child column, created implicitly for every foreign key.
    pub fn child_index_name(&self) -> String {
        format!("{}.fk_{}", self.child_table, self.name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Table {
    pub name: String,
    pub columns: Vec<Column>,
    pub primary_key: Option<IndexDef>,
    /// Declared indices plus implicit foreign-key child indices. Excludes the primary key.
    pub indices: Vec<IndexDef>,
    pub foreign_keys: Vec<ForeignKeySpec>,
}

impl Table {
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    pub fn row_id_index_name(&self) -> String {
        format!("{}.#", self.name)
    }

    /// Primary key first, then the remaining indices in declaration order.
    pub fn all_indices(&self) -> impl Iterator<Item = &IndexDef> {
        self.primary_key.iter().chain(self.indices.iter())
    }

    pub fn index(&self, normalized_name: &str) -> Option<&IndexDef> {
        self.all_indices().find(|i| i.normalized_name() == normalized_name)
    }

    pub fn unique_indices(&self) -> impl Iterator<Item = &IndexDef> {
        self.all_indices().filter(|i| i.unique)
    }

    pub fn not_null_columns(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter().filter(|c| !c.nullable)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schema {
    pub name: String,
    pub version: u32,
    pub tables: BTreeMap<String, Table>,
}

impl Schema {
    pub fn table(&self, name: &str) -> Result<&Table> {
        self.tables
            .get(name)
            .ok_or_else(|| Error::not_found(format!("table {} does not exist", name)))
    }

    pub fn tables(&self) -> impl Iterator<Item = &Table> {
        self.tables.values()
    }

    /// Foreign keys whose parent is `table`.
    pub fn referencing_keys(&self, table: &str) -> Vec<&ForeignKeySpec> {
        self.tables
            .values()
            .flat_map(|t| t.foreign_keys.iter())
            .filter(|fk| fk.parent_table == table)
            .collect()
    }

    /// Every table reachable from `tables` through foreign keys in either direction.
    pub fn connected_tables<'a>(&self, tables: impl IntoIterator<Item = &'a str>) -> BTreeSet<String> {
        let mut seen: BTreeSet<String> = BTreeSet::new();
        let mut queue: VecDeque<String> = tables.into_iter().map(|t| t.to_string()).collect();

        while let Some(name) = queue.pop_front() {
            if !seen.insert(name.clone()) {
                continue;
            }
            if let Some(table) = self.tables.get(&name) {
                for fk in &table.foreign_keys {
                    queue.push_back(fk.parent_table.clone());
                }
            }
            for fk in self.referencing_keys(&name) {
                queue.push_back(fk.child_table.clone());
            }
        }
        seen
    }
}

pub struct TableBuilder {
    name: String,
    columns: Vec<Column>,
    primary_key: Option<Vec<(String, Order)>>,
    indices: Vec<(String, Vec<(String, Order)>, bool)>,
    foreign_keys: Vec<ForeignKeySpec>,
}

impl TableBuilder {
    pub fn new(name: &str) -> Self {
        TableBuilder {
            name: name.to_string(),
            columns: Vec::new(),
            primary_key: None,
            indices: Vec::new(),
            foreign_keys: Vec::new(),
        }
    }

    pub fn add_column(mut self, name: &str, data_type: DataType) -> Self {
        self.columns.push(Column {
            name: name.to_string(),
            data_type,
            nullable: false,
        });
        self
    }

    pub fn add_nullable_column(mut self, name: &str, data_type: DataType) -> Self {
        self.columns.push(Column {
            name: name.to_string(),
            data_type,
            nullable: true,
        });
        self
    }

    pub fn add_primary_key(mut self, columns: &[&str]) -> Self {
        self.primary_key = Some(columns.iter().map(|c| (c.to_string(), Order::Asc)).collect());
        self
    }

    pub fn add_unique(self, name: &str, columns: &[&str]) -> Self {
        let cols: Vec<(&str, Order)> = columns.iter().map(|c| (*c, Order::Asc)).collect();
        self.add_index(name, &cols, true)
    }

    pub fn add_index(mut self, name: &str, columns: &[(&str, Order)], unique: bool) -> Self {
        self.indices.push((
            name.to_string(),
            columns.iter().map(|(c, o)| (c.to_string(), *o)).collect(),
            unique,
        ));
        self
    }

    pub fn add_foreign_key(
        mut self,
        name: &str,
        child_column: &str,
        parent: (&str, &str),
        action: ConstraintAction,
        timing: ConstraintTiming,
    ) -> Self {
        self.foreign_keys.push(ForeignKeySpec {
            name: name.to_string(),
            child_table: self.name.clone(),
            child_column: child_column.to_string(),
            parent_table: parent.0.to_string(),
            parent_column: parent.1.to_string(),
            action,
            timing,
        });
        self
    }

    fn index_def(&self, name: &str, columns: &[(String, Order)], unique: bool) -> Result<IndexDef> {
        let mut nullable = false;
        let mut indexed = Vec::with_capacity(columns.len());
        for (col, order) in columns {
            let column = self.columns.iter().find(|c| &c.name == col).ok_or_else(|| {
                Error::not_found(format!("index {}.{} references unknown column {}", self.name, name, col))
            })?;
            if !column.data_type.is_indexable() {
                return Err(Error::invalid_argument(format!(
                    "column {}.{} of type {:?} cannot be indexed",
                    self.name, col, column.data_type
                )));
            }
            nullable |= column.nullable;
            indexed.push(IndexedColumn { name: col.clone(), order: *order });
        }
        if indexed.is_empty() {
            return Err(Error::invalid_argument(format!("index {}.{} has no columns", self.name, name)));
        }
        Ok(IndexDef {
            name: name.to_string(),
            table: self.name.clone(),
            columns: indexed,
            unique,
            nullable,
        })
    }

    fn build(self) -> Result<Table> {
        let mut names = BTreeSet::new();
        for column in &self.columns {
            if !names.insert(column.name.as_str()) {
                return Err(Error::invalid_argument(format!(
                    "duplicate column {}.{}",
                    self.name, column.name
                )));
            }
        }

        let primary_key = match &self.primary_key {
            Some(cols) => {
                let pk = self.index_def(&format!("pk{}", self.name), cols, true)?;
                if pk.nullable {
                    return Err(Error::invalid_argument(format!(
                        "primary key of {} includes a nullable column",
                        self.name
                    )));
                }
                Some(pk)
            }
            None => None,
        };

        let mut indices = Vec::new();
        for (name, cols, unique) in &self.indices {
            indices.push(self.index_def(name, cols, *unique)?);
        }

        Ok(Table {
            name: self.name,
            columns: self.columns,
            primary_key,
            indices,
            foreign_keys: self.foreign_keys,
        })
    }
}

pub struct SchemaBuilder {
    name: String,
    version: u32,
    tables: Vec<TableBuilder>,
}

impl SchemaBuilder {
    pub fn new(name: &str, version: u32) -> Self {
        SchemaBuilder {
            name: name.to_string(),
            version,
            tables: Vec::new(),
        }
    }

    pub fn table(mut self, table: TableBuilder) -> Self {
        self.tables.push(table);
        self
    }

    pub fn build(self) -> Result<Schema> {
        let mut tables = BTreeMap::new();
        for builder in self.tables {
            let table = builder.build()?;
            if tables.contains_key(&table.name) {
                return Err(Error::invalid_argument(format!("duplicate table {}", table.name)));
            }
            tables.insert(table.name.clone(), table);
        }

        let mut schema = Schema {
            name: self.name,
            version: self.version,
            tables,
        };
        validate_foreign_keys(&mut schema)?;
        Ok(schema)
    }
}

/// Checks every foreign key and adds the implicit child-column index for each.
fn validate_foreign_keys(schema: &mut Schema) -> Result<()> {
    let mut child_indices = Vec::new();

    for table in schema.tables.values() {
        for fk in &table.foreign_keys {
            if fk.action == ConstraintAction::Cascade && fk.timing == ConstraintTiming::Deferrable {
                return Err(Error::invalid_argument(format!(
                    "foreign key {}: CASCADE cannot be DEFERRABLE",
                    fk.normalized_name()
                )));
            }
            let child = table.column(&fk.child_column).ok_or_else(|| {
                Error::not_found(format!(
                    "foreign key {}: unknown child column {}",
                    fk.normalized_name(),
                    fk.child_column
                ))
            })?;
            let parent = schema.tables.get(&fk.parent_table).ok_or_else(|| {
                Error::not_found(format!(
                    "foreign key {}: unknown parent table {}",
                    fk.normalized_name(),
                    fk.parent_table
                ))
            })?;
            if !parent.has_column(&fk.parent_column) {
                return Err(Error::not_found(format!(
                    "foreign key {}: unknown parent column {}.{}",
                    fk.normalized_name(),
                    fk.parent_table,
                    fk.parent_column
                )));
            }
            let parent_is_key = parent
                .unique_indices()
                .any(|i| i.columns.len() == 1 && i.columns[0].name == fk.parent_column);
            if !parent_is_key {
                return Err(Error::new(
                    ErrorKind::InvalidArgument,
                    format!(
                        "foreign key {}: parent column {}.{} is not a primary key or unique",
                        fk.normalized_name(),
                        fk.parent_table,
                        fk.parent_column
                    ),
                ));
            }

            child_indices.push(IndexDef {
                name: format!("fk_{}", fk.name),
                table: table.name.clone(),
                columns: vec![IndexedColumn { name: fk.child_column.clone(), order: Order::Asc }],
                unique: false,
                nullable: child.nullable,
            });
        }
    }

    for index in child_indices {
        if let Some(table) = schema.tables.get_mut(&index.table) {
            table.indices.push(index);
        }
    }
    Ok(())
}
