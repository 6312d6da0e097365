//! Maps table names to their B+Trees. Each table owns one page file,
//! `<data_dir>/<name>.tbl`, and one buffer pool.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};
use parking_lot::RwLock;

use crate::btree::{BPlusTree, TreeOptions};
use crate::buffer_pool::BufferPool;
use crate::error::{Result, StrataError};
use crate::pager::Pager;

const TABLE_EXTENSION: &str = "tbl";

pub struct Catalog {
    data_dir: PathBuf,
    pool_pages: usize,
    options: TreeOptions,
    tables: RwLock<HashMap<String, Arc<BPlusTree>>>,
}

/// Table names become file names, so only ASCII letters, digits and `_` are allowed.
pub fn validate_table_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StrataError::InvalidTableName(name.to_string()))
    }
}

impl Catalog {
    pub fn new(data_dir: impl Into<PathBuf>, pool_pages: usize, options: TreeOptions) -> Self {
        Self {
            data_dir: data_dir.into(),
            pool_pages,
            options,
            tables: RwLock::new(HashMap::new()),
        }
    }

    fn table_path(&self, name: &str) -> PathBuf {
        self.data_dir.join(format!("{name}.{TABLE_EXTENSION}"))
    }

    fn open_tree(&self, name: &str) -> Result<Arc<BPlusTree>> {
        let pager = Pager::open(self.table_path(name))?;
        let pool = Arc::new(BufferPool::new(pager, self.pool_pages));
        Ok(Arc::new(BPlusTree::open(pool, self.options)?))
    }

    /// Creates a table. Fails if the name is taken.
    pub fn create(&self, name: &str) -> Result<Arc<BPlusTree>> {
        validate_table_name(name)?;
        let mut tables = self.tables.write();
        if tables.contains_key(name) {
            return Err(StrataError::TableAlreadyExists(name.to_string()));
        }
        let tree = self.open_tree(name)?;
        tables.insert(name.to_string(), Arc::clone(&tree));
        info!("created table {}", name);
        Ok(tree)
    }

    /// Opens a table, reusing its file if one exists.
    pub fn open_or_create(&self, name: &str) -> Result<Arc<BPlusTree>> {
        validate_table_name(name)?;
        let mut tables = self.tables.write();
        if let Some(tree) = tables.get(name) {
            return Ok(Arc::clone(tree));
        }
        let tree = self.open_tree(name)?;
        tables.insert(name.to_string(), Arc::clone(&tree));
        debug!("opened table {}", name);
        Ok(tree)
    }

    pub fn get(&self, name: &str) -> Result<Arc<BPlusTree>> {
        self.tables
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| StrataError::TableNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tables.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Writes back every dirty page of every table and syncs the files.
    pub fn flush_all(&self) -> Result<()> {
        let trees: Vec<Arc<BPlusTree>> = self.tables.read().values().cloned().collect();
        for tree in trees {
            tree.pool().flush_all()?;
        }
        Ok(())
    }

    /// Copies every table file into `dir`. Pages must have been flushed first.
    pub fn snapshot(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        for name in self.names() {
            let target = dir.join(format!("{name}.{TABLE_EXTENSION}"));
            fs::copy(self.table_path(&name), &target)?;
            fs::File::open(&target)?.sync_all()?;
        }
        Ok(())
    }

    /// Closes every table and replaces the table files with the ones in
    /// `snapshot`, or removes them when there is no snapshot. Tables are
    /// reopened by `open_or_create`.
    pub fn restore(&self, snapshot: Option<&Path>) -> Result<()> {
        let mut tables = self.tables.write();
        tables.clear();

        fs::create_dir_all(&self.data_dir)?;
        for path in table_files(&self.data_dir)? {
            fs::remove_file(&path)?;
        }
        if let Some(dir) = snapshot {
            for source in table_files(dir)? {
                if let Some(file_name) = source.file_name() {
                    fs::copy(&source, self.data_dir.join(file_name))?;
                }
            }
            info!("restored table files from {:?}", dir);
        }
        Ok(())
    }
}

fn table_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == TABLE_EXTENSION) {
            files.push(path);
        }
    }
    Ok(files)
}
