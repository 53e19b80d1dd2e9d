use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use electora_core::{
    build_hierarchy, build_list_union_description, build_permission_tree, build_tree,
    lists_sharing_union, plan_counting_circle_inheritance, validate_union_entries, CountingCircle,
    CountingCircleAssignment, CountingCircleId, DomainOfInfluence, DomainOfInfluenceId,
    DomainOfInfluenceKind, EventOutcome, HierarchyEntry, List, ListId, ListUnion, ListUnionEntry,
    ListUnionId, MasterDataEvent, PermissionEntry,
};
use rusqlite::{params, Connection, DatabaseName};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use ulid::Ulid;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS domain_of_influences (
  id TEXT PRIMARY KEY,
  parent_id TEXT,
  tenant_id TEXT NOT NULL,
  name TEXT NOT NULL,
  short_name TEXT NOT NULL,
  kind TEXT NOT NULL CHECK (kind IN ('ch','ct','bz','mu','sc','ki','an')),
  sort_number INTEGER NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS counting_circles (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  bfs_number TEXT NOT NULL,
  tenant_id TEXT NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS domain_of_influence_counting_circles (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  domain_of_influence_id TEXT NOT NULL REFERENCES domain_of_influences(id),
  counting_circle_id TEXT NOT NULL REFERENCES counting_circles(id),
  inherited INTEGER NOT NULL CHECK (inherited IN (0,1)),
  source_domain_of_influence_id TEXT NOT NULL,
  created_at TEXT NOT NULL,
  UNIQUE(domain_of_influence_id, counting_circle_id, source_domain_of_influence_id)
);

CREATE TABLE IF NOT EXISTS domain_of_influence_hierarchies (
  domain_of_influence_id TEXT PRIMARY KEY,
  tenant_id TEXT NOT NULL,
  ancestor_ids_json TEXT NOT NULL,
  descendant_ids_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS domain_of_influence_permissions (
  tenant_id TEXT NOT NULL,
  domain_of_influence_id TEXT NOT NULL,
  counting_circle_ids_json TEXT NOT NULL,
  is_parent INTEGER NOT NULL CHECK (is_parent IN (0,1)),
  PRIMARY KEY (tenant_id, domain_of_influence_id)
);

CREATE TABLE IF NOT EXISTS lists (
  id TEXT PRIMARY KEY,
  order_number INTEGER NOT NULL,
  short_description TEXT NOT NULL,
  list_union_description TEXT NOT NULL DEFAULT '',
  sub_list_union_description TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS list_unions (
  id TEXT PRIMARY KEY,
  description TEXT NOT NULL,
  main_list_id TEXT REFERENCES lists(id),
  root_id TEXT REFERENCES list_unions(id)
);

CREATE TABLE IF NOT EXISTS list_union_entries (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  list_union_id TEXT NOT NULL REFERENCES list_unions(id),
  list_id TEXT NOT NULL REFERENCES lists(id),
  UNIQUE(list_union_id, list_id)
);

CREATE INDEX IF NOT EXISTS idx_doi_parent ON domain_of_influences(parent_id);
CREATE INDEX IF NOT EXISTS idx_doi_cc_target ON domain_of_influence_counting_circles(domain_of_influence_id);
CREATE INDEX IF NOT EXISTS idx_doi_cc_source ON domain_of_influence_counting_circles(source_domain_of_influence_id);
CREATE INDEX IF NOT EXISTS idx_union_entries_union ON list_union_entries(list_union_id);
CREATE INDEX IF NOT EXISTS idx_union_entries_list ON list_union_entries(list_id);
";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportFileDigest {
    pub path: String,
    pub sha256: String,
    pub records: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportManifest {
    pub schema_version: i64,
    pub exported_at: String,
    pub files: Vec<ExportFileDigest>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportSummary {
    pub imported_rows: usize,
    pub skipped_existing_rows: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

const EXPORT_FILES: [&str; 6] = [
    "domain_of_influences.ndjson",
    "counting_circles.ndjson",
    "counting_circle_assignments.ndjson",
    "lists.ndjson",
    "list_unions.ndjson",
    "list_union_entries.ndjson",
];

impl SqliteStore {
    /// Open a SQLite-backed projection store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;
        if version == 0 {
            self.conn.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            record_schema_version(&self.conn, 1)?;
            version = 1;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Persist one validated administrative unit.
    ///
    /// # Errors
    /// Returns an error when validation fails or the insert fails.
    pub fn create_domain_of_influence(&mut self, node: &DomainOfInfluence) -> Result<()> {
        node.validate().context("domain of influence validation failed")?;
        let tx = self.conn.transaction().context("failed to start transaction")?;
        insert_domain_of_influence(&tx, node)?;
        tx.commit().context("failed to commit domain of influence insert")
    }

    /// Load all administrative units ordered by id.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_domain_of_influences(&self) -> Result<Vec<DomainOfInfluence>> {
        load_domain_of_influences(&self.conn)
    }

    /// Retrieve one administrative unit by id.
    ///
    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn get_domain_of_influence(
        &self,
        id: DomainOfInfluenceId,
    ) -> Result<Option<DomainOfInfluence>> {
        let nodes = load_domain_of_influences(&self.conn)?;
        Ok(nodes.into_iter().find(|node| node.id == id))
    }

    /// Persist one validated counting circle.
    ///
    /// # Errors
    /// Returns an error when validation fails or the insert fails.
    pub fn create_counting_circle(&mut self, circle: &CountingCircle) -> Result<()> {
        circle.validate().context("counting circle validation failed")?;
        let tx = self.conn.transaction().context("failed to start transaction")?;
        insert_counting_circle(&tx, circle)?;
        tx.commit().context("failed to commit counting circle insert")
    }

    /// Load all counting circles ordered by id.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_counting_circles(&self) -> Result<Vec<CountingCircle>> {
        load_counting_circles(&self.conn)
    }

    /// Load all materialized counting-circle assignment rows.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_assignments(&self) -> Result<Vec<CountingCircleAssignment>> {
        load_assignments(&self.conn)
    }

    /// Replace the persisted hierarchy closure with one built from the given
    /// complete node collection. Full replace, never a diff: moving one
    /// subtree changes the descendant lists of every ancestor above it.
    ///
    /// # Errors
    /// Returns an error when persistence fails.
    pub fn rebuild_hierarchy(&mut self, nodes: &[DomainOfInfluence]) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        persist_hierarchy(&tx, &build_hierarchy(nodes))?;
        tx.commit().context("failed to commit hierarchy rebuild")
    }

    /// Rebuild the hierarchy closure from the store's own node collection.
    ///
    /// # Errors
    /// Returns an error when loading or persistence fails.
    pub fn rebuild_hierarchy_all(&mut self) -> Result<()> {
        let nodes = load_domain_of_influences(&self.conn)?;
        self.rebuild_hierarchy(&nodes)
    }

    /// Load all persisted hierarchy closure entries.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_hierarchy_entries(&self) -> Result<Vec<HierarchyEntry>> {
        load_hierarchy_entries(&self.conn)
    }

    /// Replace the persisted permission closure with one built from the given
    /// complete node collection and the stored assignment rows.
    ///
    /// # Errors
    /// Returns an error when loading or persistence fails.
    pub fn rebuild_permission_tree(&mut self, nodes: &[DomainOfInfluence]) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        let assignments = load_assignments(&tx)?;
        persist_permissions(&tx, &build_permission_tree(nodes, &assignments))?;
        tx.commit().context("failed to commit permission rebuild")
    }

    /// Rebuild the permission closure from the store's own node collection.
    ///
    /// # Errors
    /// Returns an error when loading or persistence fails.
    pub fn rebuild_permission_tree_all(&mut self) -> Result<()> {
        let nodes = load_domain_of_influences(&self.conn)?;
        self.rebuild_permission_tree(&nodes)
    }

    /// Load all persisted permission entries, ordered by (tenant, node).
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_permission_entries(&self) -> Result<Vec<PermissionEntry>> {
        load_permission_entries(&self.conn)
    }

    /// Apply one direct assignment change at `origin` across the
    /// orchestrator-supplied scope. `event_at` is stamped on created rows for
    /// audit purposes only; the planning algorithm never reads it.
    ///
    /// # Errors
    /// Returns an error when querying existing rows or applying the diff fails.
    pub fn build_inheritance_for_counting_circles(
        &mut self,
        origin: DomainOfInfluenceId,
        scope_ids: &[DomainOfInfluenceId],
        to_add: &[CountingCircleId],
        to_remove: &[CountingCircleId],
        event_at: OffsetDateTime,
    ) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        apply_inheritance(&tx, origin, scope_ids, to_add, to_remove, event_at)?;
        tx.commit().context("failed to commit inheritance change")
    }

    /// Persist one validated list.
    ///
    /// # Errors
    /// Returns an error when validation fails or the insert fails.
    pub fn create_list(&mut self, list: &List) -> Result<()> {
        list.validate().context("list validation failed")?;
        let tx = self.conn.transaction().context("failed to start transaction")?;
        insert_list(&tx, list)?;
        tx.commit().context("failed to commit list insert")
    }

    /// Load all lists ordered by id.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_lists(&self) -> Result<Vec<List>> {
        load_lists(&self.conn)
    }

    /// Retrieve one list by id.
    ///
    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn get_list(&self, id: ListId) -> Result<Option<List>> {
        let lists = load_lists(&self.conn)?;
        Ok(lists.into_iter().find(|list| list.id == id))
    }

    /// Persist one validated list union. A sub-union's root must already
    /// exist and must itself be a root union. A freshly created union has no
    /// members yet, so its main list pointer must start out unset.
    ///
    /// # Errors
    /// Returns an error when validation fails, the root is missing or nested,
    /// a main list is set, or the insert fails.
    pub fn create_list_union(&mut self, union: &ListUnion) -> Result<()> {
        union.validate().context("list union validation failed")?;
        if let Some(main_list_id) = union.main_list_id {
            return Err(anyhow!(
                "new list union {} has no members; main list {main_list_id} must be set after entries exist",
                union.id
            ));
        }
        let tx = self.conn.transaction().context("failed to start transaction")?;
        if let Some(root_id) = union.root_id {
            let unions = load_list_unions(&tx)?;
            let root = unions
                .iter()
                .find(|candidate| candidate.id == root_id)
                .ok_or_else(|| anyhow!("root list union {root_id} not found"))?;
            if root.root_id.is_some() {
                return Err(anyhow!("list union {root_id} is itself a sub union; only one nesting level is allowed"));
            }
        }
        insert_list_union(&tx, union)?;
        tx.commit().context("failed to commit list union insert")
    }

    /// Load all list unions ordered by id.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_list_unions(&self) -> Result<Vec<ListUnion>> {
        load_list_unions(&self.conn)
    }

    /// Ordered member list ids of one union.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_union_member_ids(&self, union_id: ListUnionId) -> Result<Vec<ListId>> {
        let entries = load_union_entries(&self.conn)?;
        Ok(entries
            .into_iter()
            .filter(|entry| entry.list_union_id == union_id)
            .map(|entry| entry.list_id)
            .collect())
    }

    /// Recompute and persist the two derived description fields of the given
    /// lists. Only those two columns are written, so no other relation is
    /// touched by the bulk update.
    ///
    /// # Errors
    /// Returns an error when loading fails or a union member has no loaded
    /// short description (an invariant violation).
    pub fn update_list_union_descriptions(&mut self, list_ids: &[ListId]) -> Result<usize> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        let targets: BTreeSet<ListId> = list_ids.iter().copied().collect();
        let updated = update_descriptions_for(&tx, &targets)?;
        tx.commit().context("failed to commit description update")?;
        Ok(updated)
    }

    /// Recompute descriptions for every list sharing a union with the given
    /// list. Used when the list's own short description changed, since other
    /// lists' derived fields quote it.
    ///
    /// # Errors
    /// Returns an error when loading or recomputation fails.
    pub fn update_list_union_descriptions_referencing_list(
        &mut self,
        list_id: ListId,
    ) -> Result<usize> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        let entries = load_union_entries(&tx)?;
        let targets = lists_sharing_union(list_id, &entries);
        let updated = update_descriptions_for(&tx, &targets)?;
        tx.commit().context("failed to commit description update")?;
        Ok(updated)
    }

    /// Replace a union's member entries and repair every derived view that
    /// depends on them.
    ///
    /// # Errors
    /// Returns an error when a referenced list is missing, the member set
    /// violates sub-union containment, or persistence fails.
    pub fn replace_list_union_entries(
        &mut self,
        union_id: ListUnionId,
        list_ids: &[ListId],
    ) -> Result<EventOutcome> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        let outcome = replace_union_entries(&tx, union_id, list_ids)?;
        tx.commit().context("failed to commit union entry replacement")?;
        Ok(outcome)
    }

    /// Process one domain event in arrival order: mutate primary records,
    /// then run the affected derived-state builders in dependency order, all
    /// inside a single transaction. Returns `Skipped` instead of failing when
    /// the referenced entity was deleted by an earlier event (a legitimate
    /// race on the stream); every other failure propagates.
    ///
    /// # Errors
    /// Returns an error on storage failures and on invariant violations
    /// (cycles, membership violations, missing referenced master data).
    pub fn apply_event(&mut self, event: &MasterDataEvent) -> Result<EventOutcome> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        let outcome = apply_event_tx(&tx, event)
            .with_context(|| format!("failed to process event {}", event.kind()))?;
        tx.commit().context("failed to commit event transaction")?;
        Ok(outcome)
    }

    /// Export all primary master data as deterministic NDJSON plus manifest.
    /// Derived tables are not exported; importers rebuild them.
    ///
    /// # Errors
    /// Returns an error when export files cannot be created, written, or serialized.
    pub fn export_snapshot(&self, out_dir: &Path) -> Result<ExportManifest> {
        fs::create_dir_all(out_dir)
            .with_context(|| format!("failed to create export directory {}", out_dir.display()))?;

        let digests = [
            write_ndjson_file(
                &out_dir.join(EXPORT_FILES[0]),
                &load_domain_of_influences(&self.conn)?,
            )?,
            write_ndjson_file(&out_dir.join(EXPORT_FILES[1]), &load_counting_circles(&self.conn)?)?,
            write_ndjson_file(&out_dir.join(EXPORT_FILES[2]), &load_assignments(&self.conn)?)?,
            write_ndjson_file(&out_dir.join(EXPORT_FILES[3]), &load_lists(&self.conn)?)?,
            write_ndjson_file(&out_dir.join(EXPORT_FILES[4]), &load_list_unions(&self.conn)?)?,
            write_ndjson_file(&out_dir.join(EXPORT_FILES[5]), &load_union_entries(&self.conn)?)?,
        ];

        let manifest = ExportManifest {
            schema_version: LATEST_SCHEMA_VERSION,
            exported_at: now_rfc3339()?,
            files: EXPORT_FILES
                .iter()
                .zip(digests)
                .map(|(path, (sha256, records))| ExportFileDigest {
                    path: (*path).to_string(),
                    sha256,
                    records,
                })
                .collect(),
        };

        let manifest_path = out_dir.join("manifest.json");
        let manifest_json =
            serde_json::to_vec_pretty(&manifest).context("failed to serialize export manifest")?;
        fs::write(&manifest_path, manifest_json).with_context(|| {
            format!("failed to write export manifest {}", manifest_path.display())
        })?;

        Ok(manifest)
    }

    /// Import an exported snapshot directory, then rebuild every derived view.
    ///
    /// # Errors
    /// Returns an error when the manifest does not verify, a row conflicts
    /// while `skip_existing` is false, or any write fails.
    pub fn import_snapshot(&mut self, in_dir: &Path, skip_existing: bool) -> Result<ImportSummary> {
        self.migrate()?;
        let manifest = read_export_manifest(&in_dir.join("manifest.json"))?;
        validate_import_manifest(in_dir, &manifest)?;

        let mut summary = ImportSummary::default();
        let tx = self.conn.transaction().context("failed to start import transaction")?;

        for node in read_ndjson_file::<DomainOfInfluence>(&in_dir.join(EXPORT_FILES[0]))? {
            import_row(&mut summary, skip_existing, exists_in(&tx, "domain_of_influences", &node.id.to_string())?, || {
                insert_domain_of_influence(&tx, &node)
            })?;
        }
        for circle in read_ndjson_file::<CountingCircle>(&in_dir.join(EXPORT_FILES[1]))? {
            import_row(&mut summary, skip_existing, exists_in(&tx, "counting_circles", &circle.id.to_string())?, || {
                insert_counting_circle(&tx, &circle)
            })?;
        }
        for list in read_ndjson_file::<List>(&in_dir.join(EXPORT_FILES[3]))? {
            import_row(&mut summary, skip_existing, exists_in(&tx, "lists", &list.id.to_string())?, || {
                insert_list(&tx, &list)
            })?;
        }
        for union in read_ndjson_file::<ListUnion>(&in_dir.join(EXPORT_FILES[4]))? {
            import_row(&mut summary, skip_existing, exists_in(&tx, "list_unions", &union.id.to_string())?, || {
                insert_list_union(&tx, &union)
            })?;
        }
        for entry in read_ndjson_file::<ListUnionEntry>(&in_dir.join(EXPORT_FILES[5]))? {
            let present = union_entry_exists(&tx, entry.list_union_id, entry.list_id)?;
            import_row(&mut summary, skip_existing, present, || {
                insert_union_entry(&tx, entry.list_union_id, entry.list_id)
            })?;
        }
        let now = now_rfc3339()?;
        for row in read_ndjson_file::<CountingCircleAssignment>(&in_dir.join(EXPORT_FILES[2]))? {
            let present = assignment_exists(&tx, &row)?;
            import_row(&mut summary, skip_existing, present, || {
                insert_assignment(&tx, &row, &now)
            })?;
        }

        let nodes = load_domain_of_influences(&tx)?;
        persist_hierarchy(&tx, &build_hierarchy(&nodes))?;
        let assignments = load_assignments(&tx)?;
        persist_permissions(&tx, &build_permission_tree(&nodes, &assignments))?;
        let all_lists: BTreeSet<ListId> = load_lists(&tx)?.iter().map(|list| list.id).collect();
        update_descriptions_for(&tx, &all_lists)?;

        tx.commit().context("failed to commit import transaction")?;
        Ok(summary)
    }

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Restore this database from a `SQLite` backup file, then migrate to latest.
    ///
    /// # Errors
    /// Returns an error when the backup file is missing, restore fails, or migrations fail.
    pub fn restore_database(&mut self, in_file: &Path) -> Result<()> {
        if !in_file.exists() {
            return Err(anyhow!("backup file does not exist: {}", in_file.display()));
        }

        self.conn
            .restore(DatabaseName::Main, in_file, None::<fn(rusqlite::backup::Progress)>)
            .with_context(|| {
                format!("failed to restore sqlite backup from {}", in_file.display())
            })?;

        self.migrate()?;
        Ok(())
    }

    /// Run quick-check, foreign-key-check, and schema status health probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status,
        })
    }
}

fn import_row(
    summary: &mut ImportSummary,
    skip_existing: bool,
    present: bool,
    insert: impl FnOnce() -> Result<()>,
) -> Result<()> {
    if present {
        if skip_existing {
            summary.skipped_existing_rows += 1;
            return Ok(());
        }
        return Err(anyhow!("row already exists and --skip-existing is disabled"));
    }
    insert()?;
    summary.imported_rows += 1;
    Ok(())
}

fn apply_event_tx(conn: &Connection, event: &MasterDataEvent) -> Result<EventOutcome> {
    match event {
        MasterDataEvent::DomainOfInfluenceCreated { domain_of_influence } => {
            domain_of_influence.validate().context("domain of influence validation failed")?;
            insert_domain_of_influence(conn, domain_of_influence)?;
            rebuild_closures(conn)
        }
        MasterDataEvent::DomainOfInfluenceUpdated { domain_of_influence } => {
            let nodes = load_domain_of_influences(conn)?;
            let tree = build_tree(&nodes);
            if tree.get(domain_of_influence.id).is_none() {
                return Ok(skipped("domain of influence", &domain_of_influence.id.to_string()));
            }
            domain_of_influence.validate().context("domain of influence validation failed")?;
            // An update may carry a new parent; it is bound by the same
            // cycle rule as an explicit move.
            if let Some(parent_id) = domain_of_influence.parent_id {
                if parent_id == domain_of_influence.id
                    || tree.descendant_ids(domain_of_influence.id).contains(&parent_id)
                {
                    return Err(anyhow!(
                        "re-parenting domain of influence {} under {parent_id} would create a cycle",
                        domain_of_influence.id
                    ));
                }
            }
            update_domain_of_influence_row(conn, domain_of_influence)?;
            rebuild_closures(conn)
        }
        MasterDataEvent::DomainOfInfluenceMoved { id, new_parent_id } => {
            let nodes = load_domain_of_influences(conn)?;
            let tree = build_tree(&nodes);
            if tree.get(*id).is_none() {
                return Ok(skipped("domain of influence", &id.to_string()));
            }
            if let Some(parent_id) = new_parent_id {
                if *parent_id == *id || tree.descendant_ids(*id).contains(parent_id) {
                    return Err(anyhow!(
                        "moving domain of influence {id} under {parent_id} would create a cycle"
                    ));
                }
            }
            set_domain_of_influence_parent(conn, *id, *new_parent_id)?;
            rebuild_closures(conn)
        }
        MasterDataEvent::DomainOfInfluenceDeleted { id } => delete_domain_of_influence(conn, *id),
        MasterDataEvent::CountingCircleCreated { counting_circle } => {
            counting_circle.validate().context("counting circle validation failed")?;
            insert_counting_circle(conn, counting_circle)?;
            Ok(EventOutcome::Applied)
        }
        MasterDataEvent::CountingCircleUpdated { counting_circle } => {
            if !exists_in(conn, "counting_circles", &counting_circle.id.to_string())? {
                return Ok(skipped("counting circle", &counting_circle.id.to_string()));
            }
            counting_circle.validate().context("counting circle validation failed")?;
            update_counting_circle_row(conn, counting_circle)?;
            Ok(EventOutcome::Applied)
        }
        MasterDataEvent::CountingCircleDeleted { id } => {
            if !exists_in(conn, "counting_circles", &id.to_string())? {
                return Ok(skipped("counting circle", &id.to_string()));
            }
            conn.execute(
                "DELETE FROM domain_of_influence_counting_circles WHERE counting_circle_id = ?1",
                params![id.to_string()],
            )
            .context("failed to delete assignment rows for counting circle")?;
            conn.execute("DELETE FROM counting_circles WHERE id = ?1", params![id.to_string()])
                .context("failed to delete counting circle")?;
            let nodes = load_domain_of_influences(conn)?;
            let assignments = load_assignments(conn)?;
            persist_permissions(conn, &build_permission_tree(&nodes, &assignments))
                .map(|()| EventOutcome::Applied)
        }
        MasterDataEvent::CountingCirclesReassigned { id, counting_circle_ids, event_at } => {
            reassign_counting_circles(conn, *id, counting_circle_ids, *event_at)
        }
        MasterDataEvent::ListCreated { list } => {
            list.validate().context("list validation failed")?;
            insert_list(conn, list)?;
            Ok(EventOutcome::Applied)
        }
        MasterDataEvent::ListUpdated { list } => {
            if !exists_in(conn, "lists", &list.id.to_string())? {
                return Ok(skipped("list", &list.id.to_string()));
            }
            list.validate().context("list validation failed")?;
            conn.execute(
                "UPDATE lists SET order_number = ?2, short_description = ?3 WHERE id = ?1",
                params![list.id.to_string(), i64::from(list.order_number), list.short_description],
            )
            .context("failed to update list")?;
            let entries = load_union_entries(conn)?;
            let targets = lists_sharing_union(list.id, &entries);
            update_descriptions_for(conn, &targets)?;
            Ok(EventOutcome::Applied)
        }
        MasterDataEvent::ListDeleted { id } => {
            if !exists_in(conn, "lists", &id.to_string())? {
                return Ok(skipped("list", &id.to_string()));
            }
            // Capture co-members before the mutation; their derived fields
            // quote the list being removed.
            let entries = load_union_entries(conn)?;
            let mut affected = lists_sharing_union(*id, &entries);
            affected.remove(id);
            conn.execute(
                "UPDATE list_unions SET main_list_id = NULL WHERE main_list_id = ?1",
                params![id.to_string()],
            )
            .context("failed to clear main list pointers")?;
            conn.execute("DELETE FROM list_union_entries WHERE list_id = ?1", params![id.to_string()])
                .context("failed to delete union entries for list")?;
            conn.execute("DELETE FROM lists WHERE id = ?1", params![id.to_string()])
                .context("failed to delete list")?;
            update_descriptions_for(conn, &affected)?;
            Ok(EventOutcome::Applied)
        }
        MasterDataEvent::ListUnionCreated { list_union } => {
            list_union.validate().context("list union validation failed")?;
            if let Some(main_list_id) = list_union.main_list_id {
                return Err(anyhow!(
                    "new list union {} has no members; main list {main_list_id} must be set after entries exist",
                    list_union.id
                ));
            }
            if let Some(root_id) = list_union.root_id {
                let unions = load_list_unions(conn)?;
                let root = unions
                    .iter()
                    .find(|candidate| candidate.id == root_id)
                    .ok_or_else(|| anyhow!("root list union {root_id} not found"))?;
                if root.root_id.is_some() {
                    return Err(anyhow!(
                        "list union {root_id} is itself a sub union; only one nesting level is allowed"
                    ));
                }
            }
            insert_list_union(conn, list_union)?;
            Ok(EventOutcome::Applied)
        }
        MasterDataEvent::ListUnionUpdated { list_union } => {
            if !exists_in(conn, "list_unions", &list_union.id.to_string())? {
                return Ok(skipped("list union", &list_union.id.to_string()));
            }
            list_union.validate().context("list union validation failed")?;
            conn.execute(
                "UPDATE list_unions SET description = ?2 WHERE id = ?1",
                params![list_union.id.to_string(), list_union.description],
            )
            .context("failed to update list union")?;
            Ok(EventOutcome::Applied)
        }
        MasterDataEvent::ListUnionDeleted { id } => delete_list_union(conn, *id),
        MasterDataEvent::ListUnionEntriesReplaced { id, list_ids } => {
            replace_union_entries(conn, *id, list_ids)
        }
        MasterDataEvent::ListUnionMainListChanged { id, main_list_id } => {
            let Some(union) = find_list_union(conn, *id)? else {
                return Ok(skipped("list union", &id.to_string()));
            };
            let members = members_of_union(conn, union.id)?;
            if let Some(main_list_id) = main_list_id {
                if !members.contains(main_list_id) {
                    return Err(anyhow!(
                        "list {main_list_id} is not a member of union {id} and cannot be its main list"
                    ));
                }
            }
            conn.execute(
                "UPDATE list_unions SET main_list_id = ?2 WHERE id = ?1",
                params![id.to_string(), main_list_id.map(|value| value.to_string())],
            )
            .context("failed to update main list pointer")?;
            let targets: BTreeSet<ListId> = members.into_iter().collect();
            update_descriptions_for(conn, &targets)?;
            Ok(EventOutcome::Applied)
        }
    }
}

fn skipped(entity: &str, id: &str) -> EventOutcome {
    EventOutcome::Skipped { reason: format!("{entity} {id} no longer exists") }
}

/// Rebuild the tree-derived views as one bundle: hierarchy closure first,
/// permission closure second, both full-replace from the post-mutation state.
fn rebuild_closures(conn: &Connection) -> Result<EventOutcome> {
    let nodes = load_domain_of_influences(conn)?;
    persist_hierarchy(conn, &build_hierarchy(&nodes))?;
    let assignments = load_assignments(conn)?;
    persist_permissions(conn, &build_permission_tree(&nodes, &assignments))?;
    Ok(EventOutcome::Applied)
}

fn reassign_counting_circles(
    conn: &Connection,
    id: DomainOfInfluenceId,
    counting_circle_ids: &[CountingCircleId],
    event_at: OffsetDateTime,
) -> Result<EventOutcome> {
    let nodes = load_domain_of_influences(conn)?;
    let tree = build_tree(&nodes);
    if tree.get(id).is_none() {
        return Ok(skipped("domain of influence", &id.to_string()));
    }

    for circle_id in counting_circle_ids {
        if !exists_in(conn, "counting_circles", &circle_id.to_string())? {
            return Err(anyhow!("counting circle {circle_id} not found"));
        }
    }

    let desired: BTreeSet<CountingCircleId> = counting_circle_ids.iter().copied().collect();
    let current: BTreeSet<CountingCircleId> = load_assignments(conn)?
        .into_iter()
        .filter(|row| {
            row.domain_of_influence_id == id && row.source_domain_of_influence_id == id
        })
        .map(|row| row.counting_circle_id)
        .collect();

    let to_add: Vec<CountingCircleId> = desired.difference(&current).copied().collect();
    let to_remove: Vec<CountingCircleId> = current.difference(&desired).copied().collect();
    if to_add.is_empty() && to_remove.is_empty() {
        return Ok(EventOutcome::Applied);
    }

    let mut scope = vec![id];
    scope.extend(tree.descendant_ids(id));
    apply_inheritance(conn, id, &scope, &to_add, &to_remove, event_at)?;

    let assignments = load_assignments(conn)?;
    persist_permissions(conn, &build_permission_tree(&nodes, &assignments))?;
    Ok(EventOutcome::Applied)
}

fn delete_domain_of_influence(conn: &Connection, id: DomainOfInfluenceId) -> Result<EventOutcome> {
    let nodes = load_domain_of_influences(conn)?;
    let tree = build_tree(&nodes);
    if tree.get(id).is_none() {
        return Ok(skipped("domain of influence", &id.to_string()));
    }

    // Deletion cascades to the whole subtree. Each deleted node first
    // retracts the assignments it is the provenance of, across its full
    // hierarchical line, so no stale inherited row survives the reshape.
    let mut subtree = vec![id];
    subtree.extend(tree.descendant_ids(id));
    let now = OffsetDateTime::now_utc();

    for node_id in &subtree {
        let direct: Vec<CountingCircleId> = load_assignments(conn)?
            .into_iter()
            .filter(|row| {
                row.domain_of_influence_id == *node_id
                    && row.source_domain_of_influence_id == *node_id
            })
            .map(|row| row.counting_circle_id)
            .collect();
        if direct.is_empty() {
            continue;
        }
        let mut scope = tree.ancestor_ids(*node_id);
        scope.push(*node_id);
        scope.extend(tree.descendant_ids(*node_id));
        apply_inheritance(conn, *node_id, &scope, &[], &direct, now)?;
    }

    for node_id in &subtree {
        conn.execute(
            "DELETE FROM domain_of_influence_counting_circles WHERE domain_of_influence_id = ?1",
            params![node_id.to_string()],
        )
        .context("failed to delete assignment rows for deleted node")?;
    }

    // Children before parents, so the forest never holds a deleted parent.
    for node_id in subtree.iter().rev() {
        conn.execute("DELETE FROM domain_of_influences WHERE id = ?1", params![node_id.to_string()])
            .context("failed to delete domain of influence")?;
    }

    rebuild_closures(conn)
}

fn delete_list_union(conn: &Connection, id: ListUnionId) -> Result<EventOutcome> {
    let Some(union) = find_list_union(conn, id)? else {
        return Ok(skipped("list union", &id.to_string()));
    };

    // The old members' derived fields must be recomputed, so capture them
    // before the deleting mutation is applied.
    let mut affected: BTreeSet<ListId> = members_of_union(conn, union.id)?.into_iter().collect();

    if union.root_id.is_none() {
        let subs: Vec<ListUnionId> = load_list_unions(conn)?
            .into_iter()
            .filter(|candidate| candidate.root_id == Some(union.id))
            .map(|candidate| candidate.id)
            .collect();
        for sub_id in subs {
            affected.extend(members_of_union(conn, sub_id)?);
            conn.execute(
                "DELETE FROM list_union_entries WHERE list_union_id = ?1",
                params![sub_id.to_string()],
            )
            .context("failed to delete sub union entries")?;
            conn.execute("DELETE FROM list_unions WHERE id = ?1", params![sub_id.to_string()])
                .context("failed to delete sub union")?;
        }
    }

    conn.execute("DELETE FROM list_union_entries WHERE list_union_id = ?1", params![id.to_string()])
        .context("failed to delete union entries")?;
    conn.execute("DELETE FROM list_unions WHERE id = ?1", params![id.to_string()])
        .context("failed to delete list union")?;

    update_descriptions_for(conn, &affected)?;
    Ok(EventOutcome::Applied)
}

fn replace_union_entries(
    conn: &Connection,
    union_id: ListUnionId,
    list_ids: &[ListId],
) -> Result<EventOutcome> {
    let Some(union) = find_list_union(conn, union_id)? else {
        return Ok(skipped("list union", &union_id.to_string()));
    };

    for list_id in list_ids {
        if !exists_in(conn, "lists", &list_id.to_string())? {
            return Err(anyhow!("list {list_id} not found"));
        }
    }

    let root_members: Option<BTreeSet<ListId>> = match union.root_id {
        Some(root_id) => Some(members_of_union(conn, root_id)?.into_iter().collect()),
        None => None,
    };
    validate_union_entries(&union, list_ids, root_members.as_ref())?;

    let mut affected: BTreeSet<ListId> =
        members_of_union(conn, union_id)?.into_iter().collect();
    affected.extend(list_ids.iter().copied());

    conn.execute(
        "DELETE FROM list_union_entries WHERE list_union_id = ?1",
        params![union_id.to_string()],
    )
    .context("failed to clear union entries")?;
    for list_id in list_ids {
        insert_union_entry(conn, union_id, *list_id)?;
    }

    let new_members: BTreeSet<ListId> = list_ids.iter().copied().collect();
    if let Some(main_list_id) = union.main_list_id {
        if !new_members.contains(&main_list_id) {
            conn.execute(
                "UPDATE list_unions SET main_list_id = NULL WHERE id = ?1",
                params![union_id.to_string()],
            )
            .context("failed to clear stale main list pointer")?;
        }
    }

    // Shrinking a root union trims its sub-unions to the remaining members.
    if union.root_id.is_none() {
        let subs: Vec<ListUnion> = load_list_unions(conn)?
            .into_iter()
            .filter(|candidate| candidate.root_id == Some(union_id))
            .collect();
        for sub in subs {
            let sub_members = members_of_union(conn, sub.id)?;
            for member in &sub_members {
                if !new_members.contains(member) {
                    affected.extend(sub_members.iter().copied());
                    conn.execute(
                        "DELETE FROM list_union_entries WHERE list_union_id = ?1 AND list_id = ?2",
                        params![sub.id.to_string(), member.to_string()],
                    )
                    .context("failed to trim sub union entry")?;
                    if sub.main_list_id == Some(*member) {
                        conn.execute(
                            "UPDATE list_unions SET main_list_id = NULL WHERE id = ?1",
                            params![sub.id.to_string()],
                        )
                        .context("failed to clear trimmed sub union main list")?;
                    }
                }
            }
        }
    }

    update_descriptions_for(conn, &affected)?;
    Ok(EventOutcome::Applied)
}

fn apply_inheritance(
    conn: &Connection,
    origin: DomainOfInfluenceId,
    scope_ids: &[DomainOfInfluenceId],
    to_add: &[CountingCircleId],
    to_remove: &[CountingCircleId],
    event_at: OffsetDateTime,
) -> Result<()> {
    let existing: Vec<CountingCircleAssignment> = load_assignments(conn)?
        .into_iter()
        .filter(|row| row.source_domain_of_influence_id == origin)
        .collect();

    let diff = plan_counting_circle_inheritance(origin, scope_ids, &existing, to_add, to_remove);
    let stamp = rfc3339(event_at)?;

    for row in &diff.creates {
        insert_assignment(conn, row, &stamp)?;
    }
    for row in &diff.deletes {
        conn.execute(
            "DELETE FROM domain_of_influence_counting_circles
             WHERE domain_of_influence_id = ?1 AND counting_circle_id = ?2
               AND source_domain_of_influence_id = ?3",
            params![
                row.domain_of_influence_id.to_string(),
                row.counting_circle_id.to_string(),
                row.source_domain_of_influence_id.to_string(),
            ],
        )
        .context("failed to delete assignment row")?;
    }

    Ok(())
}

fn update_descriptions_for(conn: &Connection, targets: &BTreeSet<ListId>) -> Result<usize> {
    if targets.is_empty() {
        return Ok(0);
    }

    let unions = load_list_unions(conn)?;
    let entries = load_union_entries(conn)?;
    let mut members_by_union: BTreeMap<ListUnionId, Vec<ListId>> = BTreeMap::new();
    for entry in &entries {
        members_by_union.entry(entry.list_union_id).or_default().push(entry.list_id);
    }

    let short_descriptions: BTreeMap<ListId, String> = load_lists(conn)?
        .into_iter()
        .map(|list| (list.id, list.short_description))
        .collect();

    let mut updated = 0_usize;
    for target in targets {
        if !short_descriptions.contains_key(target) {
            // The list was deleted by this same event; nothing to recompute.
            continue;
        }

        let mut root_members: Option<&Vec<ListId>> = None;
        let mut sub_members: Option<&Vec<ListId>> = None;
        for union in &unions {
            let Some(members) = members_by_union.get(&union.id) else {
                continue;
            };
            if !members.contains(target) {
                continue;
            }
            if union.root_id.is_none() {
                if root_members.is_none() {
                    root_members = Some(members);
                }
            } else if sub_members.is_none() {
                sub_members = Some(members);
            }
        }

        let union_description = match root_members {
            Some(members) => build_list_union_description(*target, members, &short_descriptions)?,
            None => String::new(),
        };
        let sub_union_description = match sub_members {
            Some(members) => build_list_union_description(*target, members, &short_descriptions)?,
            None => String::new(),
        };

        conn.execute(
            "UPDATE lists SET list_union_description = ?2, sub_list_union_description = ?3
             WHERE id = ?1",
            params![target.to_string(), union_description, sub_union_description],
        )
        .context("failed to update derived list descriptions")?;
        updated += 1;
    }

    Ok(updated)
}

fn insert_domain_of_influence(conn: &Connection, node: &DomainOfInfluence) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT INTO domain_of_influences(
            id, parent_id, tenant_id, name, short_name, kind, sort_number, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
        params![
            node.id.to_string(),
            node.parent_id.map(|value| value.to_string()),
            node.tenant_id,
            node.name,
            node.short_name,
            node.kind.as_str(),
            i64::from(node.sort_number),
            now,
        ],
    )
    .context("failed to insert domain of influence")?;
    Ok(())
}

fn update_domain_of_influence_row(conn: &Connection, node: &DomainOfInfluence) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "UPDATE domain_of_influences
         SET parent_id = ?2, tenant_id = ?3, name = ?4, short_name = ?5, kind = ?6,
             sort_number = ?7, updated_at = ?8
         WHERE id = ?1",
        params![
            node.id.to_string(),
            node.parent_id.map(|value| value.to_string()),
            node.tenant_id,
            node.name,
            node.short_name,
            node.kind.as_str(),
            i64::from(node.sort_number),
            now,
        ],
    )
    .context("failed to update domain of influence")?;
    Ok(())
}

fn set_domain_of_influence_parent(
    conn: &Connection,
    id: DomainOfInfluenceId,
    parent_id: Option<DomainOfInfluenceId>,
) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "UPDATE domain_of_influences SET parent_id = ?2, updated_at = ?3 WHERE id = ?1",
        params![id.to_string(), parent_id.map(|value| value.to_string()), now],
    )
    .context("failed to update parent pointer")?;
    Ok(())
}

fn insert_counting_circle(conn: &Connection, circle: &CountingCircle) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT INTO counting_circles(id, name, bfs_number, tenant_id, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
        params![circle.id.to_string(), circle.name, circle.bfs_number, circle.tenant_id, now],
    )
    .context("failed to insert counting circle")?;
    Ok(())
}

fn update_counting_circle_row(conn: &Connection, circle: &CountingCircle) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "UPDATE counting_circles SET name = ?2, bfs_number = ?3, tenant_id = ?4, updated_at = ?5
         WHERE id = ?1",
        params![circle.id.to_string(), circle.name, circle.bfs_number, circle.tenant_id, now],
    )
    .context("failed to update counting circle")?;
    Ok(())
}

fn insert_assignment(conn: &Connection, row: &CountingCircleAssignment, stamp: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO domain_of_influence_counting_circles(
            domain_of_influence_id, counting_circle_id, inherited,
            source_domain_of_influence_id, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            row.domain_of_influence_id.to_string(),
            row.counting_circle_id.to_string(),
            row.inherited,
            row.source_domain_of_influence_id.to_string(),
            stamp,
        ],
    )
    .context("failed to insert assignment row")?;
    Ok(())
}

fn insert_list(conn: &Connection, list: &List) -> Result<()> {
    conn.execute(
        "INSERT INTO lists(
            id, order_number, short_description, list_union_description, sub_list_union_description
        ) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            list.id.to_string(),
            i64::from(list.order_number),
            list.short_description,
            list.list_union_description,
            list.sub_list_union_description,
        ],
    )
    .context("failed to insert list")?;
    Ok(())
}

fn insert_list_union(conn: &Connection, union: &ListUnion) -> Result<()> {
    conn.execute(
        "INSERT INTO list_unions(id, description, main_list_id, root_id) VALUES (?1, ?2, ?3, ?4)",
        params![
            union.id.to_string(),
            union.description,
            union.main_list_id.map(|value| value.to_string()),
            union.root_id.map(|value| value.to_string()),
        ],
    )
    .context("failed to insert list union")?;
    Ok(())
}

fn insert_union_entry(conn: &Connection, union_id: ListUnionId, list_id: ListId) -> Result<()> {
    conn.execute(
        "INSERT INTO list_union_entries(list_union_id, list_id) VALUES (?1, ?2)",
        params![union_id.to_string(), list_id.to_string()],
    )
    .context("failed to insert union entry")?;
    Ok(())
}

fn persist_hierarchy(conn: &Connection, entries: &[HierarchyEntry]) -> Result<()> {
    conn.execute("DELETE FROM domain_of_influence_hierarchies", [])
        .context("failed to clear hierarchy closure")?;
    for entry in entries {
        conn.execute(
            "INSERT INTO domain_of_influence_hierarchies(
                domain_of_influence_id, tenant_id, ancestor_ids_json, descendant_ids_json
            ) VALUES (?1, ?2, ?3, ?4)",
            params![
                entry.domain_of_influence_id.to_string(),
                entry.tenant_id,
                serde_json::to_string(&entry.ancestor_ids)
                    .context("failed to serialize ancestor ids")?,
                serde_json::to_string(&entry.descendant_ids)
                    .context("failed to serialize descendant ids")?,
            ],
        )
        .context("failed to insert hierarchy entry")?;
    }
    Ok(())
}

fn persist_permissions(conn: &Connection, entries: &[PermissionEntry]) -> Result<()> {
    conn.execute("DELETE FROM domain_of_influence_permissions", [])
        .context("failed to clear permission closure")?;
    for entry in entries {
        conn.execute(
            "INSERT INTO domain_of_influence_permissions(
                tenant_id, domain_of_influence_id, counting_circle_ids_json, is_parent
            ) VALUES (?1, ?2, ?3, ?4)",
            params![
                entry.tenant_id,
                entry.domain_of_influence_id.to_string(),
                serde_json::to_string(&entry.counting_circle_ids)
                    .context("failed to serialize counting circle ids")?,
                entry.is_parent,
            ],
        )
        .context("failed to insert permission entry")?;
    }
    Ok(())
}

fn load_domain_of_influences(conn: &Connection) -> Result<Vec<DomainOfInfluence>> {
    let mut stmt = conn.prepare(
        "SELECT id, parent_id, tenant_id, name, short_name, kind, sort_number
         FROM domain_of_influences ORDER BY id ASC",
    )?;
    let mut rows = stmt.query([])?;
    let mut nodes = Vec::new();
    while let Some(row) = rows.next()? {
        let id_raw: String = row.get(0)?;
        let parent_raw: Option<String> = row.get(1)?;
        let kind_raw: String = row.get(5)?;
        nodes.push(DomainOfInfluence {
            id: DomainOfInfluenceId(parse_ulid(&id_raw)?),
            parent_id: match parent_raw {
                Some(raw) => Some(DomainOfInfluenceId(parse_ulid(&raw)?)),
                None => None,
            },
            tenant_id: row.get(2)?,
            name: row.get(3)?,
            short_name: row.get(4)?,
            kind: DomainOfInfluenceKind::parse(&kind_raw)
                .ok_or_else(|| anyhow!("unknown domain of influence kind: {kind_raw}"))?,
            sort_number: u32::try_from(row.get::<_, i64>(6)?)
                .context("sort_number out of range")?,
        });
    }
    Ok(nodes)
}

fn load_counting_circles(conn: &Connection) -> Result<Vec<CountingCircle>> {
    let mut stmt =
        conn.prepare("SELECT id, name, bfs_number, tenant_id FROM counting_circles ORDER BY id ASC")?;
    let mut rows = stmt.query([])?;
    let mut circles = Vec::new();
    while let Some(row) = rows.next()? {
        let id_raw: String = row.get(0)?;
        circles.push(CountingCircle {
            id: CountingCircleId(parse_ulid(&id_raw)?),
            name: row.get(1)?,
            bfs_number: row.get(2)?,
            tenant_id: row.get(3)?,
        });
    }
    Ok(circles)
}

fn load_assignments(conn: &Connection) -> Result<Vec<CountingCircleAssignment>> {
    let mut stmt = conn.prepare(
        "SELECT domain_of_influence_id, counting_circle_id, inherited, source_domain_of_influence_id
         FROM domain_of_influence_counting_circles ORDER BY id ASC",
    )?;
    let mut rows = stmt.query([])?;
    let mut assignments = Vec::new();
    while let Some(row) = rows.next()? {
        let target_raw: String = row.get(0)?;
        let circle_raw: String = row.get(1)?;
        let source_raw: String = row.get(3)?;
        assignments.push(CountingCircleAssignment {
            domain_of_influence_id: DomainOfInfluenceId(parse_ulid(&target_raw)?),
            counting_circle_id: CountingCircleId(parse_ulid(&circle_raw)?),
            inherited: row.get(2)?,
            source_domain_of_influence_id: DomainOfInfluenceId(parse_ulid(&source_raw)?),
        });
    }
    Ok(assignments)
}

fn load_hierarchy_entries(conn: &Connection) -> Result<Vec<HierarchyEntry>> {
    let mut stmt = conn.prepare(
        "SELECT domain_of_influence_id, tenant_id, ancestor_ids_json, descendant_ids_json
         FROM domain_of_influence_hierarchies ORDER BY domain_of_influence_id ASC",
    )?;
    let mut rows = stmt.query([])?;
    let mut entries = Vec::new();
    while let Some(row) = rows.next()? {
        let id_raw: String = row.get(0)?;
        let ancestors_json: String = row.get(2)?;
        let descendants_json: String = row.get(3)?;
        entries.push(HierarchyEntry {
            domain_of_influence_id: DomainOfInfluenceId(parse_ulid(&id_raw)?),
            tenant_id: row.get(1)?,
            ancestor_ids: serde_json::from_str(&ancestors_json)
                .context("failed to deserialize ancestor ids")?,
            descendant_ids: serde_json::from_str(&descendants_json)
                .context("failed to deserialize descendant ids")?,
        });
    }
    Ok(entries)
}

fn load_permission_entries(conn: &Connection) -> Result<Vec<PermissionEntry>> {
    let mut stmt = conn.prepare(
        "SELECT tenant_id, domain_of_influence_id, counting_circle_ids_json, is_parent
         FROM domain_of_influence_permissions
         ORDER BY tenant_id ASC, domain_of_influence_id ASC",
    )?;
    let mut rows = stmt.query([])?;
    let mut entries = Vec::new();
    while let Some(row) = rows.next()? {
        let id_raw: String = row.get(1)?;
        let circles_json: String = row.get(2)?;
        entries.push(PermissionEntry {
            tenant_id: row.get(0)?,
            domain_of_influence_id: DomainOfInfluenceId(parse_ulid(&id_raw)?),
            counting_circle_ids: serde_json::from_str(&circles_json)
                .context("failed to deserialize counting circle ids")?,
            is_parent: row.get(3)?,
        });
    }
    Ok(entries)
}

fn load_lists(conn: &Connection) -> Result<Vec<List>> {
    let mut stmt = conn.prepare(
        "SELECT id, order_number, short_description, list_union_description,
                sub_list_union_description
         FROM lists ORDER BY id ASC",
    )?;
    let mut rows = stmt.query([])?;
    let mut lists = Vec::new();
    while let Some(row) = rows.next()? {
        let id_raw: String = row.get(0)?;
        lists.push(List {
            id: ListId(parse_ulid(&id_raw)?),
            order_number: u32::try_from(row.get::<_, i64>(1)?)
                .context("order_number out of range")?,
            short_description: row.get(2)?,
            list_union_description: row.get(3)?,
            sub_list_union_description: row.get(4)?,
        });
    }
    Ok(lists)
}

fn load_list_unions(conn: &Connection) -> Result<Vec<ListUnion>> {
    let mut stmt =
        conn.prepare("SELECT id, description, main_list_id, root_id FROM list_unions ORDER BY id ASC")?;
    let mut rows = stmt.query([])?;
    let mut unions = Vec::new();
    while let Some(row) = rows.next()? {
        let id_raw: String = row.get(0)?;
        let main_raw: Option<String> = row.get(2)?;
        let root_raw: Option<String> = row.get(3)?;
        unions.push(ListUnion {
            id: ListUnionId(parse_ulid(&id_raw)?),
            description: row.get(1)?,
            main_list_id: match main_raw {
                Some(raw) => Some(ListId(parse_ulid(&raw)?)),
                None => None,
            },
            root_id: match root_raw {
                Some(raw) => Some(ListUnionId(parse_ulid(&raw)?)),
                None => None,
            },
        });
    }
    Ok(unions)
}

fn load_union_entries(conn: &Connection) -> Result<Vec<ListUnionEntry>> {
    let mut stmt =
        conn.prepare("SELECT list_union_id, list_id FROM list_union_entries ORDER BY id ASC")?;
    let mut rows = stmt.query([])?;
    let mut entries = Vec::new();
    while let Some(row) = rows.next()? {
        let union_raw: String = row.get(0)?;
        let list_raw: String = row.get(1)?;
        entries.push(ListUnionEntry {
            list_union_id: ListUnionId(parse_ulid(&union_raw)?),
            list_id: ListId(parse_ulid(&list_raw)?),
        });
    }
    Ok(entries)
}

fn find_list_union(conn: &Connection, id: ListUnionId) -> Result<Option<ListUnion>> {
    let unions = load_list_unions(conn)?;
    Ok(unions.into_iter().find(|union| union.id == id))
}

fn members_of_union(conn: &Connection, union_id: ListUnionId) -> Result<Vec<ListId>> {
    let entries = load_union_entries(conn)?;
    Ok(entries
        .into_iter()
        .filter(|entry| entry.list_union_id == union_id)
        .map(|entry| entry.list_id)
        .collect())
}

fn exists_in(conn: &Connection, table: &str, id: &str) -> Result<bool> {
    let query = format!("SELECT EXISTS(SELECT 1 FROM {table} WHERE id = ?1)");
    let exists = conn
        .query_row(&query, params![id], |row| row.get::<_, i64>(0))
        .with_context(|| format!("failed to check existence in {table}"))?;
    Ok(exists == 1)
}

fn union_entry_exists(conn: &Connection, union_id: ListUnionId, list_id: ListId) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM list_union_entries WHERE list_union_id = ?1 AND list_id = ?2)",
            params![union_id.to_string(), list_id.to_string()],
            |row| row.get::<_, i64>(0),
        )
        .context("failed to check union entry existence")?;
    Ok(exists == 1)
}

fn assignment_exists(conn: &Connection, row: &CountingCircleAssignment) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(
                SELECT 1 FROM domain_of_influence_counting_circles
                WHERE domain_of_influence_id = ?1 AND counting_circle_id = ?2
                  AND source_domain_of_influence_id = ?3
             )",
            params![
                row.domain_of_influence_id.to_string(),
                row.counting_circle_id.to_string(),
                row.source_domain_of_influence_id.to_string(),
            ],
            |sql_row| sql_row.get::<_, i64>(0),
        )
        .context("failed to check assignment existence")?;
    Ok(exists == 1)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_ulid(raw: &str) -> Result<Ulid> {
    Ulid::from_string(raw).with_context(|| format!("invalid ULID: {raw}"))
}

fn write_ndjson_file<T: Serialize>(path: &Path, values: &[T]) -> Result<(String, usize)> {
    let file = File::create(path)
        .with_context(|| format!("failed to create export file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let mut hasher = Sha256::new();

    for value in values {
        let line = serde_json::to_string(value).context("failed to serialize NDJSON row")?;
        writer
            .write_all(line.as_bytes())
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        writer
            .write_all(b"\n")
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }

    writer.flush().with_context(|| format!("failed to flush export file {}", path.display()))?;

    Ok((format!("{:x}", hasher.finalize()), values.len()))
}

fn read_ndjson_file<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open NDJSON file {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut values = Vec::new();

    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| {
            format!("failed to read line {} from {}", index + 1, path.display())
        })?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let value = serde_json::from_str(trimmed).with_context(|| {
            format!("failed to parse NDJSON row {} from {}", index + 1, path.display())
        })?;
        values.push(value);
    }

    Ok(values)
}

fn read_export_manifest(path: &Path) -> Result<ExportManifest> {
    let bytes = fs::read(path)
        .with_context(|| format!("failed to read manifest file {}", path.display()))?;
    serde_json::from_slice(&bytes)
        .with_context(|| format!("failed to parse manifest JSON {}", path.display()))
}

fn ndjson_digest_and_records(path: &Path) -> Result<(String, usize)> {
    let file = File::open(path)
        .with_context(|| format!("failed to open NDJSON file {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut records = 0_usize;

    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| {
            format!("failed to read line {} from {}", index + 1, path.display())
        })?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
        if !line.trim().is_empty() {
            records += 1;
        }
    }

    Ok((format!("{:x}", hasher.finalize()), records))
}

fn validate_import_manifest(in_dir: &Path, manifest: &ExportManifest) -> Result<()> {
    if manifest.schema_version <= 0 || manifest.schema_version > LATEST_SCHEMA_VERSION {
        return Err(anyhow!(
            "unsupported export schema version {}; supported range is 1..={}",
            manifest.schema_version,
            LATEST_SCHEMA_VERSION
        ));
    }

    let mut by_path: BTreeMap<&str, &ExportFileDigest> = BTreeMap::new();
    for file in &manifest.files {
        if by_path.insert(file.path.as_str(), file).is_some() {
            return Err(anyhow!("manifest contains duplicate file entry: {}", file.path));
        }
    }

    for required in EXPORT_FILES {
        let Some(expected) = by_path.get(required) else {
            return Err(anyhow!("manifest is missing required file entry: {required}"));
        };
        let file_path = in_dir.join(required);
        if !file_path.exists() {
            return Err(anyhow!("manifest references missing file {}", file_path.display()));
        }

        let (actual_sha256, actual_records) = ndjson_digest_and_records(&file_path)?;
        if actual_sha256 != expected.sha256 {
            return Err(anyhow!(
                "manifest digest mismatch for {required}: expected {}, got {}",
                expected.sha256,
                actual_sha256
            ));
        }
        if actual_records != expected.records {
            return Err(anyhow!(
                "manifest record count mismatch for {required}: expected {}, got {}",
                expected.records,
                actual_records
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store() -> SqliteStore {
        let mut store = match SqliteStore::open(Path::new(":memory:")) {
            Ok(store) => store,
            Err(err) => panic!("in-memory store should open: {err}"),
        };
        if let Err(err) = store.migrate() {
            panic!("migration should succeed: {err}");
        }
        store
    }

    fn mk_node(
        id: DomainOfInfluenceId,
        parent_id: Option<DomainOfInfluenceId>,
        tenant_id: &str,
        name: &str,
    ) -> DomainOfInfluence {
        DomainOfInfluence {
            id,
            parent_id,
            tenant_id: tenant_id.to_string(),
            name: name.to_string(),
            short_name: name.to_string(),
            kind: DomainOfInfluenceKind::Mu,
            sort_number: 0,
        }
    }

    fn mk_circle(id: CountingCircleId, name: &str) -> CountingCircle {
        CountingCircle {
            id,
            name: name.to_string(),
            bfs_number: "3203".to_string(),
            tenant_id: "tenant-cc".to_string(),
        }
    }

    fn mk_list(id: ListId, short_description: &str) -> List {
        List {
            id,
            order_number: 1,
            short_description: short_description.to_string(),
            list_union_description: String::new(),
            sub_list_union_description: String::new(),
        }
    }

    fn apply(store: &mut SqliteStore, event: &MasterDataEvent) -> EventOutcome {
        match store.apply_event(event) {
            Ok(outcome) => outcome,
            Err(err) => panic!("event {} should apply: {err:#}", event.kind()),
        }
    }

    fn seed_chain(
        store: &mut SqliteStore,
    ) -> (DomainOfInfluenceId, DomainOfInfluenceId, DomainOfInfluenceId) {
        let a = DomainOfInfluenceId::new();
        let b = DomainOfInfluenceId::new();
        let c = DomainOfInfluenceId::new();
        apply(store, &MasterDataEvent::DomainOfInfluenceCreated {
            domain_of_influence: mk_node(a, None, "tenant-a", "Canton"),
        });
        apply(store, &MasterDataEvent::DomainOfInfluenceCreated {
            domain_of_influence: mk_node(b, Some(a), "tenant-b", "District"),
        });
        apply(store, &MasterDataEvent::DomainOfInfluenceCreated {
            domain_of_influence: mk_node(c, Some(b), "tenant-c", "Municipality"),
        });
        (a, b, c)
    }

    fn hierarchy_for(store: &SqliteStore, id: DomainOfInfluenceId) -> HierarchyEntry {
        let entries = match store.list_hierarchy_entries() {
            Ok(entries) => entries,
            Err(err) => panic!("hierarchy entries should load: {err}"),
        };
        match entries.into_iter().find(|entry| entry.domain_of_influence_id == id) {
            Some(entry) => entry,
            None => panic!("missing hierarchy entry for {id}"),
        }
    }

    fn assignments(store: &SqliteStore) -> Vec<CountingCircleAssignment> {
        match store.list_assignments() {
            Ok(rows) => rows,
            Err(err) => panic!("assignments should load: {err}"),
        }
    }

    fn list_by_id(store: &SqliteStore, id: ListId) -> List {
        match store.get_list(id) {
            Ok(Some(list)) => list,
            Ok(None) => panic!("missing list {id}"),
            Err(err) => panic!("list lookup should succeed: {err}"),
        }
    }

    #[test]
    fn migrate_initializes_schema_and_status() {
        let store = open_store();
        let status = match store.schema_status() {
            Ok(status) => status,
            Err(err) => panic!("schema status should load: {err}"),
        };
        assert_eq!(status.current_version, LATEST_SCHEMA_VERSION);
        assert!(status.pending_versions.is_empty());
    }

    #[test]
    fn hierarchy_rebuild_is_full_replace_without_leftovers() {
        let mut store = open_store();
        let (a, b, c) = seed_chain(&mut store);

        // Creating every node already rebuilt the closure; rebuild again and
        // assert there are no duplicate or leftover rows.
        if let Err(err) = store.rebuild_hierarchy_all() {
            panic!("rebuild should succeed: {err}");
        }
        if let Err(err) = store.rebuild_hierarchy_all() {
            panic!("second rebuild should succeed: {err}");
        }

        let entries = match store.list_hierarchy_entries() {
            Ok(entries) => entries,
            Err(err) => panic!("hierarchy entries should load: {err}"),
        };
        assert_eq!(entries.len(), 3);
        assert_eq!(hierarchy_for(&store, c).ancestor_ids, vec![b, a]);
        assert_eq!(hierarchy_for(&store, a).descendant_ids, vec![b, c]);
        assert!(hierarchy_for(&store, a).ancestor_ids.is_empty());
    }

    #[test]
    fn move_event_reshapes_the_closure_non_locally() {
        let mut store = open_store();
        let (a, b, c) = seed_chain(&mut store);

        apply(&mut store, &MasterDataEvent::DomainOfInfluenceMoved {
            id: c,
            new_parent_id: Some(a),
        });

        assert_eq!(hierarchy_for(&store, c).ancestor_ids, vec![a]);
        assert!(hierarchy_for(&store, b).descendant_ids.is_empty());
        assert_eq!(hierarchy_for(&store, a).descendant_ids.len(), 2);
    }

    #[test]
    fn move_under_own_descendant_is_rejected() {
        let mut store = open_store();
        let (a, _, c) = seed_chain(&mut store);

        let result = store.apply_event(&MasterDataEvent::DomainOfInfluenceMoved {
            id: a,
            new_parent_id: Some(c),
        });
        assert!(result.is_err());
    }

    #[test]
    fn update_re_parenting_under_own_descendant_is_rejected() {
        let mut store = open_store();
        let (a, b, c) = seed_chain(&mut store);

        let mut node = mk_node(a, Some(c), "tenant-a", "Canton");
        node.sort_number = 7;
        let result =
            store.apply_event(&MasterDataEvent::DomainOfInfluenceUpdated {
                domain_of_influence: node,
            });
        assert!(result.is_err());

        let result = store.apply_event(&MasterDataEvent::DomainOfInfluenceUpdated {
            domain_of_influence: mk_node(a, Some(a), "tenant-a", "Canton"),
        });
        assert!(result.is_err());

        // The rejected events left the chain intact.
        assert_eq!(hierarchy_for(&store, c).ancestor_ids, vec![b, a]);

        // A cycle-free parent change through an update is still honored.
        apply(&mut store, &MasterDataEvent::DomainOfInfluenceUpdated {
            domain_of_influence: mk_node(c, Some(a), "tenant-c", "Municipality"),
        });
        assert_eq!(hierarchy_for(&store, c).ancestor_ids, vec![a]);
        assert!(hierarchy_for(&store, b).descendant_ids.is_empty());
    }

    #[test]
    fn update_for_missing_node_is_skipped_not_failed() {
        let mut store = open_store();
        let ghost = mk_node(DomainOfInfluenceId::new(), None, "tenant", "Ghost");

        let outcome =
            apply(&mut store, &MasterDataEvent::DomainOfInfluenceUpdated {
                domain_of_influence: ghost,
            });
        assert!(matches!(outcome, EventOutcome::Skipped { .. }));
    }

    #[test]
    fn reassignment_materializes_inherited_rows_with_provenance() {
        let mut store = open_store();
        let (a, b, c) = seed_chain(&mut store);
        let cc1 = CountingCircleId::new();
        apply(&mut store, &MasterDataEvent::CountingCircleCreated {
            counting_circle: mk_circle(cc1, "Circle 1"),
        });

        apply(&mut store, &MasterDataEvent::CountingCirclesReassigned {
            id: a,
            counting_circle_ids: vec![cc1],
            event_at: OffsetDateTime::UNIX_EPOCH,
        });

        let rows = assignments(&store);
        assert_eq!(rows.len(), 3);
        for target in [a, b, c] {
            let row = rows.iter().find(|row| row.domain_of_influence_id == target);
            match row {
                Some(row) => {
                    assert_eq!(row.counting_circle_id, cc1);
                    assert_eq!(row.source_domain_of_influence_id, a);
                    assert_eq!(row.inherited, target != a);
                }
                None => panic!("missing assignment row for target {target}"),
            }
        }

        // Identical reassignment is a no-op, not a duplicate insert.
        apply(&mut store, &MasterDataEvent::CountingCirclesReassigned {
            id: a,
            counting_circle_ids: vec![cc1],
            event_at: OffsetDateTime::UNIX_EPOCH,
        });
        assert_eq!(assignments(&store).len(), 3);
    }

    #[test]
    fn retraction_preserves_other_sources_rows() {
        let mut store = open_store();
        let (a, b, c) = seed_chain(&mut store);
        let cc1 = CountingCircleId::new();
        apply(&mut store, &MasterDataEvent::CountingCircleCreated {
            counting_circle: mk_circle(cc1, "Circle 1"),
        });

        apply(&mut store, &MasterDataEvent::CountingCirclesReassigned {
            id: a,
            counting_circle_ids: vec![cc1],
            event_at: OffsetDateTime::UNIX_EPOCH,
        });
        apply(&mut store, &MasterDataEvent::CountingCirclesReassigned {
            id: b,
            counting_circle_ids: vec![cc1],
            event_at: OffsetDateTime::UNIX_EPOCH,
        });
        assert_eq!(assignments(&store).len(), 5);

        // Removing A's direct assignment deletes exactly A's three rows.
        apply(&mut store, &MasterDataEvent::CountingCirclesReassigned {
            id: a,
            counting_circle_ids: vec![],
            event_at: OffsetDateTime::UNIX_EPOCH,
        });

        let rows = assignments(&store);
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|row| row.source_domain_of_influence_id == b));
        assert!(rows
            .iter()
            .any(|row| row.domain_of_influence_id == c && row.counting_circle_id == cc1));
    }

    #[test]
    fn permission_tree_reflects_assignments_after_rebuild() {
        let mut store = open_store();
        let (a, b, _) = seed_chain(&mut store);
        let cc1 = CountingCircleId::new();
        apply(&mut store, &MasterDataEvent::CountingCircleCreated {
            counting_circle: mk_circle(cc1, "Circle 1"),
        });
        apply(&mut store, &MasterDataEvent::CountingCirclesReassigned {
            id: b,
            counting_circle_ids: vec![cc1],
            event_at: OffsetDateTime::UNIX_EPOCH,
        });

        let entries = match store.list_permission_entries() {
            Ok(entries) => entries,
            Err(err) => panic!("permission entries should load: {err}"),
        };

        let owned = entries
            .iter()
            .find(|entry| entry.tenant_id == "tenant-b" && entry.domain_of_influence_id == b);
        match owned {
            Some(entry) => assert!(entry.counting_circle_ids.contains(&cc1)),
            None => panic!("missing owned permission entry for tenant-b"),
        }

        let parent = entries
            .iter()
            .find(|entry| entry.tenant_id == "tenant-b" && entry.domain_of_influence_id == a);
        match parent {
            Some(entry) => assert!(entry.is_parent),
            None => panic!("missing ancestor permission entry for tenant-b"),
        }
    }

    #[test]
    fn delete_cascades_to_descendants_and_retracts_provenance() {
        let mut store = open_store();
        let (a, b, c) = seed_chain(&mut store);
        let cc1 = CountingCircleId::new();
        apply(&mut store, &MasterDataEvent::CountingCircleCreated {
            counting_circle: mk_circle(cc1, "Circle 1"),
        });
        apply(&mut store, &MasterDataEvent::CountingCirclesReassigned {
            id: b,
            counting_circle_ids: vec![cc1],
            event_at: OffsetDateTime::UNIX_EPOCH,
        });

        apply(&mut store, &MasterDataEvent::DomainOfInfluenceDeleted { id: b });

        let nodes = match store.list_domain_of_influences() {
            Ok(nodes) => nodes,
            Err(err) => panic!("nodes should load: {err}"),
        };
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].id, a);
        assert!(assignments(&store).is_empty());
        assert!(hierarchy_for(&store, a).descendant_ids.is_empty());
        match store.get_domain_of_influence(c) {
            Ok(found) => assert!(found.is_none()),
            Err(err) => panic!("node lookup should succeed: {err}"),
        }
    }

    #[test]
    fn union_entries_drive_description_symmetry() {
        let mut store = open_store();
        let l1 = ListId::new();
        let l2 = ListId::new();
        let union_id = ListUnionId::new();
        apply(&mut store, &MasterDataEvent::ListCreated { list: mk_list(l1, "Party A") });
        apply(&mut store, &MasterDataEvent::ListCreated { list: mk_list(l2, "Party B") });
        apply(&mut store, &MasterDataEvent::ListUnionCreated {
            list_union: ListUnion {
                id: union_id,
                description: "Union".to_string(),
                main_list_id: None,
                root_id: None,
            },
        });

        apply(&mut store, &MasterDataEvent::ListUnionEntriesReplaced {
            id: union_id,
            list_ids: vec![l1, l2],
        });

        assert_eq!(list_by_id(&store, l1).list_union_description, "Party B");
        assert_eq!(list_by_id(&store, l2).list_union_description, "Party A");

        // Removing the last co-member empties the survivor's description.
        apply(&mut store, &MasterDataEvent::ListUnionEntriesReplaced {
            id: union_id,
            list_ids: vec![l1],
        });
        assert_eq!(list_by_id(&store, l1).list_union_description, "");
        assert_eq!(list_by_id(&store, l2).list_union_description, "");
    }

    #[test]
    fn short_description_change_requotes_co_members_only() {
        let mut store = open_store();
        let l1 = ListId::new();
        let l2 = ListId::new();
        let l3 = ListId::new();
        let shared = ListUnionId::new();
        let unrelated = ListUnionId::new();
        apply(&mut store, &MasterDataEvent::ListCreated { list: mk_list(l1, "Party A") });
        apply(&mut store, &MasterDataEvent::ListCreated { list: mk_list(l2, "Party B") });
        apply(&mut store, &MasterDataEvent::ListCreated { list: mk_list(l3, "Party C") });
        for (id, lists) in [(shared, vec![l1, l2]), (unrelated, vec![l3])] {
            apply(&mut store, &MasterDataEvent::ListUnionCreated {
                list_union: ListUnion {
                    id,
                    description: "Union".to_string(),
                    main_list_id: None,
                    root_id: None,
                },
            });
            apply(&mut store, &MasterDataEvent::ListUnionEntriesReplaced { id, list_ids: lists });
        }
        let l3_before = list_by_id(&store, l3);

        let mut renamed = mk_list(l2, "Party B (renamed)");
        renamed.order_number = 2;
        apply(&mut store, &MasterDataEvent::ListUpdated { list: renamed });

        assert_eq!(list_by_id(&store, l1).list_union_description, "Party B (renamed)");
        assert_eq!(list_by_id(&store, l2).list_union_description, "Party A");
        assert_eq!(list_by_id(&store, l3), l3_before);
    }

    #[test]
    fn sub_union_descriptions_stay_within_root_members() {
        let mut store = open_store();
        let l1 = ListId::new();
        let l2 = ListId::new();
        let l3 = ListId::new();
        let root = ListUnionId::new();
        let sub = ListUnionId::new();
        apply(&mut store, &MasterDataEvent::ListCreated { list: mk_list(l1, "Party A") });
        apply(&mut store, &MasterDataEvent::ListCreated { list: mk_list(l2, "Party B") });
        apply(&mut store, &MasterDataEvent::ListCreated { list: mk_list(l3, "Party C") });
        apply(&mut store, &MasterDataEvent::ListUnionCreated {
            list_union: ListUnion {
                id: root,
                description: "Root".to_string(),
                main_list_id: None,
                root_id: None,
            },
        });
        apply(&mut store, &MasterDataEvent::ListUnionEntriesReplaced {
            id: root,
            list_ids: vec![l1, l2, l3],
        });
        apply(&mut store, &MasterDataEvent::ListUnionCreated {
            list_union: ListUnion {
                id: sub,
                description: "Sub".to_string(),
                main_list_id: None,
                root_id: Some(root),
            },
        });
        apply(&mut store, &MasterDataEvent::ListUnionEntriesReplaced {
            id: sub,
            list_ids: vec![l1, l2],
        });

        assert_eq!(list_by_id(&store, l1).list_union_description, "Party B, Party C");
        assert_eq!(list_by_id(&store, l1).sub_list_union_description, "Party B");
        assert_eq!(list_by_id(&store, l3).sub_list_union_description, "");

        // A member outside the root union is an invariant violation.
        let l4 = ListId::new();
        apply(&mut store, &MasterDataEvent::ListCreated { list: mk_list(l4, "Party D") });
        let result = store.apply_event(&MasterDataEvent::ListUnionEntriesReplaced {
            id: sub,
            list_ids: vec![l1, l4],
        });
        assert!(result.is_err());

        // Shrinking the root trims the sub union along with it.
        apply(&mut store, &MasterDataEvent::ListUnionEntriesReplaced {
            id: root,
            list_ids: vec![l1, l3],
        });
        let sub_members = match store.list_union_member_ids(sub) {
            Ok(members) => members,
            Err(err) => panic!("sub members should load: {err}"),
        };
        assert_eq!(sub_members, vec![l1]);
        assert_eq!(list_by_id(&store, l1).sub_list_union_description, "");
    }

    #[test]
    fn deleting_a_union_recomputes_former_members() {
        let mut store = open_store();
        let l1 = ListId::new();
        let l2 = ListId::new();
        let union_id = ListUnionId::new();
        apply(&mut store, &MasterDataEvent::ListCreated { list: mk_list(l1, "Party A") });
        apply(&mut store, &MasterDataEvent::ListCreated { list: mk_list(l2, "Party B") });
        apply(&mut store, &MasterDataEvent::ListUnionCreated {
            list_union: ListUnion {
                id: union_id,
                description: "Union".to_string(),
                main_list_id: None,
                root_id: None,
            },
        });
        apply(&mut store, &MasterDataEvent::ListUnionEntriesReplaced {
            id: union_id,
            list_ids: vec![l1, l2],
        });
        assert_eq!(list_by_id(&store, l1).list_union_description, "Party B");

        apply(&mut store, &MasterDataEvent::ListUnionDeleted { id: union_id });
        assert_eq!(list_by_id(&store, l1).list_union_description, "");
        assert_eq!(list_by_id(&store, l2).list_union_description, "");
    }

    #[test]
    fn main_list_pointer_must_reference_a_member() {
        let mut store = open_store();
        let l1 = ListId::new();
        let l2 = ListId::new();
        let union_id = ListUnionId::new();
        apply(&mut store, &MasterDataEvent::ListCreated { list: mk_list(l1, "Party A") });
        apply(&mut store, &MasterDataEvent::ListCreated { list: mk_list(l2, "Party B") });
        apply(&mut store, &MasterDataEvent::ListUnionCreated {
            list_union: ListUnion {
                id: union_id,
                description: "Union".to_string(),
                main_list_id: None,
                root_id: None,
            },
        });
        apply(&mut store, &MasterDataEvent::ListUnionEntriesReplaced {
            id: union_id,
            list_ids: vec![l1],
        });

        apply(&mut store, &MasterDataEvent::ListUnionMainListChanged {
            id: union_id,
            main_list_id: Some(l1),
        });

        let result = store.apply_event(&MasterDataEvent::ListUnionMainListChanged {
            id: union_id,
            main_list_id: Some(l2),
        });
        assert!(result.is_err());

        // Replacing entries without the main list clears the stale pointer.
        apply(&mut store, &MasterDataEvent::ListUnionEntriesReplaced {
            id: union_id,
            list_ids: vec![l2],
        });
        let unions = match store.list_list_unions() {
            Ok(unions) => unions,
            Err(err) => panic!("unions should load: {err}"),
        };
        assert_eq!(unions[0].main_list_id, None);
    }

    #[test]
    fn new_union_cannot_start_with_a_main_list() {
        let mut store = open_store();
        let l1 = ListId::new();
        let union_id = ListUnionId::new();
        apply(&mut store, &MasterDataEvent::ListCreated { list: mk_list(l1, "Party A") });

        let with_main = ListUnion {
            id: union_id,
            description: "Union".to_string(),
            main_list_id: Some(l1),
            root_id: None,
        };
        let result = store
            .apply_event(&MasterDataEvent::ListUnionCreated { list_union: with_main.clone() });
        assert!(result.is_err());
        assert!(store.create_list_union(&with_main).is_err());

        // The pointer becomes settable once the list is an actual member.
        apply(&mut store, &MasterDataEvent::ListUnionCreated {
            list_union: ListUnion { main_list_id: None, ..with_main },
        });
        apply(&mut store, &MasterDataEvent::ListUnionEntriesReplaced {
            id: union_id,
            list_ids: vec![l1],
        });
        apply(&mut store, &MasterDataEvent::ListUnionMainListChanged {
            id: union_id,
            main_list_id: Some(l1),
        });
        let unions = match store.list_list_unions() {
            Ok(unions) => unions,
            Err(err) => panic!("unions should load: {err}"),
        };
        assert_eq!(unions[0].main_list_id, Some(l1));
    }

    #[test]
    fn export_import_round_trip_rebuilds_derived_state() {
        let mut store = open_store();
        let (a, b, _) = seed_chain(&mut store);
        let cc1 = CountingCircleId::new();
        apply(&mut store, &MasterDataEvent::CountingCircleCreated {
            counting_circle: mk_circle(cc1, "Circle 1"),
        });
        apply(&mut store, &MasterDataEvent::CountingCirclesReassigned {
            id: b,
            counting_circle_ids: vec![cc1],
            event_at: OffsetDateTime::UNIX_EPOCH,
        });

        let out_dir = std::env::temp_dir().join(format!("electora-export-{}", Ulid::new()));
        let manifest = match store.export_snapshot(&out_dir) {
            Ok(manifest) => manifest,
            Err(err) => panic!("export should succeed: {err}"),
        };
        assert_eq!(manifest.files.len(), EXPORT_FILES.len());

        let mut target = open_store();
        let summary = match target.import_snapshot(&out_dir, true) {
            Ok(summary) => summary,
            Err(err) => panic!("import should succeed: {err}"),
        };
        assert!(summary.imported_rows >= 5);
        assert_eq!(hierarchy_for(&target, a).descendant_ids.len(), 2);
        assert_eq!(assignments(&target).len(), 2);

        if let Err(err) = fs::remove_dir_all(&out_dir) {
            panic!("temp export dir should be removable: {err}");
        }
    }

    #[test]
    fn crud_surface_feeds_the_same_builders_as_events() {
        let mut store = open_store();
        let a = DomainOfInfluenceId::new();
        let cc1 = CountingCircleId::new();
        if let Err(err) = store.create_domain_of_influence(&mk_node(a, None, "tenant-a", "Canton"))
        {
            panic!("node insert should succeed: {err}");
        }
        if let Err(err) = store.create_counting_circle(&mk_circle(cc1, "Circle 1")) {
            panic!("circle insert should succeed: {err}");
        }
        if let Err(err) = store.rebuild_hierarchy_all() {
            panic!("hierarchy rebuild should succeed: {err}");
        }
        if let Err(err) = store.build_inheritance_for_counting_circles(
            a,
            &[a],
            &[cc1],
            &[],
            OffsetDateTime::UNIX_EPOCH,
        ) {
            panic!("inheritance change should succeed: {err}");
        }
        if let Err(err) = store.rebuild_permission_tree_all() {
            panic!("permission rebuild should succeed: {err}");
        }
        assert_eq!(assignments(&store).len(), 1);
        let circles = match store.list_counting_circles() {
            Ok(circles) => circles,
            Err(err) => panic!("circles should load: {err}"),
        };
        assert_eq!(circles.len(), 1);

        let l1 = ListId::new();
        let l2 = ListId::new();
        let union_id = ListUnionId::new();
        if let Err(err) = store.create_list(&mk_list(l1, "Party A")) {
            panic!("list insert should succeed: {err}");
        }
        if let Err(err) = store.create_list(&mk_list(l2, "Party B")) {
            panic!("list insert should succeed: {err}");
        }
        if let Err(err) = store.create_list_union(&ListUnion {
            id: union_id,
            description: "Union".to_string(),
            main_list_id: None,
            root_id: None,
        }) {
            panic!("union insert should succeed: {err}");
        }
        match store.replace_list_union_entries(union_id, &[l1, l2]) {
            Ok(outcome) => assert!(outcome.is_applied()),
            Err(err) => panic!("entry replacement should succeed: {err}"),
        }
        match store.update_list_union_descriptions(&[l1]) {
            Ok(updated) => assert_eq!(updated, 1),
            Err(err) => panic!("description update should succeed: {err}"),
        }
        match store.update_list_union_descriptions_referencing_list(l1) {
            Ok(updated) => assert_eq!(updated, 2),
            Err(err) => panic!("description update should succeed: {err}"),
        }
        assert_eq!(list_by_id(&store, l1).list_union_description, "Party B");
    }

    #[test]
    fn backup_and_restore_database_round_trip() {
        let mut source = open_store();
        let (a, _, _) = seed_chain(&mut source);

        let backup_file =
            std::env::temp_dir().join(format!("electora-backup-{}.sqlite3", Ulid::new()));
        if let Err(err) = source.backup_database(&backup_file) {
            panic!("backup should succeed: {err}");
        }

        let mut target = match SqliteStore::open(Path::new(":memory:")) {
            Ok(store) => store,
            Err(err) => panic!("in-memory store should open: {err}"),
        };
        if let Err(err) = target.restore_database(&backup_file) {
            panic!("restore should succeed: {err}");
        }
        assert_eq!(hierarchy_for(&target, a).descendant_ids.len(), 2);

        if let Err(err) = fs::remove_file(&backup_file) {
            panic!("temp backup file should be removable: {err}");
        }
    }

    #[test]
    fn integrity_check_reports_clean_database() {
        let mut store = open_store();
        seed_chain(&mut store);
        let report = match store.integrity_check() {
            Ok(report) => report,
            Err(err) => panic!("integrity check should run: {err}"),
        };
        assert!(report.quick_check_ok);
        assert!(report.foreign_key_violations.is_empty());
        assert_eq!(report.schema_status.current_version, LATEST_SCHEMA_VERSION);
    }
}
