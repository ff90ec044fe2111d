//! Readers for nuPlan log databases
//!
//! Each log is a SQLite file holding a `scenario_tag` table (`token`,
//! `lidar_pc_token`, `type`) and a `lidar_pc` table (`token`). Tokens are raw
//! bytes and are rendered as lowercase hex strings.
//!
//! Every function opens its own read-only connection and closes it before
//! returning; no connection outlives a call.

use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
};

use rusqlite::{Connection, OpenFlags};
use serde::Serialize;
use tracing::{debug, info};

use crate::counts::ScenarioTypeCounts;

/// Default per-type quota for [`relocate_databases`].
pub const DEFAULT_MAX_PER_TYPE: u64 = 500;

const SCENARIO_TOKENS_QUERY: &str = "SELECT type, token FROM scenario_tag";

const SCENARIO_TYPE_COUNTS_QUERY: &str = "
    SELECT  type,
            COUNT(*) AS cnt
    FROM scenario_tag
    GROUP BY type
    ORDER BY cnt DESC";

const LIDAR_PC_TOKENS_QUERY: &str = "
    SELECT  st.type,
            lp.token
    FROM lidar_pc AS lp
    LEFT OUTER JOIN scenario_tag AS st
        ON lp.token = st.lidar_pc_token
    WHERE st.type IS NOT NULL
    ORDER BY st.type ASC";

#[derive(Debug, derive_more::Display, derive_more::Error)]
pub enum DbError {
    #[display("Failed to read directory {}", path.display())]
    ReadDir { path: PathBuf, source: io::Error },
    #[display("Failed to open database {}", path.display())]
    Open {
        path: PathBuf,
        source: rusqlite::Error,
    },
    #[display("Failed to query database {}", path.display())]
    Query {
        path: PathBuf,
        source: rusqlite::Error,
    },
    #[display("Failed to create directory {}", path.display())]
    CreateDir { path: PathBuf, source: io::Error },
    #[display("Failed to move {} to {}", from.display(), to.display())]
    Move {
        from: PathBuf,
        to: PathBuf,
        source: io::Error,
    },
}

fn open(db: &Path) -> Result<Connection, DbError> {
    Connection::open_with_flags(
        db,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(|source| DbError::Open {
        path: db.to_owned(),
        source,
    })
}

fn query_pairs<T, F>(db: &Path, sql: &str, map: F) -> Result<Vec<T>, DbError>
where
    F: FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
{
    let conn = open(db)?;
    let to_err = |source| DbError::Query {
        path: db.to_owned(),
        source,
    };
    let mut stmt = conn.prepare(sql).map_err(to_err)?;
    let rows = stmt
        .query_map([], map)
        .map_err(to_err)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(to_err)?;
    Ok(rows)
}

/// Scenario tokens of one database, grouped by scenario type.
pub fn scenario_tokens(db: &Path) -> Result<BTreeMap<String, Vec<String>>, DbError> {
    let rows = query_pairs(db, SCENARIO_TOKENS_QUERY, |row| {
        Ok((row.get::<_, Option<String>>(0)?, row.get::<_, Vec<u8>>(1)?))
    })?;
    let mut tokens = BTreeMap::<String, Vec<String>>::new();
    for (scenario_type, token) in rows {
        let Some(scenario_type) = scenario_type else {
            continue;
        };
        tokens
            .entry(scenario_type)
            .or_default()
            .push(hex::encode(token));
    }
    Ok(tokens)
}

/// Number of scenario tags per type in one database.
pub fn scenario_type_counts(db: &Path) -> Result<ScenarioTypeCounts, DbError> {
    let rows = query_pairs(db, SCENARIO_TYPE_COUNTS_QUERY, |row| {
        Ok((row.get::<_, Option<String>>(0)?, row.get::<_, i64>(1)?))
    })?;
    Ok(rows
        .into_iter()
        .filter_map(|(scenario_type, count)| {
            Some((scenario_type?, u64::try_from(count).unwrap_or(0)))
        })
        .collect())
}

/// Lidar point cloud tokens that carry a scenario tag, as `(type, token)`
/// pairs sorted by type.
pub fn lidar_pc_tokens_with_scenario_tag(db: &Path) -> Result<Vec<(String, String)>, DbError> {
    let rows = query_pairs(db, LIDAR_PC_TOKENS_QUERY, |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
    })?;
    Ok(rows
        .into_iter()
        .map(|(scenario_type, token)| (scenario_type, hex::encode(token)))
        .collect())
}

/// Maps every scenario type to the `(database, lidar_pc token)` pairs tagged
/// with it.
pub fn scenario_type_token_map<P>(
    db_files: &[P],
) -> Result<BTreeMap<String, Vec<(PathBuf, String)>>, DbError>
where
    P: AsRef<Path>,
{
    let mut map = BTreeMap::<String, Vec<(PathBuf, String)>>::new();
    for db in db_files {
        let db = db.as_ref();
        for (scenario_type, token) in lidar_pc_tokens_with_scenario_tag(db)? {
            map.entry(scenario_type)
                .or_default()
                .push((db.to_owned(), token));
        }
    }
    Ok(map)
}

/// Regular files ending in `.db` directly under `dir`, sorted by path.
pub fn list_db_files(dir: &Path) -> Result<Vec<PathBuf>, DbError> {
    let to_err = |source| DbError::ReadDir {
        path: dir.to_owned(),
        source,
    };
    let mut files = vec![];
    for entry in fs::read_dir(dir).map_err(to_err)? {
        let path = entry.map_err(to_err)?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "db") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Sums the scenario type counts of every database in `dir`.
pub fn aggregate_scenario_counts(dir: &Path) -> Result<ScenarioTypeCounts, DbError> {
    let mut total = ScenarioTypeCounts::new();
    for db in list_db_files(dir)? {
        info!("Processing {}...", db.display());
        total.merge(&scenario_type_counts(&db)?);
    }
    Ok(total)
}

/// Scenario tokens of every database in `dir`, keyed by database file name.
pub fn scenario_tokens_by_db(
    dir: &Path,
) -> Result<BTreeMap<String, BTreeMap<String, Vec<String>>>, DbError> {
    let mut all = BTreeMap::new();
    for db in list_db_files(dir)? {
        let name = db
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        info!("Processing file: {name}");
        all.insert(name, scenario_tokens(&db)?);
    }
    Ok(all)
}

/// Moves databases that contain under-represented scenario types into a
/// separate directory.
///
/// A database is moved when it contains at least one type of
/// `existing_counts` whose quota is not yet exhausted. The quota of a type is
/// `max_per_type - existing_count`, and each moved database consumes one unit
/// of quota for every such type it contains. A database skipped because the
/// target already holds a file of that name consumes no quota and is not
/// counted in [`RelocationReport::moved_counts`].
#[derive(Debug, Clone)]
pub struct RelocationPlan {
    pub source_dir: PathBuf,
    pub target_dir: PathBuf,
    pub existing_counts: ScenarioTypeCounts,
    pub max_per_type: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RelocationReport {
    /// Destination paths of the moved databases.
    pub moved: Vec<PathBuf>,
    /// Databases left in place because the target already had a file of the same name.
    pub skipped_existing: Vec<PathBuf>,
    /// Number of moved databases per scenario type.
    pub moved_counts: ScenarioTypeCounts,
}

pub fn relocate_databases(plan: &RelocationPlan) -> Result<RelocationReport, DbError> {
    fs::create_dir_all(&plan.target_dir).map_err(|source| DbError::CreateDir {
        path: plan.target_dir.clone(),
        source,
    })?;

    let mut report = RelocationReport::default();
    for db in list_db_files(&plan.source_dir)? {
        info!("Processing {}...", db.display());
        let wanted = scenario_type_counts(&db)?
            .scenario_types()
            .filter(|scenario_type| plan.existing_counts.contains(scenario_type))
            .filter(|scenario_type| {
                let remaining = plan
                    .max_per_type
                    .saturating_sub(plan.existing_counts.get(scenario_type))
                    .saturating_sub(report.moved_counts.get(scenario_type));
                if remaining == 0 {
                    debug!("Scenario type '{scenario_type}' reached its move limit");
                }
                remaining > 0
            })
            .map(str::to_owned)
            .collect::<Vec<_>>();
        if wanted.is_empty() {
            continue;
        }

        let Some(file_name) = db.file_name() else {
            continue;
        };
        let target = plan.target_dir.join(file_name);
        if target.exists() {
            info!(
                "File {} already exists in {}, skipping",
                file_name.to_string_lossy(),
                plan.target_dir.display()
            );
            report.skipped_existing.push(db);
            continue;
        }
        move_file(&db, &target)?;
        info!("Moved {} to {}", db.display(), target.display());
        for scenario_type in wanted {
            report.moved_counts.add(scenario_type, 1);
        }
        report.moved.push(target);
    }
    Ok(report)
}

fn move_file(from: &Path, to: &Path) -> Result<(), DbError> {
    let to_err = |source| DbError::Move {
        from: from.to_owned(),
        to: to.to_owned(),
        source,
    };
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    // rename fails across file systems
    fs::copy(from, to).map_err(to_err)?;
    fs::remove_file(from).map_err(to_err)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Creates a log database with one lidar_pc row per tag.
    pub(crate) fn create_log_db(path: &Path, tags: &[(&str, &[u8])]) {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch(
            "CREATE TABLE lidar_pc (token BLOB PRIMARY KEY);
             CREATE TABLE scenario_tag (
                 token BLOB PRIMARY KEY,
                 lidar_pc_token BLOB,
                 type TEXT
             );",
        )
        .unwrap();
        for (i, (scenario_type, lidar_token)) in tags.iter().enumerate() {
            let tag_token = vec![0xa0, u8::try_from(i).unwrap()];
            conn.execute(
                "INSERT INTO lidar_pc (token) VALUES (?1)",
                rusqlite::params![lidar_token],
            )
            .unwrap();
            conn.execute(
                "INSERT INTO scenario_tag (token, lidar_pc_token, type) VALUES (?1, ?2, ?3)",
                rusqlite::params![tag_token, lidar_token, scenario_type],
            )
            .unwrap();
        }
    }

    #[test]
    fn test_scenario_tokens_and_counts() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("log.db");
        create_log_db(
            &db,
            &[
                ("on_carpark", &[0x01]),
                ("on_carpark", &[0x02]),
                ("behind_bike", &[0xff]),
            ],
        );

        let tokens = scenario_tokens(&db).unwrap();
        let mut carpark = tokens["on_carpark"].clone();
        carpark.sort();
        assert_eq!(carpark, vec!["a000", "a001"]);
        assert_eq!(tokens["behind_bike"], vec!["a002"]);

        let counts = scenario_type_counts(&db).unwrap();
        assert_eq!(counts.get("on_carpark"), 2);
        assert_eq!(counts.get("behind_bike"), 1);
    }

    #[test]
    fn test_lidar_pc_tokens_sorted_by_type() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("log.db");
        create_log_db(&db, &[("z_type", &[0x10]), ("a_type", &[0x20])]);
        let pairs = lidar_pc_tokens_with_scenario_tag(&db).unwrap();
        assert_eq!(
            pairs,
            vec![
                ("a_type".to_owned(), "20".to_owned()),
                ("z_type".to_owned(), "10".to_owned())
            ]
        );

        let map = scenario_type_token_map(&[&db]).unwrap();
        assert_eq!(map["a_type"], vec![(db.clone(), "20".to_owned())]);
    }

    #[test]
    fn test_aggregate_skips_non_db_entries() {
        let dir = tempfile::tempdir().unwrap();
        create_log_db(&dir.path().join("a.db"), &[("x", &[1]), ("y", &[2])]);
        create_log_db(&dir.path().join("b.db"), &[("x", &[3])]);
        fs::write(dir.path().join("notes.txt"), "not a db").unwrap();
        fs::create_dir(dir.path().join("sub.db")).unwrap();

        let files = list_db_files(dir.path()).unwrap();
        assert_eq!(files.len(), 2);

        let counts = aggregate_scenario_counts(dir.path()).unwrap();
        assert_eq!(counts.get("x"), 2);
        assert_eq!(counts.get("y"), 1);

        let by_db = scenario_tokens_by_db(dir.path()).unwrap();
        assert_eq!(by_db.keys().collect::<Vec<_>>(), ["a.db", "b.db"]);
    }

    #[test]
    fn test_missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = aggregate_scenario_counts(&dir.path().join("missing"));
        assert!(matches!(result, Err(DbError::ReadDir { .. })));
    }

    #[test]
    fn test_unreadable_database_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("broken.db");
        fs::write(&db, "definitely not sqlite").unwrap();
        assert!(scenario_type_counts(&db).is_err());
    }

    #[test]
    fn test_relocate_respects_quota() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("trainval");
        let target = dir.path().join("resample");
        fs::create_dir(&source).unwrap();
        create_log_db(&source.join("1.db"), &[("rare", &[1])]);
        create_log_db(&source.join("2.db"), &[("rare", &[2])]);
        create_log_db(&source.join("3.db"), &[("common", &[3])]);

        let plan = RelocationPlan {
            source_dir: source.clone(),
            target_dir: target.clone(),
            existing_counts: [("rare", 499)].into_iter().collect(),
            max_per_type: 500,
        };
        let report = relocate_databases(&plan).unwrap();

        assert_eq!(report.moved, vec![target.join("1.db")]);
        assert_eq!(report.moved_counts.get("rare"), 1);
        assert!(target.join("1.db").exists());
        assert!(!source.join("1.db").exists());
        assert!(source.join("2.db").exists());
        assert!(source.join("3.db").exists());
    }

    #[test]
    fn test_relocate_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("src");
        let target = dir.path().join("dst");
        fs::create_dir(&source).unwrap();
        fs::create_dir(&target).unwrap();
        create_log_db(&source.join("1.db"), &[("rare", &[1])]);
        fs::write(target.join("1.db"), "existing").unwrap();

        let plan = RelocationPlan {
            source_dir: source.clone(),
            target_dir: target.clone(),
            existing_counts: [("rare", 0)].into_iter().collect(),
            max_per_type: DEFAULT_MAX_PER_TYPE,
        };
        let report = relocate_databases(&plan).unwrap();
        assert!(report.moved.is_empty());
        assert_eq!(report.skipped_existing, vec![source.join("1.db")]);
        assert_eq!(fs::read_to_string(target.join("1.db")).unwrap(), "existing");
        assert!(source.join("1.db").exists());
        assert_eq!(report.moved_counts.get("rare"), 0);
    }
}
