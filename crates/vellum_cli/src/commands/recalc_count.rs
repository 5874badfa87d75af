//! Recalculate-count command implementation.

use super::{open_engine, print_json, CliResult, Format};
use serde::Serialize;
use std::path::Path;
use vellum_core::{CatalogService, Config};

/// Count before and after for one collection.
#[derive(Debug, Serialize)]
pub struct RecountResult {
    /// Database name.
    pub database: String,
    /// Collection name.
    pub collection: String,
    /// Count before recalculation.
    pub before: u64,
    /// Exact count.
    pub after: u64,
}

/// Runs the recalc-count command.
///
/// Without `database`, every database is recounted; without `collection`,
/// every collection of the chosen databases.
pub fn run(
    path: &Path,
    database: Option<&str>,
    collection: Option<&str>,
    format: Format,
) -> CliResult<()> {
    let service = open_engine(path, Config::default())?;
    let results = recount(&service, database, collection)?;
    service.close()?;

    match format {
        Format::Json => print_json(&results)?,
        Format::Text => {
            for r in &results {
                let note = if r.before == r.after { "" } else { " (fixed)" };
                println!(
                    "{}/{}: {} -> {}{note}",
                    r.database, r.collection, r.before, r.after
                );
            }
        }
    }
    Ok(())
}

/// Recounts the selected collections.
pub fn recount(
    service: &CatalogService,
    database: Option<&str>,
    collection: Option<&str>,
) -> CliResult<Vec<RecountResult>> {
    let databases = match database {
        Some(name) => vec![name.to_string()],
        None => service.databases(),
    };

    let mut results = Vec::new();
    for db_name in databases {
        let db = service.database(&db_name)?;
        let collections = match collection {
            Some(name) => vec![name.to_string()],
            None => db.collections(),
        };
        for name in collections {
            let c = db.collection(&name)?;
            let before = c.count();
            let after = c.recalculate_count()?;
            tracing::debug!(database = %db_name, collection = %name, before, after, "recounted");
            results.push(RecountResult {
                database: db_name.clone(),
                collection: name,
                before,
                after,
            });
        }
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use vellum_core::CollectionOptions;

    #[test]
    fn recount_reports_every_collection() {
        let service = CatalogService::open_in_memory(Config::default()).unwrap();
        let db = service.system().unwrap();
        let a = db.create_collection("a", CollectionOptions::default()).unwrap();
        db.create_collection("b", CollectionOptions::default()).unwrap();
        a.insert(json!({"_key": "x"})).unwrap();

        let results = recount(&service, Some("_system"), None).unwrap();
        let a = results.iter().find(|r| r.collection == "a").unwrap();
        assert_eq!((a.before, a.after), (1, 1));
        assert!(results.iter().any(|r| r.collection == "b" && r.after == 0));

        assert!(recount(&service, Some("missing"), None).is_err());
    }
}
