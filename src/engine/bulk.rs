//! Whole-store operations: export, import, reset and integrity repair.

use std::mem;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::info;

use super::CirculationEngine;
use crate::{
    error::{CirculationError, CirculationResult},
    events::ActivityAction,
    persistence::{StorageError, hydrate_dates},
    store::{Collections, EntityKind, IntegrityIssue, RepairReport, Store},
};

/// Format version written into export bundles
pub const EXPORT_VERSION: &str = "1.0";

/// Collections an import payload must carry
const REQUIRED_COLLECTIONS: [EntityKind; 3] =
    [EntityKind::Readers, EntityKind::Books, EntityKind::BorrowRecords];

/// What an import loaded
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    /// Readers imported
    pub readers: usize,
    /// Books imported
    pub books: usize,
    /// Borrow records imported
    pub borrow_records: usize,
    /// Categories imported
    pub categories: usize,
    /// Authors imported
    pub authors: usize,
    /// Publishers imported
    pub publishers: usize,
    /// Fines imported
    pub fines: usize,
    /// Renewals imported
    pub renewals: usize,
    /// Reservations imported
    pub reservations: usize,
    /// Orphans dropped while loading
    pub repair: RepairReport,
}

impl ImportSummary {
    /// Record counts of a freshly imported store
    fn new(store: &Store, repair: RepairReport) -> Self {
        Self {
            readers: store.readers.len(),
            books: store.books.len(),
            borrow_records: store.borrow_records.len(),
            categories: store.categories.len(),
            authors: store.authors.len(),
            publishers: store.publishers.len(),
            fines: store.fines.len(),
            renewals: store.renewals.len(),
            reservations: store.reservations.len(),
            repair,
        }
    }
}

/// The export file layout
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExportBundle {
    /// Every record collection
    #[serde(flatten)]
    collections: Collections,
    /// When the bundle was written
    export_date: DateTime<Utc>,
    /// Layout version
    version: &'static str,
}

/// Validate and decode an import payload into a repaired store
fn decode_import(payload: &str) -> CirculationResult<(Store, RepairReport)> {
    let invalid = CirculationError::InvalidImport;
    let mut root: Value =
        serde_json::from_str(payload).map_err(|e| invalid(format!("not valid JSON: {e}")))?;
    let Some(object) = root.as_object_mut() else {
        return Err(invalid("expected a JSON object".into()));
    };

    for kind in REQUIRED_COLLECTIONS {
        if !object.get(kind.key()).is_some_and(Value::is_array) {
            return Err(invalid(format!("missing {} array", kind.key())));
        }
    }
    for kind in EntityKind::ALL {
        let Some(items) = object.get_mut(kind.key()) else {
            continue;
        };
        if items.is_null() {
            *items = Value::Array(Vec::new());
        }
        hydrate_dates(kind, items).map_err(invalid)?;
    }

    let collections: Collections =
        serde_json::from_value(root).map_err(|e| invalid(format!("malformed record: {e}")))?;
    let mut store = Store::from(collections);
    let repair = store.repair();
    Ok((store, repair))
}

impl CirculationEngine {
    /// Serialize every collection into a pretty-printed JSON bundle.
    ///
    /// # Errors
    ///
    /// Returns `Storage` when serializing or logging the export fails.
    pub fn export_json(&mut self) -> CirculationResult<String> {
        let bundle = ExportBundle {
            collections: Collections::from(&self.store),
            export_date: self.clock.now(),
            version: EXPORT_VERSION,
        };
        let json = serde_json::to_string_pretty(&bundle)
            .map_err(|source| StorageError::Json { key: "export".into(), source })?;

        let counts = ImportSummary::new(&self.store, RepairReport::default());
        self.transact(|txn| {
            txn.log(
                ActivityAction::ExportData,
                "Exported library data".into(),
                json!({ "bytes": json.len(), "counts": counts }),
            );
            Ok(())
        })?;
        Ok(json)
    }

    /// Replace the whole store with the contents of an export bundle.
    ///
    /// The payload must be an object with `readers`, `books` and
    /// `borrowRecords` arrays; other collections default to empty. Date
    /// fields may be RFC 3339 or plain `YYYY-MM-DD`. Orphaned records are
    /// dropped and every counter re-derived before the store is swapped in.
    /// The activity log is kept.
    ///
    /// # Errors
    ///
    /// Returns `InvalidImport` without touching the store when the payload
    /// is malformed, or `Storage` when the new store cannot be persisted.
    pub fn import_data(&mut self, payload: &str) -> CirculationResult<ImportSummary> {
        let (imported, repair) = decode_import(payload)?;
        let summary = ImportSummary::new(&imported, repair);

        self.transact(|txn| {
            let activities = mem::take(&mut txn.store.activities);
            *txn.store = imported;
            txn.store.activities = activities;
            txn.log(
                ActivityAction::ImportData,
                format!(
                    "Imported {} readers, {} books and {} borrow records",
                    summary.readers, summary.books, summary.borrow_records
                ),
                json!(summary),
            );
            Ok(())
        })?;
        info!(?summary, "library data imported");
        Ok(summary)
    }

    /// Clear every collection and the activity log.
    ///
    /// # Errors
    ///
    /// Returns `Storage` when the empty store cannot be persisted.
    pub fn reset_data(&mut self) -> CirculationResult<()> {
        self.transact(|txn| {
            *txn.store = Store::default();
            txn.log(ActivityAction::ResetData, "Reset all library data".into(), Value::Null);
            Ok(())
        })?;
        info!("library data reset");
        Ok(())
    }

    /// List integrity problems without changing anything
    #[must_use]
    pub fn check_integrity(&self) -> Vec<IntegrityIssue> {
        self.store.integrity_issues()
    }

    /// Drop orphaned records and re-derive every counter.
    ///
    /// # Errors
    ///
    /// Returns `Storage` when the repaired store cannot be persisted.
    pub fn repair_integrity(&mut self) -> CirculationResult<RepairReport> {
        self.transact(|txn| {
            let report = txn.store.repair();
            txn.log(
                ActivityAction::RepairData,
                "Repaired data integrity".into(),
                json!(report),
            );
            Ok(report)
        })
    }
}
