//! CSV and PDF downloads.
//!
//! Exports never touch the query cache: every call is a fresh binary GET whose
//! body lands in the export directory under a deterministic name.

use chrono::{Local, NaiveDate};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{PortalError, PortalResult};
use crate::portal::{EntityKind, PortalQueryKey, Scope, ScopeId, Transport};

/// `export-<entity>.csv`
pub fn listing_file_name(entity: EntityKind) -> String {
  format!("export-{}.csv", entity.name())
}

/// `releve-intervention-<id>-<DD-MM-YYYY>.pdf`
pub fn report_file_name(id: &ScopeId, date: NaiveDate) -> String {
  format!("releve-intervention-{}-{}.pdf", id, date.format("%d-%m-%Y"))
}

pub struct Exporter {
  transport: Arc<dyn Transport>,
  directory: PathBuf,
}

impl Exporter {
  pub fn new(transport: Arc<dyn Transport>, directory: impl Into<PathBuf>) -> Self {
    Self {
      transport,
      directory: directory.into(),
    }
  }

  pub fn directory(&self) -> &Path {
    &self.directory
  }

  /// Download a listing as CSV. Returns the written file.
  ///
  /// An absent scope fails with `ScopeMissing` before any request is made.
  pub async fn export_listing(
    &self,
    entity: EntityKind,
    scope: Option<&Scope>,
    filter: Option<&str>,
  ) -> PortalResult<PathBuf> {
    let what = entity.name();
    if !entity.is_exportable() {
      return Err(PortalError::Export {
        what: what.to_string(),
        reason: "no CSV export for this entity".to_string(),
      });
    }
    let scope = scope.ok_or_else(|| PortalError::scope_missing(what))?;

    let key = PortalQueryKey::new(entity, scope.clone(), filter);
    let path = format!("{}/export", key.path());

    self
      .download(&path, &key.params(), &listing_file_name(entity))
      .await
      .map_err(|e| PortalError::export(what, &e))
  }

  /// Download the PDF report of one intervention, dated today.
  pub async fn export_intervention_report(&self, id: Option<&ScopeId>) -> PortalResult<PathBuf> {
    let id = id.ok_or_else(|| PortalError::scope_missing("Intervention"))?;
    let path = format!("/intervention/{}/releve", id);
    let file_name = report_file_name(id, Local::now().date_naive());

    self
      .download(&path, &[], &file_name)
      .await
      .map_err(|e| PortalError::export("intervention report", &e))
  }

  async fn download(
    &self,
    path: &str,
    params: &[(&'static str, String)],
    file_name: &str,
  ) -> PortalResult<PathBuf> {
    let download = self.transport.get_bytes(path, params).await?;
    let target = self.save(file_name, &download.bytes)?;

    info!(
      path,
      file = %target.display(),
      bytes = download.bytes.len(),
      content_type = download.content_type.as_deref().unwrap_or("unknown"),
      "Export saved"
    );
    Ok(target)
  }

  /// Write to a temp file next to the target, then rename into place. The temp
  /// file is removed on drop if anything fails.
  fn save(&self, file_name: &str, bytes: &[u8]) -> PortalResult<PathBuf> {
    std::fs::create_dir_all(&self.directory)?;

    let mut file = tempfile::Builder::new()
      .prefix(".download-")
      .tempfile_in(&self.directory)?;
    file.write_all(bytes)?;
    file.flush()?;

    let target = self.directory.join(file_name);
    file.persist(&target).map_err(|e| {
      warn!(file = %target.display(), "Failed to move download into place: {}", e.error);
      PortalError::from(e.error)
    })?;
    Ok(target)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::UpstreamError;
  use crate::portal::testing::FakeTransport;

  fn unit(id: &str) -> Scope {
    Scope::HousingUnit(ScopeId::new(id).unwrap())
  }

  fn entries(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
      .unwrap()
      .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
      .collect();
    names.sort();
    names
  }

  #[tokio::test]
  async fn test_listing_export_writes_named_file() {
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(FakeTransport::new().with_bytes(
      "/logement/12/anomalies/export",
      b"id;appareil\n1;EF\n",
      "text/csv",
    ));
    let exporter = Exporter::new(transport.clone(), dir.path());

    let path = exporter
      .export_listing(EntityKind::Anomalies, Some(&unit("12")), Some("EF"))
      .await
      .unwrap();

    assert_eq!(path, dir.path().join("export-anomalies.csv"));
    assert_eq!(std::fs::read(&path).unwrap(), b"id;appareil\n1;EF\n");
    assert_eq!(entries(dir.path()), vec!["export-anomalies.csv"]);
    assert_eq!(
      transport.requests(),
      vec!["/logement/12/anomalies/export?appareil=EF"]
    );
  }

  #[tokio::test]
  async fn test_exports_are_never_cached() {
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(FakeTransport::new().with_bytes(
      "/immeuble/3/factures/export",
      b"x",
      "text/csv",
    ));
    let exporter = Exporter::new(transport.clone(), dir.path());
    let scope = Scope::Building(ScopeId::new("3").unwrap());

    for _ in 0..2 {
      exporter
        .export_listing(EntityKind::Invoices, Some(&scope), None)
        .await
        .unwrap();
    }
    assert_eq!(transport.calls(), 2);
  }

  #[tokio::test]
  async fn test_missing_scope_rejects_before_network() {
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(FakeTransport::new());
    let exporter = Exporter::new(transport.clone(), dir.path());

    let err = exporter
      .export_listing(EntityKind::Leaks, None, None)
      .await
      .unwrap_err();

    assert!(err.is_scope_missing());
    assert!(err.to_string().contains("required"));
    assert_eq!(transport.calls(), 0);

    let err = exporter.export_intervention_report(None).await.unwrap_err();
    assert!(err.is_scope_missing());
    assert_eq!(transport.calls(), 0);
  }

  #[tokio::test]
  async fn test_non_exportable_entity_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(FakeTransport::new());
    let exporter = Exporter::new(transport.clone(), dir.path());

    let err = exporter
      .export_listing(EntityKind::Building, Some(&unit("1")), None)
      .await
      .unwrap_err();

    assert!(matches!(err, PortalError::Export { .. }));
    assert_eq!(transport.calls(), 0);
  }

  #[tokio::test]
  async fn test_upstream_failure_is_aggregated() {
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(FakeTransport::new().with_error(
      "/logement/12/pannes/export",
      UpstreamError::Server {
        status: 500,
        reason: "Internal server error".into(),
      },
    ));
    let exporter = Exporter::new(transport, dir.path());

    let err = exporter
      .export_listing(EntityKind::Malfunctions, Some(&unit("12")), None)
      .await
      .unwrap_err();

    assert_eq!(
      err.to_string(),
      "Failed to export malfunctions: Server error (500): Internal server error"
    );
    assert!(entries(dir.path()).is_empty());
  }

  #[tokio::test]
  async fn test_failed_save_leaves_no_temp_file() {
    let dir = tempfile::tempdir().unwrap();
    // A non-empty directory squatting on the target name makes the rename fail
    let blocker = dir.path().join("export-leaks.csv");
    std::fs::create_dir(&blocker).unwrap();
    std::fs::write(blocker.join("keep"), b"").unwrap();

    let transport = Arc::new(FakeTransport::new().with_bytes(
      "/logement/12/fuites/export",
      b"data",
      "text/csv",
    ));
    let exporter = Exporter::new(transport, dir.path());

    let err = exporter
      .export_listing(EntityKind::Leaks, Some(&unit("12")), None)
      .await
      .unwrap_err();

    assert!(err.to_string().starts_with("Failed to export leaks:"));
    assert_eq!(entries(dir.path()), vec!["export-leaks.csv"]);
  }

  #[tokio::test]
  async fn test_intervention_report_is_dated() {
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(FakeTransport::new().with_bytes(
      "/intervention/77/releve",
      b"%PDF-1.4",
      "application/pdf",
    ));
    let exporter = Exporter::new(transport, dir.path());
    let id = ScopeId::new("77").unwrap();

    let path = exporter.export_intervention_report(Some(&id)).await.unwrap();

    let name = path.file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.starts_with("releve-intervention-77-"));
    assert!(name.ends_with(".pdf"));
    assert_eq!(std::fs::read(&path).unwrap(), b"%PDF-1.4");
  }

  #[test]
  fn test_file_names() {
    assert_eq!(listing_file_name(EntityKind::HousingUnits), "export-housing-units.csv");
    let date = NaiveDate::from_ymd_opt(2024, 3, 7).unwrap();
    assert_eq!(
      report_file_name(&ScopeId::new("5").unwrap(), date),
      "releve-intervention-5-07-03-2024.pdf"
    );
  }
}
