//! Query keys for portal API calls.

use sha2::{Digest, Sha256};
use std::fmt;

use crate::cache::QueryKey;

use super::scope::{Scope, ScopeId};

/// Entity type a query returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
  Building,
  HousingUnit,
  Occupant,
  HousingUnits,
  Occupants,
  Anomalies,
  Leaks,
  Malfunctions,
  Interventions,
  Invoices,
  Operators,
}

impl EntityKind {
  pub const LISTINGS: [EntityKind; 8] = [
    EntityKind::HousingUnits,
    EntityKind::Occupants,
    EntityKind::Anomalies,
    EntityKind::Leaks,
    EntityKind::Malfunctions,
    EntityKind::Interventions,
    EntityKind::Invoices,
    EntityKind::Operators,
  ];

  /// Stable name used in hashes, logs and export file names.
  pub fn name(self) -> &'static str {
    match self {
      Self::Building => "building",
      Self::HousingUnit => "housing-unit",
      Self::Occupant => "occupant",
      Self::HousingUnits => "housing-units",
      Self::Occupants => "occupants",
      Self::Anomalies => "anomalies",
      Self::Leaks => "leaks",
      Self::Malfunctions => "malfunctions",
      Self::Interventions => "interventions",
      Self::Invoices => "invoices",
      Self::Operators => "operators",
    }
  }

  /// URL segment under the scope, `None` for single records.
  pub fn segment(self) -> Option<&'static str> {
    match self {
      Self::Building | Self::HousingUnit | Self::Occupant => None,
      Self::HousingUnits => Some("logements"),
      Self::Occupants => Some("occupants"),
      Self::Anomalies => Some("anomalies"),
      Self::Leaks => Some("fuites"),
      Self::Malfunctions => Some("pannes"),
      Self::Interventions => Some("interventions"),
      Self::Invoices => Some("factures"),
      Self::Operators => Some("gestionnaires"),
    }
  }

  /// Listings the backend can export as CSV.
  pub fn is_exportable(self) -> bool {
    !matches!(
      self,
      Self::Building | Self::HousingUnit | Self::Occupant | Self::Operators
    )
  }

  /// Parse a CLI name: the English name or the URL segment.
  pub fn parse(raw: &str) -> Option<Self> {
    let raw = raw.trim().to_lowercase();
    [
      Self::Building,
      Self::HousingUnit,
      Self::Occupant,
    ]
    .into_iter()
    .chain(Self::LISTINGS)
    .find(|kind| kind.name() == raw || kind.segment() == Some(raw.as_str()))
  }
}

impl fmt::Display for EntityKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

/// Composite identity of a portal query: entity, scope and optional device filter.
///
/// Equality is structural; equal keys hash to the same cache slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PortalQueryKey {
  entity: EntityKind,
  scope: Scope,
  filter: Option<String>,
}

impl PortalQueryKey {
  /// Listing key. A blank filter is the same as no filter.
  pub fn new(entity: EntityKind, scope: Scope, filter: Option<&str>) -> Self {
    let filter = filter
      .map(str::trim)
      .filter(|f| !f.is_empty())
      .map(String::from);
    Self {
      entity,
      scope,
      filter,
    }
  }

  pub fn building(id: ScopeId) -> Self {
    Self::new(EntityKind::Building, Scope::Building(id), None)
  }

  pub fn housing_unit(id: ScopeId) -> Self {
    Self::new(EntityKind::HousingUnit, Scope::HousingUnit(id), None)
  }

  pub fn occupant(id: ScopeId) -> Self {
    Self::new(EntityKind::Occupant, Scope::Occupant(id), None)
  }

  pub fn entity(&self) -> EntityKind {
    self.entity
  }

  pub fn scope(&self) -> &Scope {
    &self.scope
  }

  pub fn filter(&self) -> Option<&str> {
    self.filter.as_deref()
  }

  /// `/{domain}/{id}` for records, `/{domain}/{id}/{segment}` for listings.
  pub fn path(&self) -> String {
    let base = format!("/{}/{}", self.scope.domain(), self.scope.id());
    match self.entity.segment() {
      Some(segment) => format!("{}/{}", base, segment),
      None => base,
    }
  }

  pub fn params(&self) -> Vec<(&'static str, String)> {
    self
      .filter
      .as_ref()
      .map(|f| vec![("appareil", f.clone())])
      .unwrap_or_default()
  }
}

impl QueryKey for PortalQueryKey {
  fn cache_hash(&self) -> String {
    let input = format!(
      "{}:{}:{}:{}",
      self.entity.name(),
      self.scope.domain(),
      self.scope.id(),
      self.filter.as_deref().unwrap_or("")
    );

    // SHA256 hash for stable, fixed-length keys
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
  }

  fn description(&self) -> String {
    match &self.filter {
      Some(f) => format!("{} for {} (appareil {})", self.entity, self.scope, f),
      None => format!("{} for {}", self.entity, self.scope),
    }
  }

  fn tags(&self) -> Vec<String> {
    vec![self.scope.tag(), format!("entity:{}", self.entity.name())]
  }
}
