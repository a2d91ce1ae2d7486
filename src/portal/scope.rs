//! Scope identifiers narrowing a query to one building, housing unit or occupant.

use std::fmt;

/// A usable scope id.
///
/// Empty ids and numeric zero never make it into a `ScopeId`; callers hold an
/// `Option<ScopeId>` and `None` means "disabled".
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(String);

impl ScopeId {
  pub fn new(raw: impl AsRef<str>) -> Option<Self> {
    let trimmed = raw.as_ref().trim();
    if trimmed.is_empty() || is_numeric_zero(trimmed) {
      return None;
    }
    Some(Self(trimmed.to_string()))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

fn is_numeric_zero(s: &str) -> bool {
  s.parse::<f64>().map(|n| n == 0.0).unwrap_or(false)
}

impl fmt::Display for ScopeId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Parent a query is scoped to. The variant picks the URL domain segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
  Building(ScopeId),
  HousingUnit(ScopeId),
  Occupant(ScopeId),
}

impl Scope {
  pub fn domain(&self) -> &'static str {
    match self {
      Self::Building(_) => "immeuble",
      Self::HousingUnit(_) => "logement",
      Self::Occupant(_) => "occupant",
    }
  }

  pub fn id(&self) -> &ScopeId {
    match self {
      Self::Building(id) | Self::HousingUnit(id) | Self::Occupant(id) => id,
    }
  }

  /// Tag shared by every cache key under this scope.
  pub fn tag(&self) -> String {
    format!("{}:{}", self.domain(), self.id())
  }
}

impl fmt::Display for Scope {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} {}", self.domain(), self.id())
  }
}
