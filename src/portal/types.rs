//! Canonical domain types. Wire payloads are normalized into these once, in
//! `api_types`; nothing downstream sees the backend's field casings.

use serde::{Deserialize, Serialize};

/// Building (immeuble)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Building {
  pub id: String,
  pub name: String,
  pub address: String,
  pub city: String,
  pub housing_unit_count: Option<u32>,
  /// Meters are read remotely (télérelève)
  pub remote_reading: bool,
}

/// Housing unit (logement)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HousingUnit {
  pub id: String,
  pub building_id: Option<String>,
  pub reference: String,
  pub floor: Option<String>,
  pub occupant_name: Option<String>,
  pub remote_reading: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Occupant {
  pub id: String,
  pub housing_unit_id: Option<String>,
  pub name: String,
  pub email: Option<String>,
  pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
  pub id: String,
  pub device: String,
  pub label: String,
  pub detected_at: Option<String>,
  pub status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Leak {
  pub id: String,
  pub device: String,
  pub started_at: Option<String>,
  pub volume_litres: Option<f64>,
  pub resolved: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Malfunction {
  pub id: String,
  pub device: String,
  pub label: String,
  pub reported_at: Option<String>,
  pub resolved: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intervention {
  pub id: String,
  pub date: Option<String>,
  pub kind: String,
  pub technician: Option<String>,
  pub status: Option<String>,
  /// A PDF report can be downloaded
  pub has_report: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
  pub id: String,
  pub number: String,
  pub issued_at: Option<String>,
  pub amount: f64,
  pub paid: bool,
}

/// Property manager (gestionnaire)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operator {
  pub id: String,
  pub name: String,
  pub email: Option<String>,
  pub phone: Option<String>,
}
