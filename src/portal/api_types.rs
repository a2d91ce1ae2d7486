//! Serde-deserializable types matching the portal API responses.
//!
//! The backend is inconsistent about casing (`HasTelereleve` on one endpoint,
//! `hasTelereleve` on another, sometimes both in one object) and about id
//! types (numbers or strings). `decode` folds every field name to its
//! camelCase spelling before serde sees it, keeping the first non-null value
//! when two spellings collide. `Normalize` then turns each payload into its
//! canonical type in `types`.

use serde::{de::DeserializeOwned, Deserialize, Deserializer};
use serde_json::{Map, Value};

use super::types::{
  Anomaly, Building, HousingUnit, Intervention, Invoice, Leak, Malfunction, Occupant, Operator,
};

/// Conversion from a wire payload to its canonical type.
pub trait Normalize {
  type Output;

  /// Alternate field names, as `(alternate, camelCase field)`, folded before decoding.
  const SYNONYMS: &'static [(&'static str, &'static str)] = &[];

  fn normalize(self) -> Self::Output;
}

impl<N: Normalize> Normalize for Vec<N> {
  type Output = Vec<N::Output>;

  const SYNONYMS: &'static [(&'static str, &'static str)] = N::SYNONYMS;

  fn normalize(self) -> Self::Output {
    self.into_iter().map(Normalize::normalize).collect()
  }
}

/// Decode a payload (one object or a list of them) after folding field spellings.
pub fn decode<A>(value: Value) -> serde_json::Result<A>
where
  A: DeserializeOwned + Normalize,
{
  serde_json::from_value(fold_fields(value, A::SYNONYMS))
}

fn fold_fields(value: Value, synonyms: &[(&str, &str)]) -> Value {
  match value {
    Value::Array(items) => Value::Array(
      items
        .into_iter()
        .map(|item| fold_fields(item, synonyms))
        .collect(),
    ),
    Value::Object(map) => {
      let mut folded = Map::with_capacity(map.len());
      for (key, value) in map {
        let key = canonical_field(&key, synonyms);
        match folded.get(&key) {
          Some(existing) if !existing.is_null() => {}
          _ => {
            folded.insert(key, value);
          }
        }
      }
      Value::Object(folded)
    }
    other => other,
  }
}

fn canonical_field(key: &str, synonyms: &[(&str, &str)]) -> String {
  let mut chars = key.chars();
  let camel = match chars.next() {
    Some(first) => first.to_lowercase().chain(chars).collect(),
    None => String::new(),
  };
  synonyms
    .iter()
    .find(|(alternate, _)| *alternate == camel)
    .map(|(_, field)| field.to_string())
    .unwrap_or(camel)
}

/// Every JSON endpoint answers `{ "data": ... }`.
#[derive(Debug, Deserialize)]
pub struct ApiEnvelope<T> {
  pub data: T,
}

// ============================================================================
// Lenient scalar decoding
// ============================================================================

/// Ids arrive as numbers or strings.
fn id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
  match Value::deserialize(deserializer)? {
    Value::String(s) => Ok(s),
    Value::Number(n) => Ok(n.to_string()),
    other => Err(serde::de::Error::custom(format!(
      "expected string or number id, got {}",
      other
    ))),
  }
}

fn optional_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
  match Value::deserialize(deserializer)? {
    Value::Null => Ok(None),
    Value::String(s) if s.is_empty() => Ok(None),
    Value::String(s) => Ok(Some(s)),
    Value::Number(n) => Ok(Some(n.to_string())),
    other => Err(serde::de::Error::custom(format!(
      "expected string or number id, got {}",
      other
    ))),
  }
}

/// Flags arrive as booleans, 0/1, or "true"/"false"/"1"/"0".
fn flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
  Ok(match Value::deserialize(deserializer)? {
    Value::Bool(b) => b,
    Value::Number(n) => n.as_f64().map(|v| v != 0.0).unwrap_or(false),
    Value::String(s) => matches!(s.trim().to_lowercase().as_str(), "true" | "1" | "oui"),
    _ => false,
  })
}

/// Amounts arrive as numbers or decimal strings, sometimes with a comma.
fn amount<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
  match Value::deserialize(deserializer)? {
    Value::Number(n) => Ok(n.as_f64().unwrap_or_default()),
    Value::String(s) => s
      .trim()
      .replace(',', ".")
      .parse()
      .map_err(|_| serde::de::Error::custom(format!("invalid amount {:?}", s))),
    Value::Null => Ok(0.0),
    other => Err(serde::de::Error::custom(format!("invalid amount {}", other))),
  }
}

fn optional_amount<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
  match Value::deserialize(deserializer)? {
    Value::Null => Ok(None),
    Value::Number(n) => Ok(n.as_f64()),
    Value::String(s) if s.trim().is_empty() => Ok(None),
    Value::String(s) => s
      .trim()
      .replace(',', ".")
      .parse()
      .map(Some)
      .map_err(|_| serde::de::Error::custom(format!("invalid amount {:?}", s))),
    other => Err(serde::de::Error::custom(format!("invalid amount {}", other))),
  }
}

// ============================================================================
// Entity payloads
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiBuilding {
  #[serde(rename = "pkImmeuble", deserialize_with = "id")]
  pub pk: String,
  #[serde(rename = "nom", default)]
  pub name: String,
  #[serde(rename = "adresse", default)]
  pub address: String,
  #[serde(rename = "ville", default)]
  pub city: String,
  #[serde(rename = "nbLogements", default)]
  pub housing_unit_count: Option<u32>,
  #[serde(rename = "hasTelereleve", default, deserialize_with = "flag")]
  pub has_telereleve: bool,
}

impl Normalize for ApiBuilding {
  type Output = Building;

  const SYNONYMS: &'static [(&'static str, &'static str)] = &[("id", "pkImmeuble")];

  fn normalize(self) -> Building {
    Building {
      id: self.pk,
      name: self.name,
      address: self.address,
      city: self.city,
      housing_unit_count: self.housing_unit_count,
      remote_reading: self.has_telereleve,
    }
  }
}

#[derive(Debug, Deserialize)]
pub struct ApiHousingUnit {
  #[serde(rename = "pkLogement", deserialize_with = "id")]
  pub pk: String,
  #[serde(rename = "fkImmeuble", default, deserialize_with = "optional_id")]
  pub fk_immeuble: Option<String>,
  #[serde(rename = "reference", default)]
  pub reference: String,
  #[serde(rename = "etage", default, deserialize_with = "optional_id")]
  pub floor: Option<String>,
  #[serde(rename = "occupant", default)]
  pub occupant_name: Option<String>,
  #[serde(rename = "hasTelereleve", default, deserialize_with = "flag")]
  pub has_telereleve: bool,
}

impl Normalize for ApiHousingUnit {
  type Output = HousingUnit;

  const SYNONYMS: &'static [(&'static str, &'static str)] = &[
    ("id", "pkLogement"),
    ("numero", "reference"),
    ("nomOccupant", "occupant"),
  ];

  fn normalize(self) -> HousingUnit {
    HousingUnit {
      id: self.pk,
      building_id: self.fk_immeuble,
      reference: self.reference,
      floor: self.floor,
      occupant_name: self.occupant_name.filter(|n| !n.trim().is_empty()),
      remote_reading: self.has_telereleve,
    }
  }
}

#[derive(Debug, Deserialize)]
pub struct ApiOccupant {
  #[serde(rename = "pkOccupant", deserialize_with = "id")]
  pub pk: String,
  #[serde(rename = "fkLogement", default, deserialize_with = "optional_id")]
  pub fk_logement: Option<String>,
  #[serde(rename = "nom", default)]
  pub name: String,
  #[serde(rename = "email", default)]
  pub email: Option<String>,
  #[serde(rename = "telephone", default)]
  pub phone: Option<String>,
}

impl Normalize for ApiOccupant {
  type Output = Occupant;

  const SYNONYMS: &'static [(&'static str, &'static str)] = &[("id", "pkOccupant")];

  fn normalize(self) -> Occupant {
    Occupant {
      id: self.pk,
      housing_unit_id: self.fk_logement,
      name: self.name,
      email: self.email,
      phone: self.phone,
    }
  }
}

#[derive(Debug, Deserialize)]
pub struct ApiAnomaly {
  #[serde(rename = "pkAnomalie", deserialize_with = "id")]
  pub pk: String,
  #[serde(rename = "appareil", default)]
  pub device: String,
  #[serde(rename = "libelle", default)]
  pub label: String,
  #[serde(rename = "dateDetection", default)]
  pub detected_at: Option<String>,
  #[serde(rename = "statut", default)]
  pub status: Option<String>,
}

impl Normalize for ApiAnomaly {
  type Output = Anomaly;

  const SYNONYMS: &'static [(&'static str, &'static str)] = &[("id", "pkAnomalie")];

  fn normalize(self) -> Anomaly {
    Anomaly {
      id: self.pk,
      device: self.device,
      label: self.label,
      detected_at: self.detected_at,
      status: self.status,
    }
  }
}

#[derive(Debug, Deserialize)]
pub struct ApiLeak {
  #[serde(rename = "pkFuite", deserialize_with = "id")]
  pub pk: String,
  #[serde(rename = "appareil", default)]
  pub device: String,
  #[serde(rename = "dateDebut", default)]
  pub started_at: Option<String>,
  #[serde(rename = "volume", default, deserialize_with = "optional_amount")]
  pub volume: Option<f64>,
  #[serde(rename = "resolue", default, deserialize_with = "flag")]
  pub resolved: bool,
}

impl Normalize for ApiLeak {
  type Output = Leak;

  const SYNONYMS: &'static [(&'static str, &'static str)] = &[("id", "pkFuite")];

  fn normalize(self) -> Leak {
    Leak {
      id: self.pk,
      device: self.device,
      started_at: self.started_at,
      volume_litres: self.volume,
      resolved: self.resolved,
    }
  }
}

#[derive(Debug, Deserialize)]
pub struct ApiMalfunction {
  #[serde(rename = "pkPanne", deserialize_with = "id")]
  pub pk: String,
  #[serde(rename = "appareil", default)]
  pub device: String,
  #[serde(rename = "libelle", default)]
  pub label: String,
  #[serde(rename = "dateSignalement", default)]
  pub reported_at: Option<String>,
  #[serde(rename = "resolue", default, deserialize_with = "flag")]
  pub resolved: bool,
}

impl Normalize for ApiMalfunction {
  type Output = Malfunction;

  const SYNONYMS: &'static [(&'static str, &'static str)] = &[("id", "pkPanne")];

  fn normalize(self) -> Malfunction {
    Malfunction {
      id: self.pk,
      device: self.device,
      label: self.label,
      reported_at: self.reported_at,
      resolved: self.resolved,
    }
  }
}

#[derive(Debug, Deserialize)]
pub struct ApiIntervention {
  #[serde(rename = "pkIntervention", deserialize_with = "id")]
  pub pk: String,
  #[serde(rename = "date", default)]
  pub date: Option<String>,
  #[serde(rename = "type", default)]
  pub kind: String,
  #[serde(rename = "technicien", default)]
  pub technician: Option<String>,
  #[serde(rename = "statut", default)]
  pub status: Option<String>,
  #[serde(rename = "hasReleve", default, deserialize_with = "flag")]
  pub has_releve: bool,
}

impl Normalize for ApiIntervention {
  type Output = Intervention;

  const SYNONYMS: &'static [(&'static str, &'static str)] = &[("id", "pkIntervention")];

  fn normalize(self) -> Intervention {
    Intervention {
      id: self.pk,
      date: self.date,
      kind: self.kind,
      technician: self.technician,
      status: self.status,
      has_report: self.has_releve,
    }
  }
}

#[derive(Debug, Deserialize)]
pub struct ApiInvoice {
  #[serde(rename = "pkFacture", deserialize_with = "id")]
  pub pk: String,
  #[serde(rename = "numero", default)]
  pub number: String,
  #[serde(rename = "dateEmission", default)]
  pub issued_at: Option<String>,
  #[serde(rename = "montant", default, deserialize_with = "amount")]
  pub amount: f64,
  #[serde(rename = "payee", default, deserialize_with = "flag")]
  pub paid: bool,
}

impl Normalize for ApiInvoice {
  type Output = Invoice;

  const SYNONYMS: &'static [(&'static str, &'static str)] = &[("id", "pkFacture")];

  fn normalize(self) -> Invoice {
    Invoice {
      id: self.pk,
      number: self.number,
      issued_at: self.issued_at,
      amount: self.amount,
      paid: self.paid,
    }
  }
}

#[derive(Debug, Deserialize)]
pub struct ApiOperator {
  #[serde(rename = "pkGestionnaire", deserialize_with = "id")]
  pub pk: String,
  #[serde(rename = "nom", default)]
  pub name: String,
  #[serde(rename = "email", default)]
  pub email: Option<String>,
  #[serde(rename = "telephone", default)]
  pub phone: Option<String>,
}

impl Normalize for ApiOperator {
  type Output = Operator;

  const SYNONYMS: &'static [(&'static str, &'static str)] = &[("id", "pkGestionnaire")];

  fn normalize(self) -> Operator {
    Operator {
      id: self.pk,
      name: self.name,
      email: self.email,
      phone: self.phone,
    }
  }
}
