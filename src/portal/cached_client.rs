//! Cached portal client: one fetch form and one query form per entity.
//!
//! Every call is scoped by a building, housing unit or occupant and goes
//! through the shared `CacheLayer`, so identical calls reuse one entry and
//! concurrent ones share one request. The stale time is evaluated on each
//! call.

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::cache::{CacheLayer, CacheResult, QueryKey};
use crate::error::{PortalError, PortalResult};
use crate::query::Query;
use crate::session::SessionResolver;
use crate::stale_time;

use super::api_types::{
  self, ApiAnomaly, ApiBuilding, ApiHousingUnit, ApiIntervention, ApiInvoice, ApiLeak, ApiMalfunction,
  ApiOccupant, ApiOperator, Normalize,
};
use super::cache::{EntityKind, PortalQueryKey};
use super::client::Transport;
use super::scope::{Scope, ScopeId};
use super::types::{
  Anomaly, Building, HousingUnit, Intervention, Invoice, Leak, Malfunction, Occupant, Operator,
};

/// Portal client with transparent caching.
#[derive(Clone)]
pub struct CachedPortalClient {
  transport: Arc<dyn Transport>,
  cache: CacheLayer,
  stale_buffer_minutes: i64,
}

impl CachedPortalClient {
  pub fn new(transport: Arc<dyn Transport>, cache: CacheLayer, stale_buffer_minutes: i64) -> Self {
    Self {
      transport,
      cache,
      stale_buffer_minutes,
    }
  }

  pub fn cache(&self) -> &CacheLayer {
    &self.cache
  }

  /// Stale time for a fetch starting now.
  pub fn stale_time(&self) -> Duration {
    stale_time::stale_time_until_midnight(self.stale_buffer_minutes)
  }

  /// Fetch `key`, decoding the payload as `A` and normalizing it once before
  /// it is cached.
  pub async fn fetch<A>(&self, key: &PortalQueryKey) -> PortalResult<CacheResult<A::Output>>
  where
    A: DeserializeOwned + Normalize + Send + 'static,
    A::Output: Serialize + DeserializeOwned + Send + 'static,
  {
    let transport = Arc::clone(&self.transport);
    let path = key.path();
    let params = key.params();
    let what = key.description();

    let result = self
      .cache
      .fetch(key, self.stale_time(), move || async move {
        let data = transport.get_json(&path, &params).await?;
        let payload: A = api_types::decode(data).map_err(|e| PortalError::Decode {
          what: what.clone(),
          reason: e.to_string(),
        })?;
        serde_json::to_value(payload.normalize()).map_err(|e| PortalError::Decode {
          what,
          reason: e.to_string(),
        })
      })
      .await?;

    debug!(query = %key.description(), source = ?result.source, "fetched");

    let data = serde_json::from_value(result.data.clone()).map_err(|e| PortalError::Decode {
      what: key.description(),
      reason: e.to_string(),
    })?;
    Ok(result.map(|_| data))
  }

  /// Reactive binding for `key`. A missing key yields a disabled query.
  pub fn query<A>(&self, key: Option<PortalQueryKey>, what: &'static str) -> Query<A::Output>
  where
    A: DeserializeOwned + Normalize + Send + 'static,
    A::Output: Serialize + DeserializeOwned + Send + 'static,
  {
    let key = match key {
      Some(key) => key,
      None => return Query::disabled(what),
    };

    let slot = key.cache_hash();
    let changes = self.cache.subscribe();
    let client = self.clone();
    Query::new(move || {
      let client = client.clone();
      let key = key.clone();
      async move { client.fetch::<A>(&key).await }
    })
    .observing(slot, changes)
  }

  // ==========================================================================
  // Single records
  // ==========================================================================

  pub async fn building(&self, id: &ScopeId) -> PortalResult<Building> {
    let key = PortalQueryKey::building(id.clone());
    Ok(self.fetch::<ApiBuilding>(&key).await?.data)
  }

  pub fn building_query(&self, id: Option<ScopeId>) -> Query<Building> {
    self.query::<ApiBuilding>(id.map(PortalQueryKey::building), "Building")
  }

  pub async fn housing_unit(&self, id: &ScopeId) -> PortalResult<HousingUnit> {
    let key = PortalQueryKey::housing_unit(id.clone());
    Ok(self.fetch::<ApiHousingUnit>(&key).await?.data)
  }

  pub fn housing_unit_query(&self, id: Option<ScopeId>) -> Query<HousingUnit> {
    self.query::<ApiHousingUnit>(id.map(PortalQueryKey::housing_unit), "Housing unit")
  }

  pub async fn occupant(&self, id: &ScopeId) -> PortalResult<Occupant> {
    let key = PortalQueryKey::occupant(id.clone());
    Ok(self.fetch::<ApiOccupant>(&key).await?.data)
  }

  pub fn occupant_query(&self, id: Option<ScopeId>) -> Query<Occupant> {
    self.query::<ApiOccupant>(id.map(PortalQueryKey::occupant), "Occupant")
  }

  /// The logged-in occupant; disabled until the session resolves.
  pub fn my_occupant_query(&self, session: &SessionResolver) -> Query<Occupant> {
    self.occupant_query(session.scope_id())
  }

  // ==========================================================================
  // Listings
  // ==========================================================================

  pub async fn housing_units(&self, building: &ScopeId) -> PortalResult<Vec<HousingUnit>> {
    let key = listing(EntityKind::HousingUnits, Scope::Building(building.clone()), None);
    Ok(self.fetch::<Vec<ApiHousingUnit>>(&key).await?.data)
  }

  pub fn housing_units_query(&self, building: Option<ScopeId>) -> Query<Vec<HousingUnit>> {
    let key = building.map(|id| listing(EntityKind::HousingUnits, Scope::Building(id), None));
    self.query::<Vec<ApiHousingUnit>>(key, "Building")
  }

  pub async fn occupants(&self, scope: &Scope) -> PortalResult<Vec<Occupant>> {
    let key = listing(EntityKind::Occupants, scope.clone(), None);
    Ok(self.fetch::<Vec<ApiOccupant>>(&key).await?.data)
  }

  pub fn occupants_query(&self, scope: Option<Scope>) -> Query<Vec<Occupant>> {
    let key = scope.map(|s| listing(EntityKind::Occupants, s, None));
    self.query::<Vec<ApiOccupant>>(key, "Occupants")
  }

  pub async fn anomalies(&self, scope: &Scope, filter: Option<&str>) -> PortalResult<Vec<Anomaly>> {
    let key = listing(EntityKind::Anomalies, scope.clone(), filter);
    Ok(self.fetch::<Vec<ApiAnomaly>>(&key).await?.data)
  }

  pub fn anomalies_query(&self, scope: Option<Scope>, filter: Option<&str>) -> Query<Vec<Anomaly>> {
    let key = scope.map(|s| listing(EntityKind::Anomalies, s, filter));
    self.query::<Vec<ApiAnomaly>>(key, "Anomalies")
  }

  pub fn my_anomalies_query(&self, session: &SessionResolver, filter: Option<&str>) -> Query<Vec<Anomaly>> {
    self.anomalies_query(session.occupant_scope(), filter)
  }

  pub async fn leaks(&self, scope: &Scope, filter: Option<&str>) -> PortalResult<Vec<Leak>> {
    let key = listing(EntityKind::Leaks, scope.clone(), filter);
    Ok(self.fetch::<Vec<ApiLeak>>(&key).await?.data)
  }

  pub fn leaks_query(&self, scope: Option<Scope>, filter: Option<&str>) -> Query<Vec<Leak>> {
    let key = scope.map(|s| listing(EntityKind::Leaks, s, filter));
    self.query::<Vec<ApiLeak>>(key, "Leaks")
  }

  pub fn my_leaks_query(&self, session: &SessionResolver, filter: Option<&str>) -> Query<Vec<Leak>> {
    self.leaks_query(session.occupant_scope(), filter)
  }

  pub async fn malfunctions(
    &self,
    scope: &Scope,
    filter: Option<&str>,
  ) -> PortalResult<Vec<Malfunction>> {
    let key = listing(EntityKind::Malfunctions, scope.clone(), filter);
    Ok(self.fetch::<Vec<ApiMalfunction>>(&key).await?.data)
  }

  pub fn malfunctions_query(
    &self,
    scope: Option<Scope>,
    filter: Option<&str>,
  ) -> Query<Vec<Malfunction>> {
    let key = scope.map(|s| listing(EntityKind::Malfunctions, s, filter));
    self.query::<Vec<ApiMalfunction>>(key, "Malfunctions")
  }

  pub fn my_malfunctions_query(
    &self,
    session: &SessionResolver,
    filter: Option<&str>,
  ) -> Query<Vec<Malfunction>> {
    self.malfunctions_query(session.occupant_scope(), filter)
  }

  pub async fn interventions(
    &self,
    scope: &Scope,
    filter: Option<&str>,
  ) -> PortalResult<Vec<Intervention>> {
    let key = listing(EntityKind::Interventions, scope.clone(), filter);
    Ok(self.fetch::<Vec<ApiIntervention>>(&key).await?.data)
  }

  pub fn interventions_query(
    &self,
    scope: Option<Scope>,
    filter: Option<&str>,
  ) -> Query<Vec<Intervention>> {
    let key = scope.map(|s| listing(EntityKind::Interventions, s, filter));
    self.query::<Vec<ApiIntervention>>(key, "Interventions")
  }

  pub fn my_interventions_query(
    &self,
    session: &SessionResolver,
    filter: Option<&str>,
  ) -> Query<Vec<Intervention>> {
    self.interventions_query(session.occupant_scope(), filter)
  }

  pub async fn invoices(&self, scope: &Scope, filter: Option<&str>) -> PortalResult<Vec<Invoice>> {
    let key = listing(EntityKind::Invoices, scope.clone(), filter);
    Ok(self.fetch::<Vec<ApiInvoice>>(&key).await?.data)
  }

  pub fn invoices_query(&self, scope: Option<Scope>, filter: Option<&str>) -> Query<Vec<Invoice>> {
    let key = scope.map(|s| listing(EntityKind::Invoices, s, filter));
    self.query::<Vec<ApiInvoice>>(key, "Invoices")
  }

  pub fn my_invoices_query(&self, session: &SessionResolver, filter: Option<&str>) -> Query<Vec<Invoice>> {
    self.invoices_query(session.occupant_scope(), filter)
  }

  pub async fn operators(&self, scope: &Scope) -> PortalResult<Vec<Operator>> {
    let key = listing(EntityKind::Operators, scope.clone(), None);
    Ok(self.fetch::<Vec<ApiOperator>>(&key).await?.data)
  }

  pub fn operators_query(&self, scope: Option<Scope>) -> Query<Vec<Operator>> {
    let key = scope.map(|s| listing(EntityKind::Operators, s, None));
    self.query::<Vec<ApiOperator>>(key, "Operators")
  }

  // ==========================================================================
  // Untyped access and invalidation
  // ==========================================================================

  /// Fetch any entity as canonical JSON. Single records take the id of `scope`.
  pub async fn fetch_json(
    &self,
    entity: EntityKind,
    scope: &Scope,
    filter: Option<&str>,
  ) -> PortalResult<Value> {
    let id = scope.id();
    let value = match entity {
      EntityKind::Building => to_json(self.building(id).await?),
      EntityKind::HousingUnit => to_json(self.housing_unit(id).await?),
      EntityKind::Occupant => to_json(self.occupant(id).await?),
      EntityKind::HousingUnits => to_json(self.housing_units(id).await?),
      EntityKind::Occupants => to_json(self.occupants(scope).await?),
      EntityKind::Anomalies => to_json(self.anomalies(scope, filter).await?),
      EntityKind::Leaks => to_json(self.leaks(scope, filter).await?),
      EntityKind::Malfunctions => to_json(self.malfunctions(scope, filter).await?),
      EntityKind::Interventions => to_json(self.interventions(scope, filter).await?),
      EntityKind::Invoices => to_json(self.invoices(scope, filter).await?),
      EntityKind::Operators => to_json(self.operators(scope).await?),
    };
    value.map_err(|e| PortalError::Decode {
      what: entity.name().to_string(),
      reason: e.to_string(),
    })
  }

  /// Drop one entry; subscribed queries refetch.
  pub fn invalidate(&self, key: &PortalQueryKey) -> PortalResult<bool> {
    self.cache.invalidate(key)
  }

  /// Drop every entry under `scope`, e.g. after a write to it.
  pub fn invalidate_scope(&self, scope: &Scope) -> PortalResult<usize> {
    self.cache.invalidate_tagged(&scope.tag())
  }
}

fn listing(entity: EntityKind, scope: Scope, filter: Option<&str>) -> PortalQueryKey {
  PortalQueryKey::new(entity, scope, filter)
}

fn to_json<T: Serialize>(value: T) -> serde_json::Result<Value> {
  serde_json::to_value(value)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::UpstreamError;
  use crate::portal::testing::FakeTransport;
  use serde_json::json;

  fn client(transport: FakeTransport) -> (Arc<FakeTransport>, CachedPortalClient) {
    let transport = Arc::new(transport);
    let client = CachedPortalClient::new(transport.clone(), CacheLayer::new(), 30);
    (transport, client)
  }

  fn unit(id: &str) -> Scope {
    Scope::HousingUnit(ScopeId::new(id).unwrap())
  }

  fn anomalies_payload() -> Value {
    json!([
      {"PkAnomalie": 1, "Appareil": "EF", "Libelle": "Index bloqué"},
      {"pkAnomalie": "2", "appareil": "EC", "libelle": "Surconsommation"}
    ])
  }

  #[tokio::test]
  async fn test_fetch_reuses_unexpired_entry() {
    let (transport, client) =
      client(FakeTransport::new().with_json("/logement/12/anomalies", anomalies_payload()));

    let first = client.anomalies(&unit("12"), None).await.unwrap();
    let second = client.anomalies(&unit("12"), None).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(first[0].label, "Index bloqué");
    assert_eq!(first[1].id, "2");
    assert_eq!(transport.calls(), 1);
  }

  #[tokio::test]
  async fn test_concurrent_queries_share_one_request() {
    let (transport, client) = client(
      FakeTransport::new()
        .with_json("/logement/12/anomalies", anomalies_payload())
        .with_delay(Duration::from_millis(30)),
    );

    let mut a = client.anomalies_query(Some(unit("12")), None);
    let mut b = client.anomalies_query(Some(unit("12")), None);
    a.fetch();
    b.fetch();

    tokio::time::sleep(Duration::from_millis(100)).await;
    a.poll();
    b.poll();

    assert_eq!(transport.calls(), 1);
    assert_eq!(a.data().map(Vec::len), Some(2));
    assert_eq!(a.data(), b.data());
  }

  #[tokio::test]
  async fn test_query_without_scope_never_calls_network() {
    let (transport, client) = client(FakeTransport::new());

    let mut query = client.invoices_query(None, Some("EF"));
    query.fetch();
    tokio::time::sleep(Duration::from_millis(20)).await;
    query.poll();

    assert!(!query.is_enabled());
    assert_eq!(query.data(), None);
    assert_eq!(transport.calls(), 0);
  }

  #[tokio::test]
  async fn test_unresolved_session_disables_occupant_queries() {
    let (transport, client) = client(FakeTransport::new());
    let dir = tempfile::tempdir().unwrap();
    let session = SessionResolver::new(dir.path().join("missing.json"));

    let mut before = client.my_invoices_query(&session, None);
    before.fetch();
    session.hydrate().await;
    let mut after = client.my_invoices_query(&session, None);
    after.fetch();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(!before.is_enabled());
    assert!(!after.is_enabled());
    assert_eq!(transport.calls(), 0);
  }

  #[tokio::test]
  async fn test_filter_is_sent_and_scopes_the_slot() {
    let (transport, client) =
      client(FakeTransport::new().with_json("/occupant/9/factures", json!([])));
    let scope = Scope::Occupant(ScopeId::new("9").unwrap());

    client.invoices(&scope, Some("EF")).await.unwrap();
    client.invoices(&scope, Some("EC")).await.unwrap();
    client.invoices(&scope, Some(" EF ")).await.unwrap();

    assert_eq!(
      transport.requests(),
      vec!["/occupant/9/factures?appareil=EF", "/occupant/9/factures?appareil=EC"]
    );
  }

  #[tokio::test]
  async fn test_upstream_failure_is_typed() {
    let (_, client) = client(FakeTransport::new().with_error(
      "/immeuble/3",
      UpstreamError::Server {
        status: 500,
        reason: "Internal server error".into(),
      },
    ));

    let err = client.building(&ScopeId::new("3").unwrap()).await.unwrap_err();
    assert!(matches!(
      err,
      PortalError::Upstream(UpstreamError::Server { status: 500, .. })
    ));
  }

  #[tokio::test]
  async fn test_failed_query_surfaces_error_without_retry() {
    let (transport, client) = client(FakeTransport::new().with_error(
      "/logement/12/fuites",
      UpstreamError::Unreachable("connection refused".into()),
    ));

    let mut query = client.leaks_query(Some(unit("12")), None);
    query.fetch();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(query.poll());

    assert!(matches!(
      query.error(),
      Some(PortalError::Upstream(UpstreamError::Unreachable(_)))
    ));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(transport.calls(), 1);
  }

  #[tokio::test]
  async fn test_payload_is_normalized_before_caching() {
    let (_, client) = client(FakeTransport::new().with_json(
      "/logement/12",
      json!({"PkLogement": 12, "FkImmeuble": 3, "HasTelereleve": true}),
    ));

    let key = PortalQueryKey::housing_unit(ScopeId::new("12").unwrap());
    client.fetch::<ApiHousingUnit>(&key).await.unwrap();

    let cached = client.cache().peek(&key).unwrap().unwrap();
    assert_eq!(cached.data["remote_reading"], json!(true));
    assert_eq!(cached.data["building_id"], json!("3"));
  }

  #[tokio::test]
  async fn test_listing_item_with_every_spelling_decodes() {
    let (_, client) = client(FakeTransport::new().with_json(
      "/logement/12/anomalies",
      json!([
        {"id": 7, "PkAnomalie": 7, "Appareil": "EF", "appareil": "EF", "libelle": "Index bloqué"},
        {"pkAnomalie": 8, "appareil": "EC", "libelle": "Fuite"}
      ]),
    ));

    let anomalies = client.anomalies(&unit("12"), None).await.unwrap();
    assert_eq!(anomalies.len(), 2);
    assert_eq!(anomalies[0].id, "7");
    assert_eq!(anomalies[0].device, "EF");
    assert_eq!(anomalies[1].id, "8");
  }

  #[tokio::test]
  async fn test_decode_failure_is_reported() {
    let (_, client) = client(FakeTransport::new().with_json("/logement/12/pannes", json!({"oops": 1})));

    let err = client.malfunctions(&unit("12"), None).await.unwrap_err();
    assert!(matches!(err, PortalError::Decode { .. }));
    assert!(!client
      .cache()
      .has_data(&PortalQueryKey::new(EntityKind::Malfunctions, unit("12"), None))
      .unwrap());
  }

  #[tokio::test]
  async fn test_invalidate_scope_refetches_observing_query() {
    let (transport, client) =
      client(FakeTransport::new().with_json("/logement/12/interventions", json!([])));

    let mut query = client.interventions_query(Some(unit("12")), None);
    query.fetch();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(query.poll());
    assert_eq!(transport.calls(), 1);

    assert_eq!(client.invalidate_scope(&unit("12")).unwrap(), 1);
    assert!(query.poll());
    tokio::time::sleep(Duration::from_millis(20)).await;
    query.poll();

    assert_eq!(transport.calls(), 2);
    assert!(query.is_success());
  }

  #[tokio::test]
  async fn test_fetch_json_dispatches_by_entity() {
    let (_, client) = client(
      FakeTransport::new()
        .with_json("/immeuble/3", json!({"pkImmeuble": 3, "nom": "Les Tilleuls"}))
        .with_json("/immeuble/3/gestionnaires", json!([{"pkGestionnaire": 1, "nom": "Syndic"}])),
    );
    let scope = Scope::Building(ScopeId::new("3").unwrap());

    let building = client.fetch_json(EntityKind::Building, &scope, None).await.unwrap();
    assert_eq!(building["name"], json!("Les Tilleuls"));

    let operators = client.fetch_json(EntityKind::Operators, &scope, None).await.unwrap();
    assert_eq!(operators[0]["name"], json!("Syndic"));
  }
}
