use color_eyre::{eyre::eyre, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use crate::cache::CacheLayer;
use crate::config::Config;
use crate::export::Exporter;
use crate::portal::{CachedPortalClient, EntityKind, HttpTransport, Scope, ScopeId, Transport};
use crate::prefetch::{self, PrefetchWarmer};
use crate::session::SessionStore;

/// Scope selected on the command line. At most one is set.
#[derive(Debug, Clone, Default)]
pub struct ScopeSelection {
  pub building: Option<String>,
  pub logement: Option<String>,
  pub occupant: Option<String>,
}

impl ScopeSelection {
  /// The explicit scope, if a usable one was given.
  pub fn scope(&self) -> Option<Scope> {
    if let Some(raw) = &self.building {
      return ScopeId::new(raw).map(Scope::Building);
    }
    if let Some(raw) = &self.logement {
      return ScopeId::new(raw).map(Scope::HousingUnit);
    }
    self.occupant.as_ref().and_then(|raw| ScopeId::new(raw).map(Scope::Occupant))
  }

  fn is_empty(&self) -> bool {
    self.building.is_none() && self.logement.is_none() && self.occupant.is_none()
  }
}

/// Everything one CLI invocation needs: one transport, one cache, one session.
pub struct App {
  config: Config,
  transport: Arc<dyn Transport>,
  client: CachedPortalClient,
  session: SessionStore,
}

impl App {
  pub fn new(config: Config) -> Result<Self> {
    let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(&config)?);
    let client = CachedPortalClient::new(
      Arc::clone(&transport),
      CacheLayer::new(),
      config.cache.stale_buffer_minutes,
    );
    let session = SessionStore::new(config.session_path()?);

    Ok(Self {
      config,
      transport,
      client,
      session,
    })
  }

  pub fn login(&self, fk: &str) -> Result<()> {
    let id = ScopeId::new(fk).ok_or_else(|| eyre!("Invalid occupant id: {:?}", fk))?;
    self.session.login(&id)?;
    println!("Logged in as occupant {}", id);
    Ok(())
  }

  pub fn logout(&self) -> Result<()> {
    self.session.logout()?;
    println!("Logged out");
    Ok(())
  }

  pub async fn whoami(&self) -> Result<()> {
    match self.session.resolver().hydrate().await {
      Some(id) => println!("occupant {}", id),
      None => println!("Not logged in"),
    }
    Ok(())
  }

  /// Print one entity or listing as JSON. Without a scope flag, the session
  /// occupant is used.
  pub async fn get(&self, entity: &str, selection: &ScopeSelection, filter: Option<&str>) -> Result<()> {
    let entity = parse_entity(entity)?;
    let scope = self.resolve_scope(selection).await?;

    let value = self.client.fetch_json(entity, &scope, filter).await?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
  }

  pub async fn export(&self, entity: &str, selection: &ScopeSelection, filter: Option<&str>) -> Result<()> {
    let entity = parse_entity(entity)?;
    let scope = if selection.is_empty() {
      self.session.resolver().hydrate().await.map(Scope::Occupant)
    } else {
      selection.scope()
    };

    let path = self
      .exporter()?
      .export_listing(entity, scope.as_ref(), filter)
      .await?;
    println!("{}", path.display());
    Ok(())
  }

  pub async fn report(&self, intervention: &str) -> Result<()> {
    let id = ScopeId::new(intervention);
    let path = self
      .exporter()?
      .export_intervention_report(id.as_ref())
      .await?;
    println!("{}", path.display());
    Ok(())
  }

  /// Serve the prefetch boundary until interrupted.
  pub async fn serve(&self, bind: Option<SocketAddr>) -> Result<()> {
    let addr = bind.unwrap_or(self.config.server.bind);
    let warmer = PrefetchWarmer::new(Arc::clone(&self.transport), self.config.cache.stale_buffer_minutes);
    let router = prefetch::create_router(warmer);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Prefetch server listening");
    eprintln!("Listening on http://{}", addr);

    axum::serve(listener, router)
      .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
      })
      .await?;

    info!("Prefetch server stopped");
    Ok(())
  }

  async fn resolve_scope(&self, selection: &ScopeSelection) -> Result<Scope> {
    if !selection.is_empty() {
      return selection
        .scope()
        .ok_or_else(|| eyre!("The scope id must be a non-empty, non-zero value"));
    }

    self
      .session
      .resolver()
      .hydrate()
      .await
      .map(Scope::Occupant)
      .ok_or_else(|| eyre!("Not logged in. Pass --building, --logement or --occupant, or run `releve login`"))
  }

  fn exporter(&self) -> Result<Exporter> {
    let dir: PathBuf = self.config.export_dir()?;
    Ok(Exporter::new(Arc::clone(&self.transport), dir))
  }
}

fn parse_entity(raw: &str) -> Result<EntityKind> {
  EntityKind::parse(raw).ok_or_else(|| {
    let known: Vec<&str> = EntityKind::LISTINGS.iter().map(|k| k.name()).collect();
    eyre!(
      "Unknown entity {:?}. Use building, housing-unit, occupant or one of: {}",
      raw,
      known.join(", ")
    )
  })
}
