use clap::{Args as ClapArgs, Parser, Subcommand};
use color_eyre::Result;
use std::net::SocketAddr;
use std::path::PathBuf;

use releve::{app, config, logging, stale_time};

#[derive(Parser, Debug)]
#[command(name = "releve")]
#[command(about = "Client for the metering portal, with a cache that follows the nightly refresh")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/releve/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Show how long data fetched now stays fresh
  StaleTime {
    /// Minutes before midnight at which data goes stale
    #[arg(long, default_value_t = stale_time::DEFAULT_BUFFER_MINUTES)]
    buffer: i64,
  },
  /// Persist the session for an occupant
  Login { fk: String },
  /// Forget the persisted session
  Logout,
  /// Print the occupant of the persisted session
  Whoami,
  /// Fetch an entity or listing and print it as JSON
  Get {
    /// building, housing-unit, occupant, or a listing (anomalies, fuites, ...)
    entity: String,
    #[command(flatten)]
    scope: ScopeFlags,
    /// Device filter
    #[arg(long)]
    appareil: Option<String>,
  },
  /// Download a listing as CSV
  Export {
    entity: String,
    #[command(flatten)]
    scope: ScopeFlags,
    #[arg(long)]
    appareil: Option<String>,
  },
  /// Download the PDF report of an intervention
  Report { intervention: String },
  /// Run the prefetch HTTP endpoint
  Serve {
    #[arg(long)]
    bind: Option<SocketAddr>,
  },
}

#[derive(ClapArgs, Debug)]
#[group(multiple = false)]
struct ScopeFlags {
  #[arg(long)]
  building: Option<String>,
  #[arg(long)]
  logement: Option<String>,
  #[arg(long)]
  occupant: Option<String>,
}

impl From<ScopeFlags> for app::ScopeSelection {
  fn from(flags: ScopeFlags) -> Self {
    Self {
      building: flags.building,
      logement: flags.logement,
      occupant: flags.occupant,
    }
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  if let Command::StaleTime { buffer } = args.command {
    let stale = stale_time::stale_time_until_midnight(buffer);
    println!("{} ms ({} min)", stale.as_millis(), stale.as_secs() / 60);
    return Ok(());
  }

  // Keep the guard alive until exit so buffered log lines are flushed
  let _guard = if matches!(args.command, Command::Serve { .. }) {
    logging::init_stderr()?;
    None
  } else {
    Some(logging::init_file()?)
  };

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;
  let app = app::App::new(config)?;

  match args.command {
    Command::StaleTime { .. } => {}
    Command::Login { fk } => app.login(&fk)?,
    Command::Logout => app.logout()?,
    Command::Whoami => app.whoami().await?,
    Command::Get {
      entity,
      scope,
      appareil,
    } => app.get(&entity, &scope.into(), appareil.as_deref()).await?,
    Command::Export {
      entity,
      scope,
      appareil,
    } => {
      app
        .export(&entity, &scope.into(), appareil.as_deref())
        .await?
    }
    Command::Report { intervention } => app.report(&intervention).await?,
    Command::Serve { bind } => app.serve(bind).await?,
  }

  Ok(())
}
