pub mod models {
    pub mod automation;
    pub mod tado;
}

pub mod client;
pub mod config;
pub mod db {
    pub mod models;
    pub mod store;
}
pub mod device;
pub mod engine {
    pub mod alerts;
    pub mod climate;
    pub mod presence;
}
pub mod notify;
pub mod schema;
pub mod services {
    pub mod automation;
    pub mod climate;
    pub mod dispatch;
    pub mod schedule;
    pub mod triggers;
}
pub mod store;
pub mod utils;

use crate::client::TadoClient;
use crate::config::{Config, TriggerSource};
use crate::db::store::PgStore;
use crate::device::{LightPort, TadoDevices, WebhookLight};
use crate::engine::climate::ClimateController;
use crate::notify::{LogNotifier, Notifier, WebhookNotifier};
use crate::services::automation::{IntentExecutor, Ports};
use crate::services::climate::ClimateRunner;
use crate::services::dispatch::Dispatcher;
use crate::services::triggers::{self, GeofenceTracker, Trigger};
use crate::store::StateStore;
use chrono::Utc;
use diesel::PgConnection;
use diesel::prelude::*;
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use log::{error, info, warn};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;

#[derive(Debug)]
struct LoadedEnvFile {
    path: PathBuf,
    explicit: bool,
}

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

fn apply_database_migrations(conn: &mut PgConnection) -> Result<(), String> {
    let applied = conn
        .run_pending_migrations(MIGRATIONS)
        .map_err(|e| format!("Applying database migrations failed: {}", e))?;
    if applied.is_empty() {
        info!("Database schema is up to date; no migrations were applied");
    } else {
        let names = applied.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", ");
        info!("Applied {} database migration(s): {}", applied.len(), names);
    }
    Ok(())
}

pub fn run() -> Result<(), String> {
    // 1) Load config
    let cfg = Config::from_env()?;
    info!(
        "Config loaded (home={}, zones={}, tick={}s, timeout={}s, unit={:?}, night={}-{}, geofence_poll={}, light={}, push={})",
        cfg.home_id.0,
        cfg.climate.zones.len(),
        cfg.tick_interval.as_secs(),
        cfg.request_timeout.as_secs(),
        cfg.temperature_unit,
        cfg.night_window.start.format("%H:%M"),
        cfg.night_window.end.format("%H:%M"),
        cfg.geofence_poll_enabled,
        cfg.light_webhook_url.is_some(),
        cfg.notify_url.is_some()
    );

    // 2) Connect DB
    let mut conn = PgConnection::establish(&cfg.database_url).map_err(|e| format!("DB connection failed: {}", e))?;
    info!("Connected to database");

    // 3) Apply pending database migrations
    apply_database_migrations(&mut conn)?;

    // 4) Make sure every durable record exists
    let store: Arc<dyn StateStore> = Arc::new(PgStore::new(conn, cfg.database_url.clone()));
    let zone_ids = cfg.climate.zones.iter().map(|z| z.id).collect::<Vec<_>>();
    store
        .initialize(&zone_ids, Utc::now())
        .map_err(|e| format!("State initialization failed: {}", e))?;
    let presence = store.load_presence().map_err(|e| format!("Loading presence failed: {}", e))?;
    info!("Resuming with presence {:?}/{:?}", presence.state, presence.stage);

    // 5) Init Tado client
    let client = TadoClient::new(
        &cfg.tado_refresh_token,
        &cfg.tado_firefox_version,
        cfg.tado_refresh_token_file.clone(),
        cfg.request_timeout,
    )
    .map_err(|e| format!("Tado auth failed (refresh token invalid/expired?): {}", e))?;
    info!("Authenticated to Tado API");

    // 6) Wire ports, controller and dispatcher
    let devices = TadoDevices::new(&client, cfg.home_id, cfg.temperature_unit, &cfg.climate);
    let light = cfg
        .light_webhook_url
        .as_deref()
        .map(|url| WebhookLight::new(url, cfg.request_timeout));
    let notifier: Box<dyn Notifier> = match cfg.notify_url.as_deref() {
        Some(url) => Box::new(WebhookNotifier::new(url, cfg.request_timeout)),
        None => Box::new(LogNotifier),
    };
    let controller = ClimateController::new(cfg.climate.clone(), cfg.temperature_unit, store.clone());
    let ports = Ports {
        climate: &devices,
        presence: Some(&devices),
        light: light.as_ref().map(|l| l as &dyn LightPort),
    };
    let runner = ClimateRunner::new(&controller, &devices, notifier.as_ref());
    let executor = IntentExecutor::new(
        &controller,
        ports,
        notifier.as_ref(),
        cfg.dark_window,
        cfg.temperature_unit,
    );
    let dispatcher = Dispatcher::new(
        store.clone(),
        &controller,
        runner,
        executor,
        notifier.as_ref(),
        cfg.night_window,
    );

    // 7) Start trigger sources and dispatch until they are all gone
    let (tx, rx) = mpsc::channel::<Trigger>();
    thread::scope(|s| -> Result<(), String> {
        let tick_tx = tx.clone();
        let interval = cfg.tick_interval;
        s.spawn(move || triggers::schedule_ticks(interval, &tick_tx));

        match &cfg.trigger_source {
            TriggerSource::Disabled => info!("Event trigger source disabled"),
            TriggerSource::Stdin => {
                let events_tx = tx.clone();
                s.spawn(move || triggers::read_lines(BufReader::new(std::io::stdin()), "stdin", &events_tx));
                info!("Reading trigger events from stdin");
            }
            TriggerSource::File(path) => {
                let file = File::open(path).map_err(|e| format!("opening {} failed: {}", path.display(), e))?;
                let origin = path.display().to_string();
                let events_tx = tx.clone();
                s.spawn(move || triggers::read_lines(BufReader::new(file), &origin, &events_tx));
                info!("Reading trigger events from {}", path.display());
            }
        }

        if cfg.geofence_poll_enabled {
            let tracker = GeofenceTracker::new(cfg.geofence_devices.clone());
            let geo_tx = tx.clone();
            let client = &client;
            let home_id = cfg.home_id;
            s.spawn(move || triggers::poll_geofence(client, home_id, tracker, &geo_tx));
            info!(
                "Geofence poller started (every {}s)",
                triggers::GEOFENCE_POLL_INTERVAL.as_secs()
            );
        } else {
            warn!("Geofence polling disabled; arrivals depend on external events");
        }

        drop(tx);
        dispatcher.run(rx);
        Ok(())
    })
}

fn configure_env_from_cli() -> Result<Option<LoadedEnvFile>, String> {
    let mut args = std::env::args_os();
    args.next(); // skip program name

    let mut env_file: Option<PathBuf> = None;
    while let Some(arg) = args.next() {
        let value = match arg.to_str() {
            Some("--env-file") => args
                .next()
                .map(PathBuf::from)
                .ok_or_else(|| "`--env-file` requires a path argument".to_string())?,
            Some(s) if s.starts_with("--env-file=") => match &s["--env-file=".len()..] {
                "" => return Err("`--env-file` requires a path argument".to_string()),
                p => PathBuf::from(p),
            },
            Some("--") => break,
            Some(other) => return Err(format!("unrecognised argument: {}", other)),
            None => return Err("argument contains invalid UTF-8".to_string()),
        };
        if env_file.replace(value).is_some() {
            return Err("`--env-file` provided more than once".to_string());
        }
    }

    let (path, explicit) = match env_file {
        Some(path) if !path.is_file() => return Err(format!("env file not found: {}", path.display())),
        Some(path) => (path, true),
        None => {
            let cwd = std::env::current_dir().map_err(|e| format!("unable to read current directory: {}", e))?;
            let default_path = cwd.join(".env");
            if !default_path.is_file() {
                return Ok(None);
            }
            (default_path, false)
        }
    };
    load_env_file(&path)?;
    Ok(Some(LoadedEnvFile { path, explicit }))
}

fn load_env_file(path: &Path) -> Result<(), String> {
    let contents = std::fs::read_to_string(path).map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    for (index, line) in contents.lines().enumerate() {
        let Some((key, value)) =
            parse_env_assignment(line).map_err(|e| format!("{}:{}: {}", path.display(), index + 1, e))?
        else {
            continue;
        };
        // Values already in the process environment win.
        if std::env::var_os(&key).is_none() {
            // Updating process-level environment variables is unsafe on some targets.
            unsafe {
                std::env::set_var(key, value);
            }
        }
    }
    Ok(())
}

/// `KEY=value`, optionally prefixed with `export`. Values may be single-quoted
/// (literal), double-quoted (with `\n`, `\t`, `\"` escapes) or bare with a
/// trailing `# comment`.
fn parse_env_assignment(line: &str) -> Result<Option<(String, String)>, String> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }
    let assignment = trimmed.strip_prefix("export ").map(str::trim_start).unwrap_or(trimmed);
    let (key, raw) = assignment
        .split_once('=')
        .ok_or_else(|| "missing '=' in assignment".to_string())?;
    let key = key.trim();
    if key.is_empty() {
        return Err("environment variable name cannot be empty".to_string());
    }
    if key.chars().any(char::is_whitespace) {
        return Err(format!("environment variable name contains whitespace: {}", key));
    }
    Ok(Some((key.to_string(), parse_env_value(raw.trim())?)))
}

fn parse_env_value(raw: &str) -> Result<String, String> {
    if let Some(rest) = raw.strip_prefix('\'') {
        let (value, tail) = rest
            .split_once('\'')
            .ok_or_else(|| "unterminated single-quoted value".to_string())?;
        return expect_comment_only(tail, "single").map(|_| value.to_string());
    }
    let Some(rest) = raw.strip_prefix('"') else {
        return Ok(raw.split('#').next().unwrap_or_default().trim_end().to_string());
    };

    let mut value = String::new();
    let mut chars = rest.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' => {
                let escaped = chars
                    .next()
                    .ok_or_else(|| "unterminated escape sequence in double-quoted value".to_string())?;
                value.push(match escaped {
                    'n' => '\n',
                    'r' => '\r',
                    't' => '\t',
                    other => other,
                });
            }
            '"' => return expect_comment_only(chars.as_str(), "double").map(|_| value),
            other => value.push(other),
        }
    }
    Err("unterminated double-quoted value".to_string())
}

fn expect_comment_only(tail: &str, quote: &str) -> Result<(), String> {
    let tail = tail.trim();
    if tail.is_empty() || tail.starts_with('#') {
        Ok(())
    } else {
        Err(format!("unexpected characters after closing {} quote", quote))
    }
}

fn main() {
    let loaded_env = match configure_env_from_cli() {
        Ok(info) => info,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(1);
        }
    };

    // Init logging after environment so RUST_LOG from .env is respected.
    let default_filter = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(default_filter)
        .format_timestamp_secs()
        .init();

    if let Some(info) = loaded_env.as_ref() {
        let origin = if info.explicit { "CLI-specified" } else { "default" };
        info!("Environment loaded from {} .env file: {}", origin, info.path.display());
    }

    info!(
        "tado-autopilot {} (git {}) starting",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIME_GIT_HASH")
    );
    if let Err(e) = run() {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}
