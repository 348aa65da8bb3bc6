mod access;
mod config;
mod cycle;
mod db;
mod evaluator;
mod model;
mod mqtt;
mod reconciler;
mod scheduler;
mod state;
mod store;
mod valve;
mod web;

use anyhow::{bail, Result};
use rumqttc::MqttOptions;
use std::env;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use db::Db;
use model::now_unix;
use mqtt::MqttStore;
use scheduler::{ModeMachine, Scheduler};
use store::{MemoryStore, Store};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let mqtt_port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let client_id =
        env::var("MQTT_CLIENT_ID").unwrap_or_else(|_| "irrigation-engine".to_string());
    let db_url = env::var("DB_URL")
        .unwrap_or_else(|_| "sqlite:irrigation-engine.db?mode=rwc".to_string());
    let web_port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);
    let backend = env::var("STORE_BACKEND").unwrap_or_else(|_| "mqtt".to_string());

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;

    // ── Config file ─────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;

    // ── Store ───────────────────────────────────────────────────────
    match backend.as_str() {
        "memory" => {
            info!("using in-memory store (state is lost on exit)");
            run(MemoryStore::new(), &cfg, db, web_port).await
        }
        "mqtt" => {
            let mut options = MqttOptions::new(client_id, broker.clone(), mqtt_port);
            options.set_keep_alive(Duration::from_secs(30));
            let (store, eventloop) = MqttStore::new(options, &cfg.engine.topic_prefix);
            tokio::spawn(store.clone().run(eventloop));
            info!(%broker, mqtt_port, prefix = %cfg.engine.topic_prefix, "using mqtt store");
            run(store, &cfg, db, web_port).await
        }
        other => bail!("unknown STORE_BACKEND '{other}' (use mqtt or memory)"),
    }
}

async fn run<S: Store>(store: S, cfg: &config::Config, db: Db, web_port: u16) -> Result<()> {
    let shared = state::shared();
    shared
        .write()
        .await
        .record_system(now_unix(), format!("engine starting (web port {web_port})"));

    let machine = ModeMachine::new(store, shared.clone(), cfg.machine_settings()?, Some(db.clone()));
    let scheduler = Scheduler::spawn(machine, cfg.scheduler_settings());

    let app = web::AppState {
        shared,
        scheduler: scheduler.handle(),
        db,
    };

    tokio::select! {
        res = web::serve(app, web_port) => res?,
        _ = tokio::signal::ctrl_c() => info!("shutdown requested"),
    }

    scheduler.shutdown().await;
    Ok(())
}
