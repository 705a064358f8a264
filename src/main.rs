use actix_web::{middleware, web, App, HttpServer};
use anyhow::{Context, Result};
use clap::Parser;
use dropwatch::config;
use dropwatch::db;
use dropwatch::email::ResendMailer;
use dropwatch::fetch::FetchOptions;
use dropwatch::parse::CardGridParser;
use dropwatch::server::{self, AppState};
use dropwatch::sms::ClickSendSms;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use url::Url;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[actix_web::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/dropwatch.db", cfg.app.data_dir));

    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let page_url = Url::parse(&cfg.watch.page_url).context("invalid watch.page_url")?;
    let state = AppState {
        pool,
        http: reqwest::Client::new(),
        parser: Arc::new(CardGridParser::new(page_url)),
        email: Arc::new(ResendMailer::from_config(&cfg.email)),
        sms: Arc::new(ClickSendSms::from_config(&cfg.sms)),
        fetch_options: FetchOptions::default(),
        config: cfg.clone(),
    };

    let bind_addr = cfg.app.bind_addr.clone();
    info!(%bind_addr, page = %cfg.watch.page_url, "starting arrival watcher");
    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .wrap(middleware::Logger::default())
            .configure(server::routes)
    })
    .bind(&bind_addr)?
    .workers(2)
    .run()
    .await?;

    Ok(())
}
