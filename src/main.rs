use anyhow::{bail, Context};
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod app;
mod catalog;
mod cli;
mod config;
mod eid;
mod images;
mod search;
mod storage;
#[cfg(test)]
mod tests;
mod web;

use app::service::SearchRequest;
use search::{ImageSource, SearchFilters};

fn runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = cli::Args::parse();
    let mut factory = app::AppFactory::from_env()?;

    match args.command {
        cli::Command::Serve { bind } => {
            if let Some(bind) = bind.or_else(|| std::env::var("PIXMATCH_BIND").ok()) {
                factory.config_mut().bind = bind;
            }
            let service = factory.build()?;
            web::start_daemon(service)?;
        }

        cli::Command::Index { ids, all } => {
            if ids.is_empty() && !all {
                bail!("pass product ids or --all");
            }

            let service = factory.build()?;
            let report = runtime()?.block_on(async {
                service.load_snapshot().await?;
                let report = if all {
                    service.index_all().await
                } else {
                    service.index_products(&ids).await
                };
                anyhow::Ok(report)
            })?;

            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        cli::Command::Search {
            image,
            top_k,
            min_stock,
            categories,
            min_price,
            max_price,
        } => {
            let request = SearchRequest {
                top_k,
                filters: SearchFilters {
                    min_stock,
                    categories: categories.as_deref().map(cli::parse_list),
                    max_price,
                    min_price,
                },
                ..Default::default()
            };

            let service = factory.build()?;
            let results = runtime()?.block_on(async {
                if service.load_snapshot().await? == 0 {
                    log::warn!("no indexed products, run `pixmatch index` first");
                }
                service
                    .search_source(ImageSource::from_locator(&image), request)
                    .await
            })?;

            println!("{}", serde_json::to_string_pretty(&results)?);
        }
    }

    Ok(())
}
