use actix_web::{middleware, web, App, HttpServer};
use neuronav::analyzer::Analyzer;
use neuronav::config::Settings;
use neuronav::manager::ScanManager;
use neuronav::server;
use neuronav::uploads::UploadStore;
use neuronav::util::init_tracing;
use std::sync::RwLock;
use std::{env, process};
use tracing::{error, info};

const USAGE: &str = "usage: ./neuronav [config file]";

fn get_args() -> Option<String> {
    let args: Vec<String> = env::args().collect();
    if args.len() > 2 {
        println!("{USAGE}");
        process::exit(1);
    }
    args.get(1).cloned()
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    let config_file = get_args();
    let settings = Settings::load(config_file.as_deref())?;
    init_tracing(&settings.log.filter);

    info!("loading model from {:?}", settings.model.manifest);
    let analyzer = match Analyzer::from_settings(&settings) {
        Ok(analyzer) => web::Data::new(analyzer),
        Err(e) => {
            error!("could not start: {e}");
            return Err(e.into());
        }
    };
    info!("model loaded, explaining with layer {}", analyzer.explainer().layer());

    let uploads = web::Data::new(UploadStore::new(&settings.uploads));
    let scans = web::Data::new(RwLock::new(ScanManager::with_capacity(
        settings.scans.max_records,
    )));
    let max_upload_size = uploads.max_size();
    let cors = settings.cors.clone();
    info!("allowing browser origins {:?}", cors.allowed_origins);

    // Start the HTTP server
    let mut server = HttpServer::new(move || {
        App::new()
            .app_data(analyzer.clone())
            .app_data(uploads.clone())
            .app_data(scans.clone())
            .wrap(server::cors(&cors))
            .wrap(middleware::Logger::default())
            .configure(server::configure(max_upload_size))
    });
    if settings.server.workers > 0 {
        server = server.workers(settings.server.workers);
    }

    info!(
        "listening on {}:{}",
        settings.server.host, settings.server.port
    );
    server
        .bind((settings.server.host.as_str(), settings.server.port))?
        .run()
        .await?;
    Ok(())
}
