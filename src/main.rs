use std::process;
use std::sync::Arc;

use log::{error, info};

mod classes;
mod loader;
mod model;
mod preprocess;
mod routes;
mod utils;

use loader::ModelPaths;
use routes::AppState;
use utils::Config;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::from_env();
    let paths = ModelPaths::new(&config.model_dir);

    if let Err(err) = utils::ensure_model_file(paths.frozen_graph()).await {
        // The loader still gets a chance with the other artifacts.
        error!("model fetch failed: {err}");
    }

    info!("starting model loading...");
    let model = match loader::load_model(&paths) {
        Ok(model) => model,
        Err(failure) => {
            error!("could not load model: {failure}");
            process::exit(1);
        }
    };
    info!("model ready");

    let state = Arc::new(AppState {
        model: Box::new(model),
    });
    let app = routes::router(state, config.body_limit_bytes);

    let addr = format!("0.0.0.0:{}", config.port);
    info!("listening on http://{addr}");
    axum::Server::bind(&addr.parse().expect("invalid bind address"))
        .serve(app.into_make_service())
        .await
        .expect("server error");
}
