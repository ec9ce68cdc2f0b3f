use actix_web::{web::Data, App, HttpServer};
use tracing::level_filters::LevelFilter;
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, FmtSubscriber};

use dovecote::api;
use dovecote::config::Config;
use dovecote::service::Service;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("DOVECOTE_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    let config = Config::load()?;
    let listen_addr = config.listen_addr.clone();

    let service = Service::connect_with(config).await?;
    let flush = service.start_flush_loop();

    let data = Data::new(service);

    HttpServer::new(move || {
        App::new()
            .wrap(TracingLogger::default())
            .service(api::chat::service())
            .app_data(data.clone())
    })
    .bind(listen_addr.as_str())?
    .run()
    .await?;

    flush.shutdown().await;

    Ok(())
}
