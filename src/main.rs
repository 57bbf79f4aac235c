use std::process;

use storefront_cache::{
    application::{commands, error::AppError},
    cache::CacheService,
    config,
    infra::telemetry,
};
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(error.exit_code());
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt()
        .with_writer(std::io::stderr)
        .with_max_level(Level::ERROR)
        .finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    telemetry::init(&settings.logging)?;
    info!(
        provider = %settings.provider.base_url,
        storage = %settings.storage.directory.display(),
        persist = settings.storage.enabled,
        "Configuration loaded"
    );

    let service = commands::build_service(&settings)?;
    let result = dispatch(&service, cli_args.command).await;
    service.shutdown().await;
    result
}

async fn dispatch(service: &CacheService, command: config::Command) -> Result<(), AppError> {
    let output = match command {
        config::Command::Warm(args) => {
            commands::render_json(&commands::warm(service, &args).await)?
        }
        config::Command::Stats => commands::render_json(&commands::stats(service))?,
        config::Command::RefreshAll(args) => {
            commands::render_json(&commands::refresh_all(service, &args).await)?
        }
        config::Command::Show(args) => commands::render_json(&commands::show(service, &args)?)?,
    };

    println!("{output}");
    Ok(())
}
