use std::env;

#[tokio::main]
async fn main() {
    let mut args = env::args().skip(1);
    let cmd = args.next().unwrap_or_default();
    if cmd != "serve" {
        eprintln!("Usage: courier serve --config <path>");
        std::process::exit(2);
    }

    let mut config_path = String::from("./config/example-config.yaml");
    while let Some(arg) = args.next() {
        if arg == "--config" {
            match args.next() {
                Some(v) => config_path = v,
                None => {
                    eprintln!("--config requires a path");
                    std::process::exit(2);
                }
            }
        }
    }

    let cfg = match courier_config::load_and_validate(&config_path) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("failed to load config: {e}");
            std::process::exit(1);
        }
    };
    courier_server::logging::init_logging(&cfg.logging);
    tracing::info!(config = %config_path, store = %cfg.store.kind, remote = %cfg.remote.mode, "starting courier");

    if let Err(e) = courier_server::serve(cfg).await {
        tracing::error!(error = %e, "server exited with error");
        eprintln!("server exited with error: {e}");
        std::process::exit(1);
    }
}
