use cloudenvoy_cli::run_cli;
use tracing::error;

#[tokio::main]
async fn main() {
    if let Err(e) = run_cli().await {
        error!("{}", e);
        // The log filter may hide the event above, or logging may not be up.
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}
