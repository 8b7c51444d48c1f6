#[tokio::main]
async fn main() {
    if let Err(error) = slomo_app::run_from_env().await {
        if tracing::dispatcher::has_been_set() {
            tracing::error!("{error:#}");
        } else {
            eprintln!("Error: {error:#}");
        }
        std::process::exit(1);
    }
}
