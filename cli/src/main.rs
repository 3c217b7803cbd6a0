//! The main entrypoint for makedistro, which just performs global initialization
//! and then calls out into the library.
use anyhow::Result;

async fn run() -> Result<()> {
    makedistro_utils::initialize_tracing();
    tracing::trace!("starting");
    makedistro_lib::cli::run_from_iter(std::env::args()).await
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    if let Err(e) = run().await {
        if !makedistro_lib::cli::error_is_reported(&e) {
            tracing::error!("{:#}", e);
        }
        std::process::exit(1);
    }
}
