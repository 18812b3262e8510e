//! mtveil — MTProto proxy server.
//!
//! Configuration is environment-only; with nothing set it binds `:443`,
//! generates a FakeTLS secret for `google.com`, and logs the secret to add
//! to a client.

use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = run() {
        eprintln!("\n✗ {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = mtveil::Config::from_env()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(mtveil::listener::run(config))?;
    Ok(())
}
