use {
    anyhow::Result,
    clap::Parser,
    server::start_server,
    std::io::IsTerminal,
    tracing_subscriber::{
        filter::LevelFilter,
        layer::SubscriberExt,
        util::SubscriberInitExt,
        Layer,
    },
};

mod admission;
mod api;
mod auth;
mod cache;
mod config;
mod events;
mod lifecycle;
mod models;
mod processor;
mod queue;
mod repository;
mod server;
mod state;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize a Tracing Subscriber
    let log_layer = tracing_subscriber::fmt::layer()
        .with_file(false)
        .with_line_number(true)
        .with_thread_ids(true)
        .with_target(true)
        .with_ansi(std::io::stderr().is_terminal());

    if std::io::stderr().is_terminal() {
        tracing_subscriber::registry()
            .with(log_layer.compact().with_filter(LevelFilter::INFO))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(log_layer.json().with_filter(LevelFilter::INFO))
            .init();
    }

    // Parse the command line arguments; exits automatically on `--help` or
    // invalid arguments.
    match config::Options::parse() {
        config::Options::Run(opts) => start_server(opts).await,
    }
}
