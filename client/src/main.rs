use clap::Parser;
use peerview_client::config::Config;
use peerview_client::sync::ViewState;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::select;
use tokio::sync::watch;
use tracing::subscriber::set_global_default;
use tracing_log::LogTracer;
use tracing_subscriber::prelude::*;

fn main() -> anyhow::Result<()> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    rt.block_on(main_()).map_err(|e| {
        tracing::error!("{}", e);
        e
    })?;
    Ok(())
}

async fn main_() -> anyhow::Result<()> {
    set_global_default(
        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new(
                std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".into()),
            ))
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr)),
    )?;
    LogTracer::init()?;
    let config = Config::parse();
    let client = peerview_client::connect(&config).await?;
    println!("connected as {}. /camera on|off toggles publishing, /logout leaves.", client.identity());
    let printer = tokio::spawn(print_view(client.view()));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = select! {
            _ = client.closed() => {
                println!("connection lost");
                break;
            }
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            break;
        };
        match line.trim() {
            "" => {}
            "/logout" => break,
            "/camera on" => {
                if !client.set_publishing(true) {
                    println!("no frame to publish, start with --frame");
                }
            }
            "/camera off" => {
                client.set_publishing(false);
            }
            content => client.chat(content).await?,
        }
    }
    client.logout().await;
    printer.abort();
    Ok(())
}

async fn print_view(mut view: watch::Receiver<ViewState>) {
    let mut printed = 0;
    let mut members = Vec::new();
    while view.changed().await.is_ok() {
        let state = view.borrow_and_update().clone();
        for line in state.chat_log().get(printed..).unwrap_or_default() {
            println!("{line}");
        }
        printed = state.chat_log().len();
        if state.members() != members.as_slice() {
            members = state.members().to_vec();
            println!("* online: {}", members.join(", "));
        }
        let mut showing = state.frames().keys().cloned().collect::<Vec<_>>();
        showing.sort();
        tracing::debug!(?showing, "frames on screen");
    }
}
