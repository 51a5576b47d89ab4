use anyhow::Context;
use clap::Parser;
use tracing::{debug, info, warn};

#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Set config file path
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let cfg = station::config::Config::parse(args.config)?;

    utils::set_log(format!(
        "onair={},station={},storage={},tower_http=info",
        cfg.log.level, cfg.log.level, cfg.log.level
    ));
    warn!("set log level : {}", cfg.log.level);
    debug!("config : {:?}", cfg);

    let listener = tokio::net::TcpListener::bind(cfg.http.listen)
        .await
        .with_context(|| format!("bind {}", cfg.http.listen))?;

    station::serve(cfg, listener, async {
        let signal = utils::wait_for_stop_signal().await;
        info!("received {}, shutting down", signal);
    })
    .await?;
    info!("Server shutdown");
    Ok(())
}
