use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use tokio::net::{TcpListener, UdpSocket};
use tokio_util::sync::CancellationToken;

use periscope::dns::{fqdn, serve_tcp, serve_udp, ServerConfig, TsigKey};
use periscope::obfuscate;

#[derive(Parser, Debug)]
#[command(name = "periscope-dns")]
#[command(about = "Authoritative tracer/reflection nameserver", long_about = None)]
struct Args {
    /// Port to listen on (UDP and TCP)
    #[arg(long, default_value_t = 53)]
    port: u16,

    /// Subdomain this server is authoritative for
    #[arg(long, default_value = "v1.nxdomain.us")]
    subdomain: String,

    /// HMAC-MD5 TSIG key as keyname:base64
    #[arg(long)]
    tsig: Option<String>,

    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level))
        .init();

    obfuscate::randomize_keys();

    let tsig = match &args.tsig {
        Some(spec) => Some(TsigKey::parse(spec).context("invalid --tsig")?),
        None => None,
    };

    let cfg = Arc::new(ServerConfig {
        helper_domain: fqdn(&args.subdomain),
        tsig,
    });

    let udp = UdpSocket::bind(("::", args.port))
        .await
        .with_context(|| format!("failed to bind udp port {}", args.port))?;
    let tcp = TcpListener::bind(("::", args.port))
        .await
        .with_context(|| format!("failed to bind tcp port {}", args.port))?;

    info!(
        "periscope-dns starting on port {} for {}",
        args.port, cfg.helper_domain
    );

    let cancel = CancellationToken::new();
    let udp_task = tokio::spawn(serve_udp(Arc::clone(&cfg), udp, cancel.clone()));
    let tcp_task = tokio::spawn(serve_tcp(Arc::clone(&cfg), tcp, cancel.clone()));

    wait_for_shutdown().await?;
    info!("signal received, stopping");
    cancel.cancel();
    let _ = udp_task.await;
    let _ = tcp_task.await;
    Ok(())
}

async fn wait_for_shutdown() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}
