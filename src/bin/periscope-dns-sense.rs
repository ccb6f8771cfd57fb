use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::process::exit;

use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use periscope::cidr;
use periscope::dns::{fqdn, format_line, sense_one};
use periscope::obfuscate;
use periscope::workers::{default_workers, WorkerPool};

#[derive(Parser, Debug)]
#[command(name = "periscope-dns-sense")]
#[command(
    about = "Identify hosts reachable by an open resolver via a tracer helper domain",
    long_about = None
)]
struct Args {
    /// Port to send queries to
    #[arg(long, default_value_t = 53)]
    port: u16,

    /// Number of parallel workers
    #[arg(long, default_value_t = default_workers())]
    threads: usize,

    /// Subdomain handled by the tracer nameserver
    #[arg(long, default_value = "v1.nxdomain.us")]
    subdomain: String,

    /// Quiet mode, only show positive results
    #[arg(long)]
    quiet: bool,

    /// Open resolver to probe through
    resolver: IpAddr,

    /// Target networks (CIDRs or bare addresses)
    #[arg(required = true)]
    cidrs: Vec<String>,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let _ = err.print();
            exit(1);
        }
    };

    obfuscate::randomize_keys();

    let resolver = SocketAddr::new(args.resolver, args.port);
    let resolver_display = resolver.to_string();
    let helper_domain = fqdn(&args.subdomain);
    let quiet = args.quiet;

    let (tx, rx) = mpsc::channel::<Ipv4Addr>(1024);
    let cancel = CancellationToken::new();

    let pool = WorkerPool::spawn(args.threads, rx, move |ip| {
        let helper_domain = helper_domain.clone();
        let resolver_display = resolver_display.clone();
        async move {
            let outcome = sense_one(resolver, &helper_domain, ip).await;
            if outcome.alive || !quiet {
                println!("{}", format_line(ip, &resolver_display, &outcome));
            }
        }
    });

    for cidr in &args.cidrs {
        if let Err(err) = cidr::addresses_from_cidr(cidr, &tx, &cancel).await {
            println!("input: {err}");
        }
    }
    drop(tx);
    pool.join().await;
}
