use std::collections::BTreeMap;
use std::process::exit;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use log::{error, info, warn};

use periscope::smb::{hex_sequence, probe, CounterPredictor, ProbeReport};

const MIN_REP: usize = 3;
const MIN_LEN: usize = 10;
/// Give up training after this many collected samples.
const MAX_TRAINING_SAMPLES: usize = 250;
/// Give up hunting backward after this many probes.
const MAX_HUNT_PROBES: usize = 10_000;
const SAMPLE_COUNT: usize = 100;

const STATUS_NETWORK_SESSION_EXPIRED: u32 = 0xc000_0203;
const STATUS_ACCESS_DENIED: u32 = 0xc000_0022;
const STATUS_INVALID_PARAMETER: u32 = 0xc000_000d;

#[derive(Parser, Debug)]
#[command(name = "periscope-smb-sessions")]
#[command(
    about = "Monitor or enumerate SMB2 sessions via predictable session IDs",
    long_about = None
)]
struct Args {
    /// Target host
    target: String,

    #[arg(value_enum)]
    mode: Mode,

    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    /// Learn the session-id cycle, then report new sessions as they appear
    Watch,
    /// Learn the cycle, then walk backward probing prior session IDs
    Hunt,
    /// Collect raw session-id samples
    Sample,
}

#[tokio::main]
async fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let _ = err.print();
            exit(1);
        }
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level))
        .init();

    match args.mode {
        Mode::Watch => watch(&args.target).await,
        Mode::Hunt => hunt(&args.target).await,
        Mode::Sample => sample(&args.target).await,
    }
}

/// A plain probe that must yield a session id, or None with the reason
/// already logged (the caller just stops).
async fn next_session_id(dst: &str) -> Option<(u64, ProbeReport)> {
    match probe(dst, None).await {
        Ok(report) => match report.session_id() {
            Some(sid) => Some((sid, report)),
            None => {
                error!("{dst}: no sid: {}", format_attrs(&report.attributes()));
                None
            }
        },
        Err(err) => {
            error!("{dst}: {err}");
            None
        }
    }
}

async fn watch(dst: &str) {
    let mut predictor = CounterPredictor::new(MIN_REP, MIN_LEN);
    let mut shown_info = false;

    loop {
        let Some((sid, report)) = next_session_id(dst).await else {
            break;
        };

        if !shown_info {
            info!(
                "{dst}: determining the session cycle for {}",
                format_attrs(&report.attributes())
            );
            shown_info = true;
        }

        if !predictor.ready() {
            if predictor.sample_count() > MAX_TRAINING_SAMPLES {
                info!("{dst}: could not determine cycle after {MAX_TRAINING_SAMPLES} requests");
                return;
            }
            if predictor.submit_sample(sid) {
                info!(
                    "{dst}: cycle found after {} requests: {}",
                    predictor.sample_count(),
                    hex_sequence(&predictor.cycle())
                );
                info!("{dst}: watching for new sessions...");
            }
            continue;
        }

        let missed = match predictor.check(sid) {
            Ok(missed) => missed,
            Err(err) => {
                info!("{dst}: {err}, recalibrating...");
                predictor = CounterPredictor::new(MIN_REP, MIN_LEN);
                shown_info = false;
                continue;
            }
        };

        for found in missed {
            let report = probe(dst, Some(found)).await.unwrap_or_default();
            let sig = report
                .signature()
                .map(|s| format!("sig:{s}"))
                .unwrap_or_default();
            let status = match report.status() {
                Some(STATUS_NETWORK_SESSION_EXPIRED) => "EXPIRED".to_string(),
                Some(STATUS_ACCESS_DENIED) => {
                    format!("ACTIVE dialect:{}", dialect_display(&report))
                }
                Some(STATUS_INVALID_PARAMETER) => {
                    format!("ACTIVE dialect:!{}", dialect_display(&report))
                }
                Some(other) => format!("0x{other:08x}"),
                None => "UNKNOWN".to_string(),
            };
            info!("{dst}: SESSION 0x{found:016x} is {status} {sig}");
        }

        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

async fn hunt(dst: &str) {
    warn!("{dst}: warning: hunt mode is unreliable and unlikely to find older sessions");
    let mut predictor = CounterPredictor::new(MIN_REP, MIN_LEN);
    let mut shown_info = false;

    'predict: loop {
        let Some((sid, report)) = next_session_id(dst).await else {
            break;
        };

        if !shown_info {
            info!(
                "{dst}: determining the session cycle for {}",
                format_attrs(&report.attributes())
            );
            shown_info = true;
        }

        if !predictor.ready() {
            if predictor.sample_count() > MAX_TRAINING_SAMPLES {
                info!("{dst}: could not determine cycle after {MAX_TRAINING_SAMPLES} requests");
                return;
            }
            if predictor.submit_sample(sid) {
                info!(
                    "{dst}: cycle found after {} requests: {}",
                    predictor.sample_count(),
                    hex_sequence(&predictor.cycle())
                );
                info!("{dst}: hunting for existing sessions...");
            }
            continue;
        }

        let mut sid = sid;
        let mut count = 0usize;
        loop {
            if count > MAX_HUNT_PROBES {
                info!("{dst}: giving up...");
                break 'predict;
            }

            sid = match predictor.previous(sid) {
                Ok(prev) => prev,
                Err(err) => {
                    info!("{dst}: {err}, exiting...");
                    break 'predict;
                }
            };

            let report = match probe(dst, Some(sid)).await {
                Ok(report) => report,
                Err(err) => {
                    info!("{dst}: {err}, exiting...");
                    break 'predict;
                }
            };
            count += 1;

            if count % 1000 == 0 {
                info!("{dst}: sent {count} requests ({sid:x})");
            }

            let sig = report
                .signature()
                .map(|s| format!("sig:{s}"))
                .unwrap_or_default();
            let status = match report.status() {
                Some(STATUS_NETWORK_SESSION_EXPIRED) => continue,
                Some(STATUS_ACCESS_DENIED) => {
                    format!("ACTIVE dialect:{}", dialect_display(&report))
                }
                Some(STATUS_INVALID_PARAMETER) => {
                    format!("ACTIVE dialect:!{}", dialect_display(&report))
                }
                _ => format!("UNKNOWN {}", format_attrs(&report.attributes())),
            };
            info!("{dst}: SESSION 0x{sid:016x} is {status} {sig}");
        }
    }
}

async fn sample(dst: &str) {
    let mut shown_info = false;
    for _ in 0..SAMPLE_COUNT {
        let Some((sid, report)) = next_session_id(dst).await else {
            break;
        };
        if !shown_info {
            info!(
                "{dst}: sampling {SAMPLE_COUNT} session IDs for {}",
                format_attrs(&report.attributes())
            );
            shown_info = true;
        }
        println!("0x{sid:016x}");
    }
}

fn dialect_display(report: &ProbeReport) -> String {
    report
        .dialect()
        .map(|d| format!("0x{d:04x}"))
        .unwrap_or_default()
}

fn format_attrs(attrs: &BTreeMap<String, String>) -> String {
    attrs
        .iter()
        .map(|(k, v)| format!("{k}:{v}"))
        .collect::<Vec<_>>()
        .join(" ")
}
