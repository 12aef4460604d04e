use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use modemlink_frame::channel_name;
use modemlink_link::{CommState, DeviceStats, EchoPeer, LinkConfig, LinkDevice};
use modemlink_transport::{HeapRegion, TransportKind};
use serde::Serialize;
use tracing::{debug, info};

use crate::cmd::{parse_timeout, LoopbackArgs};
use crate::exit::{link_error, CliError, CliResult, DATA_INVALID, INTERNAL, SUCCESS, TIMEOUT};
use crate::output::{print_json, OutputFormat};

#[derive(Serialize)]
struct LoopbackReport {
    transport: TransportKind,
    channel: u8,
    channel_name: &'static str,
    count: usize,
    payload_size: usize,
    min_us: u64,
    avg_us: u64,
    max_us: u64,
    peer_echoed: u64,
    device: DeviceStats,
}

pub fn run(args: LoopbackArgs, config: LinkConfig, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_timeout(&args.timeout)?;
    let config = if args.dpram {
        LinkConfig {
            transport: TransportKind::Dpram,
            shmem: LinkConfig::dpram().shmem,
            ..config
        }
    } else {
        config
    };

    let region = Arc::new(HeapRegion::new(config.region_size()));
    let device = LinkDevice::shmem(region.clone(), config.clone())
        .map_err(|err| link_error("opening device", err))?;
    let peer = EchoPeer::new(region, &config).map_err(|err| link_error("opening peer", err))?;

    let (tx, rx) = mpsc::channel();
    device.register_channel(args.channel, move |msg| {
        let _ = tx.send(msg.to_vec());
    });

    let stop = Arc::new(AtomicBool::new(false));
    let peer_thread = spawn_peer(peer, stop.clone(), config.poll_interval())?;
    let worker = device
        .spawn_worker()
        .map_err(|err| CliError::new(INTERNAL, format!("spawning worker: {err}")))?;

    let outcome = round_trips(&device, &args, &rx, timeout);

    device.shutdown();
    stop.store(true, Ordering::Release);
    let _ = worker.join();
    let peer_echoed = peer_thread.join().unwrap_or(0);

    let rtts = outcome?;
    let report = LoopbackReport {
        transport: config.transport,
        channel: args.channel,
        channel_name: channel_name(args.channel),
        count: rtts.len(),
        payload_size: args.size,
        min_us: rtts.iter().copied().min().unwrap_or(0),
        avg_us: average(&rtts),
        max_us: rtts.iter().copied().max().unwrap_or(0),
        peer_echoed,
        device: device.stats(),
    };
    print_report(&report, format);
    Ok(SUCCESS)
}

fn spawn_peer(
    peer: EchoPeer,
    stop: Arc<AtomicBool>,
    interval: Duration,
) -> CliResult<thread::JoinHandle<u64>> {
    thread::Builder::new()
        .name("echo-peer".to_string())
        .spawn(move || {
            while !stop.load(Ordering::Acquire) {
                match peer.pump() {
                    Ok(0) => thread::sleep(interval),
                    Ok(_) => {}
                    Err(err) => {
                        debug!(error = %err, "echo peer stopped");
                        break;
                    }
                }
            }
            peer.echoed()
        })
        .map_err(|err| CliError::new(INTERNAL, format!("spawning peer: {err}")))
}

fn round_trips(
    device: &LinkDevice,
    args: &LoopbackArgs,
    rx: &mpsc::Receiver<Vec<u8>>,
    timeout: Duration,
) -> CliResult<Vec<u64>> {
    device
        .init_comm()
        .map_err(|err| link_error("starting link", err))?;
    let deadline = Instant::now() + timeout;
    while device.state() != CommState::Online {
        if Instant::now() >= deadline {
            return Err(CliError::new(
                TIMEOUT,
                format!("handshake timed out after {timeout:?}"),
            ));
        }
        thread::sleep(Duration::from_millis(1));
    }
    info!(transport = %device.transport().kind(), "link online");

    let mut rtts = Vec::with_capacity(args.count);
    for seq in 0..args.count {
        let payload = pattern(seq, args.size);
        let start = Instant::now();
        device
            .send(args.channel, &payload)
            .map_err(|err| link_error("send", err))?;
        let echoed = rx.recv_timeout(timeout).map_err(|_| {
            CliError::new(
                TIMEOUT,
                format!("echo {seq} not received after {timeout:?}"),
            )
        })?;
        if echoed != payload {
            return Err(CliError::new(
                DATA_INVALID,
                format!("echo {seq} differs from what was sent"),
            ));
        }
        rtts.push(start.elapsed().as_micros() as u64);
    }
    Ok(rtts)
}

fn pattern(seq: usize, size: usize) -> Vec<u8> {
    (0..size).map(|i| (seq + i) as u8).collect()
}

fn average(values: &[u64]) -> u64 {
    if values.is_empty() {
        0
    } else {
        values.iter().sum::<u64>() / values.len() as u64
    }
}

fn print_report(report: &LoopbackReport, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(report),
        OutputFormat::Table | OutputFormat::Pretty => {
            println!("Loopback:");
            println!("  Transport:    {}", report.transport);
            println!(
                "  Channel:      {} ({})",
                report.channel, report.channel_name
            );
            println!(
                "  Round trips:  {} x {} bytes",
                report.count, report.payload_size
            );
            println!(
                "  Latency:      min={}us avg={}us max={}us",
                report.min_us, report.avg_us, report.max_us
            );
            println!(
                "  Link:         tx={} frames rx={} frames backpressure={} resyncs={}",
                report.device.link.tx_frames,
                report.device.link.rx_frames,
                report.device.link.backpressure,
                report.device.link.resyncs
            );
            println!("  State:        {}", report.device.state);
        }
        OutputFormat::Raw => println!("{}", report.avg_us),
    }
}
