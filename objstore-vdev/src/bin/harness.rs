//! Standalone CLI for exercising a `Device` against a real agent socket
//! without a host filesystem attached. Opens the pool, issues one read and
//! one write at block 0, then closes cleanly.

use std::collections::HashMap;
use std::path::PathBuf;

use clap::Parser;
use log::info;
use objstore_vdev::{
    CompletionReceiver, Device, IoOutcome, IoRequest, Priority, SpaLoadState, Tunables,
    CONFIG_KEY_CREDENTIALS, CONFIG_KEY_CREDENTIALS_LOCATION, CONFIG_KEY_ENDPOINT,
    CONFIG_KEY_REGION,
};

#[derive(Parser, Debug)]
#[command(about = "Exercise an object-store vdev against an agent socket")]
struct Args {
    /// Path to the agent's Unix domain socket.
    #[arg(long, default_value = "/run/zfs_socket")]
    socket: PathBuf,

    /// Bucket/device path identifying this vdev to the agent.
    #[arg(long)]
    bucket: String,

    /// Object store endpoint, forwarded to the agent at pool create/open.
    #[arg(long)]
    endpoint: String,

    /// Object store region, forwarded to the agent at pool create/open.
    #[arg(long)]
    region: String,

    /// Path the agent should read credentials from.
    #[arg(long)]
    credentials_location: String,

    /// Credential material forwarded to the agent, never logged.
    #[arg(long, default_value = "")]
    credentials: String,

    /// Pool name, only meaningful with --create.
    #[arg(long, default_value = "harness-pool")]
    pool_name: String,

    /// Pool GUID.
    #[arg(long, default_value_t = 1)]
    guid: u64,

    /// Send a create-pool request before opening.
    #[arg(long)]
    create: bool,

    #[arg(long, default_value_t = objstore_vdev::DEFAULT_ASHIFT)]
    logical_ashift: u32,

    #[arg(long, default_value_t = objstore_vdev::DEFAULT_ASHIFT)]
    physical_ashift: u32,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let mut config = HashMap::new();
    config.insert(CONFIG_KEY_ENDPOINT.to_string(), args.endpoint);
    config.insert(CONFIG_KEY_REGION.to_string(), args.region);
    config.insert(
        CONFIG_KEY_CREDENTIALS_LOCATION.to_string(),
        args.credentials_location,
    );
    config.insert(CONFIG_KEY_CREDENTIALS.to_string(), args.credentials);

    let device = Device::init(&config).expect("init failed");
    let load_state = if args.create {
        SpaLoadState::Create
    } else {
        SpaLoadState::Open
    };
    let tunables = Tunables {
        logical_ashift: args.logical_ashift,
        physical_ashift: args.physical_ashift,
    };

    let opened = device
        .open(
            &args.bucket,
            &args.pool_name,
            args.guid,
            objstore_vdev::SpaMode::ReadWrite,
            load_state,
            false,
            tunables,
            &args.socket,
        )
        .expect("open failed");
    info!(
        "opened: psize={} max_psize={} logical_ashift={} physical_ashift={} non_rotational={} trim_supported={}",
        opened.psize,
        opened.max_psize,
        opened.logical_ashift,
        opened.physical_ashift,
        opened.non_rotational,
        opened.trim_supported
    );

    let write_rx = device
        .io_start(
            IoRequest::Write {
                offset: 0,
                data: vec![0xAB; 512],
            },
            Priority::Sync,
        )
        .expect("write submit failed");
    await_outcome("write", write_rx);

    let read_rx = device
        .io_start(IoRequest::Read { offset: 0, size: 512 }, Priority::Sync)
        .expect("read submit failed");
    await_outcome("read", read_rx);

    device.close(false);
    device.fini();
}

fn await_outcome(label: &str, rx: CompletionReceiver) {
    match rx.recv() {
        Ok(completion) => match completion.outcome {
            IoOutcome::ReadComplete(data) => {
                info!("{label} complete: {} bytes, delay={:?}", data.len(), completion.delay)
            }
            IoOutcome::WriteComplete => info!("{label} complete, delay={:?}", completion.delay),
            IoOutcome::Acked => info!("{label} acked, delay={:?}", completion.delay),
            IoOutcome::Err(e) => {
                eprintln!("{label} failed: {e}");
                std::process::exit(1);
            }
        },
        Err(_) => {
            eprintln!("{label} completion channel dropped");
            std::process::exit(1);
        }
    }
}
