use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::{App, Arg, ArgMatches};
use lazy_static::lazy_static;
use log::{error, info};
use thiserror::Error;

use usbio::{
    calc_packet_information, ConfigError, DeviceSpeed, FrameNumber, IsochTransfer, LoopbackDevice,
    NoCallbacks, OvlPool, PipeDevice, PipeStream, PoolConfig, StreamConfig, UsbError, WaitFlags,
};

const BULK_IN: u8 = 0x81;
const BULK_OUT: u8 = 0x02;
const ISOCH_IN: u8 = 0x83;
const WAIT: Option<Duration> = Some(Duration::from_secs(5));
const STOP_GRACE: Duration = Duration::from_millis(500);

lazy_static! {
    static ref DEFAULT_PROFILE: StreamConfig = {
        const TOML: &str = include_str!("../usbioctl.toml");

        StreamConfig::from_toml_str(TOML).expect("Failed to parse internally embedded profile")
    };
}

#[derive(Debug, Error)]
enum CliError {
    #[error("{0}")]
    Usb(#[from] UsbError),

    #[error("profile: {0}")]
    Config(#[from] ConfigError),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid value for {0}")]
    Argument(&'static str),
}

type Result<T> = std::result::Result<T, CliError>;

fn number<T: std::str::FromStr>(matches: &ArgMatches, name: &'static str) -> Result<T> {
    matches
        .value_of(name)
        .ok_or(CliError::Argument(name))?
        .parse()
        .map_err(|_| CliError::Argument(name))
}

fn speed(matches: &ArgMatches) -> Result<DeviceSpeed> {
    match matches.value_of("SPEED").unwrap_or("high") {
        "low" => Ok(DeviceSpeed::Low),
        "full" => Ok(DeviceSpeed::Full),
        "high" => Ok(DeviceSpeed::High),
        "super" => Ok(DeviceSpeed::Super),
        _ => Err(CliError::Argument("SPEED")),
    }
}

fn profile(matches: &ArgMatches) -> Result<StreamConfig> {
    match matches.value_of("PROFILE") {
        Some(path) => {
            info!("loading stream profile {}", path);
            Ok(StreamConfig::from_file(path)?)
        }
        None => Ok(DEFAULT_PROFILE.clone()),
    }
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| i as u8).collect()
}

/// Writes `count` transfers through a pool, keeping at most `capacity` of them outstanding.
fn run_pool(device: Arc<LoopbackDevice>, matches: &ArgMatches) -> Result<()> {
    let capacity: usize = number(matches, "CAPACITY")?;
    let count: usize = number(matches, "COUNT")?;
    let size: usize = number(matches, "SIZE")?;

    let ep_out = device.add_bulk_pipe(BULK_OUT, 512)?;
    let pool = OvlPool::from_config(device.clone(), &PoolConfig { capacity })?;
    let mut total = 0;

    for _ in 0..count {
        if pool.acquired_count() == pool.capacity() {
            let (_, result) = pool.wait_oldest(WAIT, WaitFlags::RELEASE_ALWAYS)?;
            total += result?;
        }
        let ovl = pool.acquire()?;
        ovl.write_pipe(ep_out, pattern(size))?;
    }
    while pool.acquired_count() > 0 {
        let (_, result) = pool.wait_oldest(WAIT, WaitFlags::RELEASE_ALWAYS)?;
        total += result?;
    }
    pool.free();

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "transfers": count,
            "bytes": total,
            "max_in_flight": device.max_in_flight(ep_out)?,
        }))?
    );
    Ok(())
}

fn run_stream(device: Arc<LoopbackDevice>, matches: &ArgMatches) -> Result<()> {
    let config = profile(matches)?;
    let bytes: usize = number(matches, "BYTES")?;
    let reading = matches.subcommand_matches("read").is_some();

    let pipe_id = if reading {
        device.add_bulk_pipe(BULK_IN, 512)?
    } else {
        device.add_bulk_pipe(BULK_OUT, 512)?
    };
    let stream = PipeStream::new(device.clone(), pipe_id, &config, Arc::new(NoCallbacks))?;

    if reading {
        device.inject(pipe_id, &pattern(bytes))?;
    }
    stream.start()?;

    let mut total = 0;
    if reading {
        let mut buffer = vec![0; bytes];
        while total < bytes {
            let read = stream.read(&mut buffer[total..])?;
            if read == 0 {
                break;
            }
            total += read;
        }
    } else {
        let data = pattern(bytes);
        while total < bytes {
            total += stream.write(&data[total..])?;
        }
        stream.flush()?;
        device.wait_captured(pipe_id, bytes, Duration::from_secs(5))?;
    }
    info!("{} {} bytes on pipe {}", if reading { "read" } else { "wrote" }, total, pipe_id);

    stream.stop(STOP_GRACE)?;
    println!("{}", serde_json::to_string_pretty(&stream.stats())?);
    stream.free();
    Ok(())
}

fn run_isoch(device: Arc<LoopbackDevice>, matches: &ArgMatches) -> Result<()> {
    let max_packet_size: u16 = number(matches, "MPS")?;
    let interval: u8 = number(matches, "INTERVAL")?;
    let packets: usize = number(matches, "PACKETS")?;

    let pipe_id = device.add_isoch_pipe(ISOCH_IN, max_packet_size, interval)?;
    let information =
        calc_packet_information(device.speed().is_high_speed(), &device.query_pipe(pipe_id)?)?;

    let length = packets * usize::from(max_packet_size);
    let pool = OvlPool::new(device.clone(), 1)?;
    let mut transfer = IsochTransfer::new(device.clone(), pipe_id, packets, vec![0; length])?;
    // One byte short of full so the last packet comes back short.
    device.inject(pipe_id, &pattern(length.saturating_sub(1)))?;

    let ovl = pool.acquire()?;
    let mut frame = FrameNumber::Asap;
    transfer.read(&ovl, &mut frame, 0, 0)?;
    ovl.wait(WAIT, WaitFlags::empty())?;
    let transferred = transfer.reclaim(&ovl)?;
    ovl.release()?;

    let mut packet_list = Vec::with_capacity(packets);
    for index in 0..transfer.number_of_packets() {
        packet_list.push(transfer.get_packet(index)?);
    }
    let next_frame = match frame {
        FrameNumber::Frame(next) => Some(next),
        FrameNumber::Asap => None,
    };

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "information": information,
            "transferred": transferred,
            "next_frame": next_frame,
            "packets": packet_list,
        }))?
    );
    transfer.free();
    pool.free();
    Ok(())
}

fn show_profile(matches: &ArgMatches) -> Result<()> {
    let config = profile(matches)?;
    let flags = config.effective_flags()?;
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "max_transfer_size": config.max_transfer_size,
            "max_pending_transfers": config.max_pending_transfers,
            "max_pending_io": config.max_pending_io,
            "no_partial_xfers": flags.no_partial_xfers(),
            "timeout_ms": flags.timeout().map(|timeout| timeout.as_millis() as u64),
        }))?
    );
    Ok(())
}

fn run(matches: &ArgMatches) -> Result<()> {
    if let Some(profile_matches) = matches.subcommand_matches("profile") {
        return show_profile(profile_matches);
    }

    let device = Arc::new(LoopbackDevice::new(speed(matches)?)?);
    if let Some(latency) = matches.value_of("LATENCY") {
        let millis = latency.parse().map_err(|_| CliError::Argument("LATENCY"))?;
        device.set_latency(Duration::from_millis(millis));
    }

    match matches.subcommand() {
        ("pool", Some(pool_matches)) => run_pool(device, pool_matches),
        ("stream", Some(stream_matches)) => run_stream(device, stream_matches),
        ("isoch", Some(isoch_matches)) => run_isoch(device, isoch_matches),
        _ => {
            println!("{}", matches.usage());
            Ok(())
        }
    }
}

fn main() {
    let profile_arg = Arg::with_name("PROFILE")
        .takes_value(true)
        .long("profile")
        .short("c")
        .help("TOML stream profile, overrides the built in one");

    let matches = App::new("usbioctl")
        .about("Exercises asynchronous pipe I/O against a loopback device")
        .arg(
            Arg::with_name("SPEED")
                .takes_value(true)
                .long("speed")
                .short("s")
                .possible_values(&["low", "full", "high", "super"]),
        )
        .arg(
            Arg::with_name("LATENCY")
                .takes_value(true)
                .long("latency")
                .help("Device latency per transfer in milliseconds"),
        )
        .arg(
            Arg::with_name("VERBOSE")
                .long("verbose")
                .short("v"),
        )
        .subcommand(
            App::new("pool")
                .about("Writes transfers through an operation pool")
                .arg(Arg::with_name("CAPACITY").takes_value(true).long("capacity").default_value("4"))
                .arg(Arg::with_name("COUNT").takes_value(true).long("count").default_value("16"))
                .arg(Arg::with_name("SIZE").takes_value(true).long("size").default_value("512")),
        )
        .subcommand(
            App::new("stream")
                .about("Moves data through a pipe stream and prints its statistics")
                .arg(profile_arg.clone())
                .arg(Arg::with_name("BYTES").takes_value(true).long("bytes").default_value("65536"))
                .subcommand(App::new("read"))
                .subcommand(App::new("write")),
        )
        .subcommand(
            App::new("isoch")
                .about("Reads one isochronous transfer and prints its packets")
                .arg(Arg::with_name("MPS").takes_value(true).long("mps").default_value("64"))
                .arg(Arg::with_name("INTERVAL").takes_value(true).long("interval").default_value("1"))
                .arg(Arg::with_name("PACKETS").takes_value(true).long("packets").default_value("8")),
        )
        .subcommand(App::new("profile").about("Prints the effective stream profile").arg(profile_arg))
        .get_matches();

    let output_level = if matches.is_present("VERBOSE") {
        log::LevelFilter::Debug
    } else {
        common::output_level()
    };
    common::setup_logging("usb", "tools", "usbioctl", output_level, common::file_level());

    if let Err(err) = run(&matches) {
        error!("usbioctl: {}", err);
        process::exit(1);
    }
}
