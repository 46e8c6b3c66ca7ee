// Mooshimeter streaming example
//
// Connects to a Mooshimeter behind a serial bridge, configures both inputs
// and prints every reading until a limit is hit or the meter stops.

use clap::Parser;
use labfeed_rs::{
    AcquisitionLimits, Mooshimeter, MooshimeterConfig, Packet, SerialBridge, SerialBridgeConfig,
    SessionWriter, SessionWriterConfig,
};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "mooshimeter_stream")]
#[command(version = "1.0")]
#[command(about = "Stream readings from a Mooshimeter")]
struct Args {
    /// Serial port of the bridge
    port: String,

    #[arg(short, long, default_value_t = 115_200, help = "Baud rate of the serial bridge")]
    baud_rate: u32,

    #[arg(short, long, default_value_t = 125, help = "Samplerate in Hz (rounded up to a supported rate)")]
    samplerate: u64,

    #[arg(short, long, default_value = "A,V", help = "Channel configuration, e.g. 'A:1,V:60:RMS'")]
    channels: String,

    #[arg(long, help = "Also stream the real power channel")]
    power: bool,

    #[arg(long, help = "Stop after this many samples")]
    limit_samples: Option<u64>,

    #[arg(long, help = "Stop after this many milliseconds")]
    limit_msec: Option<u64>,

    #[arg(short, long, help = "Write the readings to a session file")]
    output: Option<String>,

    #[arg(short, long, help = "Show debug information and detailed logs")]
    verbose: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if args.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::init();
    }

    println!("Mooshimeter Stream");
    println!("==================");
    println!("Port: {} @ {} baud", args.port, args.baud_rate);

    let bridge = SerialBridge::open(SerialBridgeConfig::new(&args.port).baud_rate(args.baud_rate))?;
    let mut meter = Mooshimeter::new(bridge, MooshimeterConfig::default());
    meter.open()?;
    println!("✓ Connected, tree received");

    meter.set_samplerate(args.samplerate)?;
    meter.apply_channel_config(&args.channels)?;
    meter.set_channel_enabled(labfeed_rs::MeterChannel::Power, args.power);
    println!("Samplerate: {} Hz", meter.samplerate()?);

    let mut limits = AcquisitionLimits::default();
    if let Some(samples) = args.limit_samples {
        limits = limits.samples(samples);
    }
    if let Some(msec) = args.limit_msec {
        limits = limits.duration(Duration::from_millis(msec));
    }
    meter.set_limits(limits);

    if let Some(path) = &args.output {
        let writer = SessionWriter::save_init(
            path,
            &meter.channels(),
            meter.samplerate()?,
            SessionWriterConfig::default(),
        )?;
        let writer = Rc::new(RefCell::new(writer));
        meter.bus_mut().add_callback(move |packet: &Packet| {
            if let Err(e) = writer.borrow_mut().write_packet(packet) {
                log::error!("Failed to store packet: {e}");
            }
        });
        println!("Recording to {path}");
    }

    meter.bus_mut().add_callback(|packet: &Packet| {
        if let Packet::Analog(analog) = packet {
            let channel = analog.meaning.channels.join(",");
            let digits = usize::try_from(analog.digits).unwrap_or(0);
            let unit = analog.meaning.unit.symbol();
            for value in &analog.data {
                println!("{channel}: {value:.digits$} {unit}");
            }
        }
    });

    meter.start_acquisition()?;
    println!("Streaming, press Ctrl+C to stop\n");
    while meter.service()? {}

    meter.close();
    println!("\nDone");
    Ok(())
}
