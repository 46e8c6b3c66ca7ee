// Session replay example
//
// Opens a session archive, prints its devices and replays the logic
// samples into a DataFrame.

use clap::Parser;
use labfeed_rs::units::samplerate_string;
use labfeed_rs::{session_file, DatafeedBus, LogicCapture, Packet, SessionFile};
use std::cell::Cell;
use std::rc::Rc;

#[derive(Parser)]
#[command(name = "session_replay")]
#[command(version = "1.0")]
#[command(about = "Replay a session file")]
struct Args {
    /// Session file to replay
    path: String,

    #[arg(short, long, default_value_t = 10, help = "Number of rows to print")]
    rows: usize,

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

    let version = session_file::check(&args.path)?;
    println!("Session {} (format version {version})", args.path);

    let mut session = SessionFile::open(&args.path)?;
    for device in session.devices() {
        println!(
            "  {}: {} logic / {} analog channels at {}",
            device.section,
            device.logic_channels().count(),
            device.analog_channels().count(),
            samplerate_string(device.samplerate)
        );
    }

    let channels = session
        .devices()
        .first()
        .map(|device| device.channels.clone())
        .unwrap_or_default();

    let mut bus = DatafeedBus::new();
    let capture = LogicCapture::attach(&channels, &mut bus);
    let analog_samples = Rc::new(Cell::new(0usize));
    let counter = Rc::clone(&analog_samples);
    bus.add_callback(move |packet: &Packet| {
        if let Packet::Analog(analog) = packet {
            counter.set(counter.get() + analog.num_samples());
        }
    });

    let summary = session.replay(&mut bus)?;
    println!(
        "Replayed {} logic and {} analog samples",
        summary.logic_samples, summary.analog_samples
    );
    println!("Analog samples seen on the bus: {}", analog_samples.get());

    let capture = capture.borrow();
    if capture.num_samples() > 0 {
        let df = capture.to_dataframe()?;
        println!("\n{}", df.head(Some(args.rows)));
    }
    Ok(())
}
