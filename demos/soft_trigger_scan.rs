// Soft trigger example
//
// Runs a multi-stage software trigger over the logic samples of a session
// file and reports where it fired.

use clap::Parser;
use labfeed_rs::{DatafeedBus, LogicCapture, Packet, SessionFile, SoftTrigger, Trigger};
use std::cell::RefCell;
use std::rc::Rc;

#[derive(Parser)]
#[command(name = "soft_trigger_scan")]
#[command(version = "1.0")]
#[command(about = "Scan a session file with a software trigger")]
struct Args {
    /// Session file to scan
    path: String,

    /// One pattern per stage, one character per logic channel (0 1 r f e x)
    #[arg(required = true)]
    stages: Vec<String>,

    #[arg(short, long, default_value_t = 16, help = "Samples kept from before the trigger")]
    pre_trigger: usize,

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

    let mut session = SessionFile::open(&args.path)?;
    let channels = session
        .devices()
        .first()
        .map(|device| device.channels.clone())
        .ok_or("session has no devices")?;

    let patterns: Vec<&str> = args.stages.iter().map(String::as_str).collect();
    let trigger = Trigger::from_patterns(&channels, &patterns)?;
    println!("Trigger with {} stage(s)", trigger.stages.len());

    // Replay into memory first, then feed the trigger buffer by buffer.
    let buffers: Rc<RefCell<Vec<Vec<u8>>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&buffers);
    let mut source = DatafeedBus::new();
    source.add_callback(move |packet: &Packet| {
        if let Packet::Logic(logic) = packet {
            sink.borrow_mut().push(logic.data.clone());
        }
    });
    session.replay(&mut source)?;

    let mut soft = SoftTrigger::new(trigger, &channels, args.pre_trigger)?;
    let mut output = DatafeedBus::new();
    let capture = LogicCapture::attach(&channels, &mut output);

    let mut position = 0usize;
    let mut fired = false;
    for buffer in buffers.borrow().iter() {
        let samples = buffer.len() / soft.unitsize();
        if fired {
            output.publish(Packet::Logic(labfeed_rs::Logic::new(soft.unitsize(), buffer.clone())))?;
        } else if let Some(hit) = soft.check(buffer, &mut output)? {
            println!(
                "Fired at sample {} ({} pre-trigger samples)",
                position + hit.offset,
                hit.pre_trigger_samples
            );
            let rest = buffer[hit.offset * soft.unitsize()..].to_vec();
            output.publish(Packet::Logic(labfeed_rs::Logic::new(soft.unitsize(), rest)))?;
            fired = true;
        }
        position += samples;
    }

    if !fired {
        println!("Trigger never fired in {position} samples");
        return Ok(());
    }

    let df = capture.borrow().to_dataframe()?;
    println!("\n{}", df.head(Some(10)));
    Ok(())
}
