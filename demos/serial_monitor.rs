// Serial monitor example
//
// Opens a serial port, runs one acquisition session for a fixed time and
// prints what each channel received. Without a port argument it lists the
// serial ports found on this machine.

use clap::Parser;
use serialplot_rs::{
    available_ports, traces_to_dataframe, LinkSettings, SerialConnector, SessionController,
    SessionEnd, TraceFactory,
};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "serial_monitor")]
#[command(version = "1.0")]
#[command(about = "Acquire channels from a serial device and summarize them")]
struct Args {
    /// Serial port to open, e.g. /dev/ttyUSB0
    port: Option<String>,

    /// How long to acquire, in seconds
    #[arg(short, long, default_value_t = 5)]
    seconds: u64,

    /// Baud rate
    #[arg(short, long, default_value_t = serialplot_rs::transport::DEFAULT_BAUD_RATE)]
    baud: u32,

    /// Samples kept per channel
    #[arg(short, long, default_value_t = 1000)]
    history: usize,

    /// Enable verbose logging
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

    let Some(port) = args.port else {
        println!("Available serial ports:");
        for port in available_ports()? {
            println!(
                "  {} {}",
                port.name,
                port.description.unwrap_or_default()
            );
        }
        return Ok(());
    };

    println!("SerialPlot Monitor");
    println!("==================");
    println!("Port: {} @ {} baud\n", port, args.baud);

    let settings = LinkSettings::new(port).with_baud_rate(args.baud);
    let mut controller = SessionController::new(
        SerialConnector::new(settings),
        TraceFactory { len: args.history },
    );

    controller.start()?;
    std::thread::sleep(Duration::from_secs(args.seconds));
    println!("State before stop: {:?}", controller.state());

    match controller.stop()? {
        SessionEnd::Stopped => println!("Session stopped"),
        SessionEnd::Failed(e) => println!("Session failed: {}", e),
    }

    let traces = controller.sinks().snapshot();
    if traces.is_empty() {
        println!("No channel configuration was received");
        return Ok(());
    }

    for (title, trace) in traces.iter() {
        let trace = trace.lock().map_err(|_| "trace lock poisoned")?;
        let values = trace.values();
        let min = values.iter().fold(f32::INFINITY, |a, &b| a.min(b));
        let max = values.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
        let mean = values.iter().sum::<f32>() / values.len().max(1) as f32;
        println!(
            "  {:<16} hue {:>5.1}  range {:+.4} .. {:+.4}  mean {:+.4}",
            title,
            trace.hue(),
            min,
            max,
            mean
        );
    }

    let df = traces_to_dataframe(&traces)?;
    println!("\n{}", df.tail(Some(5)));

    Ok(())
}
