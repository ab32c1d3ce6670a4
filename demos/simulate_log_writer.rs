// Synthetic log generator for exercising the tailer/collector manually,
// grounded on `examples/original_source/scripts/simulate_log_writer.py`.
// Standalone binary, not part of the library surface.

use chrono::Local;
use clap::Parser;
use std::fs::OpenOptions;
use std::io::Write;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "simulate-log-writer")]
#[command(about = "Appends synthetic access/DNS log lines at a configurable rate")]
struct Args {
    /// File to append generated lines to
    #[arg(long)]
    path: String,

    /// Lines per second
    #[arg(long, default_value_t = 1000)]
    rate: u64,

    /// How many seconds to run for
    #[arg(long, default_value_t = 30)]
    seconds: u64,
}

fn gen_line(i: u64) -> String {
    let now = Local::now().format("%Y/%m/%d %H:%M:%S%.6f");
    if i % 7 == 0 {
        let elapsed_ms = 1 + (i % 30);
        format!(
            "{now} 8.8.8.8 got answer: demo{i}.example.com. -> [1.1.1.{}] {elapsed_ms}ms",
            i % 255
        )
    } else {
        format!(
            "{now} from 10.0.0.{}:12345 accepted tcp:demo{}.example.com:443 [socks-in -> direct] email: user{}@example.com",
            i % 255,
            i % 100,
            i % 10
        )
    }
}

fn main() -> std::io::Result<()> {
    let args = Args::parse();
    let total = args.rate * args.seconds;
    let interval = if args.rate > 0 {
        Duration::from_secs_f64(1.0 / args.rate as f64)
    } else {
        Duration::ZERO
    };

    let mut file = OpenOptions::new().create(true).append(true).open(&args.path)?;

    for i in 0..total {
        writeln!(file, "{}", gen_line(i))?;
        if !interval.is_zero() {
            std::thread::sleep(interval);
        }
    }

    Ok(())
}
