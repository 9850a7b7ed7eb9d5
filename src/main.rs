use std::env;
use std::process;

use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter, e.g. `PCC_LOG=debug`.
const LOG_ENV: &str = "PCC_LOG";

fn init_logging() {
  let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .without_time()
    .init();
}

fn main() {
  init_logging();

  let args: Vec<String> = env::args().collect();
  if args.len() != 2 {
    let program = args.first().map(String::as_str).unwrap_or("pcc");
    eprintln!("usage: {program} <program>");
    process::exit(1);
  }

  match pcc::generate_assembly(&args[1]) {
    Ok(asm) => print!("{asm}"),
    Err(err) => {
      eprintln!("{err}");
      process::exit(1);
    }
  }
}
