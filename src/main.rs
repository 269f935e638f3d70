use clap::Parser;

use althread::cli::{execute, Cli};

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    if let Err(e) = execute(cli) {
        eprintln!("{}", e);
        std::process::exit(1);
    }
}
