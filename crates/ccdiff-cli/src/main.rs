mod cli;

use clap::Parser;

fn main() {
    let exit_code = cli::run_cli(cli::Cli::parse());
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
}
