use clap::Parser;
use shadowmap::{app, cli::args::Cli};

#[tokio::main]
async fn main() {
    human_panic::setup_panic!();

    let cli = Cli::parse();
    match app::run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("fatal: {:#}", err);
            std::process::exit(1);
        }
    }
}
