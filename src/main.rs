use clap::Parser;

use gpupgrade::cli::{self, Cli};

#[tokio::main]
async fn main() {
    env_logger::init();

    let args = Cli::parse();

    if let Err(err) = cli::run(args).await {
        if err.is_user_canceled() {
            return;
        }

        eprintln!("Error: {}", err);
        if let Some(next) = err.as_next_action() {
            eprintln!("{}", next.help());
        }
        std::process::exit(1);
    }
}
