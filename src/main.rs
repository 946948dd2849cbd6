use std::process::exit;

use clap::Parser;
use log::error;

use rtain_net::{
    cmd::{Commands, CLI},
    container::exec_container,
    handle, StatePaths,
};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = CLI::parse();

    let result = match cli.command {
        // Joining a mount namespace needs a single threaded process.
        Commands::Exec(exec_args) => exec_container(exec_args, &StatePaths::new(&cli.root)),
        command => tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(anyhow::Error::from)
            .and_then(|rt| rt.block_on(handle(&cli.root, command))),
    };

    match result {
        Ok(code) => exit(code),
        Err(e) => {
            error!("{:?}", e);
            exit(-1);
        }
    }
}
