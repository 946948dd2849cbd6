use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use super::{
    network::{BRIDGE_DRIVER, DEFAULT_SUBNET},
    ROOT_PATH,
};

#[derive(Parser, Debug)]
#[command(name = "rtain")]
#[command(about = "rtain is a simple container runtime implemented in Rust.")]
pub struct CLI {
    /// Directory holding the runtime's on-disk state.
    #[arg(long, global = true, env = "RTAIN_ROOT", default_value = ROOT_PATH)]
    pub root: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a command in a new container.
    Run(RunArgs),
    /// Run a command inside a running container.
    Exec(ExecArgs),
    /// List containers.
    PS(PSArgs),
    /// Stop a running container.
    Stop(StopArgs),
    /// Remove a container.
    RM(RMArgs),
    /// Manage container networks.
    #[command(subcommand)]
    Network(NetworkCommands),
}

#[derive(Subcommand, Debug)]
pub enum NetworkCommands {
    /// Create a container network.
    Create(NetCreateArgs),
    /// List container networks.
    #[command(alias = "ls")]
    List,
    /// Remove a container network.
    #[command(alias = "rm")]
    Remove(NetRemoveArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Name of the container.
    #[arg(short, long)]
    pub name: Option<String>,

    /// Memory limit for the container.
    #[arg(short, long, value_parser(parse_memory_size))]
    pub memory: Option<i64>,

    /// Network to connect the container to.
    #[arg(short = 'z', long = "net")]
    pub net: Option<String>,

    /// Publish a container port, hostPort:containerPort.
    #[arg(short, long = "port")]
    pub port: Vec<String>,

    /// Run the container in the background and print its id.
    #[arg(short, long)]
    pub detach: bool,

    /// Command to run in the container.
    #[arg(allow_hyphen_values = true, required = true, trailing_var_arg = true)]
    pub command: Vec<String>,
}

#[derive(Args, Debug)]
pub struct ExecArgs {
    /// Container name, or the pid of a container's init process.
    pub container: String,

    /// Command to run in the container.
    #[arg(allow_hyphen_values = true, required = true, trailing_var_arg = true)]
    pub command: Vec<String>,
}

#[derive(Args, Debug)]
pub struct PSArgs {
    /// Show stopped and exited containers too.
    #[arg(short, long)]
    pub all: bool,
}

#[derive(Args, Debug)]
pub struct StopArgs {
    pub name: String,

    /// Seconds to wait before killing the container.
    #[arg(short, long, default_value_t = 10)]
    pub time: u64,
}

#[derive(Args, Debug)]
pub struct RMArgs {
    pub name: String,

    /// Stop the container first if it is still running.
    #[arg(short, long)]
    pub force: bool,
}

#[derive(Args, Debug)]
pub struct NetCreateArgs {
    /// Network driver.
    #[arg(short, long, default_value = BRIDGE_DRIVER)]
    pub driver: String,

    /// Subnet in CIDR notation.
    #[arg(short, long, default_value = DEFAULT_SUBNET)]
    pub subnet: String,

    /// Name of the network, also the name of its bridge device.
    pub name: String,
}

#[derive(Args, Debug)]
pub struct NetRemoveArgs {
    pub name: String,
}

/// Parse a memory size string into bytes.
fn parse_memory_size(input: &str) -> Result<i64, String> {
    let input = input.trim().to_lowercase();

    let (number, multiplier): (&str, i64) = if let Some(n) = input.strip_suffix('g') {
        (n, 1024 * 1024 * 1024) // GB
    } else if let Some(n) = input.strip_suffix('m') {
        (n, 1024 * 1024) // MB
    } else if let Some(n) = input.strip_suffix('k') {
        (n, 1024) // KB
    } else {
        (input.as_str(), 1) // default is B
    };

    if number.is_empty() || !number.chars().all(|c| c.is_ascii_digit()) {
        return Err("Invalid memory size".into());
    }

    let number: i64 = number.parse().map_err(|e: std::num::ParseIntError| e.to_string())?;

    number
        .checked_mul(multiplier)
        .ok_or_else(|| "Memory size out of range".into())
}
