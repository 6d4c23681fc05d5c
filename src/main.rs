use clap::Parser;
use orthanc_core::config::{Cli, Config};

#[tokio::main]
async fn main() {
    let config = Config::from_args(Cli::parse());
    orthanc_core::run(config).await;
}
