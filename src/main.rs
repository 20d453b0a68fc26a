use std::process::ExitCode;

use log::{error, info};
use tokio_util::sync::CancellationToken;
use twamp_client::{
    client::run_client,
    configuration::{Configuration, Parser},
};

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let conf = Configuration::parse();
    if let Err(e) = conf.validate() {
        error!("Configuration is broken: {}", e);
        eprintln!("Configuration is broken: {}", e);
        return ExitCode::FAILURE;
    }
    info!("Configuration valid. Starting up...");

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted, stopping test sessions");
                cancel.cancel();
            }
        });
    }

    match run_client(&conf, cancel).await {
        Ok(report) => {
            report.print(conf.output_format);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
    }
}
