use chatline::{run, Cli, Client};
use chatline_core::{telemetry, ClientSettings};
use clap::Parser;
use tokio::runtime::Runtime;

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    telemetry::init_tracing(telemetry::env_filter())?;

    let cli = Cli::parse();
    let mut settings = ClientSettings::load().map_err(|err| anyhow::anyhow!(err.user_message()))?;
    if let Some(base_url) = cli.base_url {
        settings = settings
            .with_base_url(&base_url)
            .map_err(|err| anyhow::anyhow!("--base-url: {err}"))?;
    }

    let runtime = Runtime::new()?;
    let client = Client::from_settings(settings)?;
    let mut stdout = std::io::stdout();
    let result = runtime.block_on(run(&client, cli.command, &mut stdout));

    if let Err(err) = &result {
        let expired = err
            .chain()
            .filter_map(|cause| cause.downcast_ref::<chatline_core::Error>())
            .any(chatline_core::Error::requires_reauthentication);
        if expired {
            eprintln!("Your session has expired. Run `chatline login` to sign in again.");
            std::process::exit(2);
        }
    }
    result
}
