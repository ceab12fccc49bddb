use clap::Parser;
use operator_dev::{
    cli::{self, Command, Opts},
    client::{self, ConnectionSettings},
    command,
    logging::{self, LOG_ENV},
};
use snafu::{ResultExt, Snafu};

const APP_NAME: &str = "operator-dev";

#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("failed to initialize logging"))]
    InitializeLogging { source: logging::Error },

    #[snafu(display("invalid arguments"))]
    Validate { source: cli::Error },

    #[snafu(display("failed to connect to the cluster"))]
    Connect { source: client::Error },

    #[snafu(display("failed to override {component:?}"))]
    Override {
        source: command::Error,
        component: String,
    },
}

#[snafu::report]
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Error> {
    let opts = Opts::parse();
    logging::initialize_logging(LOG_ENV, APP_NAME).context(InitializeLoggingSnafu)?;

    match opts.command {
        Command::Override(arguments) => {
            let request = arguments.validate().context(ValidateSnafu)?;
            let settings = arguments.reconcile.settings().context(ValidateSnafu)?;

            let client = client::create_client(&ConnectionSettings::from(arguments.connection))
                .await
                .context(ConnectSnafu)?;

            let mut stdout = std::io::stdout().lock();
            command::run(&client, &request, &settings, &mut stdout)
                .await
                .context(OverrideSnafu {
                    component: &request.component,
                })?;
        }
    }

    Ok(())
}
