use clap::Parser;
use deployment_sync::{config::RunConfig, crds::DeploymentSync};
use kube::CustomResourceExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
enum Args {
    /// Run the controller against the current cluster
    Run(RunConfig),
    /// Print the DeploymentSync CustomResourceDefinition
    Crds,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args {
        Args::Crds => {
            println!("{}", serde_yaml::to_string(&DeploymentSync::crd())?);
        }
        Args::Run(config) => {
            tracing_subscriber::fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
                )
                .init();

            deployment_sync::run(config).await?;
        }
    };

    Ok(())
}
