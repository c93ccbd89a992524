use clap::Parser;

#[derive(clap::Parser, Debug)]
#[clap(author, version, about = "Autoscaling operator for sharded in-memory key-value clusters", long_about = None)]
struct Cli {
    #[clap(subcommand)]
    mode: Mode,
}

#[derive(clap::Subcommand, Debug)]
enum Mode {
    /// Run the long-running controller.
    Serve(operator::serve::ServeArgs),
    /// Run one admin operation to completion (executed inside a Job).
    Task(operator::task::TaskArgs),
    /// Print the CustomResourceDefinition as YAML.
    Crd,
}

fn main() -> Result<(), anyhow::Error> {
    // Reasonable defaults for structured logs on stderr.
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .with_ansi(!matches!(std::env::var("NO_COLOR"), Ok(v) if v == "1"))
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting tracing default failed");

    let cli = Cli::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let result = runtime.block_on(runtime.spawn(async move {
        match cli.mode {
            Mode::Serve(args) => operator::serve::run(args).await,
            Mode::Task(args) => operator::task::run(args).await,
            Mode::Crd => {
                use kube::CustomResourceExt;
                let crd = serde_yaml::to_string(&models::ShardedCluster::crd())?;
                println!("{crd}");
                Ok(())
            }
        }
    }));

    runtime.shutdown_timeout(std::time::Duration::from_secs(5));
    result?
}
