use mri_diagnosis::{
    configuration::get_configuration,
    startup,
    telemetry::{get_subscriber, init_subscriber},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let subscriber = get_subscriber("mri_diagnosis".into(), "info".into(), std::io::stdout);
    init_subscriber(subscriber)?;

    let settings = get_configuration()?;
    if let Err(e) = startup::run(settings).await {
        tracing::error!("Fatal: {:?}", e);
        return Err(e);
    }
    Ok(())
}
