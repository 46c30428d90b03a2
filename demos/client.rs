//! Example MMS client.
//! This example connects to an MMS server, prints the identity and the IEC61850 model
//! of the server, reads a data set, defines an association data set and writes a
//! control value. Information reports are logged until the program ends.
//!
//! This example is expecting the server demo running on localhost:10102. The first
//! argument may name a JSON file with the client configuration.

use std::{sync::Arc, time::Duration};

use iec61850::{
    ClientConfig, IedModel, MmsClient,
    mms::{
        MmsDevice, MmsDomain, MmsValue, NamedVariableListEntry, message::InformationReport,
    },
};
use snafu::{ResultExt, Whatever};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, Layer as _, layer::SubscriberExt as _, util::SubscriberInitExt as _,
};

#[tokio::main]
async fn main() -> Result<(), Whatever> {
    let filter = EnvFilter::from("info");
    let layer = tracing_subscriber::fmt::layer().with_filter(filter);
    tracing_subscriber::registry()
        .with(layer)
        //needed to get the tracing_error working
        .with(ErrorLayer::default().with_filter(EnvFilter::from("debug")))
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => {
            let content = std::fs::read_to_string(&path)
                .with_whatever_context(|_| format!("Failed to read {path}"))?;
            serde_json::from_str(&content).whatever_context("Failed to parse the configuration")?
        }
        None => ClientConfig { port: 10102, ..ClientConfig::default() },
    };

    let report_handler = |report: InformationReport| {
        tracing::info!("Report {:?}: {:?}", report.specification, report.values);
    };
    let client = MmsClient::connect_tcp(&config, Some(Arc::new(report_handler)))
        .await
        .whatever_context("Failed to connect")?;

    let identity = client.identify().await.whatever_context("Failed to identify")?;
    tracing::info!("Server: {} {} {}", identity.vendor, identity.model, identity.revision);

    // Rebuild the server model from the variable types.
    let mut device = MmsDevice::new("remote");
    for domain_name in client.get_domain_names().await.whatever_context("Failed to list domains")? {
        let mut domain = MmsDomain::new(&domain_name);
        let variables = client
            .get_domain_variable_names(&domain_name)
            .await
            .whatever_context("Failed to list variables")?;
        for variable in variables.iter().filter(|name| !name.contains('$')) {
            let spec = client
                .get_variable_access_attributes(&domain_name, variable)
                .await
                .whatever_context("Failed to read the variable type")?;
            let _ = domain.add_named_variable(spec);
        }
        let _ = device.add_domain(domain);
    }
    let model = IedModel::from_device(&device);
    tracing::info!("Model: {model:#}");

    for &ld in model.logical_devices() {
        let Some(ld) = model.node(ld) else { continue };
        let datasets = client
            .get_domain_variable_list_names(&ld.name)
            .await
            .whatever_context("Failed to list data sets")?;
        for dataset in datasets {
            let values = client
                .read_named_variable_list_values(&ld.name, &dataset, false)
                .await
                .whatever_context("Failed to read data set")?;
            tracing::info!("Data set {}/{dataset}: {values:?}", ld.name);
        }
    }

    if let Some(ld) = model.logical_devices().first().and_then(|ld| model.node(*ld)) {
        let entries = [
            NamedVariableListEntry::new(&ld.name, "GGIO1$ST$Ind1"),
            NamedVariableListEntry::new(&ld.name, "GGIO1$MX$AnIn1"),
        ];
        client
            .define_association_named_variable_list("demo", &entries)
            .await
            .whatever_context("Failed to define data set")?;
        let values = client
            .read_association_named_variable_list_values("demo", false)
            .await
            .whatever_context("Failed to read data set")?;
        tracing::info!("Association data set: {values:?}");

        client
            .write_variable(&ld.name, "GGIO1$CO$SPCSO1$Oper$ctlVal", &MmsValue::new_boolean(true))
            .await
            .whatever_context("Failed to operate")?;
        if let Err(error) =
            client.write_variable(&ld.name, "LLN0$ST$Mod$stVal", &MmsValue::new_i32(2)).await
        {
            tracing::info!("Write of a status value refused: {error}");
        }
    }

    tokio::time::sleep(Duration::from_secs(3)).await;
    client.conclude().await.whatever_context("Failed to conclude")?;
    Ok(())
}
