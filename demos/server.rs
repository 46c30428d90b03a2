//! Example MMS server.
//! This example serves a small IEC61850 style model with one logical device. The
//! analog value changes every second and is pushed to every connected client as an
//! information report. Only the control attributes can be written.
//!
//! The first argument may name a JSON file with the server configuration, for example
//! `{"port": 10102, "max_pdu_size": 8000}`.

use std::{sync::Arc, time::Duration};

use iec61850::{
    IedModel, MmsServer, ServerConfig,
    mms::{
        MmsDevice, MmsDomain, MmsTypeSpec, MmsValue, NamedVariableList, NamedVariableListEntry,
        WriteIndication, value::DataAccessError,
    },
};
use snafu::{ResultExt, Whatever};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, Layer as _, layer::SubscriberExt as _, util::SubscriberInitExt as _,
};

/// The logical device served.
const DOMAIN: &str = "simpleIOGenericIO";
/// The measurement changed every second.
const ANALOG_VALUE: &str = "GGIO1$MX$AnIn1$mag$f";

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
        None => ServerConfig { port: 10102, ..ServerConfig::default() },
    };

    let device = device();
    tracing::info!("Model: {:#}", IedModel::from_device(&device));

    let server = Arc::new(MmsServer::new(config, device).with_write_handler(
        |domain: &str, item: &str, value: &MmsValue, connection_id: u64| {
            tracing::info!("Connection {connection_id} writes {domain}/{item} = {value}");
            if item.contains("$CO$") {
                WriteIndication::Ok
            } else {
                WriteIndication::Failed(DataAccessError::ObjectAccessDenied)
            }
        },
    ));

    tokio::spawn(publish_measurements(Arc::clone(&server)));
    server.listen().await.whatever_context("Server failed")
}

/// Change the analog value every second and report it to every client.
async fn publish_measurements(server: Arc<MmsServer>) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    let mut value = MmsValue::new_float(0.0);
    let mut step = 0_u16;
    loop {
        interval.tick().await;
        step = step.wrapping_add(1);
        value.set_f32(f32::from(step % 100) / 10.0);
        if let Err(error) = server.set_value(DOMAIN, ANALOG_VALUE, &value).await {
            tracing::warn!("Failed to update {ANALOG_VALUE}: {error}");
            continue;
        }
        for id in server.connection_ids() {
            if let Err(error) =
                server.send_information_report(id, "AnalogValues", vec![value.clone()]).await
            {
                tracing::debug!("Report to connection {id} dropped: {error}");
            }
        }
    }
}

/// The served model.
fn device() -> MmsDevice {
    let ggio = MmsTypeSpec::structure(
        "GGIO1",
        vec![
            MmsTypeSpec::structure(
                "ST",
                vec![MmsTypeSpec::structure(
                    "Ind1",
                    vec![
                        MmsTypeSpec::boolean("stVal"),
                        MmsTypeSpec::bit_string("q", 13),
                        MmsTypeSpec::utc_time("t"),
                    ],
                )],
            ),
            MmsTypeSpec::structure(
                "MX",
                vec![MmsTypeSpec::structure(
                    "AnIn1",
                    vec![
                        MmsTypeSpec::structure("mag", vec![MmsTypeSpec::float32("f")]),
                        MmsTypeSpec::bit_string("q", 13),
                    ],
                )],
            ),
            MmsTypeSpec::structure(
                "CO",
                vec![MmsTypeSpec::structure(
                    "SPCSO1",
                    vec![MmsTypeSpec::structure("Oper", vec![MmsTypeSpec::boolean("ctlVal")])],
                )],
            ),
        ],
    );
    let lln0 = MmsTypeSpec::structure(
        "LLN0",
        vec![MmsTypeSpec::structure(
            "ST",
            vec![MmsTypeSpec::structure("Mod", vec![MmsTypeSpec::integer("stVal", 8)])],
        )],
    );

    let mut domain = MmsDomain::new(DOMAIN).with_named_variable(lln0).with_named_variable(ggio);
    let events = NamedVariableList::new(
        "LLN0$Events",
        false,
        vec![
            NamedVariableListEntry::new(DOMAIN, "GGIO1$ST$Ind1$stVal"),
            NamedVariableListEntry::new(DOMAIN, ANALOG_VALUE),
        ],
    );
    if !domain.add_named_variable_list(events) {
        tracing::warn!("Duplicate data set LLN0$Events");
    }

    let mut device = MmsDevice::new("simpleIO").with_domain(domain);
    if !device.add_named_variable(MmsTypeSpec::visible_string("Vendor", 64)) {
        tracing::warn!("Duplicate variable Vendor");
    }
    device
}
