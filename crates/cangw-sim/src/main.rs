//! cangw-sim - CANopen gateway on a simulated network
//!
//! Registers one simulated device, shows its state and identity objects and
//! optionally flashes an image onto it, printing the resulting flash record.
//!
//! Usage:
//!   cangw-sim [OPTIONS] [config.toml]
//!
//! Options:
//!   --device <id>      Node id of the simulated device (decimal or 0x-hex, default 0x05)
//!   --image <path>     Program image to flash
//!   --version <v>      Version the device should report after flashing

use std::sync::Arc;
use std::time::Duration;

use cangw_canopen::protocol::sim::SimNetwork;
use cangw_canopen::{CanGwConfig, CanOpenService, DeviceId, NmtState};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const SIM_EDS: &[u8] = b"[FileInfo]
FileName=cangw-sim.eds
FileVersion=1
Description=Simulated flashable node

[DeviceInfo]
VendorName=cangw
ProductName=sim-node

[1001]
ParameterName=Error register
DataType=0x0005
AccessType=ro

[100A]
ParameterName=Manufacturer software version
DataType=0x0009
AccessType=const

[1F50sub1]
ParameterName=Program data
DataType=0x000F
AccessType=rw
";

/// Parsed command-line arguments
struct Args {
    config_path: Option<String>,
    device: DeviceId,
    image: Option<String>,
    version: Option<String>,
}

fn parse_args() -> anyhow::Result<Args> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut result = Args {
        config_path: None,
        device: DeviceId(5),
        image: None,
        version: None,
    };

    let mut i = 0;
    while i < args.len() {
        let value = args.get(i + 1).cloned();
        match args[i].as_str() {
            "--device" => {
                let value = value.ok_or_else(|| anyhow::anyhow!("Missing argument for --device"))?;
                result.device = match value.parse::<u32>() {
                    Ok(id) => DeviceId(id),
                    Err(_) => DeviceId::from_hex(&value)?,
                };
                i += 2;
            }
            "--image" => {
                result.image = Some(value.ok_or_else(|| anyhow::anyhow!("Missing argument for --image"))?);
                i += 2;
            }
            "--version" => {
                result.version =
                    Some(value.ok_or_else(|| anyhow::anyhow!("Missing argument for --version"))?);
                i += 2;
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            arg if !arg.starts_with('-') => {
                result.config_path = Some(arg.to_string());
                i += 1;
            }
            other => {
                tracing::warn!("Unknown argument: {}", other);
                i += 1;
            }
        }
    }

    Ok(result)
}

fn print_help() {
    println!(
        r#"cangw-sim - CANopen gateway on a simulated network

Usage: cangw-sim [OPTIONS] [config.toml]

Options:
  --device <id>    Node id of the simulated device (default 0x05)
  --image <path>   Program image to flash
  --version <v>    Version expected after flashing
  -h, --help       Print this help

Environment:
  CANGW_STORAGE    Storage root when the config does not set one
  RUST_LOG         Log filter (default: cangw_sim=info,cangw_canopen=info)
"#
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cangw_sim=info,cangw_canopen=info,cangw_store=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = parse_args()?;
    let config = match &args.config_path {
        Some(path) => {
            tracing::info!("Loading config from: {}", path);
            CanGwConfig::from_file(path)?
        }
        None => CanGwConfig::default(),
    };

    let network = Arc::new(SimNetwork::new());
    let node = network.node(args.device);
    node.set_value(0x1001, 0, vec![0x00]);
    node.set_value(0x1F57, 1, vec![0x00]);
    node.set_value(0x1008, 0, b"cangw-sim".to_vec());
    node.set_value(
        0x100A,
        0,
        args.version.clone().unwrap_or_else(|| "0.0.0".to_string()).into_bytes(),
    );
    node.set_latency(Duration::from_millis(5));

    let service = CanOpenService::open(&config, network.clone()).await?;
    service.register_device(args.device, SIM_EDS).await?;
    node.report_state(NmtState::PreOperational);

    // keep the simulated heartbeat going for state reads
    let beating = node.clone();
    let heartbeat = tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_millis(500));
        loop {
            tick.tick().await;
            beating.emit_heartbeat();
        }
    });

    service.write_device_state(args.device, "OPERATIONAL").await?;
    tracing::info!(
        "Device {} state: {}",
        args.device,
        service.read_device_state(args.device).await?
    );
    let name = service.read_dictionary_entry(args.device, 0x1008, 0).await?;
    tracing::info!("Device name object 0x1008:0 = {}", hex::encode(&name));

    if let Some(image) = &args.image {
        let payload = tokio::fs::read(image).await?;
        tracing::info!("Flashing {} ({} bytes)", image, payload.len());
        let order = service
            .submit_flash(args.device, payload, args.version.clone())
            .await?;

        let state = loop {
            let state = service.query_flash_state(order).await?;
            if state.is_terminal() {
                break state;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        };
        println!("order: {}\n{}", order, serde_yaml::to_string(&state)?);
    }

    service.shutdown().await;
    heartbeat.abort();
    Ok(())
}
