// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use figment::providers::{Format, Toml};

use fleet_tasknet::{NetworkConfig, NetworkInstance, Role, logging};

/// Command line flags override the config file, which overrides `TASKNET_*` environment variables.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML file with network settings
    #[arg(long)]
    config: Option<PathBuf>,

    /// Role of this peer: worker, agent or controller
    #[arg(long)]
    role: Option<Role>,

    #[arg(long)]
    server_rank: Option<String>,

    #[arg(long)]
    process_rank: Option<String>,

    /// Address children connect to
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Parent address as host:port
    #[arg(long)]
    parent: Option<String>,
}

impl Args {
    fn into_config(self) -> anyhow::Result<NetworkConfig> {
        let mut figment = NetworkConfig::figment();
        if let Some(path) = &self.config {
            anyhow::ensure!(path.exists(), "config file {} not found", path.display());
            figment = figment.merge(Toml::file(path));
        }
        if let Some(role) = self.role {
            figment = figment.merge(("role", role));
        }
        if let Some(rank) = self.server_rank {
            figment = figment.merge(("server_rank", rank));
        }
        if let Some(rank) = self.process_rank {
            figment = figment.merge(("process_rank", rank));
        }
        if let Some(listen) = self.listen {
            figment = figment.merge(("listen_addr", listen));
        }
        if let Some(parent) = self.parent {
            figment = figment.merge(("parent_addr", parent));
        }
        NetworkConfig::extract_from(figment).context("failed to load network configuration")
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();
    let config = Args::parse().into_config()?;
    tracing::debug!("configuration: {}", serde_json::to_string(&config)?);

    let network = NetworkInstance::start(config).await?;
    let status = network.status();
    tracing::info!(
        position = %status.position,
        listen = ?status.listen_addr,
        "tasknet node running, press ctrl-c to stop"
    );

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for ctrl-c")?;
                break;
            }
            message = network.receive() => match message {
                Some(message) => tracing::info!(
                    uuid = %message.header.uuid,
                    biz_type = %message.header.biz_type,
                    src = %message.header.src,
                    msg_type = %message.body.msg_type,
                    "{}",
                    message.body.message
                ),
                None => break,
            },
        }
    }

    network.shutdown().await;
    Ok(())
}
