// Copyright (c) Aptos
// SPDX-License-Identifier: Apache-2.0

use clap::Parser;
use shutter_api::ShutterApiArgs;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(err) = ShutterApiArgs::parse().run().await {
        error!(error = ?err, "api terminated");
        std::process::exit(1);
    }
}
