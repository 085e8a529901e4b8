// Copyright (c) Aptos
// SPDX-License-Identifier: Apache-2.0

//! The HTTP edge of the variant service. Requests name an image and
//! an optional target box; the answer is always a redirect, either
//! to the finished rendition or to the original while the rendition
//! is produced in the background.

use anyhow::Context as AnyhowContext;
use clap::Parser;
use shutter_config::ServiceConfig;
use shutter_storage::{
    JobQueue, MongoVariantStore, ObjectStore, QueueConfig, RedisJobQueue, S3ObjectStore,
    VariantStore,
};
use std::{net::SocketAddr, sync::Arc};
use tracing::info;
use warp::{Filter, Reply};

pub mod context;
pub mod rate_limit;
pub mod resolver;
pub mod response;
pub mod routes;
#[cfg(test)]
pub(crate) mod tests;

use context::Context;
use resolver::VariantResolver;
use routes::routes;

#[derive(Clone, Debug, Parser)]
#[clap(name = "Shutter Image API", author, version)]
pub struct ShutterApiArgs {}

impl ShutterApiArgs {
    pub async fn run(self) -> anyhow::Result<()> {
        let config = ServiceConfig::from_env().context("loading configuration")?;
        info!(environment = %config.environment, "starting http edge");

        let store: Arc<dyn VariantStore> = Arc::new(
            MongoVariantStore::connect(&config.mongodb_uri, &config.db_name)
                .await
                .context("connecting metadata store")?,
        );
        let objects: Arc<dyn ObjectStore> = Arc::new(
            S3ObjectStore::connect(&config.object_store)
                .await
                .context("connecting object store")?,
        );
        let queue: Arc<dyn JobQueue> = Arc::new(
            RedisJobQueue::connect(&config.queue_broker.url(), QueueConfig::default())
                .await
                .context("connecting queue broker")?,
        );

        let resolver = Arc::new(VariantResolver::new(store, objects, queue, &config)?);
        let context = Context::new(config.clone(), resolver);
        Self::serve(&config, routes(context)).await;
        info!("http edge shut down cleanly");
        Ok(())
    }

    async fn serve<F>(config: &ServiceConfig, routes: F)
    where
        F: Filter<Error = warp::Rejection> + Clone + Send + Sync + 'static,
        F::Extract: Reply,
    {
        let addr: SocketAddr = ([0, 0, 0, 0], config.port).into();
        let (bound, server) =
            warp::serve(routes).bind_with_graceful_shutdown(addr, shutdown_signal());
        info!(address = %bound, "http edge listening");
        server.await;
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("cannot install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate.recv() => {},
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
    info!("shutdown signal received, draining in-flight requests");
}
