// Copyright (c) Aptos
// SPDX-License-Identifier: Apache-2.0

use crate::{rate_limit::RateLimiter, resolver::VariantResolver};
use shutter_config::ServiceConfig;
use std::{convert::Infallible, sync::Arc};
use warp::Filter;

// Context holds application scope state shared by every handler.
#[derive(Clone)]
pub struct Context {
    config: Arc<ServiceConfig>,
    resolver: Arc<VariantResolver>,
    rate_limiter: Arc<RateLimiter>,
}

impl Context {
    pub fn new(config: ServiceConfig, resolver: Arc<VariantResolver>) -> Self {
        let rate_limiter = Arc::new(RateLimiter::new(&config.rate_limit));
        Self {
            config: Arc::new(config),
            resolver,
            rate_limiter,
        }
    }

    pub fn filter(self) -> impl Filter<Extract = (Context,), Error = Infallible> + Clone {
        warp::any().map(move || self.clone())
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn resolver(&self) -> &VariantResolver {
        &self.resolver
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }
}
