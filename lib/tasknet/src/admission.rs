// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Admission control for inbound RPCs.
//!
//! A single token bucket is shared by every inbound call on the listener. Calls over budget are
//! refused with `RESOURCE_EXHAUSTED` before reaching a handler; the calling child surfaces this
//! as [`AckCode::AdmissionDenied`](crate::message::AckCode::AdmissionDenied).

use std::num::NonZeroU32;
use std::sync::Arc;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tonic::service::Interceptor;
use tonic::{Request, Status};
use tracing::debug;

#[derive(Clone)]
pub(crate) struct AdmissionFilter {
    limiter: Arc<DefaultDirectRateLimiter>,
}

impl AdmissionFilter {
    /// `rate` calls per second sustained, with bursts of up to `burst` calls.
    pub fn new(rate: u32, burst: u32) -> Self {
        let rate = NonZeroU32::new(rate).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(burst).unwrap_or(rate);
        let quota = Quota::per_second(rate).allow_burst(burst);
        Self {
            limiter: Arc::new(RateLimiter::direct(quota)),
        }
    }

    pub fn admit(&self) -> bool {
        self.limiter.check().is_ok()
    }
}

impl Interceptor for AdmissionFilter {
    fn call(&mut self, request: Request<()>) -> Result<Request<()>, Status> {
        if self.admit() {
            Ok(request)
        } else {
            debug!(target: "fleet_tasknet::admission", "inbound call refused");
            Err(Status::resource_exhausted("admission rate exceeded"))
        }
    }
}
