// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Consumer
//!
//! This module holds the per-destination receive loop and the ack/nack routing of a
//! single delivery. Each registered destination gets one [`ConsumerLoop`] per
//! connection generation; it processes messages strictly in receipt order and never
//! issues a new receive before the previous message was settled.
//!
//! Every delivery runs inside an OpenTelemetry consumer span joined to the trace
//! carried in the message headers.

use crate::{
    broker::{Delivery, Receiver},
    connection::{ConnectionManager, Generation},
    errors::MqError,
    otel,
};
use async_trait::async_trait;
use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{Span, Status},
    Context,
};
use std::{borrow::Cow, sync::Arc, time::Duration};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// What the handler wants done with a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Processing succeeded; the broker drops the message.
    Accept,
    /// Processing failed; the broker may redeliver the message.
    Reject,
}

impl From<bool> for Outcome {
    fn from(ack: bool) -> Self {
        if ack {
            Outcome::Accept
        } else {
            Outcome::Reject
        }
    }
}

impl<T, E> From<Result<T, E>> for Outcome {
    fn from(result: Result<T, E>) -> Self {
        Outcome::from(result.is_ok())
    }
}

/// Processes the payload of one delivery.
///
/// Plain closures `Fn(&[u8]) -> Outcome` are handlers too.
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn exec(&self, ctx: &Context, payload: &[u8]) -> Outcome;
}

#[async_trait]
impl<F> ConsumerHandler for F
where
    F: Fn(&[u8]) -> Outcome + Send + Sync,
{
    async fn exec(&self, _ctx: &Context, payload: &[u8]) -> Outcome {
        self(payload)
    }
}

/// Runs the handler on one delivery and settles it exactly once.
///
/// # Returns
/// The handler's outcome, or the error returned by the broker while settling
pub(crate) async fn consume(
    tracer: &BoxedTracer,
    destination: &str,
    delivery: Delivery,
    handler: &dyn ConsumerHandler,
) -> Result<Outcome, MqError> {
    let (ctx, mut span) = otel::new_span(delivery.headers(), tracer, destination);

    debug!(destination, "received message");

    let outcome = handler.exec(&ctx, delivery.payload()).await;
    let settled = match outcome {
        Outcome::Accept => delivery.accept().await,
        Outcome::Reject => {
            span.set_status(Status::Error {
                description: Cow::from("handler rejected the message"),
            });
            delivery.reject().await
        }
    };

    match settled {
        Ok(()) => {
            if outcome == Outcome::Accept {
                span.set_status(Status::Ok);
            }
            Ok(outcome)
        }
        Err(err) => {
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("failure to settle message"),
            });
            Err(err)
        }
    }
}

/// Why a consumer loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LoopExit {
    /// The client is shutting down.
    Stopped,
    /// The generation failed; the loop restarts after recovery.
    Failed,
    /// The receiver could not be opened on a healthy connection.
    LinkError(MqError),
}

/// Receive loop for one destination on one generation.
pub(crate) struct ConsumerLoop {
    pub(crate) manager: Arc<ConnectionManager>,
    pub(crate) destination: String,
    pub(crate) handler: Arc<dyn ConsumerHandler>,
    pub(crate) generation: Arc<Generation>,
    pub(crate) prefetch: u16,
    pub(crate) stop: CancellationToken,
    pub(crate) receiver_close_timeout: Duration,
}

impl ConsumerLoop {
    pub(crate) async fn run(self) -> LoopExit {
        let epoch = self.generation.epoch();
        let opened = self
            .generation
            .receive_session()
            .new_receiver(&self.destination, self.prefetch)
            .await;

        let mut receiver = match opened {
            Ok(receiver) => receiver,
            Err(err) if err.is_transient() => {
                warn!(
                    destination = self.destination.as_str(),
                    generation = epoch,
                    error = err.to_string(),
                    "failure to open receiver on a dead connection"
                );
                self.fail().await;
                return LoopExit::Failed;
            }
            Err(err) => {
                error!(
                    destination = self.destination.as_str(),
                    generation = epoch,
                    error = err.to_string(),
                    "failure to create the consumer"
                );
                return LoopExit::LinkError(err);
            }
        };

        debug!(
            destination = self.destination.as_str(),
            generation = epoch,
            prefetch = self.prefetch,
            "consumer started"
        );

        let exit = self.receive_loop(receiver.as_mut()).await;

        match time::timeout(self.receiver_close_timeout, receiver.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => debug!(
                destination = self.destination.as_str(),
                error = err.to_string(),
                "failure to close receiver"
            ),
            Err(_) => debug!(
                destination = self.destination.as_str(),
                "receiver close timed out"
            ),
        }

        exit
    }

    /// Marks this loop's generation degraded and wakes the supervisor.
    async fn fail(&self) {
        self.manager.mark_degraded(self.generation.epoch()).await;
        self.generation.failure().signal();
    }

    async fn receive_loop(&self, receiver: &mut dyn Receiver) -> LoopExit {
        let tracer = global::tracer(otel::CONSUMER_TRACER);
        let failure = self.generation.failure();

        loop {
            let received = tokio::select! {
                biased;
                _ = self.stop.cancelled() => return LoopExit::Stopped,
                _ = failure.wait() => return LoopExit::Failed,
                received = receiver.receive() => received,
            };

            let delivery = match received {
                Ok(delivery) => delivery,
                Err(err) => {
                    warn!(
                        destination = self.destination.as_str(),
                        generation = failure.generation(),
                        error = err.to_string(),
                        "receive failed, signalling connection failure"
                    );
                    self.fail().await;
                    return LoopExit::Failed;
                }
            };

            if let Err(err) =
                consume(&tracer, &self.destination, delivery, self.handler.as_ref()).await
            {
                error!(
                    destination = self.destination.as_str(),
                    error = err.to_string(),
                    "error consume msg"
                );
            }
        }
    }
}
