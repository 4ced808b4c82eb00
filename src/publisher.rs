//! Batch publisher with partial-failure retry
//!
//! `Publisher` encodes a batch, sends it through a `Transport`, and drives a
//! small state machine until every event is settled or the retry budget is
//! spent:
//!
//! - a 5xx status or a prematurely closed connection resends the whole batch
//!   of that attempt, since the broker committed nothing
//! - a 207/422 multi-status is classified per event; settled events are
//!   dropped and only the retryable subset is resent
//! - any other failure is surfaced immediately

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::auth::TokenProvider;
use crate::classify::{classify, Identified, ResponseLog};
use crate::codec::avro::{self, AvroEncoder};
use crate::codec::json;
use crate::config::PublisherConfig;
use crate::enrich::enrich_all;
use crate::error::{PublishError, Result};
use crate::retry::RetryConfig;
use crate::schema::{ResolvedSchema, SchemaHint, SchemaResolver};
use crate::transport::{HttpTransport, PublishRequest, Transport, TransportResponse};
use crate::types::{BatchItemResponse, Event, PublishFormat, PublishOptions, PublishingStatus};

/// Multi-status: the body lists a verdict per event
pub const STATUS_MULTI_STATUS: u16 = 207;

/// Unprocessable entity: some events failed validation
pub const STATUS_UNPROCESSABLE: u16 = 422;

/// One event, already in its wire form
#[derive(Debug, Clone)]
struct PreparedEvent {
    eid: Option<Uuid>,
    value: EncodedValue,
}

#[derive(Debug, Clone)]
enum EncodedValue {
    Json(serde_json::Value),
    Avro(apache_avro::types::Value),
}

impl Identified for PreparedEvent {
    fn event_id(&self) -> Option<Uuid> {
        self.eid
    }
}

/// Turns prepared events into a request body
enum BatchEncoder {
    Json,
    Avro(AvroEncoder),
}

impl BatchEncoder {
    fn content_type(&self) -> &'static str {
        match self {
            Self::Json => json::CONTENT_TYPE,
            Self::Avro(_) => avro::CONTENT_TYPE,
        }
    }

    fn prepare<T: Serialize>(&self, event: &Event<T>) -> Result<PreparedEvent> {
        match self {
            Self::Json => {
                let value = json::encode(event)?;
                let eid = event
                    .metadata()
                    .map(|m| m.eid)
                    .or_else(|| json::probe_eid(&value));
                Ok(PreparedEvent {
                    eid,
                    value: EncodedValue::Json(value),
                })
            }
            Self::Avro(encoder) => {
                let metadata = event.metadata().ok_or_else(|| {
                    PublishError::Encoding(
                        "undefined events carry no envelope and cannot be sent as avro"
                            .to_string(),
                    )
                })?;
                Ok(PreparedEvent {
                    eid: Some(metadata.eid),
                    value: EncodedValue::Avro(encoder.envelope(metadata, event.data())?),
                })
            }
        }
    }

    fn encode(&self, events: &[PreparedEvent]) -> Result<Bytes> {
        let body = match self {
            Self::Json => json::encode_batch(events.iter().filter_map(|e| match &e.value {
                EncodedValue::Json(v) => Some(v),
                EncodedValue::Avro(_) => None,
            }))?,
            Self::Avro(encoder) => encoder.encode_batch(events.iter().filter_map(|e| {
                match &e.value {
                    EncodedValue::Avro(v) => Some(v),
                    EncodedValue::Json(_) => None,
                }
            }))?,
        };
        Ok(Bytes::from(body))
    }
}

/// Per-call accumulator carried across attempts
struct RetryState {
    /// Events still to be submitted
    pending: Vec<PreparedEvent>,
    /// Settled responses seen so far, deduplicated by event id
    non_retryable: ResponseLog,
    /// Current un-jittered backoff delay
    delay: Duration,
    /// Retries performed so far
    attempt: u32,
}

enum State {
    Attempting,
    ClassifyingFailure(Vec<BatchItemResponse>),
    Backoff,
    Success,
    PermanentFailure(PublishError),
}

/// Batch publisher bound to one broker
///
/// Cheap to share behind an `Arc`; concurrent `publish` calls are
/// independent and share only the transport and read-only configuration.
pub struct Publisher {
    transport: Arc<dyn Transport>,
    schemas: Option<Arc<dyn SchemaResolver>>,
    tokens: Option<Arc<dyn TokenProvider>>,
    retry: RetryConfig,
}

impl Publisher {
    /// Create a publisher over any transport
    pub fn new(transport: impl Transport + 'static, retry: RetryConfig) -> Self {
        Self::from_shared(Arc::new(transport), retry)
    }

    /// Create a publisher over a transport that is shared elsewhere
    pub fn from_shared(transport: Arc<dyn Transport>, retry: RetryConfig) -> Self {
        Self {
            transport,
            schemas: None,
            tokens: None,
            retry,
        }
    }

    /// Create an HTTP publisher from configuration
    pub fn from_config(config: &PublisherConfig) -> Result<Self> {
        config.validate()?;
        let transport = HttpTransport::new(&config.base_url, &config.http)?;
        Ok(Self::new(transport, config.retry.clone()))
    }

    /// Attach a schema resolver for the avro format
    pub fn with_schema_resolver(mut self, resolver: Arc<dyn SchemaResolver>) -> Self {
        self.schemas = Some(resolver);
        self
    }

    /// Attach a bearer token provider
    pub fn with_token_provider(mut self, provider: Arc<dyn TokenProvider>) -> Self {
        self.tokens = Some(provider);
        self
    }

    /// Retry configuration in use
    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// Publish a batch of events under `event_type`
    ///
    /// Resolves with `Ok(())` once the broker has accepted every event still
    /// pending, or with the error that ended the call. Dropping the future
    /// cancels the call.
    ///
    /// `Ok(())` does not mean every event was accepted. Events rejected at
    /// validation on an earlier attempt are not resent, and when a later
    /// attempt settles the rest the call succeeds and only logs the rejected
    /// count at `warn`. A call fails with `PublishError::Validation` only when
    /// the rejection leaves nothing to retry, or when the retry budget runs
    /// out.
    pub async fn publish<T: Serialize>(
        &self,
        event_type: &str,
        events: Vec<Event<T>>,
        options: &PublishOptions,
    ) -> Result<()> {
        self.publish_with_cancel(event_type, events, options, &CancellationToken::new())
            .await
    }

    /// Publish a batch, stopping with `PublishError::Cancelled` when `cancel` fires
    pub async fn publish_with_cancel<T: Serialize>(
        &self,
        event_type: &str,
        events: Vec<Event<T>>,
        options: &PublishOptions,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let flow_id = options
            .flow_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let span = tracing::info_span!(
            "publish",
            event_type = %event_type,
            flow_id = %flow_id,
            events = events.len()
        );

        self.run(event_type, events, options, flow_id, cancel)
            .instrument(span)
            .await
    }

    async fn run<T: Serialize>(
        &self,
        event_type: &str,
        events: Vec<Event<T>>,
        options: &PublishOptions,
        flow_id: String,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if events.is_empty() {
            tracing::debug!("Empty batch, nothing to publish");
            return Ok(());
        }

        let events = if options.fill_metadata {
            enrich_all(events, event_type)
        } else {
            events
        };

        let encoder = match &options.format {
            PublishFormat::Json => BatchEncoder::Json,
            PublishFormat::Avro(hint) => {
                let resolved = cancellable(cancel, self.resolve_schema(event_type, hint)).await??;
                BatchEncoder::Avro(AvroEncoder::new(&resolved)?)
            }
        };

        let pending = events
            .iter()
            .map(|e| encoder.prepare(e))
            .collect::<Result<Vec<_>>>()?;

        let token = match &self.tokens {
            Some(provider) => cancellable(cancel, provider.token()).await??,
            None => None,
        };

        let mut retry_state = RetryState {
            pending,
            non_retryable: ResponseLog::new(),
            delay: self.retry.initial_delay(),
            attempt: 0,
        };
        let path = PublishRequest::events_path(event_type);
        let mut state = State::Attempting;

        loop {
            state = match state {
                State::Attempting => {
                    let request = PublishRequest {
                        path: path.clone(),
                        flow_id: flow_id.clone(),
                        token: token.clone(),
                        content_type: encoder.content_type(),
                        body: encoder.encode(&retry_state.pending)?,
                    };

                    tracing::debug!(
                        attempt = retry_state.attempt,
                        events = retry_state.pending.len(),
                        bytes = request.body.len(),
                        "Sending batch"
                    );

                    let outcome = cancellable(cancel, self.transport.send(request))
                        .await
                        .and_then(|sent| sent);
                    match self.interpret(outcome, retry_state.attempt) {
                        State::PermanentFailure(error) if error.is_retryable() => {
                            State::PermanentFailure(exhausted(error, &retry_state))
                        }
                        next => next,
                    }
                }

                State::ClassifyingFailure(responses) => {
                    let pending = std::mem::take(&mut retry_state.pending);
                    let classification = classify(pending, &responses);
                    retry_state.non_retryable.merge(classification.non_retryable());

                    for rejected in &classification.rejected {
                        tracing::warn!(
                            eid = ?rejected.eid,
                            status = ?rejected.publishing_status,
                            step = ?rejected.step,
                            detail = ?rejected.detail,
                            "Event rejected by broker, not retrying"
                        );
                    }

                    if classification.retryable.is_empty() {
                        if retry_state.non_retryable.rejected().next().is_none() {
                            State::Success
                        } else {
                            State::PermanentFailure(PublishError::Validation {
                                responses: retry_state.non_retryable.clone().into_vec(),
                                unresolved: Vec::new(),
                            })
                        }
                    } else if !self.retry.can_retry(retry_state.attempt) {
                        let unresolved = unresolved_responses(&classification.retryable, &responses);
                        tracing::warn!(
                            attempt = retry_state.attempt,
                            unresolved = classification.retryable.len(),
                            "Retry budget exhausted"
                        );
                        State::PermanentFailure(PublishError::Validation {
                            responses: retry_state.non_retryable.clone().into_vec(),
                            unresolved,
                        })
                    } else {
                        retry_state.pending = classification.retryable;
                        State::Backoff
                    }
                }

                State::Backoff => {
                    let delay = self.retry.next_delay(retry_state.attempt, retry_state.delay);
                    retry_state.delay = delay;
                    let sleep_for = self.retry.jittered(delay);

                    tracing::info!(
                        attempt = retry_state.attempt + 1,
                        events = retry_state.pending.len(),
                        delay_ms = sleep_for.as_millis() as u64,
                        "Retrying batch after backoff"
                    );

                    match cancellable(cancel, tokio::time::sleep(sleep_for)).await {
                        Ok(()) => {
                            retry_state.attempt += 1;
                            State::Attempting
                        }
                        Err(cancelled) => State::PermanentFailure(cancelled),
                    }
                }

                State::Success => {
                    let rejected = retry_state.non_retryable.rejected().count();
                    if rejected > 0 {
                        tracing::warn!(
                            rejected,
                            "Batch published; earlier rejected events were not resent"
                        );
                    }
                    tracing::debug!(attempts = retry_state.attempt + 1, "Batch published");
                    return Ok(());
                }

                State::PermanentFailure(error) => {
                    tracing::warn!(
                        attempt = retry_state.attempt,
                        error = %error,
                        "Publish failed"
                    );
                    return Err(error);
                }
            };
        }
    }

    /// Map a transport outcome to the next state
    fn interpret(&self, outcome: Result<TransportResponse>, attempt: u32) -> State {
        let response = match outcome {
            Ok(response) => response,
            Err(e) if e.is_retryable() && self.retry.can_retry(attempt) => {
                tracing::warn!(attempt, error = %e, "Transient transport failure");
                return State::Backoff;
            }
            Err(e) => return State::PermanentFailure(e),
        };

        match response.status {
            STATUS_MULTI_STATUS | STATUS_UNPROCESSABLE => {
                match serde_json::from_slice::<Vec<BatchItemResponse>>(&response.body) {
                    Ok(items) => State::ClassifyingFailure(items),
                    Err(e) => {
                        tracing::warn!(
                            status = response.status,
                            error = %e,
                            "Unparseable batch item responses"
                        );
                        State::PermanentFailure(PublishError::server(
                            response.status,
                            response.body_text(),
                        ))
                    }
                }
            }
            200..=299 => State::Success,
            status => {
                let error = PublishError::server(status, response.body_text());
                if error.is_retryable() && self.retry.can_retry(attempt) {
                    tracing::warn!(attempt, status, "Broker unavailable, resending batch");
                    State::Backoff
                } else {
                    State::PermanentFailure(error)
                }
            }
        }
    }

    async fn resolve_schema(
        &self,
        event_type: &str,
        hint: &SchemaHint,
    ) -> Result<ResolvedSchema> {
        let resolver = self.schemas.as_ref().ok_or_else(|| PublishError::SchemaResolution {
            event_type: event_type.to_string(),
            reason: "no schema resolver configured".to_string(),
        })?;

        resolver
            .resolve(event_type, hint)
            .await?
            .ok_or_else(|| PublishError::SchemaResolution {
                event_type: event_type.to_string(),
                reason: format!("no schema matches {:?}", hint),
            })
    }
}

/// Error for a transient failure that used up the retry budget
///
/// Rejections from earlier attempts are kept: when any were recorded the
/// call fails with `Validation`, listing the events still pending as aborted
/// with the triggering error as their detail.
fn exhausted(error: PublishError, retry_state: &RetryState) -> PublishError {
    if retry_state.non_retryable.rejected().next().is_none() {
        return error;
    }

    let detail = error.to_string();
    PublishError::Validation {
        responses: retry_state.non_retryable.clone().into_vec(),
        unresolved: retry_state
            .pending
            .iter()
            .map(|event| BatchItemResponse {
                eid: event.eid,
                publishing_status: PublishingStatus::Aborted,
                step: None,
                detail: Some(detail.clone()),
            })
            .collect(),
    }
}

/// Last responses for events that are still retryable
fn unresolved_responses(
    retryable: &[PreparedEvent],
    responses: &[BatchItemResponse],
) -> Vec<BatchItemResponse> {
    retryable
        .iter()
        .map(|event| {
            event
                .eid
                .and_then(|eid| responses.iter().find(|r| r.eid == Some(eid)).cloned())
                .unwrap_or_else(|| BatchItemResponse {
                    eid: event.eid,
                    publishing_status: PublishingStatus::Aborted,
                    step: None,
                    detail: Some("no response for event".to_string()),
                })
        })
        .collect()
}

/// Race a future against the cancellation token
async fn cancellable<F: Future>(cancel: &CancellationToken, fut: F) -> Result<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(PublishError::Cancelled),
        out = fut => Ok(out),
    }
}
