//! Partial-failure classification of broker batch responses
//!
//! Splits a multi-status outcome into the events that are settled (accepted
//! or permanently rejected) and the events worth sending again. Events are
//! matched to responses by event id only.

use std::collections::{HashMap, HashSet};

use uuid::Uuid;

use crate::codec::json::probe_eid;
use crate::types::{BatchItemResponse, Event, PublishingStatus, Step};

/// Anything that can be matched against a broker item response
pub trait Identified {
    /// Event id, or `None` if it cannot be determined
    fn event_id(&self) -> Option<Uuid>;
}

impl<T: serde::Serialize> Identified for Event<T> {
    /// Envelope id, or an `eid` probed from the payload of undefined events
    fn event_id(&self) -> Option<Uuid> {
        match self.metadata() {
            Some(metadata) => Some(metadata.eid),
            None => serde_json::to_value(self.data())
                .ok()
                .and_then(|v| probe_eid(&v)),
        }
    }
}

/// Outcome of classifying one attempt
#[derive(Debug)]
pub struct Classification<E> {
    /// Responses with status `submitted`
    pub accepted: Vec<BatchItemResponse>,

    /// Responses that failed at the validation step
    pub rejected: Vec<BatchItemResponse>,

    /// Submitted events not covered by any settled response, in input order
    pub retryable: Vec<E>,
}

impl<E> Classification<E> {
    /// Settled responses: accepted plus rejected
    pub fn non_retryable(&self) -> impl Iterator<Item = &BatchItemResponse> {
        self.accepted.iter().chain(self.rejected.iter())
    }
}

/// Whether the broker's verdict on this item is final
pub fn is_non_retryable(response: &BatchItemResponse) -> bool {
    response.publishing_status == PublishingStatus::Submitted
        || response.step == Some(Step::Validating)
}

/// Partition a submitted batch against the broker's per-item responses
///
/// An event is retried unless a settled response carries its id. Events
/// whose id cannot be recovered are always retried.
pub fn classify<E: Identified>(
    events: Vec<E>,
    responses: &[BatchItemResponse],
) -> Classification<E> {
    let mut accepted = Vec::new();
    let mut rejected = Vec::new();
    let mut settled = HashSet::new();

    for response in responses.iter().filter(|r| is_non_retryable(r)) {
        if let Some(eid) = response.eid {
            settled.insert(eid);
        }
        if response.publishing_status == PublishingStatus::Submitted {
            accepted.push(response.clone());
        } else {
            rejected.push(response.clone());
        }
    }

    let retryable = events
        .into_iter()
        .filter(|e| match e.event_id() {
            Some(eid) => !settled.contains(&eid),
            None => true,
        })
        .collect();

    Classification {
        accepted,
        rejected,
        retryable,
    }
}

/// Non-retryable responses accumulated across attempts
///
/// Keyed by event id; a later response for the same id replaces the earlier
/// one in place. Responses without an id cannot be tied to an event, so only
/// those from the most recent merge are kept.
#[derive(Debug, Default, Clone)]
pub struct ResponseLog {
    responses: Vec<BatchItemResponse>,
    index: HashMap<Uuid, usize>,
    anonymous: Vec<BatchItemResponse>,
}

impl ResponseLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one attempt's responses, deduplicating by event id
    pub fn merge<'a>(&mut self, responses: impl IntoIterator<Item = &'a BatchItemResponse>) {
        let mut anonymous = Vec::new();
        for response in responses {
            match response.eid {
                Some(eid) => match self.index.get(&eid) {
                    Some(&pos) => self.responses[pos] = response.clone(),
                    None => {
                        self.index.insert(eid, self.responses.len());
                        self.responses.push(response.clone());
                    }
                },
                None => anonymous.push(response.clone()),
            }
        }
        self.anonymous = anonymous;
    }

    /// Responses that are not `submitted`
    pub fn rejected(&self) -> impl Iterator<Item = &BatchItemResponse> {
        self.responses
            .iter()
            .chain(self.anonymous.iter())
            .filter(|r| r.publishing_status != PublishingStatus::Submitted)
    }

    pub fn len(&self) -> usize {
        self.responses.len() + self.anonymous.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Identified responses in first-seen order, then anonymous ones
    pub fn into_vec(self) -> Vec<BatchItemResponse> {
        let mut responses = self.responses;
        responses.extend(self.anonymous);
        responses
    }
}
