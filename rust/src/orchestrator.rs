//! Fans a batch of image generations out to a backend and reports each slot
//! as it settles.
//!
//! Every slot resolves to exactly one [`GenerationOutcome`]. Failures stay
//! inside their slot; the batch only completes once all slots have settled.

use futures_util::future::{BoxFuture, FutureExt, Shared};
use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::backend::{select_payload, BackendRequest, ImageBackend};
use crate::dimensions::AspectRatio;
use crate::error::{BatchError, GenerationError};
use crate::MAX_IMAGE_COUNT;

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub index: usize,
    pub prompt: String,
    pub aspect_ratio: AspectRatio,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum GenerationOutcome {
    Success { image_data: String },
    Failure { reason: String },
}

impl GenerationOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

impl From<Result<String, GenerationError>> for GenerationOutcome {
    fn from(result: Result<String, GenerationError>) -> Self {
        match result {
            Ok(image_data) => Self::Success { image_data },
            Err(err) => Self::Failure {
                reason: err.to_string(),
            },
        }
    }
}

/// The slots created by one submission, indexed `0..len`.
#[derive(Debug, Clone)]
pub struct Batch {
    requests: Vec<GenerationRequest>,
}

impl Batch {
    pub fn new(count: usize, prompt: &str, aspect_ratio: AspectRatio) -> Result<Self, BatchError> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(BatchError::EmptyPrompt);
        }
        if count == 0 || count > MAX_IMAGE_COUNT {
            return Err(BatchError::Count {
                count,
                max: MAX_IMAGE_COUNT,
            });
        }

        let requests = (0..count)
            .map(|index| GenerationRequest {
                index,
                prompt: prompt.to_string(),
                aspect_ratio: aspect_ratio.clone(),
            })
            .collect();
        Ok(Self { requests })
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn requests(&self) -> &[GenerationRequest] {
        &self.requests
    }
}

/// How many backend calls a batch makes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallPlan {
    /// One call per slot.
    #[default]
    PerSlot,
    /// One call for the whole batch, its result shared by every slot.
    Shared,
}

impl CallPlan {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "per_slot" => Some(Self::PerSlot),
            "shared" => Some(Self::Shared),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PerSlot => "per_slot",
            Self::Shared => "shared",
        }
    }
}

/// Which element of a returned payload list belongs to a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PayloadPick {
    #[default]
    SlotIndex,
    First,
}

impl PayloadPick {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "slot_index" => Some(Self::SlotIndex),
            "first" => Some(Self::First),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SlotIndex => "slot_index",
            Self::First => "first",
        }
    }

    fn position(&self, index: usize) -> usize {
        match self {
            Self::SlotIndex => index,
            Self::First => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchPlan {
    pub call_plan: CallPlan,
    pub payload_pick: PayloadPick,
    pub base_size: u32,
}

impl Default for DispatchPlan {
    fn default() -> Self {
        Self {
            call_plan: CallPlan::default(),
            payload_pick: PayloadPick::default(),
            base_size: 512,
        }
    }
}

impl DispatchPlan {
    fn backend_request(&self, request: &GenerationRequest, slot: Option<usize>) -> BackendRequest {
        let dims = request.aspect_ratio.dimensions(self.base_size);
        BackendRequest {
            slot,
            prompt: request.prompt.clone(),
            width: dims.width,
            height: dims.height,
            num_images: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
}

type Payloads = Result<Arc<Vec<String>>, GenerationError>;
type SlotFuture<'a> = BoxFuture<'a, (usize, Result<String, GenerationError>)>;

/// Issues every slot of `batch` at once and waits for all of them.
///
/// `on_outcome` runs once per slot, in settlement order. `on_complete` runs
/// once, after the last slot has settled, whatever the mix of results.
pub async fn dispatch_batch<B, O, C>(
    backend: &B,
    batch: Batch,
    plan: &DispatchPlan,
    mut on_outcome: O,
    on_complete: C,
) -> BatchSummary
where
    B: ImageBackend + ?Sized,
    O: FnMut(usize, GenerationOutcome),
    C: FnOnce(),
{
    let total = batch.len();
    info!(
        slots = total,
        call_plan = plan.call_plan.as_str(),
        "dispatching batch"
    );

    let shared_call: Option<Shared<BoxFuture<'_, Payloads>>> = match plan.call_plan {
        CallPlan::Shared => batch.requests.first().map(|first| {
            let mut request = plan.backend_request(first, None);
            request.num_images = u32::try_from(total).ok();
            call_backend(backend, request).boxed().shared()
        }),
        CallPlan::PerSlot => None,
    };

    let mut pending: FuturesUnordered<SlotFuture<'_>> = batch
        .requests
        .iter()
        .map(|request| {
            let shared_call = shared_call.clone();
            async move {
                let payloads = match shared_call {
                    Some(call) => call.await,
                    None => {
                        call_backend(backend, plan.backend_request(request, Some(request.index)))
                            .await
                    }
                };
                let position = plan.payload_pick.position(request.index);
                let result = payloads.and_then(|payloads| select_payload(&payloads, position));
                (request.index, result)
            }
            .boxed()
        })
        .collect();

    let mut summary = BatchSummary {
        total,
        succeeded: 0,
        failed: 0,
    };
    while let Some((index, result)) = pending.next().await {
        match &result {
            Ok(_) => {
                summary.succeeded += 1;
                debug!(slot = index, "slot succeeded");
            }
            Err(err) => {
                summary.failed += 1;
                warn!(slot = index, error = %err, "slot failed");
            }
        }
        on_outcome(index, GenerationOutcome::from(result));
    }

    debug_assert_eq!(summary.succeeded + summary.failed, total);
    info!(
        succeeded = summary.succeeded,
        failed = summary.failed,
        "batch complete"
    );
    on_complete();
    summary
}

async fn call_backend<B>(backend: &B, request: BackendRequest) -> Payloads
where
    B: ImageBackend + ?Sized,
{
    backend.generate(&request).await.map(Arc::new)
}

#[cfg(test)]
mod tests {
    use super::{
        dispatch_batch, Batch, BatchSummary, CallPlan, DispatchPlan, GenerationOutcome,
        PayloadPick,
    };
    use crate::backend::{BackendRequest, ImageBackend};
    use crate::dimensions::AspectRatio;
    use crate::error::{BatchError, GenerationError};
    use async_trait::async_trait;
    use std::cell::RefCell;
    use std::collections::{BTreeSet, HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct FakeBackend {
        failing_slots: HashSet<usize>,
        delays_ms: HashMap<usize, u64>,
        payloads_per_call: usize,
        fail_all: bool,
        calls: AtomicUsize,
        seen: Mutex<Vec<BackendRequest>>,
    }

    impl FakeBackend {
        fn new(payloads_per_call: usize) -> Self {
            Self {
                payloads_per_call,
                ..Self::default()
            }
        }

        fn failing(mut self, slots: &[usize]) -> Self {
            self.failing_slots.extend(slots.iter().copied());
            self
        }

        fn delayed(mut self, delays: &[(usize, u64)]) -> Self {
            self.delays_ms.extend(delays.iter().copied());
            self
        }
    }

    #[async_trait]
    impl ImageBackend for FakeBackend {
        async fn generate(
            &self,
            request: &BackendRequest,
        ) -> Result<Vec<String>, GenerationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().expect("seen lock").push(request.clone());

            let slot = request.slot.unwrap_or_default();
            if let Some(ms) = self.delays_ms.get(&slot) {
                tokio::time::sleep(Duration::from_millis(*ms)).await;
            }
            if self.fail_all || self.failing_slots.contains(&slot) {
                return Err(GenerationError::Transport("connection reset".to_string()));
            }
            Ok((0..self.payloads_per_call)
                .map(|i| format!("img-{i}"))
                .collect())
        }
    }

    #[derive(Debug, PartialEq)]
    enum Event {
        Outcome(usize, GenerationOutcome),
        Complete,
    }

    fn ratio(raw: &str) -> AspectRatio {
        raw.parse().expect("ratio")
    }

    async fn run(
        backend: &FakeBackend,
        count: usize,
        plan: DispatchPlan,
    ) -> (Vec<Event>, BatchSummary) {
        let events = RefCell::new(Vec::new());
        let batch = Batch::new(count, "a lighthouse at dusk", ratio("1/1")).expect("batch");
        let summary = dispatch_batch(
            backend,
            batch,
            &plan,
            |index, outcome| events.borrow_mut().push(Event::Outcome(index, outcome)),
            || events.borrow_mut().push(Event::Complete),
        )
        .await;
        (events.into_inner(), summary)
    }

    fn outcome_indices(events: &[Event]) -> Vec<usize> {
        events
            .iter()
            .filter_map(|event| match event {
                Event::Outcome(index, _) => Some(*index),
                Event::Complete => None,
            })
            .collect()
    }

    fn outcome_at(events: &[Event], wanted: usize) -> &GenerationOutcome {
        events
            .iter()
            .find_map(|event| match event {
                Event::Outcome(index, outcome) if *index == wanted => Some(outcome),
                _ => None,
            })
            .expect("outcome for slot")
    }

    #[test]
    fn batch_validates_count_and_prompt() {
        assert_eq!(
            Batch::new(1, "   ", ratio("1/1")).unwrap_err(),
            BatchError::EmptyPrompt
        );
        assert!(matches!(
            Batch::new(0, "cat", ratio("1/1")),
            Err(BatchError::Count { count: 0, .. })
        ));
        assert!(matches!(
            Batch::new(11, "cat", ratio("1/1")),
            Err(BatchError::Count { count: 11, .. })
        ));

        let batch = Batch::new(3, "  cat  ", ratio("16/9")).expect("batch");
        let indices: Vec<usize> = batch.requests().iter().map(|r| r.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert!(batch.requests().iter().all(|r| r.prompt == "cat"));
    }

    #[tokio::test]
    async fn every_slot_settles_once_before_completion() {
        for count in 1..=10 {
            let backend = FakeBackend::new(10);
            let (events, summary) = run(&backend, count, DispatchPlan::default()).await;

            assert_eq!(events.len(), count + 1);
            assert_eq!(events.last(), Some(&Event::Complete));
            let distinct: BTreeSet<usize> = outcome_indices(&events).into_iter().collect();
            assert_eq!(distinct, (0..count).collect::<BTreeSet<_>>());
            assert_eq!(summary.total, count);
            assert_eq!(summary.succeeded, count);
            assert_eq!(backend.calls.load(Ordering::SeqCst), count);
        }
    }

    #[tokio::test]
    async fn one_failing_slot_does_not_affect_siblings() {
        let backend = FakeBackend::new(5).failing(&[3]);
        let (events, summary) = run(&backend, 5, DispatchPlan::default()).await;

        assert_eq!(events.last(), Some(&Event::Complete));
        assert_eq!(
            summary,
            BatchSummary {
                total: 5,
                succeeded: 4,
                failed: 1
            }
        );
        for index in [0, 1, 2, 4] {
            assert_eq!(
                outcome_at(&events, index),
                &GenerationOutcome::Success {
                    image_data: format!("img-{index}")
                }
            );
        }
        assert_eq!(
            outcome_at(&events, 3),
            &GenerationOutcome::Failure {
                reason: "request failed: connection reset".to_string()
            }
        );
    }

    #[tokio::test]
    async fn outcomes_arrive_in_settlement_order() {
        let backend = FakeBackend::new(4).delayed(&[(0, 80), (1, 60), (2, 40), (3, 20)]);
        let (events, _) = run(&backend, 4, DispatchPlan::default()).await;

        assert_eq!(outcome_indices(&events), vec![3, 2, 1, 0]);
        assert_eq!(events.last(), Some(&Event::Complete));
    }

    #[tokio::test]
    async fn slow_failure_does_not_hold_back_fast_successes() {
        let backend = FakeBackend::new(3).failing(&[0]).delayed(&[(0, 60)]);
        let (events, _) = run(&backend, 3, DispatchPlan::default()).await;

        let order = outcome_indices(&events);
        assert_eq!(order.last(), Some(&0));
        assert!(!outcome_at(&events, 0).is_success());
        assert!(outcome_at(&events, 1).is_success());
        assert!(outcome_at(&events, 2).is_success());
    }

    #[tokio::test]
    async fn mixed_batch_marks_failed_slot_and_still_completes() {
        let backend = FakeBackend::new(3).failing(&[1]);
        let (events, summary) = run(&backend, 3, DispatchPlan::default()).await;

        assert!(outcome_at(&events, 0).is_success());
        assert!(!outcome_at(&events, 1).is_success());
        assert!(outcome_at(&events, 2).is_success());
        assert_eq!(summary.failed, 1);
        assert_eq!(
            events.iter().filter(|e| **e == Event::Complete).count(),
            1
        );
    }

    #[tokio::test]
    async fn missing_payload_at_index_fails_only_that_slot() {
        let backend = FakeBackend::new(2);
        let (events, summary) = run(&backend, 3, DispatchPlan::default()).await;

        assert_eq!(summary.succeeded, 2);
        assert_eq!(
            outcome_at(&events, 2),
            &GenerationOutcome::Failure {
                reason: "no image payload at index 2".to_string()
            }
        );
    }

    #[tokio::test]
    async fn first_pick_uses_one_image_per_call() {
        let backend = FakeBackend::new(1);
        let plan = DispatchPlan {
            payload_pick: PayloadPick::First,
            ..DispatchPlan::default()
        };
        let (events, summary) = run(&backend, 3, plan).await;

        assert_eq!(summary.succeeded, 3);
        for index in 0..3 {
            assert_eq!(
                outcome_at(&events, index),
                &GenerationOutcome::Success {
                    image_data: "img-0".to_string()
                }
            );
        }
    }

    #[tokio::test]
    async fn shared_plan_makes_a_single_call() {
        let backend = FakeBackend::new(4);
        let plan = DispatchPlan {
            call_plan: CallPlan::Shared,
            ..DispatchPlan::default()
        };
        let (events, summary) = run(&backend, 4, plan).await;

        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        assert_eq!(summary.succeeded, 4);
        assert_eq!(events.last(), Some(&Event::Complete));

        let seen = backend.seen.lock().expect("seen lock");
        assert_eq!(seen[0].slot, None);
        assert_eq!(seen[0].num_images, Some(4));
    }

    #[tokio::test]
    async fn shared_plan_failure_reaches_every_slot() {
        let backend = FakeBackend {
            fail_all: true,
            ..FakeBackend::new(4)
        };
        let plan = DispatchPlan {
            call_plan: CallPlan::Shared,
            ..DispatchPlan::default()
        };
        let (events, summary) = run(&backend, 3, plan).await;

        assert_eq!(summary.failed, 3);
        assert_eq!(outcome_indices(&events).len(), 3);
        assert_eq!(events.last(), Some(&Event::Complete));
    }

    #[tokio::test]
    async fn per_slot_requests_carry_derived_dimensions() {
        let backend = FakeBackend::new(2);
        let batch = Batch::new(2, "dunes", ratio("16/9")).expect("batch");
        dispatch_batch(&backend, batch, &DispatchPlan::default(), |_, _| {}, || {}).await;

        let seen = backend.seen.lock().expect("seen lock");
        assert_eq!(seen.len(), 2);
        for request in seen.iter() {
            assert_eq!((request.width, request.height), (672, 384));
            assert_eq!(request.prompt, "dunes");
        }
        let slots: BTreeSet<Option<usize>> = seen.iter().map(|r| r.slot).collect();
        assert_eq!(slots, BTreeSet::from([Some(0), Some(1)]));
    }

    #[tokio::test]
    async fn resubmission_starts_from_fresh_indices() {
        let backend = FakeBackend::new(4).failing(&[0]);
        let (first, _) = run(&backend, 2, DispatchPlan::default()).await;
        let (second, summary) = run(&backend, 4, DispatchPlan::default()).await;

        assert_eq!(outcome_indices(&first).len(), 2);
        let distinct: BTreeSet<usize> = outcome_indices(&second).into_iter().collect();
        assert_eq!(distinct, (0..4).collect::<BTreeSet<_>>());
        assert_eq!(summary.total, 4);
    }

    #[test]
    fn plan_names_round_trip_through_config_text() {
        assert_eq!(CallPlan::parse("shared"), Some(CallPlan::Shared));
        assert_eq!(CallPlan::parse(CallPlan::PerSlot.as_str()), Some(CallPlan::PerSlot));
        assert_eq!(PayloadPick::parse("first"), Some(PayloadPick::First));
        assert_eq!(PayloadPick::parse("nope"), None);
    }
}
