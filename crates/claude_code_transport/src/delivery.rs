use std::{
    any::Any,
    collections::VecDeque,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use futures_util::FutureExt;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use crate::{Record, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelCapacities {
    pub records: usize,
    pub errors: usize,
}

impl ChannelCapacities {
    pub const DEFAULT_RECORDS: usize = 10;
    pub const DEFAULT_ERRORS: usize = 1;

    pub fn new(records: usize, errors: usize) -> Self {
        Self { records, errors }
    }

    fn normalized(self) -> Self {
        Self {
            records: if self.records == 0 {
                Self::DEFAULT_RECORDS
            } else {
                self.records
            },
            errors: if self.errors == 0 {
                Self::DEFAULT_ERRORS
            } else {
                self.errors
            },
        }
    }
}

impl Default for ChannelCapacities {
    fn default() -> Self {
        Self::new(Self::DEFAULT_RECORDS, Self::DEFAULT_ERRORS)
    }
}

/// Both consumer-side channels close together, when the last producer clone is dropped.
pub(crate) fn channel<T>(
    capacities: ChannelCapacities,
    cancel: CancellationToken,
) -> (DeliveryProducer<T>, Delivery<T>) {
    let capacities = capacities.normalized();
    let (records_tx, records_rx) = mpsc::channel(capacities.records);
    let shared = Arc::new(ErrorShared {
        queue: Mutex::new(ErrorQueue {
            items: VecDeque::with_capacity(capacities.errors),
            capacity: capacities.errors,
            closed: false,
        }),
        notify: Notify::new(),
    });

    let producer = DeliveryProducer {
        records: records_tx,
        errors: ErrorSender {
            handle: Arc::new(SenderHandle {
                shared: Arc::clone(&shared),
            }),
        },
        cancel,
    };
    let delivery = Delivery {
        records: RecordReceiver { rx: records_rx },
        errors: ErrorReceiver { shared },
        records_closed: false,
        errors_closed: false,
        finished: false,
    };
    (producer, delivery)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SendOutcome {
    Delivered,
    Cancelled,
    ReceiverDropped,
}

pub(crate) struct DeliveryProducer<T> {
    records: mpsc::Sender<T>,
    errors: ErrorSender,
    cancel: CancellationToken,
}

impl<T> Clone for DeliveryProducer<T> {
    fn clone(&self) -> Self {
        Self {
            records: self.records.clone(),
            errors: self.errors.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<T> DeliveryProducer<T> {
    /// Waits for room in the record channel unless the cycle is cancelled first.
    pub(crate) async fn send_record(&self, item: T) -> SendOutcome {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => SendOutcome::Cancelled,
            sent = self.records.send(item) => match sent {
                Ok(()) => SendOutcome::Delivered,
                Err(_) => SendOutcome::ReceiverDropped,
            },
        }
    }

    /// Never blocks; a full error channel drops its oldest entry.
    pub(crate) fn send_error(&self, err: TransportError) {
        if let Some(evicted) = self.errors.send_latest(err) {
            tracing::debug!(evicted = %evicted, "error channel full; dropped oldest error");
        }
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Runs `work`, converting a panic into a final [`TransportError::Internal`].
///
/// A producer clone is held across `work` so the channels cannot close before the panic is
/// reported; they close when this returns.
pub(crate) async fn run_guarded<T, F, Fut>(producer: DeliveryProducer<T>, work: F)
where
    F: FnOnce(DeliveryProducer<T>) -> Fut,
    Fut: Future<Output = ()>,
{
    let guard = producer.clone();
    let outcome = AssertUnwindSafe(work(producer)).catch_unwind().await;
    if let Err(panic) = outcome {
        let message = panic_message(&*panic);
        tracing::warn!(panic = %message, "recovered panic in claude delivery task");
        guard.send_error(TransportError::Internal(message));
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        format!("panic: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panic: {s}")
    } else {
        "panic: <non-string payload>".to_string()
    }
}

struct ErrorQueue {
    items: VecDeque<TransportError>,
    capacity: usize,
    closed: bool,
}

struct ErrorShared {
    queue: Mutex<ErrorQueue>,
    notify: Notify,
}

impl ErrorShared {
    fn lock(&self) -> MutexGuard<'_, ErrorQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct SenderHandle {
    shared: Arc<ErrorShared>,
}

impl Drop for SenderHandle {
    fn drop(&mut self) {
        self.shared.lock().closed = true;
        self.shared.notify.notify_one();
    }
}

#[derive(Clone)]
struct ErrorSender {
    handle: Arc<SenderHandle>,
}

impl ErrorSender {
    fn send_latest(&self, err: TransportError) -> Option<TransportError> {
        let shared = &self.handle.shared;
        let evicted = {
            let mut queue = shared.lock();
            let evicted = if queue.items.len() >= queue.capacity {
                queue.items.pop_front()
            } else {
                None
            };
            queue.items.push_back(err);
            evicted
        };
        shared.notify.notify_one();
        evicted
    }
}

#[derive(Debug)]
pub struct RecordReceiver<T = Record> {
    rx: mpsc::Receiver<T>,
}

impl<T> RecordReceiver<T> {
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }
}

pub struct ErrorReceiver {
    shared: Arc<ErrorShared>,
}

impl std::fmt::Debug for ErrorReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorReceiver").finish_non_exhaustive()
    }
}

impl ErrorReceiver {
    pub async fn recv(&mut self) -> Option<TransportError> {
        loop {
            {
                let mut queue = self.shared.lock();
                if let Some(err) = queue.items.pop_front() {
                    return Some(err);
                }
                if queue.closed {
                    return None;
                }
            }
            self.shared.notify.notified().await;
        }
    }

    pub fn try_recv(&mut self) -> Option<TransportError> {
        self.shared.lock().items.pop_front()
    }
}

/// Output of one receive cycle: ordered records plus at most one terminal error.
#[derive(Debug)]
pub struct Delivery<T = Record> {
    records: RecordReceiver<T>,
    errors: ErrorReceiver,
    records_closed: bool,
    errors_closed: bool,
    finished: bool,
}

impl<T> Delivery<T> {
    pub(crate) fn failed(err: TransportError, capacities: ChannelCapacities) -> Self {
        let (producer, delivery) = channel(capacities, CancellationToken::new());
        producer.send_error(err);
        delivery
    }

    /// Buffered records are yielded before a pending error. Nothing is yielded after an error.
    pub async fn next(&mut self) -> Option<Result<T, TransportError>> {
        if self.finished {
            return None;
        }

        loop {
            tokio::select! {
                biased;
                item = self.records.recv(), if !self.records_closed => match item {
                    Some(item) => return Some(Ok(item)),
                    None => self.records_closed = true,
                },
                err = self.errors.recv(), if !self.errors_closed => match err {
                    Some(err) => {
                        self.finished = true;
                        return Some(Err(err));
                    }
                    None => self.errors_closed = true,
                },
                else => {
                    self.finished = true;
                    return None;
                }
            }
        }
    }

    pub async fn collect(mut self) -> Result<Vec<T>, TransportError> {
        let mut out = Vec::new();
        while let Some(item) = self.next().await {
            out.push(item?);
        }
        Ok(out)
    }

    pub fn into_parts(self) -> (RecordReceiver<T>, ErrorReceiver) {
        (self.records, self.errors)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn boom(n: usize) -> TransportError {
        TransportError::Internal(format!("boom {n}"))
    }

    #[tokio::test]
    async fn full_error_channel_keeps_latest() {
        let (producer, delivery) =
            channel::<Record>(ChannelCapacities::new(1, 1), CancellationToken::new());
        producer.send_error(boom(1));
        producer.send_error(boom(2));
        drop(producer);

        let (_, mut errors) = delivery.into_parts();
        let err = errors.recv().await.expect("one error");
        assert_eq!(err.to_string(), "internal failure: boom 2");
        assert!(errors.recv().await.is_none());
    }

    #[tokio::test]
    async fn channels_close_together_with_last_producer() {
        let (producer, delivery) =
            channel::<u32>(ChannelCapacities::default(), CancellationToken::new());
        let clone = producer.clone();
        drop(producer);
        assert_eq!(clone.send_record(7).await, SendOutcome::Delivered);
        drop(clone);

        let (mut records, mut errors) = delivery.into_parts();
        assert_eq!(records.recv().await, Some(7));
        assert_eq!(records.recv().await, None);
        assert!(errors.recv().await.is_none());
    }

    #[tokio::test]
    async fn cancellation_abandons_blocked_send() {
        let cancel = CancellationToken::new();
        let (producer, _delivery) = channel::<u32>(ChannelCapacities::new(1, 1), cancel.clone());
        assert_eq!(producer.send_record(1).await, SendOutcome::Delivered);

        let blocked = tokio::spawn(async move { producer.send_record(2).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let outcome = tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .expect("send returns promptly")
            .expect("task joins");
        assert_eq!(outcome, SendOutcome::Cancelled);
    }

    #[tokio::test]
    async fn next_yields_buffered_records_before_error() {
        let (producer, mut delivery) =
            channel::<u32>(ChannelCapacities::default(), CancellationToken::new());
        producer.send_record(1).await;
        producer.send_record(2).await;
        producer.send_error(boom(0));
        drop(producer);

        assert_eq!(delivery.next().await.unwrap().unwrap(), 1);
        assert_eq!(delivery.next().await.unwrap().unwrap(), 2);
        assert!(delivery.next().await.unwrap().is_err());
        assert!(delivery.next().await.is_none());
    }

    #[tokio::test]
    async fn failed_delivery_is_pre_closed() {
        let delivery = Delivery::<Record>::failed(
            TransportError::not_connected(),
            ChannelCapacities::default(),
        );
        let err = delivery.collect().await.unwrap_err();
        assert!(err.to_string().contains("not connected"));
    }

    #[tokio::test]
    async fn panic_becomes_final_error_then_close() {
        let (producer, delivery) =
            channel::<u32>(ChannelCapacities::default(), CancellationToken::new());
        run_guarded(producer, |producer| async move {
            producer.send_record(1).await;
            panic!("decoder exploded");
        })
        .await;

        let (mut records, mut errors) = delivery.into_parts();
        assert_eq!(records.recv().await, Some(1));
        assert_eq!(records.recv().await, None);
        let err = errors.recv().await.expect("panic reported");
        assert!(matches!(&err, TransportError::Internal(msg) if msg.contains("decoder exploded")));
        assert!(errors.recv().await.is_none());
    }

    #[test]
    fn zero_capacities_fall_back_to_defaults() {
        assert_eq!(ChannelCapacities::new(0, 0).normalized(), ChannelCapacities::default());
    }
}
