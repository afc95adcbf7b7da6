use std::time::Duration;

use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    delivery::{self, run_guarded, DeliveryProducer, SendOutcome},
    ChannelCapacities, Delivery, Record, Transport, TransportBuilder, TransportError,
};

#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub(crate) transport: TransportBuilder,
    pub(crate) timeout: Option<Duration>,
    pub(crate) capacities: ChannelCapacities,
}

impl QueryOptions {
    pub fn new(transport: TransportBuilder) -> Self {
        Self {
            transport,
            ..Self::default()
        }
    }

    /// Upper bound for the whole query, on top of the caller's cancellation token.
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn capacities(mut self, capacities: ChannelCapacities) -> Self {
        self.capacities = capacities;
        self
    }
}

/// Runs `prompt` through a fresh CLI process and streams back its records.
///
/// Cancelling `cancel` ends the stream without an error; the process is stopped either way.
pub fn query(
    prompt: impl Into<String>,
    options: QueryOptions,
    cancel: CancellationToken,
) -> Delivery<Record> {
    query_map(prompt, options, cancel, Some)
}

/// Like [`query`], passing each record through `mapper`; records mapped to `None` are dropped.
pub fn query_map<T, F>(
    prompt: impl Into<String>,
    options: QueryOptions,
    cancel: CancellationToken,
    mapper: F,
) -> Delivery<T>
where
    T: Send + 'static,
    F: FnMut(Record) -> Option<T> + Send + 'static,
{
    let QueryOptions {
        transport,
        timeout,
        capacities,
    } = options;
    query_with_transport(transport.build(prompt), timeout, capacities, cancel, mapper)
}

/// Drives an already configured transport through connect, receive and disconnect.
///
/// The returned channels close before `disconnect` is called.
pub fn query_with_transport<Tr, T, F>(
    transport: Tr,
    timeout: Option<Duration>,
    capacities: ChannelCapacities,
    cancel: CancellationToken,
    mapper: F,
) -> Delivery<T>
where
    Tr: Transport + 'static,
    T: Send + 'static,
    F: FnMut(Record) -> Option<T> + Send + 'static,
{
    let query_cancel = cancel.child_token();
    let (producer, delivery) = delivery::channel(capacities, query_cancel.clone());

    tokio::spawn(async move {
        let relay_cancel = query_cancel.clone();
        run_guarded(producer, |producer| {
            relay(&transport, producer, timeout, relay_cancel, mapper)
        })
        .await;

        query_cancel.cancel();
        if let Err(err) = transport.disconnect().await {
            debug!(error = %err, "failed to disconnect after query");
        }
    });

    delivery
}

async fn relay<Tr, T, F>(
    transport: &Tr,
    producer: DeliveryProducer<T>,
    timeout: Option<Duration>,
    cancel: CancellationToken,
    mut mapper: F,
) where
    Tr: Transport + ?Sized,
    F: FnMut(Record) -> Option<T>,
{
    let limit = timeout.unwrap_or_default();
    let deadline = time::sleep(limit);
    tokio::pin!(deadline);

    let connected = tokio::select! {
        biased;
        () = cancel.cancelled() => return,
        () = &mut deadline, if timeout.is_some() => {
            producer.send_error(TransportError::Timeout { timeout: limit });
            return;
        }
        connected = transport.connect() => connected,
    };
    if let Err(err) = connected {
        producer.send_error(err);
        return;
    }
    let mut inner = transport.receive_messages(cancel.clone());

    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            () = &mut deadline, if timeout.is_some() => {
                producer.send_error(TransportError::Timeout { timeout: limit });
                return;
            }
            next = inner.next() => next,
        };

        let record = match next {
            None => return,
            Some(Err(err)) => {
                producer.send_error(err);
                return;
            }
            Some(Ok(record)) => record,
        };
        let Some(item) = mapper(record) else {
            continue;
        };

        tokio::select! {
            biased;
            () = &mut deadline, if timeout.is_some() => {
                producer.send_error(TransportError::Timeout { timeout: limit });
                return;
            }
            outcome = producer.send_record(item) => {
                if outcome != SendOutcome::Delivered {
                    return;
                }
            }
        }
    }
}
