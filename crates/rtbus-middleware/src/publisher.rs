//! [`Publisher`] – writes messages into a [`Topic`].
//!
//! One publish takes the topic lock, picks the slot after the write cursor,
//! stamps it and re-arms the QoS timers of the topic's hard real-time
//! subscribers.  What happens when that slot is still pending for an HRT
//! subscriber depends on the [`PublishPolicy`]:
//!
//! | Policy | Lock | Slot still pending |
//! |---|---|---|
//! | `Lazy` | try only, else [`BusError::PublishLocked`] | [`BusError::PublishBlocked`] |
//! | `Blocking` | wait | wait for release up to the timeout, else [`BusError::PublishBlocked`] / [`BusError::PublishTimeout`] |
//! | `Enforcing` | wait | overwrite, counted as discarded |

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use rtbus_types::{BusError, BusResult, MessageOrder, PublishPolicy, PublisherStats, Timestamp};
use tracing::{debug, warn};

use crate::topic::{QosMark, Topic, TopicInner, TopicState};

/// Writing end of a topic.
#[derive(Debug)]
pub struct Publisher {
    topic: Topic,
    attempts: AtomicU64,
    fails: AtomicU64,
}

impl Publisher {
    pub fn new(topic: &Topic) -> Self {
        Self {
            topic: topic.clone(),
            attempts: AtomicU64::new(0),
            fails: AtomicU64::new(0),
        }
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Publish `payload` carrying information of time `t`.
    ///
    /// `timeout` bounds the wait of a `Blocking` publish for the next slot to
    /// be released; `None` falls back to the configured publish timeout.
    /// The wait parks the calling thread, so it is measured in wall-clock
    /// time and not on the core [`Clock`](rtbus_kernel::Clock).
    pub fn publish(
        &self,
        payload: &[u8],
        t: Timestamp,
        policy: PublishPolicy,
        timeout: Option<Duration>,
    ) -> BusResult<()> {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        let result = self.try_publish(payload, t, policy, timeout);
        if let Err(err) = &result {
            self.fails.fetch_add(1, Ordering::Relaxed);
            debug!(topic = self.topic.id(), %t, ?policy, %err, "publish failed");
        }
        result
    }

    pub fn stats(&self) -> PublisherStats {
        PublisherStats {
            attempts: self.attempts.load(Ordering::Relaxed),
            fails: self.fails.load(Ordering::Relaxed),
        }
    }

    fn try_publish(
        &self,
        payload: &[u8],
        t: Timestamp,
        policy: PublishPolicy,
        timeout: Option<Duration>,
    ) -> BusResult<()> {
        let inner = &self.topic.inner;
        if payload.len() > inner.payload_capacity {
            return Err(BusError::PayloadTooLarge {
                size: payload.len(),
                capacity: inner.payload_capacity,
            });
        }

        let mut state = match policy {
            PublishPolicy::Lazy => inner.state.try_lock().ok_or(BusError::PublishLocked)?,
            PublishPolicy::Blocking | PublishPolicy::Enforcing => inner.state.lock(),
        };

        let mut candidate = state.oldest();
        if state.slots[candidate].hrt_left > 0 {
            match policy {
                PublishPolicy::Lazy => return Err(BusError::PublishBlocked),
                PublishPolicy::Blocking => {
                    let wait = timeout
                        .or_else(|| inner.core.config().publish_timeout())
                        .ok_or(BusError::PublishBlocked)?;
                    // Wall clock: a frozen bus clock must not park the thread forever.
                    let until = Instant::now() + wait;
                    let mut id = state.slots[candidate].id;
                    while state.slots[candidate].hrt_left > 0 {
                        let timed_out = inner.released.wait_until(&mut state, until).timed_out();
                        // Another publisher may have consumed the slot meanwhile.
                        if state.slots[candidate].id != id {
                            candidate = state.oldest();
                            id = state.slots[candidate].id;
                        }
                        if timed_out && state.slots[candidate].hrt_left > 0 {
                            return Err(BusError::PublishTimeout);
                        }
                    }
                }
                PublishPolicy::Enforcing => {
                    warn!(
                        topic = inner.id,
                        pending = state.slots[candidate].hrt_left,
                        "overwriting message still pending for hard real-time subscribers"
                    );
                }
            }
        }

        if inner.order == MessageOrder::MsgTime {
            let slot = &state.slots[candidate];
            if slot.id.is_valid() && t < slot.time {
                return Err(BusError::PublishObsolete);
            }
        }

        stamp(inner, &mut state, candidate, payload, t);
        let id = state.slots[candidate].id;
        drop(state);

        inner.events.broadcast(0);
        debug!(topic = inner.id, %id, %t, size = payload.len(), "message published");
        Ok(())
    }
}

/// Place `idx` in the ring, write the message and update the QoS timers.
fn stamp(inner: &Arc<TopicInner>, state: &mut TopicState, idx: usize, payload: &[u8], t: Timestamp) {
    let became_latest = match inner.order {
        MessageOrder::PubTime => true,
        MessageOrder::MsgTime => place_by_time(state, idx, t),
    };

    let newest_information = match inner.order {
        MessageOrder::PubTime => state.newest_information.is_none_or(|newest| t >= newest),
        MessageOrder::MsgTime => became_latest,
    };
    if newest_information {
        state.newest_information = Some(t);
        inner.arm_rate_timer(state, 0);
    }

    let id = match inner.order {
        MessageOrder::PubTime => state.slots[state.latest].id.next(),
        MessageOrder::MsgTime => {
            state.message_counter = state.message_counter.next();
            state.message_counter
        }
    };
    let hrt_left = if became_latest {
        state.hrt.len()
    } else {
        state.slots[state.slots[idx].next].hrt_left
    };

    let subscribers = state.subscribers;
    let slot = &mut state.slots[idx];
    if slot.consumers_left > 0 {
        state.discarded += 1;
    }
    slot.id = id;
    slot.time = t;
    slot.payload[..payload.len()].copy_from_slice(payload);
    slot.size = payload.len();
    slot.hrt_left = hrt_left;
    slot.utilizations += 1;
    slot.consumers_left = subscribers;

    if inner.order == MessageOrder::PubTime {
        state.latest = idx;
    }
    state.published += 1;

    if inner.deadline_checks_enabled() {
        let mark = QosMark { slot: idx, id, time: t };
        for entry in state.hrt.iter_mut() {
            if entry.mark.is_none_or(|current| current.time > t) {
                inner.arm_deadline(entry, mark);
            }
        }
    }
}

/// MSGTIME placement.  Returns `true` if the message became the latest.
fn place_by_time(state: &mut TopicState, idx: usize, t: Timestamp) -> bool {
    let latest = state.latest;
    let head = &state.slots[latest];
    if !head.id.is_valid() || t >= head.time || idx == latest {
        state.latest = idx;
        return true;
    }

    // Unlink the reused slot from behind the cursor ...
    state.slots[latest].next = state.slots[idx].next;

    // ... and re-link it behind the last message not newer than `t`.
    let mut at = latest;
    loop {
        let next = state.slots[at].next;
        let slot = &state.slots[next];
        if slot.id.is_valid() && t < slot.time {
            break;
        }
        at = next;
        if at == latest {
            break;
        }
    }
    state.slots[idx].next = state.slots[at].next;
    state.slots[at].next = idx;
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Core;
    use crate::qos::Recovery;
    use crate::subscriber::{HrtSubscriber, NrtSubscriber, Subscriber};
    use rtbus_kernel::ManualClock;
    use rtbus_types::{BusConfig, MessageId, QosContract};
    use std::thread;

    fn core(order: MessageOrder) -> Arc<Core> {
        let config = BusConfig {
            message_order: order,
            ..BusConfig::default()
        };
        Core::new(config, Arc::new(ManualClock::default()))
    }

    fn ms(v: u64) -> Timestamp {
        Timestamp::from_millis(v)
    }

    fn times(topic: &Topic) -> Vec<u64> {
        topic
            .messages()
            .into_iter()
            .map(|(_, t)| t.as_micros() / 1_000)
            .collect()
    }

    #[test]
    fn ids_increase_in_publish_order() {
        let topic = Topic::new(&core(MessageOrder::PubTime), 1, 3, 0).unwrap();
        let publisher = Publisher::new(&topic);
        for t in [5, 1, 9, 2] {
            publisher.publish(&[], ms(t), PublishPolicy::Blocking, None).unwrap();
        }
        let ids: Vec<MessageId> = topic.messages().into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![MessageId::new(2), MessageId::new(3), MessageId::new(4)]);
        assert!(ids.iter().all(|id| id.is_valid()));
        // PUBTIME keeps publish order, not information order.
        assert_eq!(times(&topic), vec![1, 9, 2]);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let topic = Topic::new(&core(MessageOrder::PubTime), 1, 2, 2).unwrap();
        let publisher = Publisher::new(&topic);
        let err = publisher
            .publish(&[1, 2, 3], ms(1), PublishPolicy::Blocking, None)
            .unwrap_err();
        assert_eq!(err, BusError::PayloadTooLarge { size: 3, capacity: 2 });
        assert_eq!(publisher.stats(), PublisherStats { attempts: 1, fails: 1 });
    }

    #[test]
    fn msgtime_keeps_information_order() {
        let topic = Topic::new(&core(MessageOrder::MsgTime), 1, 4, 0).unwrap();
        let publisher = Publisher::new(&topic);
        for t in [10, 30, 20, 25] {
            publisher.publish(&[], ms(t), PublishPolicy::Blocking, None).unwrap();
        }
        assert_eq!(times(&topic), vec![10, 20, 25, 30]);
        assert_eq!(topic.latest().map(|(_, t)| t), Some(ms(30)));

        // Ring is full; the oldest slot (10) is reused for 15.
        publisher.publish(&[], ms(15), PublishPolicy::Blocking, None).unwrap();
        assert_eq!(times(&topic), vec![15, 20, 25, 30]);
    }

    #[test]
    fn msgtime_rejects_information_older_than_oldest() {
        let topic = Topic::new(&core(MessageOrder::MsgTime), 1, 2, 0).unwrap();
        let publisher = Publisher::new(&topic);
        publisher.publish(&[], ms(10), PublishPolicy::Blocking, None).unwrap();
        publisher.publish(&[], ms(20), PublishPolicy::Blocking, None).unwrap();

        let err = publisher.publish(&[], ms(5), PublishPolicy::Blocking, None).unwrap_err();
        assert_eq!(err, BusError::PublishObsolete);
        assert_eq!(times(&topic), vec![10, 20]);

        publisher.publish(&[], ms(15), PublishPolicy::Blocking, None).unwrap();
        assert_eq!(times(&topic), vec![15, 20]);
    }

    #[test]
    fn msgtime_counter_numbers_messages_in_write_order() {
        let topic = Topic::new(&core(MessageOrder::MsgTime), 1, 3, 0).unwrap();
        let publisher = Publisher::new(&topic);
        publisher.publish(&[], ms(20), PublishPolicy::Blocking, None).unwrap();
        publisher.publish(&[], ms(10), PublishPolicy::Blocking, None).unwrap();
        let messages = topic.messages();
        assert_eq!(messages[0], (MessageId::new(2), ms(10)));
        assert_eq!(messages[1], (MessageId::new(1), ms(20)));
    }

    #[test]
    fn pending_slot_is_not_reused_by_lazy_or_blocking() {
        let topic = Topic::new(&core(MessageOrder::PubTime), 1, 2, 1).unwrap();
        let publisher = Publisher::new(&topic);
        let _hrt = HrtSubscriber::subscribe(&topic, 1, QosContract::default(), Recovery::Panic);

        publisher.publish(&[1], ms(1), PublishPolicy::Blocking, None).unwrap();
        publisher.publish(&[2], ms(2), PublishPolicy::Blocking, None).unwrap();

        assert_eq!(
            publisher.publish(&[3], ms(3), PublishPolicy::Lazy, None),
            Err(BusError::PublishBlocked)
        );
        assert_eq!(
            publisher.publish(&[3], ms(3), PublishPolicy::Blocking, None),
            Err(BusError::PublishBlocked)
        );
        assert_eq!(
            publisher.publish(&[3], ms(3), PublishPolicy::Blocking, Some(Duration::from_millis(20))),
            Err(BusError::PublishTimeout)
        );
        assert_eq!(times(&topic), vec![1, 2]);
        assert_eq!(publisher.stats(), PublisherStats { attempts: 5, fails: 3 });
    }

    #[test]
    fn enforcing_overwrites_and_counts_discard() {
        let topic = Topic::new(&core(MessageOrder::PubTime), 1, 2, 1).unwrap();
        let publisher = Publisher::new(&topic);
        let _hrt = HrtSubscriber::subscribe(&topic, 1, QosContract::default(), Recovery::Panic);

        for t in 1..=3 {
            publisher.publish(&[t as u8], ms(t), PublishPolicy::Enforcing, None).unwrap();
        }
        assert_eq!(times(&topic), vec![2, 3]);
        assert_eq!(topic.stats().discarded, 1);
    }

    #[test]
    fn blocking_publish_resumes_once_slot_is_released() {
        let topic = Topic::new(&core(MessageOrder::PubTime), 1, 1, 1).unwrap();
        let publisher = Publisher::new(&topic);
        let mut hrt = HrtSubscriber::subscribe(&topic, 1, QosContract::default(), Recovery::Panic);
        publisher.publish(&[1], ms(1), PublishPolicy::Blocking, None).unwrap();

        let reader = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            let mut buf = [0u8; 1];
            hrt.fetch_next(&mut buf).unwrap();
            buf[0]
        });

        publisher
            .publish(&[2], ms(2), PublishPolicy::Blocking, Some(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(reader.join().unwrap(), 1);
        assert_eq!(times(&topic), vec![2]);
    }

    #[test]
    fn blocking_timeout_runs_on_wall_clock() {
        let core = core(MessageOrder::PubTime);
        let topic = Topic::new(&core, 1, 1, 1).unwrap();
        let publisher = Publisher::new(&topic);
        let _hrt = HrtSubscriber::subscribe(&topic, 1, QosContract::default(), Recovery::Panic);
        publisher.publish(&[1], ms(1), PublishPolicy::Blocking, None).unwrap();

        let bus_time = core.now();
        let started = Instant::now();
        assert_eq!(
            publisher.publish(&[2], ms(2), PublishPolicy::Blocking, Some(Duration::from_millis(30))),
            Err(BusError::PublishTimeout)
        );
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(30));
        assert!(waited < Duration::from_secs(2));
        assert_eq!(core.now(), bus_time);
    }

    #[test]
    fn lazy_publish_fails_fast_while_another_thread_holds_the_lock() {
        let topic = Topic::new(&core(MessageOrder::PubTime), 1, 4, 0).unwrap();
        let holder = topic.clone();
        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let handle = thread::spawn(move || {
            let _guard = holder.inner.state.lock();
            locked_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        });
        locked_rx.recv().unwrap();

        let publisher = Publisher::new(&topic);
        let started = Instant::now();
        assert_eq!(
            publisher.publish(&[], ms(1), PublishPolicy::Lazy, None),
            Err(BusError::PublishLocked)
        );
        assert!(started.elapsed() < Duration::from_millis(50));

        release_tx.send(()).unwrap();
        handle.join().unwrap();
        publisher.publish(&[], ms(1), PublishPolicy::Lazy, None).unwrap();
    }

    #[test]
    fn deadline_timer_is_not_pushed_back_by_later_messages() {
        let core = core(MessageOrder::PubTime);
        let topic = Topic::new(&core, 1, 4, 0).unwrap();
        let publisher = Publisher::new(&topic);
        let hrt = HrtSubscriber::subscribe(
            &topic,
            1,
            QosContract::default().with_deadline(Duration::from_millis(100)),
            Recovery::Panic,
        );

        publisher.publish(&[], ms(0), PublishPolicy::Enforcing, None).unwrap();
        assert_eq!(hrt.qos_deadline(), Some(ms(100)));

        publisher.publish(&[], ms(50), PublishPolicy::Enforcing, None).unwrap();
        assert_eq!(hrt.qos_deadline(), Some(ms(100)));
    }

    #[test]
    fn published_message_marks_topic_listeners() {
        let topic = Topic::new(&core(MessageOrder::PubTime), 1, 2, 0).unwrap();
        let publisher = Publisher::new(&topic);
        let nrt = NrtSubscriber::subscribe(&topic, 0b100);
        publisher.publish(&[], ms(1), PublishPolicy::Blocking, None).unwrap();
        assert_eq!(nrt.listener().signal().pending() & 0b100, 0b100);
    }
}
