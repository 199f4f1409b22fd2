//! Demo system run by `rtbus run`.
//!
//! ```text
//!   sensor ──topic 1 (HRT)──▶ controller ──FRT request──▶ motor (service 2)
//!                               ▲                            │
//!                               └──────── response ──────────┘
//! ```
//!
//! The sensor publishes a counter every period.  The controller holds a hard
//! real-time subscription with a deadline and forwards the latest reading as
//! a firm real-time request to the motor service, which answers with the
//! doubled value.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use rtbus_kernel::{Notifier, SystemClock};
use rtbus_middleware::{
    Core, HrtSubscriber, Publisher, Recovery, Request, Service, Subscriber, Topic,
};
use rtbus_runtime::{Executor, Node, NodeContext, RuntimeError};
use rtbus_types::{
    BusError, BusResult, EventMask, PublishPolicy, QosContract, RetrievePolicy, ServiceStats,
    TopicStats,
};
use tracing::{debug, warn};

use crate::config::Config;

pub const SENSOR_TOPIC: u32 = 1;
pub const MOTOR_SERVICE: u32 = 2;

const READING: EventMask = 1 << 0;
const ANSWER: EventMask = 1 << 1;
const CALL: EventMask = 1 << 0;
const PAYLOAD: usize = 8;

#[derive(Debug, Default)]
struct Counters {
    published: AtomicU64,
    dropped: AtomicU64,
    received: AtomicU64,
    violations: AtomicU64,
    calls: AtomicU64,
    answered: AtomicU64,
    late: AtomicU64,
}

/// Figures printed after a run.
#[derive(Debug)]
pub struct DemoReport {
    pub published: u64,
    pub dropped: u64,
    pub received: u64,
    pub violations: u64,
    pub calls: u64,
    pub answered: u64,
    pub late: u64,
    pub topic: TopicStats,
    pub service: Option<ServiceStats>,
    /// Core status after the nodes stopped.
    pub status: Result<(), String>,
    /// The bus stopped on a broken deadline, jitter or rate contract.
    pub contract_broken: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// Nodes
// ─────────────────────────────────────────────────────────────────────────────

struct Sensor {
    topic: Topic,
    publisher: Option<Publisher>,
    period: Duration,
    next: u64,
    counters: Arc<Counters>,
}

impl Node for Sensor {
    fn name(&self) -> &str {
        "sensor"
    }

    fn setup(&mut self, _: &NodeContext) -> BusResult<EventMask> {
        self.publisher = Some(Publisher::new(&self.topic));
        Ok(0)
    }

    fn step(&mut self, ctx: &NodeContext, _: EventMask) -> BusResult<EventMask> {
        let Some(publisher) = &self.publisher else {
            return Ok(0);
        };
        self.next += 1;
        match publisher.publish(
            &self.next.to_le_bytes(),
            ctx.now(),
            PublishPolicy::Blocking,
            None,
        ) {
            Ok(()) => {
                self.counters.published.fetch_add(1, Ordering::Relaxed);
            }
            Err(BusError::PublishBlocked | BusError::PublishTimeout | BusError::PublishLocked) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => return Err(e),
        }
        Ok(0)
    }

    fn period(&self) -> Option<Duration> {
        Some(self.period)
    }
}

struct Controller {
    topic: Topic,
    subscriber: Option<HrtSubscriber>,
    deadline: Duration,
    request: Request,
    request_deadline: Duration,
    service: Arc<OnceLock<Service>>,
    counters: Arc<Counters>,
}

impl Controller {
    fn forward(&self, reading: u64) {
        let Some(service) = self.service.get() else {
            return;
        };
        let mut guard = match self.request.try_acquire() {
            Ok(guard) => guard,
            Err(e) => {
                debug!(error = %e, "motor request busy, reading skipped");
                return;
            }
        };
        guard.payload_mut()[..PAYLOAD].copy_from_slice(&reading.to_le_bytes());
        match guard.submit(service, PAYLOAD, ANSWER, Some(self.request_deadline)) {
            Ok(()) => {
                self.counters.calls.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => warn!(error = %e, "motor request not submitted"),
        }
    }

    fn collect(&self) {
        match self.request.retrieve(RetrievePolicy::Blocking) {
            Ok(answer) => {
                self.counters.answered.fetch_add(1, Ordering::Relaxed);
                if answer.violation.is_some() {
                    self.counters.late.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(e) => debug!(error = %e, "no motor answer yet"),
        }
    }
}

impl Node for Controller {
    fn name(&self) -> &str {
        "controller"
    }

    fn setup(&mut self, _: &NodeContext) -> BusResult<EventMask> {
        let counters = Arc::clone(&self.counters);
        self.subscriber = Some(HrtSubscriber::subscribe(
            &self.topic,
            READING,
            QosContract::default().with_deadline(self.deadline),
            Recovery::handler(move |violation| {
                warn!(%violation, "sensor reading missed its contract");
                counters.violations.fetch_add(1, Ordering::Relaxed);
            }),
        ));
        Ok(READING | ANSWER)
    }

    fn step(&mut self, _: &NodeContext, events: EventMask) -> BusResult<EventMask> {
        if events & ANSWER != 0 {
            self.collect();
        }
        if events & READING != 0
            && let Some(subscriber) = self.subscriber.as_mut()
        {
            let mut buf = [0u8; PAYLOAD];
            let fetched = subscriber.fetch_latest(&mut buf);
            if subscriber.violation().is_some() {
                subscriber.clear_violation();
            }
            if fetched.is_ok() {
                self.counters.received.fetch_add(1, Ordering::Relaxed);
                self.forward(u64::from_le_bytes(buf));
            }
        }
        Ok(READING | ANSWER)
    }
}

struct Motor {
    service: Arc<OnceLock<Service>>,
}

impl Node for Motor {
    fn name(&self) -> &str {
        "motor"
    }

    fn setup(&mut self, ctx: &NodeContext) -> BusResult<EventMask> {
        let service = Service::new(MOTOR_SERVICE, Notifier::new(Arc::clone(ctx.signal()), CALL));
        self.service
            .set(service)
            .map_err(|_| BusError::InvalidConfig("motor service set up twice".into()))?;
        Ok(CALL)
    }

    fn step(&mut self, _: &NodeContext, _: EventMask) -> BusResult<EventMask> {
        let Some(service) = self.service.get() else {
            return Ok(CALL);
        };
        let mut buf = [0u8; PAYLOAD];
        while let Some(dispatched) = service.dispatch(&mut buf)? {
            if dispatched.no_return() {
                continue;
            }
            let command = u64::from_le_bytes(buf);
            match service.acquire(dispatched) {
                Ok(mut responder) => {
                    responder.payload_mut()[..PAYLOAD]
                        .copy_from_slice(&command.wrapping_mul(2).to_le_bytes());
                    responder.respond(PAYLOAD)?;
                }
                Err(e) => debug!(error = %e, "dropping stale motor command"),
            }
        }
        Ok(CALL)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Run
// ─────────────────────────────────────────────────────────────────────────────

/// Run the demo for `run_for` or until `shutdown` is set.
pub fn run(cfg: &Config, run_for: Duration, shutdown: &AtomicBool) -> Result<DemoReport, String> {
    let core = Core::new(cfg.bus.clone(), Arc::new(SystemClock::new()));
    let topic = Topic::new(&core, SENSOR_TOPIC, cfg.demo.topic_capacity, PAYLOAD)
        .map_err(|e| format!("Failed to create sensor topic: {}", e))?;
    let service = Arc::new(OnceLock::new());
    let counters = Arc::new(Counters::default());

    let mut executor = Executor::new(Arc::clone(&core));
    executor.add(Sensor {
        topic: topic.clone(),
        publisher: None,
        period: Duration::from_millis(cfg.demo.publish_period_ms.max(1)),
        next: 0,
        counters: Arc::clone(&counters),
    });
    executor.add(Controller {
        topic: topic.clone(),
        subscriber: None,
        deadline: Duration::from_millis(cfg.demo.hrt_deadline_ms),
        request: Request::frt(&core, PAYLOAD, None),
        request_deadline: Duration::from_millis(cfg.demo.service_deadline_ms),
        service: Arc::clone(&service),
        counters: Arc::clone(&counters),
    });
    executor.add(Motor {
        service: Arc::clone(&service),
    });
    executor
        .start()
        .map_err(|e| format!("Failed to start nodes: {}", e))?;

    let until = Instant::now() + run_for;
    while Instant::now() < until && !shutdown.load(Ordering::SeqCst) && core.status().is_ok() {
        thread::sleep(Duration::from_millis(20));
    }
    if let Err(e) = executor.stop(None) {
        debug!(error = %e, "bus failed before stop");
    }
    let joined = executor.join();
    let contract_broken = joined
        .as_ref()
        .err()
        .is_some_and(RuntimeError::is_contract_violation);
    let status = joined.map_err(|e| e.to_string());

    Ok(DemoReport {
        published: counters.published.load(Ordering::Relaxed),
        dropped: counters.dropped.load(Ordering::Relaxed),
        received: counters.received.load(Ordering::Relaxed),
        violations: counters.violations.load(Ordering::Relaxed),
        calls: counters.calls.load(Ordering::Relaxed),
        answered: counters.answered.load(Ordering::Relaxed),
        late: counters.late.load(Ordering::Relaxed),
        topic: topic.stats(),
        service: service.get().map(Service::stats),
        status,
        contract_broken,
    })
}
