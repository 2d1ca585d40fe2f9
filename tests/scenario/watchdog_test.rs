//! Watchdog supervision of stepped workers.

use super::common::{simulate, Lane};
use rtcore_common::time::{Clock, SimClock};
use rtcore_runtime::watchdog::{Expiry, FatalAction, WatchdogRegistry};
use rtcore_runtime::worker::{ChannelRole, PeriodicWorker, Tick, WorkerBody, WorkerSpec};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn idle(name: &str, period: Duration, clock: &Arc<SimClock>) -> PeriodicWorker<(), impl WorkerBody<()>> {
    PeriodicWorker::new(
        WorkerSpec::new(name, period),
        ChannelRole::None,
        |_: &mut Tick<'_, ()>| {},
        clock.clone(),
    )
}

#[test]
fn test_stalled_worker_fires_exactly_once() {
    let clock = SimClock::shared();
    let expired = Arc::new(Mutex::new(Vec::<Expiry>::new()));
    let sink = Arc::clone(&expired);
    let action: FatalAction = Arc::new(move |expiry: &Expiry| {
        sink.lock().unwrap().push(expiry.clone());
    });
    let timeout = Duration::from_millis(50);
    let watchdog = WatchdogRegistry::with_fatal_action(clock.clone(), timeout, action);

    let mut healthy = idle("healthy", Duration::from_millis(1), &clock);
    healthy.attach_heartbeat(watchdog.register("healthy").unwrap());
    let mut stalled = idle("stalled", Duration::from_millis(10), &clock);
    stalled.attach_heartbeat(watchdog.register("stalled").unwrap());

    // Both heartbeat well inside the window
    let mut fired = 0;
    {
        let mut lanes: [&mut dyn Lane; 2] = [&mut healthy, &mut stalled];
        let until = clock.now() + Duration::from_millis(100);
        simulate(&clock, &mut lanes, until, |_, _| fired += watchdog.poll());
    }
    assert_eq!(fired, 0);
    assert!(expired.lock().unwrap().is_empty());

    // The second worker never comes back; the monitor keeps polling
    {
        let mut lanes: [&mut dyn Lane; 1] = [&mut healthy];
        let until = clock.now() + Duration::from_millis(200);
        simulate(&clock, &mut lanes, until, |_, _| fired += watchdog.poll());
    }
    assert_eq!(fired, 1);

    let expired = expired.lock().unwrap();
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].worker, "stalled");
    assert_eq!(expired[0].timeout, timeout);
    assert!(expired[0].silent_for >= timeout);
    drop(expired);

    // Deregistered workers are no longer supervised
    assert!(watchdog.deregister("stalled"));
    assert_eq!(watchdog.len(), 1);
}

#[test]
fn test_unsupervised_worker_is_never_registered() {
    let clock = SimClock::shared();
    let watchdog = WatchdogRegistry::with_fatal_action(
        clock.clone(),
        Duration::from_millis(5),
        Arc::new(|expiry: &Expiry| panic!("unexpected expiry of {}", expiry.worker)),
    );

    let mut acquisition = PeriodicWorker::new(
        WorkerSpec::new("acquisition", Duration::from_millis(2)).unsupervised(),
        ChannelRole::<()>::None,
        |_: &mut Tick<'_, ()>| {},
        clock.clone(),
    );
    acquisition.run_iterations(10);
    clock.advance(Duration::from_secs(1));

    assert!(watchdog.is_empty());
    assert_eq!(watchdog.poll(), 0);
}
