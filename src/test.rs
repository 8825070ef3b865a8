#[cfg(test)]
mod tests {
    use crate::config::SpinConfig;
    use crate::context::Context;
    use crate::error::RclResult;
    use crate::executor::Executor;
    use crate::transport::{LoopbackTransport, Message, Qos, encode};
    use crate::utils::*;
    use parking_lot::Mutex;
    use serde::{Deserialize, Serialize};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::{Duration, Instant};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Chatter {
        data: String,
    }

    impl Message for Chatter {
        const TYPE_NAME: &'static str = "std_msgs::msg::String";
    }

    fn chatter(s: &str) -> Chatter {
        Chatter { data: s.to_string() }
    }

    // ---- helper: loopback context with the test type registered
    fn setup() -> (LoopbackTransport, Context) {
        let transport = LoopbackTransport::new();
        let ctx = Context::new(
            Arc::new(transport.clone()),
            CancelToken::new_root(),
            SpinConfig::default(),
        );
        ctx.register_type::<Chatter>().expect("register failed");
        (transport, ctx)
    }

    fn wait_until(dur: Duration, what: impl Fn() -> bool) -> bool {
        let start = Instant::now();
        loop {
            if what() {
                return true;
            }
            if start.elapsed() > dur {
                return false;
            }
            thread::sleep(Duration::from_micros(100));
        }
    }

    fn counter() -> (Arc<AtomicUsize>, impl FnMut() + Send + 'static) {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        (hits, move || {
            h.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn timer_ticks_on_the_grid_without_bursts() {
        let (_t, ctx) = setup();
        let node = ctx.node(&ctx.create_node(0)).unwrap();
        let (hits, on_tick) = counter();

        node.create_timer(Duration::from_millis(10), on_tick)
            .expect("timer failed");
        let spinner = node.spawn_spin().expect("spawn_spin failed");
        thread::sleep(Duration::from_millis(105));
        spinner.stop_and_join();

        let n = hits.load(Ordering::SeqCst);
        assert!((9..=11).contains(&n), "ticks = {n}");
    }

    #[test]
    fn messages_are_handled_in_arrival_order() {
        let (t, ctx) = setup();
        let node = ctx.node(&ctx.create_node(0)).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            node.create_subscription::<Chatter, _, _>("t", Qos::default(), move |m| {
                seen.lock().push(m.data)
            })
            .unwrap();
        }

        for m in ["m1", "m2", "m3"] {
            assert_eq!(t.inject(0, "t", encode(&chatter(m)).unwrap()), 1);
        }
        for _ in 0..3 {
            assert!(node.spin_once().unwrap());
        }
        assert_eq!(*seen.lock(), vec!["m1", "m2", "m3"]);
    }

    #[test]
    fn concurrent_producers_reach_the_handler_once_each() {
        let (t, ctx) = setup();
        let node = ctx.node(&ctx.create_node(0)).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            node.create_subscription::<Chatter, _, _>("t", Qos::default(), move |m| {
                seen.lock().push(m.data)
            })
            .unwrap();
        }
        let spinner = node.spawn_spin().unwrap();

        let producers: Vec<_> = (0..4)
            .map(|p| {
                let t = t.clone();
                thread::spawn(move || {
                    for i in 0..250 {
                        t.inject(0, "t", encode(&chatter(&format!("{p}:{i}"))).unwrap());
                    }
                })
            })
            .collect();
        for p in producers {
            p.join().unwrap();
        }

        assert!(wait_until(Duration::from_secs(5), || seen.lock().len() == 1000));
        spinner.stop_and_join();

        let seen = seen.lock();
        for p in 0..4 {
            let mine: Vec<usize> = seen
                .iter()
                .filter_map(|s| s.split_once(':'))
                .filter(|(who, _)| *who == p.to_string())
                .map(|(_, i)| i.parse().unwrap())
                .collect();
            assert_eq!(mine, (0..250).collect::<Vec<_>>());
        }
    }

    #[test]
    fn publish_reaches_a_node_on_the_same_executor() {
        let (_t, ctx) = setup();
        let talker = ctx.create_named_node("talker", 0);
        let listener = ctx.create_named_node("listener", 0);

        let received = Arc::new(Mutex::new(Vec::new()));
        let sub = {
            let received = received.clone();
            ctx.node(&listener)
                .unwrap()
                .create_subscription::<Chatter, _, _>("chatter", Qos::default(), move |m| {
                    received.lock().push(m.data)
                })
                .unwrap()
        };

        let talker_node = ctx.node(&talker).unwrap();
        let publisher = talker_node
            .create_publisher::<Chatter>("chatter", Qos::default())
            .unwrap();
        {
            let node = Arc::downgrade(&talker_node);
            let mut count = 0;
            talker_node
                .create_timer(Duration::from_millis(2), move || -> RclResult<()> {
                    count += 1;
                    match node.upgrade() {
                        Some(node) => node.publish(&publisher, &chatter(&format!("hello {count}"))),
                        None => Ok(()),
                    }
                })
                .unwrap();
        }
        assert_eq!(talker_node.get_subscriber_count(&publisher).unwrap(), 1);
        assert_eq!(
            ctx.node(&listener).unwrap().get_publisher_count(&sub).unwrap(),
            1
        );

        let exec = Arc::new(Executor::new(&ctx));
        exec.add_node(&talker).unwrap();
        exec.add_node(&listener).unwrap();
        let runner = {
            let exec = exec.clone();
            thread::spawn(move || exec.spin())
        };

        assert!(wait_until(Duration::from_secs(5), || received.lock().len() >= 3));
        exec.stop();
        runner.join().unwrap().unwrap();

        let received = received.lock();
        assert_eq!(received[0], "hello 1");
        assert_eq!(received[1], "hello 2");

        drop(exec);
        ctx.destroy_node(talker).unwrap();
        ctx.destroy_node(listener).unwrap();
    }

    #[test]
    fn removed_node_sees_no_further_callbacks() {
        let (_t, ctx) = setup();
        let h = ctx.create_node(0);
        let (hits, on_tick) = counter();
        ctx.node(&h)
            .unwrap()
            .create_timer(Duration::from_millis(1), on_tick)
            .unwrap();

        let exec = Arc::new(Executor::new(&ctx));
        exec.add_node(&h).unwrap();
        let runner = {
            let exec = exec.clone();
            thread::spawn(move || exec.spin())
        };

        assert!(wait_until(Duration::from_secs(5), || hits.load(Ordering::SeqCst) > 2));
        assert!(exec.remove_node(&h));
        let after_remove = hits.load(Ordering::SeqCst);

        thread::sleep(Duration::from_millis(30));
        assert_eq!(hits.load(Ordering::SeqCst), after_remove);

        exec.stop();
        runner.join().unwrap().unwrap();
        ctx.destroy_node(h).unwrap();
    }

    #[test]
    fn stop_bounds_spin_latency_with_a_full_queue() {
        let (t, ctx) = setup();
        let node = ctx.node(&ctx.create_node(0)).unwrap();
        let handled = Arc::new(AtomicUsize::new(0));
        {
            let handled = handled.clone();
            node.create_subscription::<Chatter, _, _>("t", Qos::default(), move |_m| {
                handled.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(1));
            })
            .unwrap();
        }
        let payload = encode(&chatter("x")).unwrap();
        for _ in 0..1000 {
            t.inject(0, "t", payload.clone());
        }

        let spinner = node.spawn_spin().unwrap();
        thread::sleep(Duration::from_millis(20));

        let start = Instant::now();
        spinner.stop_and_join();
        assert!(start.elapsed() < Duration::from_millis(200));
        assert!(handled.load(Ordering::SeqCst) < 1000);
        assert!(node.pending() > 0);
    }

    #[test]
    fn failing_handlers_do_not_end_the_loop() {
        let (t, ctx) = setup();
        let node = ctx.node(&ctx.create_node(0)).unwrap();
        let ok = Arc::new(AtomicUsize::new(0));
        {
            let ok = ok.clone();
            node.create_subscription::<Chatter, _, _>("t", Qos::default(), move |m: Chatter| -> anyhow::Result<()> {
                match m.data.as_str() {
                    "err" => anyhow::bail!("rejected"),
                    "panic" => panic!("handler blew up"),
                    _ => {
                        ok.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }
            })
            .unwrap();
        }

        for m in ["a", "err", "panic", "b"] {
            t.inject(0, "t", encode(&chatter(m)).unwrap());
        }
        assert_eq!(node.spin_some().unwrap(), 4);
        assert_eq!(ok.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn destroy_node_waits_for_every_owner() {
        let (_t, ctx) = setup();
        let h = ctx.create_node(0);
        let exec = Executor::new(&ctx);
        exec.add_node(&h).unwrap();

        let spinner = ctx.node(&h).unwrap().spawn_spin().unwrap();
        assert!(ctx.destroy_node(h).unwrap_err().is_busy());

        exec.remove_node(&h);
        assert!(ctx.destroy_node(h).unwrap_err().is_busy());

        spinner.stop_and_join();
        ctx.destroy_node(h).unwrap();
        assert!(ctx.node(&h).unwrap_err().is_invalid_handle());
    }

    #[test]
    fn process_cancellation_stops_spin_and_timers() {
        let (_t, ctx) = setup();
        let node = ctx.node(&ctx.create_node(0)).unwrap();
        let (hits, on_tick) = counter();
        node.create_timer(Duration::from_millis(1), on_tick).unwrap();

        let runner = {
            let node = node.clone();
            thread::spawn(move || node.spin())
        };
        assert!(wait_until(Duration::from_secs(5), || hits.load(Ordering::SeqCst) > 0));

        ctx.cancel_token().cancel();
        runner.join().unwrap().unwrap();

        thread::sleep(Duration::from_millis(10));
        let drained = node.spin_some().unwrap();
        thread::sleep(Duration::from_millis(10));
        assert_eq!(node.spin_some().unwrap(), 0, "timer kept ticking ({drained} drained)");
    }

    #[test]
    fn sigterm_cancels_the_process_token_and_ends_spin() {
        let token = init_process_token().expect("signal handlers");
        let ctx = Context::new(
            Arc::new(LoopbackTransport::new()),
            token.clone(),
            SpinConfig::default(),
        );
        let node = ctx.node(&ctx.create_node(0)).unwrap();
        let runner = {
            let node = node.clone();
            thread::spawn(move || node.spin())
        };
        assert!(wait_until(Duration::from_secs(5), || node.is_spinning()));

        signal_hook::low_level::raise(signal_hook::consts::SIGTERM).expect("raise failed");

        assert!(wait_until(Duration::from_secs(5), || token.is_cancelled()));
        assert!(token.new_child().is_cancelled());
        assert!(ctx.is_shutdown());
        runner.join().unwrap().unwrap();
        assert!(node.is_stopped());
    }
}
